use std::path::PathBuf;

use agentcrew::{AgentFactoryRegistry, LoggingConfig, WorkflowConfig};
use anyhow::Context;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agentcrew", version, about = "AgentCrew CLI", author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 检查工作流文件并打印入口、终止节点与执行顺序
    Validate { workflow: PathBuf },
    /// 使用本地 echo 模型运行工作流文件
    Run {
        workflow: PathBuf,
        #[arg(long)]
        task: String,
        #[arg(long, default_value_t = false)]
        compact: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { workflow } => handle_validate(workflow)?,
        Command::Run {
            workflow,
            task,
            compact,
        } => handle_run(workflow, task, compact).await?,
    }
    Ok(())
}

fn load(path: &PathBuf) -> anyhow::Result<WorkflowConfig> {
    let mut config = WorkflowConfig::from_file(path)
        .with_context(|| format!("loading workflow `{}`", path.display()))?;
    config.engine = config.engine.clone().with_env_overrides()?;
    Ok(config)
}

fn handle_validate(path: PathBuf) -> anyhow::Result<()> {
    let config = load(&path)?;
    let flow = config.build_flow(&AgentFactoryRegistry::with_builtins())?;
    let plan = flow.validate_workflow()?;
    println!("workflow:  {}", config.name);
    println!("entry:     {}", plan.entry_nodes.join(", "));
    println!("terminals: {}", plan.terminal_nodes.join(", "));
    println!("order:     {}", plan.order.join(" -> "));
    if !plan.back_edges.is_empty() {
        let loops: Vec<String> = plan
            .back_edges
            .iter()
            .map(|(from, to)| format!("{from} -> {to}"))
            .collect();
        println!("loops:     {}", loops.join(", "));
    }
    Ok(())
}

async fn handle_run(path: PathBuf, task: String, compact: bool) -> anyhow::Result<()> {
    let config = load(&path)?;
    let flow = config.build_flow(&AgentFactoryRegistry::with_builtins())?;
    let result = flow.run_flow(&task).await?;
    let text = if compact {
        serde_json::to_string(&result)?
    } else {
        result.to_json()?
    };
    println!("{text}");
    Ok(())
}
