// 运行时：agent 调用与工具访问

mod invoker;
mod runtime;

pub use invoker::{AgentInvoker, Invocation};
pub use runtime::ExecutorRuntime;
