use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CrewError, Result};

use super::agent::Agent;
use super::builtin::register_builtin_agent_factories;

pub type AgentFactory = Arc<dyn Fn(Option<Value>) -> Result<Arc<dyn Agent>> + Send + Sync>;

/// 按名称构建 agent，供配置文件使用
#[derive(Default, Clone)]
pub struct AgentFactoryRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl AgentFactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// 预置 `echo` 与 `llm` 工厂的注册表
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtin_agent_factories(&mut registry);
        registry
    }

    pub fn register_factory<T: Into<String>>(&mut self, name: T, factory: AgentFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(&self, factory_name: &str, config: Option<Value>) -> Result<Arc<dyn Agent>> {
        let builder = self.factories.get(factory_name).ok_or_else(|| {
            CrewError::InvalidConfiguration(format!("unknown agent kind `{factory_name}`"))
        })?;
        builder(config)
    }

    pub fn has_factory(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
