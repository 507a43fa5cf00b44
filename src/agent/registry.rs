use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CrewError, Result};
use crate::utils::validation::ConfigValidator;

use super::agent::Agent;

/// 按名称索引的 agent，按注册顺序遍历
#[derive(Clone, Default)]
pub struct AgentRegistry {
    order: Vec<String>,
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.name().to_string();
        self.register_as(&name, agent)
    }

    pub fn register_as(&mut self, name: &str, agent: Arc<dyn Agent>) -> Result<()> {
        ConfigValidator::validate_agent_name(name)?;
        if self.agents.contains_key(name) {
            return Err(CrewError::DuplicateAgent(name.to_string()));
        }
        self.order.push(name.to_string());
        self.agents.insert(name.to_string(), agent);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).map(Arc::clone)
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.get(name)
            .ok_or_else(|| CrewError::AgentNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Agent>)> {
        self.order
            .iter()
            .filter_map(|name| self.agents.get(name).map(|agent| (name.as_str(), agent)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub fn register_agent(name: &str, agent: Arc<dyn Agent>, registry: &mut AgentRegistry) -> Result<()> {
    registry.register_as(name, agent)
}
