use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CrewError, Result};
use crate::flow::types::{default_max_retries, CompletionPolicy};

use super::env::{
    EnvConfig, ENV_COMPLETION_POLICY, ENV_MAX_CONCURRENCY, ENV_MAX_ITERATIONS, ENV_MAX_RETRIES,
    ENV_VECTORIZE,
};

/// 引擎运行参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub completion_policy: CompletionPolicy,
    #[serde(default)]
    pub vectorize_results: bool,
    #[serde(default = "default_reset_memory")]
    pub reset_memory: bool,
}

fn default_max_iterations() -> u32 {
    100
}

fn default_max_concurrency() -> usize {
    8
}

fn default_reset_memory() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_iterations: default_max_iterations(),
            max_concurrency: default_max_concurrency(),
            completion_policy: CompletionPolicy::default(),
            vectorize_results: false,
            reset_memory: default_reset_memory(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| CrewError::InvalidConfiguration(format!("engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            CrewError::InvalidConfiguration(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// 默认值，由 `AGENTCREW_*` 环境变量覆盖
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(value) = EnvConfig::parse_optional(ENV_MAX_RETRIES)? {
            self.max_retries = value;
        }
        if let Some(value) = EnvConfig::parse_optional(ENV_MAX_ITERATIONS)? {
            self.max_iterations = value;
        }
        if let Some(value) = EnvConfig::parse_optional(ENV_MAX_CONCURRENCY)? {
            self.max_concurrency = value;
        }
        if let Some(value) = EnvConfig::parse_optional::<CompletionPolicy>(ENV_COMPLETION_POLICY)? {
            self.completion_policy = value;
        }
        if let Some(value) = EnvConfig::flag(ENV_VECTORIZE) {
            self.vectorize_results = value;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(CrewError::InvalidConfiguration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(CrewError::InvalidConfiguration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json(r#"{ "max_retries": 1, "completion_policy": "reachable_terminals" }"#)
                .unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.completion_policy, CompletionPolicy::ReachableTerminals);
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.max_concurrency, 8);
        assert!(config.reset_memory);
        assert!(!config.vectorize_results);
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(EngineConfig::from_json(r#"{ "max_iterations": 0 }"#).is_err());
        assert!(EngineConfig::from_json(r#"{ "max_concurrency": 0 }"#).is_err());
        assert!(EngineConfig::from_json("not json").is_err());
    }
}
