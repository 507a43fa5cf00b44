use std::collections::HashMap;

use crate::error::{CrewError, Result};

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证 agent 名称
    pub fn validate_agent_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CrewError::InvalidConfiguration(
                "agent name must not be empty".to_string(),
            ));
        }

        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(CrewError::InvalidConfiguration(format!(
                "agent name '{name}' may only contain letters, digits, '_', '-' and '.'"
            )));
        }

        Ok(())
    }

    /// 验证工作流名称
    pub fn validate_workflow_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CrewError::InvalidConfiguration(
                "workflow name must not be empty".to_string(),
            ));
        }

        if name.len() > 100 {
            return Err(CrewError::InvalidConfiguration(format!(
                "workflow name is too long ({} characters, at most 100)",
                name.len()
            )));
        }

        Ok(())
    }

    /// 验证 0..=1 之间的阈值
    pub fn validate_threshold(field: &str, value: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(CrewError::InvalidConfiguration(format!(
                "{field} must be between 0.0 and 1.0, got {value}"
            )));
        }
        Ok(())
    }

    /// 验证投票权重
    pub fn validate_weights(weights: &HashMap<String, f64>) -> Result<()> {
        for (agent, weight) in weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(CrewError::InvalidConfiguration(format!(
                    "weight for '{agent}' must be a non-negative number, got {weight}"
                )));
            }
        }
        if !weights.is_empty() && weights.values().all(|weight| *weight == 0.0) {
            return Err(CrewError::InvalidConfiguration(
                "at least one vote weight must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// 验证温度参数
    pub fn validate_temperature(temperature: f32) -> Result<()> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(CrewError::InvalidConfiguration(format!(
                "temperature must be between 0.0 and 2.0, got {temperature}"
            )));
        }
        Ok(())
    }
}
