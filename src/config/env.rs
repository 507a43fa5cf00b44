use std::env;
use std::str::FromStr;

use crate::error::{CrewError, Result};

pub const ENV_MAX_RETRIES: &str = "AGENTCREW_MAX_RETRIES";
pub const ENV_MAX_ITERATIONS: &str = "AGENTCREW_MAX_ITERATIONS";
pub const ENV_MAX_CONCURRENCY: &str = "AGENTCREW_MAX_CONCURRENCY";
pub const ENV_COMPLETION_POLICY: &str = "AGENTCREW_COMPLETION_POLICY";
pub const ENV_VECTORIZE: &str = "AGENTCREW_VECTORIZE_RESULTS";

/// 环境变量配置管理
pub struct EnvConfig;

impl EnvConfig {
    /// 从环境变量获取值
    pub fn get_env(key: &str) -> Result<String> {
        env::var(key)
            .map_err(|_| CrewError::InvalidConfiguration(format!("environment variable '{key}' is not set")))
    }

    /// 获取可选的环境变量，空值视为未设置
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    /// 解析可选的环境变量
    pub fn parse_optional<T>(key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::get_env_optional(key) {
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|err| {
                CrewError::InvalidConfiguration(format!("{key}='{raw}': {err}"))
            }),
            None => Ok(None),
        }
    }

    /// 解析布尔型环境变量（1/true/yes/on）
    pub fn flag(key: &str) -> Option<bool> {
        Self::get_env_optional(key).map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optional() {
        env::set_var("AGENTCREW_TEST_NUMBER", "12");
        assert_eq!(EnvConfig::parse_optional::<u32>("AGENTCREW_TEST_NUMBER").unwrap(), Some(12));

        env::set_var("AGENTCREW_TEST_NUMBER", "twelve");
        assert!(EnvConfig::parse_optional::<u32>("AGENTCREW_TEST_NUMBER").is_err());

        env::remove_var("AGENTCREW_TEST_NUMBER");
        assert_eq!(EnvConfig::parse_optional::<u32>("AGENTCREW_TEST_NUMBER").unwrap(), None);
        assert!(EnvConfig::get_env("AGENTCREW_TEST_NUMBER").is_err());
    }

    #[test]
    fn test_flag() {
        env::set_var("AGENTCREW_TEST_FLAG", "Yes");
        assert_eq!(EnvConfig::flag("AGENTCREW_TEST_FLAG"), Some(true));
        env::set_var("AGENTCREW_TEST_FLAG", "0");
        assert_eq!(EnvConfig::flag("AGENTCREW_TEST_FLAG"), Some(false));
        env::remove_var("AGENTCREW_TEST_FLAG");
        assert_eq!(EnvConfig::flag("AGENTCREW_TEST_FLAG"), None);
    }
}
