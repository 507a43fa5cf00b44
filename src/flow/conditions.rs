use std::sync::Arc;

use serde_json::Value;

use crate::agent::AgentResponse;
use crate::state::FlowContext;

/// Flow 条件类型定义

/// 转换条件：基于源节点的输出和共享上下文
pub type TransitionCondition = Arc<dyn Fn(&AgentResponse, &FlowContext) -> bool + Send + Sync>;

/// 从函数创建转换条件
pub fn condition_from_fn<F>(func: F) -> TransitionCondition
where
    F: Fn(&AgentResponse, &FlowContext) -> bool + Send + Sync + 'static,
{
    Arc::new(func)
}

/// 总是为真的条件
pub fn condition_always() -> TransitionCondition {
    Arc::new(|_, _| true)
}

/// 输出包含指定文本（不区分大小写）
pub fn condition_output_contains<S>(needle: S) -> TransitionCondition
where
    S: Into<String>,
{
    let needle = needle.into().to_lowercase();
    Arc::new(move |response, _| response.output.to_lowercase().contains(&needle))
}

/// 共享数据等于指定值的条件
pub fn condition_state_equals<K>(key: K, expected: Value) -> TransitionCondition
where
    K: Into<String>,
{
    let key = key.into();
    Arc::new(move |_, ctx| ctx.shared(&key).as_ref() == Some(&expected))
}

/// 共享数据存在的条件
pub fn condition_state_exists<K>(key: K) -> TransitionCondition
where
    K: Into<String>,
{
    let key = key.into();
    Arc::new(move |_, ctx| ctx.shared(&key).is_some())
}

/// 共享数据不存在的条件
pub fn condition_state_absent<K>(key: K) -> TransitionCondition
where
    K: Into<String>,
{
    let key = key.into();
    Arc::new(move |_, ctx| ctx.shared(&key).is_none())
}

/// 输出元数据等于指定值的条件
pub fn condition_metadata_equals<K>(key: K, expected: Value) -> TransitionCondition
where
    K: Into<String>,
{
    let key = key.into();
    Arc::new(move |response, _| response.metadata.get(&key) == Some(&expected))
}

/// 决策节点给出指定结论
pub fn condition_decision_equals<S>(expected: S) -> TransitionCondition
where
    S: Into<String>,
{
    let expected = expected.into();
    Arc::new(move |response, _| {
        let decision = response
            .structured
            .as_ref()
            .and_then(|value| value.get("final_decision"))
            .and_then(Value::as_str)
            .unwrap_or(response.output.as_str());
        decision.trim().eq_ignore_ascii_case(expected.trim())
    })
}
