use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::store::{ContextStore, MemoryStore};
use crate::error::Result;

const SESSION_PREFIX: &str = "session";

#[derive(Default)]
struct ContextState {
    agent_results: HashMap<String, String>,
    shared_data: Map<String, Value>,
    metadata: Map<String, Value>,
}

/// Flow 上下文
///
/// 一次运行独占一个上下文；克隆得到的是同一份状态的句柄。
#[derive(Clone)]
pub struct FlowContext {
    user_id: Option<String>,
    session_id: Option<String>,
    original_query: Arc<str>,
    state: Arc<RwLock<ContextState>>,
    store: Arc<dyn ContextStore>,
}

/// 上下文快照
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowContextSnapshot {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub original_query: String,
    pub agent_results: HashMap<String, String>,
    pub shared_data: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl FlowContext {
    pub fn new(original_query: impl Into<String>) -> Self {
        Self {
            user_id: None,
            session_id: None,
            original_query: Arc::from(original_query.into()),
            state: Arc::new(RwLock::new(ContextState::default())),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_shared(self, key: impl Into<String>, value: Value) -> Self {
        self.set_shared(key, value);
        self
    }

    pub fn with_metadata(self, key: impl Into<String>, value: Value) -> Self {
        self.set_metadata(key, value);
        self
    }

    /// 保留标识与存储，重置单次运行状态，使用新查询
    pub fn fork(&self, original_query: impl Into<String>) -> Self {
        let state = self.state.read();
        Self {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            original_query: Arc::from(original_query.into()),
            state: Arc::new(RwLock::new(ContextState {
                agent_results: HashMap::new(),
                shared_data: state.shared_data.clone(),
                metadata: state.metadata.clone(),
            })),
            store: Arc::clone(&self.store),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn original_query(&self) -> &str {
        &self.original_query
    }

    pub fn store(&self) -> Arc<dyn ContextStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn record_result(&self, agent: &str, output: impl Into<String>) {
        self.state
            .write()
            .agent_results
            .insert(agent.to_string(), output.into());
    }

    pub fn agent_result(&self, agent: &str) -> Option<String> {
        self.state.read().agent_results.get(agent).cloned()
    }

    pub fn agent_results(&self) -> HashMap<String, String> {
        self.state.read().agent_results.clone()
    }

    pub fn set_shared(&self, key: impl Into<String>, value: Value) {
        self.state.write().shared_data.insert(key.into(), value);
    }

    pub fn merge_shared(&self, updates: &Map<String, Value>) {
        if updates.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for (key, value) in updates {
            state.shared_data.insert(key.clone(), value.clone());
        }
    }

    pub fn shared(&self, key: &str) -> Option<Value> {
        self.state.read().shared_data.get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.state.write().metadata.insert(key.into(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.state.read().metadata.get(key).cloned()
    }

    pub fn snapshot(&self) -> FlowContextSnapshot {
        let state = self.state.read();
        FlowContextSnapshot {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            original_query: self.original_query.to_string(),
            agent_results: state.agent_results.clone(),
            shared_data: state.shared_data.clone(),
            metadata: state.metadata.clone(),
        }
    }

    fn session_key(&self, key: &str) -> String {
        match &self.session_id {
            Some(session) => format!("{SESSION_PREFIX}:{session}:{key}"),
            None => format!("{SESSION_PREFIX}:{key}"),
        }
    }

    /// 读取会话级持久化值
    pub async fn session_get(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&self.session_key(key)).await
    }

    /// 写入会话级持久化值
    pub async fn session_set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        self.store.set(&self.session_key(key), value.into()).await
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("FlowContext")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("original_query", &self.original_query)
            .field("agents", &state.agent_results.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_state() {
        let ctx = FlowContext::new("plan a trip").with_user("u-1");
        let handle = ctx.clone();
        handle.record_result("planner", "day 1: museum");
        handle.set_shared("budget", json!(1200));

        assert_eq!(ctx.agent_result("planner").as_deref(), Some("day 1: museum"));
        assert_eq!(ctx.shared("budget"), Some(json!(1200)));
        assert_eq!(ctx.user_id(), Some("u-1"));
    }

    #[test]
    fn fork_keeps_identity_and_drops_results() {
        let ctx = FlowContext::new("first")
            .with_session("s-9")
            .with_shared("locale", json!("en"));
        ctx.record_result("a", "x");

        let next = ctx.fork("second");
        assert_eq!(next.original_query(), "second");
        assert_eq!(next.session_id(), Some("s-9"));
        assert!(next.agent_results().is_empty());
        assert_eq!(next.shared("locale"), Some(json!("en")));
    }

    #[tokio::test]
    async fn session_values_are_scoped_by_session_id() {
        let store: Arc<dyn ContextStore> = Arc::new(MemoryStore::new());
        let ctx = FlowContext::new("q")
            .with_session("abc")
            .with_store(Arc::clone(&store));
        ctx.session_set("tone", "formal").await.unwrap();
        assert_eq!(
            store.get("session:abc:tone").await.unwrap().as_deref(),
            Some("formal")
        );
        assert_eq!(ctx.session_get("tone").await.unwrap().as_deref(), Some("formal"));
    }
}
