use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// 键值存储 trait，用于会话数据与后台任务记录
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// 内存存储实现
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.inner.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(feature = "redis-store")]
pub mod redis {
    use super::*;
    use crate::error::CrewError;
    use redis::AsyncCommands;

    pub struct RedisStore {
        client: redis::Client,
        namespace: String,
    }

    impl RedisStore {
        pub fn new(client: redis::Client) -> Self {
            Self {
                client,
                namespace: "agentcrew".to_string(),
            }
        }

        pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
            self.namespace = namespace.into();
            self
        }

        fn key(&self, key: &str) -> String {
            format!("{}:{}", self.namespace, key)
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| CrewError::Context(e.to_string()))
        }
    }

    #[async_trait]
    impl ContextStore for RedisStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.connection().await?;
            conn.get(self.key(key))
                .await
                .map_err(|e| CrewError::Context(e.to_string()))
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            let mut conn = self.connection().await?;
            conn.set::<_, _, ()>(self.key(key), value)
                .await
                .map_err(|e| CrewError::Context(e.to_string()))
        }

        async fn delete(&self, key: &str) -> Result<()> {
            let mut conn = self.connection().await?;
            conn.del::<_, ()>(self.key(key))
                .await
                .map_err(|e| CrewError::Context(e.to_string()))
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            let mut conn = self.connection().await?;
            let pattern = format!("{}*", self.key(prefix));
            let keys: Vec<String> = conn
                .keys(pattern)
                .await
                .map_err(|e| CrewError::Context(e.to_string()))?;
            let strip = format!("{}:", self.namespace);
            Ok(keys
                .into_iter()
                .map(|key| key.strip_prefix(&strip).unwrap_or(&key).to_string())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keys_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("job:1", "a".into()).await.unwrap();
        store.set("job:2", "b".into()).await.unwrap();
        store.set("session:x", "c".into()).await.unwrap();

        assert_eq!(store.keys("job:").await.unwrap(), vec!["job:1", "job:2"]);
        store.delete("job:1").await.unwrap();
        assert_eq!(store.keys("job:").await.unwrap(), vec!["job:2"]);
    }
}
