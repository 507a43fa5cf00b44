// 运行上下文与持久化存储

mod context;
mod store;

pub use context::{FlowContext, FlowContextSnapshot};
#[cfg(feature = "redis-store")]
pub use store::redis::RedisStore;
pub use store::{ContextStore, MemoryStore};
