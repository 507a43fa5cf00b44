// 执行记忆：一次运行中所有 agent 的输出

mod execution;
mod vector;

pub(crate) use execution::now_secs;

pub use execution::{
    AgentResult, ExecutionGraph, ExecutionMemory, MemorySnapshot, SimilarResult, StoredResult,
};
pub use vector::{cosine_similarity, Embedder, HashingEmbedder, TextChunker};
