use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::vector::{Embedder, IndexedChunk, TextChunker, VectorIndex};
use crate::error::{CrewError, Result};

/// 单个 agent 的一次执行结果
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub agent_id: String,
    pub agent_name: String,
    pub content: String,
    pub timestamp: f64,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentResult {
    pub fn new(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            agent_name: agent_id.clone(),
            agent_id,
            content: content.into(),
            timestamp: now_secs(),
            execution_time: 0.0,
            metadata: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = seconds.max(0.0);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimilarResult {
    pub chunk: String,
    pub offset: usize,
    pub result: AgentResult,
    pub score: f32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphEdgeRecord {
    pub from: String,
    pub to: String,
    pub kind: String,
}

/// 依赖图的导出形式
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionGraph {
    pub nodes: Vec<String>,
    pub edges: Vec<GraphEdgeRecord>,
}

impl ExecutionGraph {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            edges: Vec::new(),
        }
    }

    pub fn with_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        self.edges.push(GraphEdgeRecord {
            from: from.into(),
            to: to.into(),
            kind: kind.into(),
        });
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredResult {
    pub content: String,
    pub timestamp: f64,
    pub metadata: Map<String, Value>,
}

/// `get_snapshot()` 的 JSON 布局
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MemorySnapshot {
    pub original_query: String,
    pub execution_order: Vec<String>,
    pub total_executions: usize,
    pub reexecutions: usize,
    pub results: BTreeMap<String, StoredResult>,
    pub execution_graph: ExecutionGraph,
}

#[derive(Default)]
struct MemoryState {
    original_query: String,
    execution_order: Vec<String>,
    results: HashMap<String, (u64, AgentResult)>,
    total_executions: usize,
    reexecutions: usize,
    sequence: u64,
    graph: ExecutionGraph,
    index: VectorIndex,
}

/// 执行记忆
///
/// 克隆得到同一存储的句柄；引擎写入，agent 通过检索工具读取。
#[derive(Clone)]
pub struct ExecutionMemory {
    state: Arc<RwLock<MemoryState>>,
    embedder: Option<Arc<dyn Embedder>>,
    chunker: TextChunker,
}

impl Default for ExecutionMemory {
    fn default() -> Self {
        Self::new("")
    }
}

impl ExecutionMemory {
    pub fn new(original_query: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                original_query: original_query.into(),
                ..MemoryState::default()
            })),
            embedder: None,
            chunker: TextChunker::default(),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_chunker(mut self, chunker: TextChunker) -> Self {
        self.chunker = chunker;
        self
    }

    /// 与当前句柄配置相同（embedder、分块）的全新存储
    pub fn fresh(&self, original_query: impl Into<String>) -> Self {
        Self {
            embedder: self.embedder.clone(),
            chunker: self.chunker.clone(),
            ..Self::new(original_query)
        }
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    pub fn original_query(&self) -> String {
        self.state.read().original_query.clone()
    }

    pub fn set_original_query(&self, query: impl Into<String>) {
        self.state.write().original_query = query.into();
    }

    pub fn set_execution_graph(&self, graph: ExecutionGraph) {
        self.state.write().graph = graph;
    }

    /// 记录结果，不写入向量索引
    pub fn record(&self, result: AgentResult) -> u64 {
        let mut state = self.state.write();
        state.sequence += 1;
        let sequence = state.sequence;
        if state.execution_order.iter().any(|id| id == &result.agent_id) {
            state.reexecutions += 1;
        }
        state.total_executions += 1;
        state.execution_order.push(result.agent_id.clone());
        state
            .results
            .insert(result.agent_id.clone(), (sequence, result));
        sequence
    }

    /// 记录 `result`；设置 `vectorize` 且存在 embedder 时同时写入索引
    /// 索引失败只记录日志，不向上传播
    pub async fn add_result(&self, result: AgentResult, vectorize: bool) {
        let agent_id = result.agent_id.clone();
        let content = result.content.clone();
        let sequence = self.record(result);

        if !vectorize {
            return;
        }
        let Some(embedder) = &self.embedder else {
            debug!(agent = %agent_id, "vectorize requested without embedder, skipping index");
            return;
        };

        let mut chunks = Vec::new();
        for (offset, text) in self.chunker.chunk(&content) {
            match embedder.embed(&text).await {
                Ok(embedding) => chunks.push(IndexedChunk {
                    agent_id: agent_id.clone(),
                    offset,
                    text,
                    embedding,
                }),
                Err(err) => {
                    warn!(agent = %agent_id, error = %err, "failed to index agent result");
                    return;
                }
            }
        }

        let mut state = self.state.write();
        let current = state.results.get(&agent_id).map(|(seq, _)| *seq);
        if current == Some(sequence) {
            state.index.replace_agent(&agent_id, chunks);
        } else {
            debug!(agent = %agent_id, "newer result recorded while indexing, dropping stale chunks");
        }
    }

    pub fn get_results_by_agent(&self, agent_id: &str) -> Option<AgentResult> {
        self.state
            .read()
            .results
            .get(agent_id)
            .map(|(_, result)| result.clone())
    }

    pub async fn search_similar(&self, query: &str, top_k: usize) -> Result<Vec<SimilarResult>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| CrewError::NotConfigured("semantic search".to_string()))?;
        let query_vector = embedder.embed(query).await?;

        let state = self.state.read();
        Ok(state
            .index
            .search(&query_vector, top_k)
            .into_iter()
            .filter_map(|(chunk, score)| {
                state
                    .results
                    .get(&chunk.agent_id)
                    .map(|(_, result)| SimilarResult {
                        chunk: chunk.text,
                        offset: chunk.offset,
                        result: result.clone(),
                        score,
                    })
            })
            .collect())
    }

    /// 已保存结果的 agent id，按首次执行顺序
    pub fn agent_ids(&self) -> Vec<String> {
        let state = self.state.read();
        let mut seen = HashSet::new();
        state
            .execution_order
            .iter()
            .filter(|id| state.results.contains_key(*id) && seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    /// 其他每个 agent 的最新结果；不含请求者自身的输出
    pub fn get_context_for_agent(&self, agent_id: &str) -> String {
        let ids = self.agent_ids();
        let state = self.state.read();
        let mut sections = Vec::new();
        if !state.original_query.is_empty() {
            sections.push(format!("Original query: {}", state.original_query));
        }
        for id in ids.iter().filter(|id| id.as_str() != agent_id) {
            if let Some((_, result)) = state.results.get(id) {
                sections.push(format!("=== {} ===\n{}", result.agent_name, result.content));
            }
        }
        sections.join("\n\n")
    }

    pub fn execution_order(&self) -> Vec<String> {
        self.state.read().execution_order.clone()
    }

    pub fn total_executions(&self) -> usize {
        self.state.read().total_executions
    }

    pub fn reexecutions(&self) -> usize {
        self.state.read().reexecutions
    }

    pub fn indexed_chunks(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn len(&self) -> usize {
        self.state.read().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().results.is_empty()
    }

    pub fn get_snapshot(&self) -> MemorySnapshot {
        let state = self.state.read();
        MemorySnapshot {
            original_query: state.original_query.clone(),
            execution_order: state.execution_order.clone(),
            total_executions: state.total_executions,
            reexecutions: state.reexecutions,
            results: state
                .results
                .iter()
                .map(|(id, (_, result))| {
                    (
                        id.clone(),
                        StoredResult {
                            content: result.content.clone(),
                            timestamp: result.timestamp,
                            metadata: result.metadata.clone(),
                        },
                    )
                })
                .collect(),
            execution_graph: state.graph.clone(),
        }
    }

    pub fn clear(&self, keep_query: bool) {
        let mut state = self.state.write();
        let query = if keep_query {
            std::mem::take(&mut state.original_query)
        } else {
            String::new()
        };
        let graph = std::mem::take(&mut state.graph);
        *state = MemoryState {
            original_query: query,
            graph,
            ..MemoryState::default()
        };
        state.index.clear();
    }
}

pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
