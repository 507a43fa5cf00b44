use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::uuid;
use crate::crew::{AgentCrew, CrewMode, CrewResult};
use crate::error::{CrewError, Result};
use crate::flow::AgentsFlow;
use crate::memory::now_secs;
use crate::state::{ContextStore, MemoryStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// 后台任务记录，序列化后写入 `ContextStore`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub submitted_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CrewResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 把 crew / flow 运行提交为后台 tokio 任务，并按 id 查询状态
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn ContextStore>,
    namespace: String,
    handles: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}

impl JobTracker {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self {
            store,
            namespace: "agentcrew".to_string(),
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn prefix(&self) -> String {
        format!("{}:job:", self.namespace)
    }

    fn key(&self, id: &str) -> String {
        format!("{}{id}", self.prefix())
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        let text = serde_json::to_string(record)?;
        self.store.set(&self.key(&record.id), text).await
    }

    /// 启动 `run`，排队记录保存后返回任务 id
    pub async fn submit<F>(&self, name: impl Into<String>, run: F) -> Result<String>
    where
        F: Future<Output = Result<CrewResult>> + Send + 'static,
    {
        let mut record = JobRecord {
            id: uuid(),
            name: name.into(),
            status: JobStatus::Queued,
            submitted_at: now_secs(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        };
        self.save(&record).await?;
        let id = record.id.clone();
        info!(job = %id, name = %record.name, "job submitted");

        let tracker = self.clone();
        // 持锁直到句柄存入，避免任务过快结束时先于插入执行移除
        let mut handles = self.handles.lock();
        let handle = tokio::spawn(async move {
            record.status = JobStatus::Running;
            record.started_at = Some(now_secs());
            if let Err(err) = tracker.save(&record).await {
                warn!(job = %record.id, error = %err, "cannot store job state");
            }

            match run.await {
                Ok(result) => {
                    record.status = JobStatus::Completed;
                    record.result = Some(result);
                }
                Err(err) => {
                    warn!(job = %record.id, error = %err, "job failed");
                    record.status = JobStatus::Failed;
                    record.error = Some(err.to_string());
                }
            }
            record.finished_at = Some(now_secs());
            if let Err(err) = tracker.save(&record).await {
                warn!(job = %record.id, error = %err, "cannot store job result");
            }
            info!(job = %record.id, status = ?record.status, "job finished");
            tracker.handles.lock().remove(&record.id);
        });
        handles.insert(id.clone(), handle);
        drop(handles);
        Ok(id)
    }

    pub async fn submit_flow(&self, flow: Arc<AgentsFlow>, task: impl Into<String>) -> Result<String> {
        let task = task.into();
        let name = flow.name().to_string();
        self.submit(name, async move { flow.run_flow(&task).await })
            .await
    }

    pub async fn submit_crew(
        &self,
        crew: Arc<AgentCrew>,
        mode: CrewMode,
        query: impl Into<String>,
    ) -> Result<String> {
        let query = query.into();
        let name = crew.name().to_string();
        self.submit(name, async move { crew.run(mode, &query).await })
            .await
    }

    pub async fn status(&self, id: &str) -> Result<Option<JobRecord>> {
        match self.store.get(&self.key(id)).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// 所有已保存的任务，按创建时间升序
    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        for key in self.store.keys(&self.prefix()).await? {
            if let Some(text) = self.store.get(&key).await? {
                records.push(serde_json::from_str::<JobRecord>(&text)?);
            }
        }
        records.sort_by(|a, b| a.submitted_at.total_cmp(&b.submitted_at));
        Ok(records)
    }

    /// 等待本 tracker 启动的任务并返回其最终记录
    pub async fn wait(&self, id: &str) -> Result<JobRecord> {
        let handle = self.handles.lock().remove(id);
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|err| CrewError::Context(format!("job {id} aborted: {err}")))?;
        }
        self.status(id)
            .await?
            .ok_or_else(|| CrewError::Context(format!("unknown job {id}")))
    }
}
