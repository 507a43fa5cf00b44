// 后台任务服务

pub mod jobs;

pub use jobs::{JobRecord, JobStatus, JobTracker};
