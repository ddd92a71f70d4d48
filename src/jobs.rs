//! Asynchronous job submission for heavy work (archives, bulk import).
//!
//! Callers resolve and validate everything up front and hand over a [`JobSpec`]; how and
//! when it runs is the submitter's business. [`ChannelJobSubmitter`] is the in-process
//! runner: a bounded mpsc queue drained by one worker task, each job on a fresh session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AppError, AppResult};
use crate::filesystem::validator::check_name;
use crate::filesystem::FileSystem;
use crate::models::File;
use crate::services::Services;
use crate::util::join;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSpec {
    Compress { uid: u64, dir_ids: Vec<u64>, file_ids: Vec<u64>, dst_path: String, name: String },
    Decompress { uid: u64, file_id: u64, dst_path: String },
    /// Register objects already present under `src` in a policy's backend.
    Import { uid: u64, policy_id: u64, src: String, dst_path: String, recursive: bool },
}

impl JobSpec {
    pub fn uid(&self) -> u64 {
        match self {
            JobSpec::Compress { uid, .. } | JobSpec::Decompress { uid, .. } | JobSpec::Import { uid, .. } => *uid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobSpec::Compress { .. } => "compress",
            JobSpec::Decompress { .. } => "decompress",
            JobSpec::Import { .. } => "import",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed(String),
}

#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Enqueue a job and return its id.
    async fn submit(&self, spec: JobSpec) -> AppResult<u64>;

    fn status(&self, id: u64) -> Option<JobStatus>;
}

#[derive(Clone)]
pub struct ChannelJobSubmitter {
    tx: mpsc::Sender<(u64, JobSpec)>,
    next_id: Arc<AtomicU64>,
    statuses: Arc<RwLock<HashMap<u64, JobStatus>>>,
}

impl ChannelJobSubmitter {
    /// Start the worker. It stops once every submitter clone is dropped.
    pub fn spawn(services: Services, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<(u64, JobSpec)>(capacity.max(1));
        let statuses: Arc<RwLock<HashMap<u64, JobStatus>>> = Arc::new(RwLock::new(HashMap::new()));
        let worker_statuses = statuses.clone();
        let handle = tokio::spawn(async move {
            while let Some((id, spec)) = rx.recv().await {
                worker_statuses.write().insert(id, JobStatus::Running);
                let kind = spec.kind();
                let status = match run_job(&services, spec).await {
                    Ok(()) => {
                        tracing::info!(job = id, kind, "job_done");
                        JobStatus::Done
                    }
                    Err(e) => {
                        tracing::warn!(job = id, kind, error = %e, "job_failed");
                        JobStatus::Failed(e.to_string())
                    }
                };
                worker_statuses.write().insert(id, status);
            }
            tracing::debug!("job_worker_stopped");
        });
        (Self { tx, next_id: Arc::new(AtomicU64::new(1)), statuses }, handle)
    }
}

#[async_trait]
impl JobSubmitter for ChannelJobSubmitter {
    async fn submit(&self, spec: JobSpec) -> AppResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.statuses.write().insert(id, JobStatus::Queued);
        if self.tx.send((id, spec)).await.is_err() {
            self.statuses.write().remove(&id);
            return Err(AppError::internal_setting("job_queue_closed", "the job worker is not running"));
        }
        Ok(id)
    }

    fn status(&self, id: u64) -> Option<JobStatus> { self.statuses.read().get(&id).cloned() }
}

async fn run_job(services: &Services, spec: JobSpec) -> AppResult<()> {
    let user = services.db.get_user(spec.uid())?;
    let mut fs = FileSystem::new(services, user)?;
    match spec {
        JobSpec::Compress { dir_ids, file_ids, dst_path, name, .. } => fs.compress_into(&dir_ids, &file_ids, &dst_path, &name).await.map(|_| ()),
        JobSpec::Decompress { file_id, dst_path, .. } => fs.decompress(file_id, &dst_path).await.map(|_| ()),
        JobSpec::Import { policy_id, src, dst_path, recursive, .. } => import(&mut fs, policy_id, &src, &dst_path, recursive).await.map(|_| ()),
    }
}

/// Create records for objects found under `src` in a policy's backend. Existing names are
/// skipped; the imported size is charged without a limit check. Returns the file count.
pub async fn import(fs: &mut FileSystem, policy_id: u64, src: &str, dst_path: &str, recursive: bool) -> AppResult<usize> {
    if !fs.user.group.policy_ids.contains(&policy_id) {
        return Err(AppError::policy_not_allowed("policy_not_allowed", format!("policy {} is not available to this user", policy_id)));
    }
    let (_, driver) = fs.driver_for(policy_id)?;
    let objects = driver.list(src, recursive).await?;
    let db = fs.services().db.clone();
    let uid = fs.user.id;
    let (mut imported, mut total) = (0usize, 0u64);
    for o in objects {
        if check_name(&o.name).is_err() {
            tracing::debug!(source = %o.source, "import_illegal_name");
            continue;
        }
        let dir = join(dst_path, &o.relative_path);
        if o.is_dir {
            fs.ensure_directory(&join(&dir, &o.name))?;
            continue;
        }
        let folder = fs.ensure_directory(&dir)?;
        if db.child_file(folder.id, &o.name).is_some() { continue; }
        let now = chrono::Utc::now();
        db.create_file(File {
            id: 0,
            name: o.name.clone(),
            source_name: o.source.clone(),
            user_id: uid,
            size: o.size,
            pic_info: String::new(),
            folder_id: folder.id,
            policy_id,
            created_at: now,
            updated_at: now,
        })?;
        imported += 1;
        total += o.size;
    }
    fs.services().ledger.increase_unchecked(uid, total)?;
    tracing::info!(uid, policy_id, imported, bytes = total, "import_complete");
    Ok(imported)
}

impl FileSystem {
    fn require_archive_task(&self) -> AppResult<()> {
        if !self.user.group.archive_task {
            return Err(AppError::group_not_allowed("archive_task_disabled", "this group cannot create archive tasks"));
        }
        Ok(())
    }

    /// Queue compression of the selection into `dst_path/name`.
    pub async fn submit_compress(&mut self, jobs: &dyn JobSubmitter, dir_ids: &[u64], file_ids: &[u64], dst_path: &str, name: &str) -> AppResult<u64> {
        self.require_archive_task()?;
        self.folder_by_path(dst_path)?;
        check_name(name)?;
        self.set_targets(dir_ids, file_ids);
        if self.dir_target.is_empty() && self.file_target.is_empty() {
            return Err(AppError::not_found("object_not_found", "nothing to compress"));
        }
        let spec = JobSpec::Compress {
            uid: self.user.id,
            dir_ids: self.dir_target.iter().map(|d| d.id).collect(),
            file_ids: self.file_target.iter().map(|f| f.id).collect(),
            dst_path: dst_path.to_string(),
            name: name.to_string(),
        };
        jobs.submit(spec).await
    }

    pub async fn submit_decompress(&mut self, jobs: &dyn JobSubmitter, file_id: u64, dst_path: &str) -> AppResult<u64> {
        self.require_archive_task()?;
        self.owned_file(file_id)?;
        self.folder_by_path(dst_path)?;
        jobs.submit(JobSpec::Decompress { uid: self.user.id, file_id, dst_path: dst_path.to_string() }).await
    }
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod jobs_tests;
