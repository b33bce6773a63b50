//! Background jobs for slow fleet work (teardown and its operation waits).
//!
//! Jobs run on spawned tokio tasks and report through a shared table that
//! callers poll. Cancelling a job aborts its task.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded(String),
    Failed(String),
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded(_) | JobStatus::Failed(_) | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub description: String,
    pub status: JobStatus,
    pub created_at: String,
    pub finished_at: Option<String>,
    #[serde(skip)]
    abort: Option<AbortHandle>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job '{0}' not found")]
    NotFound(String),
    #[error("job '{0}' already finished")]
    Finished(String),
}

#[derive(Clone, Default)]
pub struct JobQueue {
    jobs: Arc<Mutex<Vec<Job>>>,
    next_id: Arc<AtomicU64>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `work` and return its id immediately.
    pub fn submit<F>(&self, description: impl Into<String>, work: F) -> String
    where
        F: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let description = description.into();
        self.lock().push(Job {
            id: id.clone(),
            description: description.clone(),
            status: JobStatus::Pending,
            created_at: now(),
            finished_at: None,
            abort: None,
        });

        let queue = self.clone();
        let job_id = id.clone();
        let handle = tokio::spawn(async move {
            queue.update(&job_id, JobStatus::Running);
            debug!(job = %job_id, "job started");
            let status = match work.await {
                Ok(summary) => JobStatus::Succeeded(summary),
                Err(err) => {
                    warn!(job = %job_id, "job failed: {:#}", err);
                    JobStatus::Failed(format!("{:#}", err))
                }
            };
            queue.update(&job_id, status);
        });

        if let Some(job) = self.lock().iter_mut().find(|job| job.id == id) {
            job.abort = Some(handle.abort_handle());
        }
        info!(job = %id, "queued: {}", description);
        id
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().iter().find(|job| job.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Job> {
        self.lock().clone()
    }

    /// Stop a queued or running job. Finished jobs keep their outcome.
    pub fn cancel(&self, id: &str) -> Result<(), JobError> {
        let mut jobs = self.lock();
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if job.status.is_terminal() {
            return Err(JobError::Finished(id.to_string()));
        }
        if let Some(abort) = job.abort.take() {
            abort.abort();
        }
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now());
        info!(job = %id, "job cancelled");
        Ok(())
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait(&self, id: &str, interval: Duration) -> Result<Job, JobError> {
        loop {
            let job = self
                .get(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn update(&self, id: &str, status: JobStatus) {
        let mut jobs = self.lock();
        if let Some(job) = jobs.iter_mut().find(|job| job.id == id) {
            // A cancelled job keeps that status even if its task got further.
            if job.status == JobStatus::Cancelled {
                return;
            }
            if status.is_terminal() {
                job.finished_at = Some(now());
                job.abort = None;
            }
            job.status = status;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "now".to_string())
}
