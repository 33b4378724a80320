use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::ExecutionResult;
use crate::{Error, Result};

/// Caller-visible reference to a background execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
    pub target: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(target: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            command: command.into(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobStatus {
    Running,
    Finished(ExecutionResult),
    Cancelled,
}

impl JobStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

struct JobEntry {
    handle: JobHandle,
    status: watch::Sender<JobStatus>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Live background jobs of one engine. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, JobEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a started job. Firing `cancel` asks its worker to kill the shell.
    pub(crate) fn register(&self, handle: JobHandle, cancel: oneshot::Sender<()>) {
        let (status, _) = watch::channel(JobStatus::Running);
        debug!(job = %handle.id, target = %handle.target, "job registered");
        self.lock().insert(
            handle.id,
            JobEntry {
                handle,
                status,
                cancel: Some(cancel),
            },
        );
    }

    pub(crate) fn complete(&self, id: Uuid, status: JobStatus) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.cancel = None;
            entry.status.send_replace(status);
        }
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.lock().get(&id).map(|e| e.status.borrow().clone())
    }

    pub fn handle(&self, id: Uuid) -> Option<JobHandle> {
        self.lock().get(&id).map(|e| e.handle.clone())
    }

    /// Wait until the job leaves `Running`, for at most `limit`.
    ///
    /// The terminal status is handed out once: the job is forgotten when this
    /// returns it, and later lookups report [`Error::JobNotFound`]. Waiters
    /// already subscribed still see the same status.
    pub async fn wait(&self, id: Uuid, limit: Duration) -> Result<JobStatus> {
        let mut rx = self
            .lock()
            .get(&id)
            .map(|e| e.status.subscribe())
            .ok_or(Error::JobNotFound(id))?;

        let status = match tokio::time::timeout(limit, rx.wait_for(|s| !s.is_running())).await {
            Ok(Ok(status)) => status.clone(),
            // entry removed while waiting
            Ok(Err(_)) => return Err(Error::JobNotFound(id)),
            Err(_) => return Err(Error::WaitExpired(id)),
        };
        if self.lock().remove(&id).is_some() {
            debug!(job = %id, "job released");
        }
        Ok(status)
    }

    /// Request cancellation. `false` when the job had already ended.
    pub fn cancel(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.lock();
        let entry = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        match entry.cancel.take() {
            Some(tx) => {
                info!(job = %id, target = %entry.handle.target, "cancelling background job");
                Ok(tx.send(()).is_ok())
            }
            None => Ok(false),
        }
    }

    /// Cancel every running job, returning how many were signalled.
    ///
    /// Signalled jobs are marked `Cancelled` and, like every job that already
    /// ended, dropped from the registry. Only jobs cancelled one by one and
    /// still winding down are kept.
    pub fn cancel_all(&self) -> usize {
        let mut jobs = self.lock();
        let mut signalled = 0;
        for entry in jobs.values_mut() {
            if let Some(tx) = entry.cancel.take() {
                if tx.send(()).is_ok() {
                    signalled += 1;
                }
                entry.status.send_replace(JobStatus::Cancelled);
            }
        }
        let before = jobs.len();
        jobs.retain(|_, e| e.status.borrow().is_running());
        if signalled > 0 {
            info!(count = signalled, "cancelled background jobs");
        }
        debug!(released = before - jobs.len(), kept = jobs.len(), "job registry swept");
        signalled
    }

    /// Forget a job, returning its last status.
    pub fn remove(&self, id: Uuid) -> Option<JobStatus> {
        self.lock()
            .remove(&id)
            .map(|e| e.status.borrow().clone())
    }

    pub fn running(&self) -> Vec<JobHandle> {
        self.lock()
            .values()
            .filter(|e| e.status.borrow().is_running())
            .map(|e| e.handle.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
