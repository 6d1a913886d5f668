//! Job tracking store. The row's current status is the source of truth for
//! races between the polling and webhook paths: terminal statuses are
//! absorbing, and late writes that would regress a job are dropped.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{FailureReason, GenerationJob, JobStatus};
use crate::accounting::AccountingKey;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store backend error: {0}")]
    Backend(String),
}

/// Result of an attempted status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The job was already terminal; the write was dropped.
    AlreadySettled,
    NotFound,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: GenerationJob) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<GenerationJob>, StoreError>;

    /// Write a status if the state machine permits it. Idempotent against
    /// replays and against the sibling delivery path.
    async fn try_transition(
        &self,
        id: &str,
        status: JobStatus,
        output_url: Option<String>,
        error_message: Option<String>,
        failure_reason: Option<FailureReason>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Atomically clear the job's charged flag, returning whether it was
    /// set. Guards the compensating rollback so it runs at most once.
    async fn take_charge(&self, id: &str) -> Result<bool, StoreError>;

    /// Remember the caller's in-flight job so a restarted client can resume
    /// watching it.
    async fn set_active(&self, key: &AccountingKey, job_id: &str) -> Result<(), StoreError>;
    async fn active_for(&self, key: &AccountingKey) -> Result<Option<String>, StoreError>;
    async fn clear_active(&self, key: &AccountingKey) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, GenerationJob>>,
    active: RwLock<HashMap<String, String>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: GenerationJob) -> Result<(), StoreError> {
        info!(job_id = %job.id, mode = ?job.mode, "tracking job");
        self.jobs.write().await.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<GenerationJob>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn try_transition(
        &self,
        id: &str,
        status: JobStatus,
        output_url: Option<String>,
        error_message: Option<String>,
        failure_reason: Option<FailureReason>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if job.status.is_terminal() {
            debug!(job_id = %id, current = ?job.status, attempted = ?status, "job already settled");
            return Ok(TransitionOutcome::AlreadySettled);
        }
        if !job.status.can_transition_to(status) {
            debug!(job_id = %id, current = ?job.status, attempted = ?status, "dropping out-of-order write");
            return Ok(TransitionOutcome::AlreadySettled);
        }
        job.status = status;
        if output_url.is_some() {
            job.output_url = output_url;
        }
        if error_message.is_some() {
            job.error_message = error_message;
        }
        if failure_reason.is_some() {
            job.failure_reason = failure_reason;
        }
        if status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        info!(job_id = %id, status = ?status, "job status updated");
        Ok(TransitionOutcome::Applied)
    }

    async fn take_charge(&self, id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.charged => {
                job.charged = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_active(&self, key: &AccountingKey, job_id: &str) -> Result<(), StoreError> {
        self.active
            .write()
            .await
            .insert(key.as_str().to_string(), job_id.to_string());
        Ok(())
    }

    async fn active_for(&self, key: &AccountingKey) -> Result<Option<String>, StoreError> {
        Ok(self.active.read().await.get(key.as_str()).cloned())
    }

    async fn clear_active(&self, key: &AccountingKey) -> Result<(), StoreError> {
        self.active.write().await.remove(key.as_str());
        Ok(())
    }
}
