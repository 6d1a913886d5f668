//! Client-side polling path of the status notifier. Waits an initial grace
//! period (jobs never finish faster), polls tightly for the first stretch,
//! then widens, all bounded by a wall-clock budget. Timeout is a distinct,
//! non-terminal outcome: a later webhook may still resolve the job.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::compensation;
use super::store::{JobStore, StoreError, TransitionOutcome};
use super::{FailureReason, GenerationJob, JobStatus};
use crate::accounting::UsageLedger;
use crate::provider::{InferenceProvider, PredictionStatus};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Initial delay before the first poll.
    pub grace: Duration,
    /// Poll interval while inside the tight window.
    pub tight_interval: Duration,
    pub tight_window: Duration,
    pub wide_interval: Duration,
    /// Consecutive transient provider errors tolerated before surfacing.
    pub max_transient_errors: u32,
    /// Overrides the mode's wall-clock budget when set.
    pub budget_override: Option<Duration>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            tight_interval: Duration::from_millis(1500),
            tight_window: Duration::from_secs(10),
            wide_interval: Duration::from_secs(5),
            max_transient_errors: 3,
            budget_override: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    /// The budget elapsed with the job still in flight. The outcome is
    /// ambiguous; the job is deliberately left non-terminal.
    #[error("generation did not finish within the time budget")]
    Timeout,
    #[error("input was refused by the provider's content policy: {0}")]
    ContentPolicy(String),
    #[error("generation failed: {0}")]
    Failed(String),
    #[error("generation was canceled")]
    Canceled,
    #[error("unknown job '{0}'")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct JobWatcher {
    provider: Arc<dyn InferenceProvider>,
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn UsageLedger>,
    config: WatchConfig,
}

impl JobWatcher {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn UsageLedger>,
        config: WatchConfig,
    ) -> Self {
        Self {
            provider,
            store,
            ledger,
            config,
        }
    }

    /// Poll until the job settles or the budget runs out, returning the
    /// terminal row on success.
    pub async fn watch(&self, job_id: &str) -> Result<GenerationJob, WatchError> {
        let Some(job) = self.store.get(job_id).await? else {
            return Err(WatchError::NotFound(job_id.to_string()));
        };
        let budget = self.config.budget_override.unwrap_or(job.mode.watch_budget());
        let started = Instant::now();
        let mut transient_errors = 0u32;

        sleep(self.config.grace).await;

        loop {
            // The tracking row is the source of truth; the webhook may have
            // settled the job between polls.
            if let Some(current) = self.store.get(job_id).await? {
                if current.is_terminal() {
                    return self.resolve_terminal(current).await;
                }
            }

            match self.provider.get_prediction(job_id).await {
                Ok(prediction) => {
                    transient_errors = 0;
                    let (status, reason) = map_prediction_status(prediction.status);
                    let outcome = self
                        .store
                        .try_transition(
                            job_id,
                            status,
                            prediction.output_url.clone(),
                            prediction.error.clone(),
                            reason,
                        )
                        .await?;
                    if status.is_terminal() && outcome != TransitionOutcome::NotFound {
                        let settled = self
                            .store
                            .get(job_id)
                            .await?
                            .ok_or_else(|| WatchError::NotFound(job_id.to_string()))?;
                        return self.resolve_terminal(settled).await;
                    }
                }
                Err(e) => {
                    transient_errors += 1;
                    warn!(job_id, attempt = transient_errors, "poll failed: {e}");
                    if transient_errors > self.config.max_transient_errors {
                        return Err(WatchError::Failed(e.to_string()));
                    }
                }
            }

            if started.elapsed() >= budget {
                debug!(job_id, "watch budget exhausted, leaving job in flight");
                return Err(WatchError::Timeout);
            }

            let interval = if started.elapsed() < self.config.tight_window {
                self.config.tight_interval
            } else {
                self.config.wide_interval
            };
            sleep(interval).await;
        }
    }

    async fn resolve_terminal(&self, job: GenerationJob) -> Result<GenerationJob, WatchError> {
        if let Err(e) = self.store.clear_active(&job.accounting_key).await {
            warn!(job_id = %job.id, "could not clear active job: {e}");
        }
        match job.status {
            JobStatus::Succeeded => Ok(job),
            JobStatus::Canceled => Err(WatchError::Canceled),
            JobStatus::Failed => {
                compensation::compensate(&self.store, &self.ledger, &job.id).await;
                let message = job.error_message.clone().unwrap_or_default();
                match job.failure_reason {
                    Some(FailureReason::ContentPolicy) => Err(WatchError::ContentPolicy(message)),
                    _ => Err(WatchError::Failed(message)),
                }
            }
            // Non-terminal statuses never reach here.
            _ => Err(WatchError::Failed("job not settled".into())),
        }
    }
}

/// Map a narrowed provider status onto the local state machine. The
/// provider reports canceled/blocked for safety-filtered inputs, so both
/// become a content-policy failure rather than a generic one.
pub fn map_prediction_status(status: PredictionStatus) -> (JobStatus, Option<FailureReason>) {
    match status {
        PredictionStatus::Starting => (JobStatus::Starting, None),
        PredictionStatus::Processing => (JobStatus::Processing, None),
        PredictionStatus::Succeeded => (JobStatus::Succeeded, None),
        PredictionStatus::Failed => (JobStatus::Failed, Some(FailureReason::Provider)),
        PredictionStatus::Canceled | PredictionStatus::Flagged => {
            (JobStatus::Failed, Some(FailureReason::ContentPolicy))
        }
    }
}
