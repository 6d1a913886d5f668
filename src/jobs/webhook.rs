//! Provider webhook path of the status notifier. The payload is narrowed at
//! the boundary and the terminal status is written exactly once; replays
//! and races with the polling path land on the store's absorbing terminal
//! state and become no-ops.

use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::compensation;
use super::store::{JobStore, StoreError, TransitionOutcome};
use super::watcher::map_prediction_status;
use crate::accounting::UsageLedger;
use crate::provider::{first_output_url, PredictionStatus, ProviderError};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown job '{0}'")]
    UnknownJob(String),
    #[error(transparent)]
    Malformed(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Raw provider callback body.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl WebhookPayload {
    fn output_url(&self) -> Option<String> {
        first_output_url(&self.output)
    }
}

/// Apply a provider callback to the tracking row. A second callback for an
/// already-terminal job returns `AlreadySettled`, not an error.
pub async fn apply_webhook(
    store: &Arc<dyn JobStore>,
    ledger: &Arc<dyn UsageLedger>,
    payload: WebhookPayload,
) -> Result<TransitionOutcome, WebhookError> {
    let status = PredictionStatus::from_raw(&payload.status)?;
    let (job_status, failure_reason) = map_prediction_status(status);

    let Some(job) = store.get(&payload.id).await? else {
        warn!(job_id = %payload.id, "webhook for unknown job");
        return Err(WebhookError::UnknownJob(payload.id));
    };

    let outcome = store
        .try_transition(
            &payload.id,
            job_status,
            payload.output_url(),
            payload.error.clone(),
            failure_reason,
        )
        .await?;

    match outcome {
        TransitionOutcome::Applied if job_status.is_terminal() => {
            info!(job_id = %payload.id, status = ?job_status, "webhook settled job");
            if let Err(e) = store.clear_active(&job.accounting_key).await {
                warn!(job_id = %payload.id, "could not clear active job: {e}");
            }
            if job_status == super::JobStatus::Failed {
                compensation::compensate(store, ledger, &payload.id).await;
            }
        }
        TransitionOutcome::AlreadySettled => {
            info!(job_id = %payload.id, "webhook replay for settled job, ignoring");
        }
        _ => {}
    }

    Ok(outcome)
}
