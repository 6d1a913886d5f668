// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Request handlers for the generation lifecycle endpoints.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::errors::ApiError;
use super::http_server::AppState;
use crate::accounting::{PlanType, RenewalEvent, Strictness};
use crate::jobs::webhook::{apply_webhook, WebhookPayload};
use crate::jobs::{FailureReason, GenerationJob, GenerationMode, JobStatus, SubmitRequest};

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    pub mode: GenerationMode,
    /// Base64-encoded image payload.
    pub image: String,
    pub prompt: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct GenerationAccepted {
    pub job_id: String,
}

/// Client-facing view of a job row. Accounting internals stay private.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub mode: GenerationMode,
    pub status: JobStatus,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<GenerationJob> for JobView {
    fn from(job: GenerationJob) -> Self {
        Self {
            id: job.id,
            mode: job.mode,
            status: job.status,
            output_url: job.output_url,
            error_message: job.error_message,
            failure_reason: job.failure_reason,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResultReady {
    pub job: JobView,
    /// Path of the locally cached artifact.
    pub local_path: String,
}

#[derive(Debug, Serialize)]
pub struct ActiveJobResponse {
    pub job_id: Option<String>,
}

/// POST /v1/generations — charge the ledger, then dispatch.
pub async fn submit_generation(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<GenerationAccepted>), ApiError> {
    if state.limiter.check().is_err() {
        return Err(ApiError::ServiceBusy { retry_after: 60 });
    }

    let image = BASE64
        .decode(request.image.as_bytes())
        .map_err(|_| ApiError::InvalidRequest("image must be valid base64".into()))?;
    if image.is_empty() {
        return Err(ApiError::InvalidRequest("image must not be empty".into()));
    }

    let ctx = &state.ctx;
    let plan = ctx.entitlements.active_plan().await?;
    if request.mode.is_video() && !plan.is_paying() {
        return Err(ApiError::ProRequired);
    }

    let key = ctx.resolver.resolve(plan, strictness_for(plan)).await?;

    let anchor = ctx
        .entitlements
        .original_purchase_date()
        .await?
        .unwrap_or_else(Utc::now);
    let limit = ctx.config.plans.for_plan(plan);
    let charged = ctx
        .ledger
        .check_and_increment(&key, plan, limit, anchor)
        .await?;
    if !charged {
        info!(key = %key, ?plan, "submission denied, limit reached");
        return Err(ApiError::LimitExceeded);
    }

    let job_id = ctx
        .submitter
        .submit(
            SubmitRequest {
                image,
                mode: request.mode,
                custom_prompt: request.prompt,
                params: request.params,
            },
            &key,
            true,
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(GenerationAccepted { job_id })))
}

/// GET /v1/generations/:id — poll target for job status.
pub async fn get_generation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    match state.ctx.store.get(&id).await? {
        Some(job) => Ok(Json(job.into())),
        None => Err(ApiError::NotFound(format!("unknown job '{id}'"))),
    }
}

/// GET /v1/generations/:id/result — long-poll until the job settles, then
/// return the locally cached artifact.
pub async fn get_generation_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResultReady>, ApiError> {
    let job = state.ctx.watcher.watch(&id).await?;
    let output_url = job
        .output_url
        .clone()
        .ok_or_else(|| ApiError::InternalError("job settled without an output URL".into()))?;

    let local_path = match state.ctx.cache.get_or_fetch(&output_url).await {
        Ok(path) => path,
        Err(e) => {
            warn!(job_id = %id, "artifact caching failed: {e}");
            return Err(ApiError::InternalError(e.to_string()));
        }
    };

    Ok(Json(ResultReady {
        job: job.into(),
        local_path: local_path.display().to_string(),
    }))
}

/// GET /v1/generations/active — in-flight job for the caller, so a
/// restarted client can resume watching.
pub async fn get_active_generation(
    State(state): State<AppState>,
) -> Result<Json<ActiveJobResponse>, ApiError> {
    let ctx = &state.ctx;
    let plan = ctx.entitlements.active_plan().await?;
    // Same strictness as submission, or the lookup would resolve a
    // different key than the one the job was recorded under.
    let key = ctx.resolver.resolve(plan, strictness_for(plan)).await?;
    let job_id = ctx.store.active_for(&key).await?;
    Ok(Json(ActiveJobResponse { job_id }))
}

/// Paying tiers must prove a durable identity; an easily-reset fallback
/// would defeat the ledger.
fn strictness_for(plan: PlanType) -> Strictness {
    if plan.is_paying() {
        Strictness::Bulletproof
    } else {
        Strictness::Standard
    }
}

/// POST /v1/generations/:id/cancel — cooperative, best-effort cancel. The
/// local record is marked canceled whether or not the upstream cancel lands.
pub async fn cancel_generation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let ctx = &state.ctx;
    let Some(job) = ctx.store.get(&id).await? else {
        return Err(ApiError::NotFound(format!("unknown job '{id}'")));
    };
    if job.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "job is already {:?}",
            job.status
        )));
    }

    if let Err(e) = ctx.provider.cancel_prediction(&id).await {
        // Upstream may have already finished; the local record still wins.
        warn!(job_id = %id, "upstream cancel failed: {e}");
    }

    ctx.store
        .try_transition(&id, JobStatus::Canceled, None, None, None)
        .await?;
    if let Err(e) = ctx.store.clear_active(&job.accounting_key).await {
        warn!(job_id = %id, "could not clear active job: {e}");
    }

    let settled = ctx
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown job '{id}'")))?;
    Ok(Json(settled.into()))
}

/// POST /v1/webhooks/provider — terminal status push from the provider.
pub async fn provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> Result<StatusCode, ApiError> {
    verify_webhook_secret(&state, &headers)?;
    apply_webhook(&state.ctx.store, &state.ctx.ledger, payload).await?;
    // Replays for settled jobs are acknowledged, not errored, so the
    // provider stops retrying.
    Ok(StatusCode::OK)
}

/// Canonical renewal event from the subscription provider.
#[derive(Debug, Deserialize)]
pub struct RenewalNotice {
    pub accounting_key: String,
    pub plan: PlanType,
    pub limit: Option<u32>,
    pub cycle_start: DateTime<Utc>,
    pub next_reset: DateTime<Utc>,
}

/// POST /v1/webhooks/subscription — reset cycle fields exactly once per new
/// billing cycle.
pub async fn subscription_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(notice): Json<RenewalNotice>,
) -> Result<StatusCode, ApiError> {
    verify_webhook_secret(&state, &headers)?;
    let key = crate::accounting::AccountingKey::from_anonymous(&notice.accounting_key);
    let limit = notice
        .limit
        .unwrap_or_else(|| state.ctx.config.plans.for_plan(notice.plan));
    state
        .ctx
        .ledger
        .apply_renewal(
            &key,
            RenewalEvent {
                plan: notice.plan,
                limit,
                cycle_start: notice.cycle_start,
                next_reset: notice.next_reset,
            },
        )
        .await?;
    Ok(StatusCode::OK)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn verify_webhook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.ctx.config.webhook_secret.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid webhook secret".into()))
    }
}
