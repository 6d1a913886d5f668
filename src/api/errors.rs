// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! API error taxonomy. Limit and content-policy errors surface verbatim to
//! the client; everything ambiguous collapses to a generic internal error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::accounting::key::KeyError;
use crate::accounting::ledger::LedgerError;
use crate::jobs::store::StoreError;
use crate::jobs::{SubmitError, WatchError, WebhookError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
    pub details: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub enum ApiError {
    /// The user's usage cap for the current cycle (or day) is spent.
    LimitExceeded,
    /// The feature requires a paying entitlement that could not be proven.
    ProRequired,
    /// The service (or the upstream provider) is rate limiting.
    ServiceBusy { retry_after: u64 },
    /// The provider refused the input; the user must change image or prompt.
    ContentPolicy(String),
    InvalidRequest(String),
    Unauthorized(String),
    NotFound(String),
    /// The job is in a state the requested operation does not apply to.
    Conflict(String),
    /// Ambiguous outcome; the job may still resolve later.
    Timeout,
    InternalError(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::LimitExceeded => "PHOTO_LIMIT_EXCEEDED",
            ApiError::ProRequired => "PRO_REQUIRED",
            ApiError::ServiceBusy { .. } => "SERVICE_BUSY",
            ApiError::ContentPolicy(_) => "CONTENT_POLICY_BLOCKED",
            ApiError::InvalidRequest(_) => "INVALID_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Timeout => "TIMEOUT",
            ApiError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::LimitExceeded | ApiError::ProRequired => StatusCode::FORBIDDEN,
            ApiError::ServiceBusy { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ContentPolicy(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_response(&self, request_id: Option<String>) -> ErrorResponse {
        let (message, details) = match self {
            ApiError::LimitExceeded => (
                "Usage limit reached for the current period".to_string(),
                None,
            ),
            ApiError::ProRequired => (
                "This feature requires an active subscription".to_string(),
                None,
            ),
            ApiError::ServiceBusy { retry_after } => {
                let mut details = HashMap::new();
                details.insert(
                    "retry_after".to_string(),
                    serde_json::Value::Number((*retry_after).into()),
                );
                (
                    "Service is busy, try again shortly".to_string(),
                    Some(details),
                )
            }
            ApiError::ContentPolicy(msg) => (
                if msg.is_empty() {
                    "Input was refused by the content policy".to_string()
                } else {
                    msg.clone()
                },
                None,
            ),
            ApiError::InvalidRequest(msg) => (msg.clone(), None),
            ApiError::Unauthorized(msg) => (msg.clone(), None),
            ApiError::NotFound(msg) => (msg.clone(), None),
            ApiError::Conflict(msg) => (msg.clone(), None),
            ApiError::Timeout => (
                "Generation did not finish in time; it may still complete".to_string(),
                None,
            ),
            ApiError::InternalError(msg) => (msg.clone(), None),
        };

        ErrorResponse {
            code: self.code().to_string(),
            message,
            request_id,
            details,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.to_response(None).message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.to_response(None);
        (self.status_code(), axum::Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::PayloadTooLarge | SubmitError::InvalidImage(_) => {
                ApiError::InvalidRequest(e.to_string())
            }
            SubmitError::Provider(p) if p.is_rate_limited() => {
                ApiError::ServiceBusy { retry_after: 30 }
            }
            SubmitError::Provider(p) => ApiError::InternalError(p.to_string()),
            SubmitError::Tracking(s) => ApiError::InternalError(s.to_string()),
        }
    }
}

impl From<WatchError> for ApiError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::Timeout => ApiError::Timeout,
            WatchError::ContentPolicy(msg) => ApiError::ContentPolicy(msg),
            WatchError::Canceled => ApiError::Conflict("generation was canceled".into()),
            WatchError::NotFound(id) => ApiError::NotFound(format!("unknown job '{id}'")),
            WatchError::Failed(msg) => ApiError::InternalError(msg),
            WatchError::Store(s) => ApiError::InternalError(s.to_string()),
        }
    }
}

impl From<KeyError> for ApiError {
    fn from(e: KeyError) -> Self {
        match e {
            // Deliberate anti-abuse tradeoff: an unresolvable key for a
            // paying-tier feature is a capability block, not a fallback.
            KeyError::Unresolvable => ApiError::ProRequired,
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError::InternalError(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::InternalError(e.to_string())
    }
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::UnknownJob(id) => ApiError::NotFound(format!("unknown job '{id}'")),
            WebhookError::Malformed(p) => ApiError::InvalidRequest(p.to_string()),
            WebhookError::Store(s) => ApiError::InternalError(s.to_string()),
        }
    }
}
