// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Boundary to the external inference provider. Raw provider payloads are
//! narrowed into tagged types here; nothing loosely-typed travels deeper
//! into the system.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::HttpProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed provider payload: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Rate-limit responses are surfaced to the client as SERVICE_BUSY.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::Api { status: 429, .. })
    }
}

/// Narrowed prediction status. `Flagged` covers the provider's
/// blocked/rejected statuses returned for safety-filtered inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    Flagged,
}

impl PredictionStatus {
    pub fn from_raw(raw: &str) -> Result<Self, ProviderError> {
        match raw {
            "starting" | "queued" => Ok(PredictionStatus::Starting),
            "processing" => Ok(PredictionStatus::Processing),
            "succeeded" => Ok(PredictionStatus::Succeeded),
            "failed" => Ok(PredictionStatus::Failed),
            "canceled" => Ok(PredictionStatus::Canceled),
            "blocked" | "rejected" => Ok(PredictionStatus::Flagged),
            other => Err(ProviderError::Malformed(format!(
                "unknown prediction status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PredictionStatus::Starting | PredictionStatus::Processing)
    }
}

/// Pull one artifact URL out of a raw `output` value. Models return either
/// a bare string or an array of URLs; both delivery paths narrow through
/// here.
pub fn first_output_url(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => {
            items.iter().find_map(|v| v.as_str().map(str::to_string))
        }
        _ => None,
    }
}

/// One prediction as seen by this node, already narrowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

/// Outbound request. The image is carried as a data URL the way the
/// provider expects it.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRequest {
    pub model: String,
    pub prompt: String,
    pub input_data_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn create_prediction(&self, req: &PredictionRequest) -> Result<Prediction, ProviderError>;
    async fn get_prediction(&self, id: &str) -> Result<Prediction, ProviderError>;
    async fn cancel_prediction(&self, id: &str) -> Result<(), ProviderError>;
}
