// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Generation job lifecycle: submission, status delivery, compensation.

pub mod compensation;
pub mod store;
pub mod submitter;
pub mod watcher;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use store::{JobStore, MemoryJobStore, StoreError, TransitionOutcome};
pub use submitter::{JobSubmitter, SubmitError, SubmitRequest};
pub use watcher::{JobWatcher, WatchConfig, WatchError};
pub use webhook::{apply_webhook, WebhookError, WebhookPayload};

use crate::accounting::AccountingKey;

/// Generation modes offered to the client. Each carries a default prompt
/// template used when the caller supplies no custom prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Restoration,
    Colorize,
    Unblur,
    Descratch,
    Background,
    Outfit,
    Memorial,
    Video,
}

impl GenerationMode {
    pub fn prompt_template(&self) -> &'static str {
        match self {
            GenerationMode::Restoration => {
                "Restore this old photograph, repairing damage and fading while preserving the subject"
            }
            GenerationMode::Colorize => {
                "Colorize this black and white photograph with natural, period-accurate colors"
            }
            GenerationMode::Unblur => "Sharpen this photograph and recover fine detail",
            GenerationMode::Descratch => "Remove scratches, dust and creases from this photograph",
            GenerationMode::Background => "Replace the background of this photograph with a clean studio backdrop",
            GenerationMode::Outfit => "Redress the subject of this photograph in formal attire",
            GenerationMode::Memorial => "Create a respectful memorial portrait from this photograph",
            GenerationMode::Video => "Animate this photograph into a short, natural motion clip",
        }
    }

    /// Wall-clock budget for client-side watching of this mode.
    pub fn watch_budget(&self) -> Duration {
        match self {
            GenerationMode::Video => Duration::from_secs(180),
            _ => Duration::from_secs(180),
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, GenerationMode::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Monotonic state machine check. Terminal states are absorbing and
    /// Processing never moves back to Starting.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (JobStatus::Starting, JobStatus::Starting) => false,
            (JobStatus::Processing, JobStatus::Starting | JobStatus::Processing) => false,
            _ => true,
        }
    }
}

/// Why a job ended in `Failed`. Content-policy refusals are surfaced to the
/// user differently from provider-side errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ContentPolicy,
    Provider,
}

/// One request to the inference provider and its tracked lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    /// Provider-assigned prediction id.
    pub id: String,
    pub accounting_key: AccountingKey,
    pub mode: GenerationMode,
    pub status: JobStatus,
    pub input_ref: String,
    pub output_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_reason: Option<FailureReason>,
    /// Whether the usage ledger was charged for this job. Cleared exactly
    /// once when a compensating rollback is issued.
    pub charged: bool,
}

impl GenerationJob {
    pub fn new(
        id: impl Into<String>,
        accounting_key: AccountingKey,
        mode: GenerationMode,
        input_ref: impl Into<String>,
        charged: bool,
    ) -> Self {
        Self {
            id: id.into(),
            accounting_key,
            mode,
            status: JobStatus::Starting,
            input_ref: input_ref.into(),
            output_url: None,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
            failure_reason: None,
            charged,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
