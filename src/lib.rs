// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod accounting;
pub mod api;
pub mod cache;
pub mod config;
pub mod jobs;
pub mod provider;
pub mod session;

// Re-export the lifecycle types most callers need.
pub use accounting::{
    AccountingKey, EntitlementClient, KeyResolver, MemoryLedger, PlanType, RenewalEvent,
    Strictness, UsageLedger,
};
pub use cache::{ArtifactCache, ArtifactFetcher, CacheError, HttpFetcher};
pub use config::ServiceConfig;
pub use jobs::{
    GenerationJob, GenerationMode, JobStatus, JobStore, JobSubmitter, JobWatcher, MemoryJobStore,
    SubmitError, SubmitRequest, TransitionOutcome, WatchConfig, WatchError,
};
pub use provider::{HttpProvider, InferenceProvider, Prediction, PredictionStatus, ProviderError};
pub use session::AppSessionContext;
