//! Explicit session context replacing ad-hoc global state: every collaborator
//! is constructed once at process start and injected, so tests build a fresh
//! context per case instead of sharing module-level singletons.

use std::sync::Arc;

use crate::accounting::{EntitlementClient, KeyResolver, UsageLedger};
use crate::cache::{ArtifactCache, ArtifactFetcher};
use crate::config::ServiceConfig;
use crate::jobs::{JobStore, JobSubmitter, JobWatcher, WatchConfig};
use crate::provider::InferenceProvider;

pub struct AppSessionContext {
    pub config: ServiceConfig,
    pub entitlements: Arc<dyn EntitlementClient>,
    pub resolver: KeyResolver,
    pub ledger: Arc<dyn UsageLedger>,
    pub store: Arc<dyn JobStore>,
    pub provider: Arc<dyn InferenceProvider>,
    pub cache: ArtifactCache,
    pub submitter: JobSubmitter,
    pub watcher: JobWatcher,
}

impl AppSessionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServiceConfig,
        entitlements: Arc<dyn EntitlementClient>,
        resolver: KeyResolver,
        ledger: Arc<dyn UsageLedger>,
        store: Arc<dyn JobStore>,
        provider: Arc<dyn InferenceProvider>,
        fetcher: Arc<dyn ArtifactFetcher>,
        watch_config: WatchConfig,
    ) -> Self {
        let cache = ArtifactCache::new(config.cache.root.clone(), fetcher)
            .with_min_bytes(config.cache.min_artifact_bytes);
        let submitter = JobSubmitter::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&ledger),
            config.provider.model.clone(),
            config.provider.webhook_url.clone(),
        );
        let watcher = JobWatcher::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&ledger),
            watch_config,
        );
        Self {
            config,
            entitlements,
            resolver,
            ledger,
            store,
            provider,
            cache,
            submitter,
            watcher,
        }
    }
}
