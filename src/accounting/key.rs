//! Accounting-key resolution. Paying users are keyed to their store
//! transaction id (populated a short delay after purchase, hence the bounded
//! retry), free users to the anonymous installation id. A persisted UUID is
//! the last resort so repeated calls never fabricate fresh keys.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AccountingKey, PlanType};

/// How to treat an unresolvable key for a paying-tier feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Fall through to the persisted UUID.
    Standard,
    /// Deny access outright. An easily-reset identifier would defeat the
    /// abuse-prevention purpose of the ledger.
    Bulletproof,
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no accounting key could be resolved for a paying-tier feature")]
    Unresolvable,
    #[error("entitlement lookup failed: {0}")]
    Entitlement(String),
    #[error("fallback id storage failed: {0}")]
    Storage(String),
}

/// Boundary to the subscription SDK. Implementations narrow whatever the SDK
/// returns into these three optional identifiers.
#[async_trait]
pub trait EntitlementClient: Send + Sync {
    /// The caller's current subscription tier.
    async fn active_plan(&self) -> Result<PlanType, KeyError>;
    async fn store_transaction_id(&self) -> Result<Option<String>, KeyError>;
    async fn original_app_user_id(&self) -> Result<Option<String>, KeyError>;
    async fn anonymous_id(&self) -> Result<Option<String>, KeyError>;
    /// Canonical anchor for billing-cycle math. `None` for never-subscribed
    /// users; the ledger then anchors at first use.
    async fn original_purchase_date(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>, KeyError>;
}

/// Secure on-device storage for the last-resort UUID.
pub trait FallbackIdStore: Send + Sync {
    fn load(&self) -> Result<Option<String>, KeyError>;
    fn save(&self, id: &str) -> Result<(), KeyError>;
}

pub struct KeyResolver {
    entitlements: Arc<dyn EntitlementClient>,
    fallback: Arc<dyn FallbackIdStore>,
    attempts: u32,
    retry_delay: Duration,
}

impl KeyResolver {
    pub fn new(entitlements: Arc<dyn EntitlementClient>, fallback: Arc<dyn FallbackIdStore>) -> Self {
        Self {
            entitlements,
            fallback,
            attempts: 3,
            retry_delay: Duration::from_millis(750),
        }
    }

    pub fn with_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts;
        self.retry_delay = retry_delay;
        self
    }

    /// Resolve the accounting key for `plan`. Exactly one key form is
    /// returned per call and repeated calls resolve to the same key as long
    /// as a previous one is retrievable.
    pub async fn resolve(
        &self,
        plan: PlanType,
        strictness: Strictness,
    ) -> Result<AccountingKey, KeyError> {
        if !plan.is_paying() {
            if let Some(id) = self.entitlements.anonymous_id().await? {
                return Ok(AccountingKey::from_anonymous(&id));
            }
            debug!("anonymous id unavailable, using persisted fallback");
            return self.persisted_fallback();
        }

        // Store transaction ids propagate late post-purchase; retry a bounded
        // number of times before moving down the chain.
        for attempt in 1..=self.attempts {
            match self.entitlements.store_transaction_id().await {
                Ok(Some(id)) => return Ok(AccountingKey::from_store_transaction(&id)),
                Ok(None) => debug!(attempt, "store transaction id not yet populated"),
                Err(e) => warn!(attempt, "store transaction id lookup failed: {e}"),
            }
            if attempt < self.attempts {
                sleep(self.retry_delay).await;
            }
        }

        if let Ok(Some(id)) = self.entitlements.original_app_user_id().await {
            return Ok(AccountingKey::from_original_app_user(&id));
        }

        match strictness {
            Strictness::Bulletproof => Err(KeyError::Unresolvable),
            Strictness::Standard => self.persisted_fallback(),
        }
    }

    fn persisted_fallback(&self) -> Result<AccountingKey, KeyError> {
        if let Some(existing) = self.fallback.load()? {
            return Ok(AccountingKey::from_fallback_uuid(&existing));
        }
        let fresh = Uuid::new_v4().to_string();
        self.fallback.save(&fresh)?;
        Ok(AccountingKey::from_fallback_uuid(&fresh))
    }
}

/// Fixed entitlement state, for deployments where the tier is established
/// out of band and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    pub plan: Option<PlanType>,
    pub store_transaction_id: Option<String>,
    pub original_app_user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub original_purchase_date: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
impl EntitlementClient for StaticEntitlements {
    async fn active_plan(&self) -> Result<PlanType, KeyError> {
        Ok(self.plan.unwrap_or(PlanType::Free))
    }

    async fn store_transaction_id(&self) -> Result<Option<String>, KeyError> {
        Ok(self.store_transaction_id.clone())
    }

    async fn original_app_user_id(&self) -> Result<Option<String>, KeyError> {
        Ok(self.original_app_user_id.clone())
    }

    async fn anonymous_id(&self) -> Result<Option<String>, KeyError> {
        Ok(self.anonymous_id.clone())
    }

    async fn original_purchase_date(
        &self,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, KeyError> {
        Ok(self.original_purchase_date)
    }
}

/// File-backed fallback store; stands in for the platform secure storage.
pub struct FileFallbackStore {
    path: std::path::PathBuf,
}

impl FileFallbackStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FallbackIdStore for FileFallbackStore {
    fn load(&self) -> Result<Option<String>, KeyError> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeyError::Storage(e.to_string())),
        }
    }

    fn save(&self, id: &str) -> Result<(), KeyError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KeyError::Storage(e.to_string()))?;
        }
        std::fs::write(&self.path, id).map_err(|e| KeyError::Storage(e.to_string()))
    }
}
