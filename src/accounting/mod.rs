// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Usage accounting: stable per-user accounting keys, the atomic usage
//! ledger, and billing-cycle arithmetic.

pub mod cycle;
pub mod key;
pub mod ledger;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use key::{
    EntitlementClient, FallbackIdStore, KeyError, KeyResolver, StaticEntitlements, Strictness,
};
pub use ledger::{LedgerSnapshot, MemoryLedger, RenewalEvent, UsageLedger, UsageRecord};

/// Subscription tier driving limits and cycle math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Weekly,
    Monthly,
}

impl PlanType {
    pub fn is_paying(&self) -> bool {
        !matches!(self, PlanType::Free)
    }
}

/// The identifier usage limits are keyed to. Chosen to resist being reset by
/// reinstalling the app: store transaction id for paying users, anonymous
/// installation id for free users, persisted UUID as a last resort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountingKey(String);

impl AccountingKey {
    pub fn from_store_transaction(id: &str) -> Self {
        Self(format!("store:{id}"))
    }

    pub fn from_original_app_user(id: &str) -> Self {
        Self(format!("orig:{id}"))
    }

    pub fn from_anonymous(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn from_fallback_uuid(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
