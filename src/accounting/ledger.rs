//! The usage ledger: one record per accounting key, mutated only by the
//! atomic check-and-increment and rollback operations. A per-key async mutex
//! plays the role the original deployment gives to a database row lock; it
//! serializes the compare and the write so two nearly-simultaneous
//! submissions from the same user can never push `count` past `limit`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::cycle::cycle_bounds;
use super::{AccountingKey, PlanType};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub count: u32,
    pub limit: u32,
    pub plan: PlanType,
    /// Canonical original-purchase timestamp (first use for free accounts).
    pub anchor: DateTime<Utc>,
    pub billing_cycle_start: DateTime<Utc>,
    pub next_reset_date: DateTime<Utc>,
    pub last_usage_date: Option<NaiveDate>,
    /// Increments not yet matched by a rollback in the current cycle. Caps
    /// how far rollbacks can decrement.
    pub outstanding: u32,
}

/// Read-only copy of a record, for diagnostics and tests.
pub type LedgerSnapshot = UsageRecord;

/// Canonical subscription-renewal event. Cycle fields are reset from this
/// exactly once per new cycle, never recomputed per-request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalEvent {
    pub plan: PlanType,
    pub limit: u32,
    pub cycle_start: DateTime<Utc>,
    pub next_reset: DateTime<Utc>,
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Atomically compare `count` against `limit` and increment when below.
    /// A row whose reset date has passed is rolled into the current cycle
    /// first. Returns whether the usage was granted.
    async fn check_and_increment(
        &self,
        key: &AccountingKey,
        plan: PlanType,
        limit: u32,
        anchor: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Compensating decrement for a charge whose job did not complete.
    /// Never goes below zero and is a no-op when no increment is
    /// outstanding in the current cycle.
    async fn rollback(&self, key: &AccountingKey) -> Result<bool, LedgerError>;

    /// Apply a canonical renewal event. Returns whether a reset happened
    /// (false for replays of an already-applied cycle).
    async fn apply_renewal(
        &self,
        key: &AccountingKey,
        event: RenewalEvent,
    ) -> Result<bool, LedgerError>;

    async fn snapshot(&self, key: &AccountingKey) -> Result<Option<LedgerSnapshot>, LedgerError>;
}

type RowHandle = Arc<Mutex<UsageRecord>>;

/// In-process ledger. The outer map lock is held only long enough to fetch
/// or create the row handle; the row mutex is the actual serialization
/// point for the read-modify-write.
#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<HashMap<String, RowHandle>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn row(
        &self,
        key: &AccountingKey,
        plan: PlanType,
        limit: u32,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RowHandle {
        let mut rows = self.rows.lock().await;
        rows.entry(key.as_str().to_string())
            .or_insert_with(|| {
                let bounds = cycle_bounds(plan, anchor, now);
                Arc::new(Mutex::new(UsageRecord {
                    count: 0,
                    limit,
                    plan,
                    anchor,
                    billing_cycle_start: bounds.start,
                    next_reset_date: bounds.next_reset,
                    last_usage_date: None,
                    outstanding: 0,
                }))
            })
            .clone()
    }

    async fn existing_row(&self, key: &AccountingKey) -> Option<RowHandle> {
        self.rows.lock().await.get(key.as_str()).cloned()
    }

    pub async fn check_and_increment_at(
        &self,
        key: &AccountingKey,
        plan: PlanType,
        limit: u32,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let handle = self.row(key, plan, limit, anchor, now).await;
        let mut row = handle.lock().await;
        row.plan = plan;
        row.limit = limit;

        // Roll the row into the current cycle once its reset date has
        // passed. Free accounts have no renewal webhook; this is where
        // their allowance comes back.
        if now >= row.next_reset_date {
            let bounds = cycle_bounds(plan, row.anchor, now);
            row.billing_cycle_start = bounds.start;
            row.next_reset_date = bounds.next_reset;
            row.count = 0;
            row.outstanding = 0;
            row.last_usage_date = None;
            info!(key = %key, cycle_start = %bounds.start, "usage cycle rolled forward");
        }

        // Weekly tier carries a daily sub-limit on top of the cycle counter.
        if plan == PlanType::Weekly {
            if let Some(last) = row.last_usage_date {
                if last == now.date_naive() {
                    debug!(key = %key, "daily sub-limit reached");
                    return false;
                }
            }
        }

        if row.count >= row.limit {
            debug!(key = %key, count = row.count, limit = row.limit, "usage limit reached");
            return false;
        }

        row.count += 1;
        row.outstanding += 1;
        row.last_usage_date = Some(now.date_naive());
        debug!(key = %key, count = row.count, limit = row.limit, "usage granted");
        true
    }

    pub async fn rollback_at(&self, key: &AccountingKey, now: DateTime<Utc>) -> bool {
        let Some(handle) = self.existing_row(key).await else {
            return false;
        };
        let mut row = handle.lock().await;
        if row.outstanding == 0 || row.count == 0 {
            debug!(key = %key, "rollback with no outstanding increment, ignoring");
            return false;
        }
        row.count -= 1;
        row.outstanding -= 1;
        // Unblock the daily sub-limit when the rolled-back usage was today's.
        if row.last_usage_date == Some(now.date_naive()) {
            row.last_usage_date = None;
        }
        info!(key = %key, count = row.count, "usage rolled back");
        true
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    async fn check_and_increment(
        &self,
        key: &AccountingKey,
        plan: PlanType,
        limit: u32,
        anchor: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .check_and_increment_at(key, plan, limit, anchor, Utc::now())
            .await)
    }

    async fn rollback(&self, key: &AccountingKey) -> Result<bool, LedgerError> {
        Ok(self.rollback_at(key, Utc::now()).await)
    }

    async fn apply_renewal(
        &self,
        key: &AccountingKey,
        event: RenewalEvent,
    ) -> Result<bool, LedgerError> {
        let handle = self
            .row(key, event.plan, event.limit, event.cycle_start, event.cycle_start)
            .await;
        let mut row = handle.lock().await;
        if event.cycle_start <= row.billing_cycle_start && row.count == 0 && row.outstanding == 0 {
            // Freshly created row already carries the event's cycle.
            row.plan = event.plan;
            row.limit = event.limit;
            row.billing_cycle_start = event.cycle_start;
            row.next_reset_date = event.next_reset;
            return Ok(false);
        }
        if event.cycle_start <= row.billing_cycle_start {
            debug!(key = %key, "renewal replay for an already-applied cycle, ignoring");
            return Ok(false);
        }
        row.plan = event.plan;
        row.limit = event.limit;
        row.billing_cycle_start = event.cycle_start;
        row.next_reset_date = event.next_reset;
        row.count = 0;
        row.outstanding = 0;
        row.last_usage_date = None;
        info!(key = %key, cycle_start = %event.cycle_start, "billing cycle reset");
        Ok(true)
    }

    async fn snapshot(&self, key: &AccountingKey) -> Result<Option<LedgerSnapshot>, LedgerError> {
        match self.existing_row(key).await {
            Some(handle) => Ok(Some(handle.lock().await.clone())),
            None => Ok(None),
        }
    }
}
