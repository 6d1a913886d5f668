//! Compensating rollback for charged jobs that did not complete. The job
//! row's charged flag is the exactly-once guard; a failed rollback is
//! logged and swallowed so it never masks the user-facing error.

use std::sync::Arc;
use tracing::{info, warn};

use super::store::JobStore;
use crate::accounting::UsageLedger;

/// Reverse the ledger charge for `job_id` if one is still outstanding.
/// Returns whether a rollback was actually issued.
pub async fn compensate(
    store: &Arc<dyn JobStore>,
    ledger: &Arc<dyn UsageLedger>,
    job_id: &str,
) -> bool {
    let job = match store.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return false,
        Err(e) => {
            warn!(job_id, "compensation lookup failed: {e}");
            return false;
        }
    };

    match store.take_charge(job_id).await {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            warn!(job_id, "could not claim charge for compensation: {e}");
            return false;
        }
    }

    match ledger.rollback(&job.accounting_key).await {
        Ok(true) => {
            info!(job_id, key = %job.accounting_key, "usage charge compensated");
            true
        }
        Ok(false) => {
            warn!(job_id, key = %job.accounting_key, "rollback found no outstanding charge");
            false
        }
        Err(e) => {
            warn!(job_id, key = %job.accounting_key, "rollback failed, surfacing to diagnostics only: {e}");
            false
        }
    }
}
