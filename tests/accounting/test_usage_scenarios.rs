// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Multi-step accounting scenarios: cycle math as the ledger sees it, plan
//! changes mid-cycle, and key isolation.

use chrono::{DateTime, TimeZone, Utc};
use revive_node::accounting::{AccountingKey, MemoryLedger, PlanType, RenewalEvent, UsageLedger};

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
}

#[tokio::test]
async fn late_month_anchor_clamps_the_cycle_boundary() {
    // Subscribed on January 31st: the February boundary clamps to the 29th
    // (leap year) instead of skipping a month.
    let ledger = MemoryLedger::new();
    let key = AccountingKey::from_store_transaction("txn-31st");
    let anchor = utc(2024, 1, 31);
    assert!(
        ledger
            .check_and_increment_at(&key, PlanType::Monthly, 90, anchor, utc(2024, 2, 15))
            .await
    );
    let snap = ledger.snapshot(&key).await.unwrap().unwrap();
    assert_eq!(snap.billing_cycle_start, utc(2024, 1, 31));
    assert_eq!(snap.next_reset_date, utc(2024, 2, 29));
}

#[tokio::test]
async fn renewal_switches_plan_and_reopens_usage() {
    let ledger = MemoryLedger::new();
    let key = AccountingKey::from_store_transaction("txn-upgrade");
    let anchor = utc(2024, 3, 1);
    let today = utc(2024, 3, 10);

    for _ in 0..5 {
        assert!(
            ledger
                .check_and_increment_at(&key, PlanType::Free, 5, anchor, today)
                .await
        );
    }
    assert!(
        !ledger
            .check_and_increment_at(&key, PlanType::Free, 5, anchor, today)
            .await
    );

    // The subscription provider reports a new weekly cycle.
    let granted = ledger
        .apply_renewal(
            &key,
            RenewalEvent {
                plan: PlanType::Weekly,
                limit: 30,
                cycle_start: utc(2024, 3, 10),
                next_reset: utc(2024, 3, 17),
            },
        )
        .await
        .unwrap();
    assert!(granted);

    // Usage reopens under the new plan, with its daily sub-limit in force.
    assert!(
        ledger
            .check_and_increment_at(&key, PlanType::Weekly, 30, anchor, today)
            .await
    );
    assert!(
        !ledger
            .check_and_increment_at(&key, PlanType::Weekly, 30, anchor, today)
            .await
    );
    assert!(
        ledger
            .check_and_increment_at(&key, PlanType::Weekly, 30, anchor, utc(2024, 3, 11))
            .await
    );
}

#[tokio::test]
async fn keys_are_accounted_independently() {
    let ledger = MemoryLedger::new();
    let paying = AccountingKey::from_store_transaction("txn-1");
    let anonymous = AccountingKey::from_anonymous("device-1");
    let anchor = utc(2024, 6, 1);

    for _ in 0..5 {
        assert!(
            ledger
                .check_and_increment_at(&paying, PlanType::Monthly, 5, anchor, anchor)
                .await
        );
    }
    assert!(
        !ledger
            .check_and_increment_at(&paying, PlanType::Monthly, 5, anchor, anchor)
            .await
    );

    // A different key is untouched by the exhausted one.
    assert!(
        ledger
            .check_and_increment_at(&anonymous, PlanType::Free, 5, anchor, anchor)
            .await
    );
    assert_eq!(ledger.snapshot(&anonymous).await.unwrap().unwrap().count, 1);
}

#[tokio::test]
async fn rollback_never_underflows() {
    let ledger = MemoryLedger::new();
    let key = AccountingKey::from_anonymous("careful");
    let anchor = utc(2024, 5, 1);

    assert!(
        ledger
            .check_and_increment_at(&key, PlanType::Free, 5, anchor, anchor)
            .await
    );
    assert!(ledger.rollback_at(&key, anchor).await);
    // The matched increment is spent; nothing further to reverse.
    assert!(!ledger.rollback_at(&key, anchor).await);
    assert_eq!(ledger.snapshot(&key).await.unwrap().unwrap().count, 0);
}
