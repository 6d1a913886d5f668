// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Lifecycle tests through the public crate surface: a ledger charge is
//! taken, the job is dispatched, and every failure path returns the ledger
//! to its pre-submission state exactly once.

use async_trait::async_trait;
use chrono::Utc;
use image::ImageFormat;
use revive_node::accounting::{AccountingKey, MemoryLedger, PlanType, UsageLedger};
use revive_node::jobs::store::StoreError;
use revive_node::jobs::{
    apply_webhook, GenerationJob, GenerationMode, JobStatus, JobStore, JobSubmitter,
    MemoryJobStore, SubmitError, SubmitRequest, TransitionOutcome, WebhookPayload,
};
use revive_node::provider::{
    InferenceProvider, Prediction, PredictionRequest, PredictionStatus, ProviderError,
};
use serde_json::json;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct StubProvider {
    created: AtomicU32,
    canceled: Mutex<Vec<String>>,
    fail_create: bool,
}

#[async_trait]
impl InferenceProvider for StubProvider {
    async fn create_prediction(&self, _req: &PredictionRequest) -> Result<Prediction, ProviderError> {
        if self.fail_create {
            return Err(ProviderError::Api {
                status: 500,
                message: "upstream exploded".into(),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Prediction {
            id: format!("pred-{n}"),
            status: PredictionStatus::Starting,
            output_url: None,
            error: None,
        })
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction, ProviderError> {
        Ok(Prediction {
            id: id.to_string(),
            status: PredictionStatus::Processing,
            output_url: None,
            error: None,
        })
    }

    async fn cancel_prediction(&self, id: &str) -> Result<(), ProviderError> {
        self.canceled.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Store whose insert always fails, to exercise the unwind path.
struct BrokenStore;

#[async_trait]
impl JobStore for BrokenStore {
    async fn insert(&self, _job: GenerationJob) -> Result<(), StoreError> {
        Err(StoreError::Backend("tracking database is down".into()))
    }

    async fn get(&self, _id: &str) -> Result<Option<GenerationJob>, StoreError> {
        Ok(None)
    }

    async fn try_transition(
        &self,
        _id: &str,
        _status: JobStatus,
        _output_url: Option<String>,
        _error_message: Option<String>,
        _failure_reason: Option<revive_node::jobs::FailureReason>,
    ) -> Result<TransitionOutcome, StoreError> {
        Ok(TransitionOutcome::NotFound)
    }

    async fn take_charge(&self, _id: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn set_active(&self, _key: &AccountingKey, _job_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn active_for(&self, _key: &AccountingKey) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn clear_active(&self, _key: &AccountingKey) -> Result<(), StoreError> {
        Ok(())
    }
}

fn png_image() -> Vec<u8> {
    let mut out = Vec::new();
    image::RgbImage::new(8, 8)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

fn submit_request() -> SubmitRequest {
    SubmitRequest {
        image: png_image(),
        mode: GenerationMode::Restoration,
        custom_prompt: None,
        params: serde_json::Value::Null,
    }
}

async fn charge(ledger: &MemoryLedger, key: &AccountingKey, times: u32) {
    let anchor = Utc::now();
    for _ in 0..times {
        assert!(ledger
            .check_and_increment(key, PlanType::Free, 5, anchor)
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn free_user_at_limit_recovers_exactly_one_slot_on_failure() {
    let key = AccountingKey::from_anonymous("free-user");
    let ledger = Arc::new(MemoryLedger::new());
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let provider = Arc::new(StubProvider::default());
    let submitter = JobSubmitter::new(
        provider.clone(),
        Arc::clone(&store),
        ledger.clone() as Arc<dyn UsageLedger>,
        "photo-restoration-v2",
        None,
    );

    // Four slots already spent, the fifth charge fills the cycle.
    charge(&ledger, &key, 5).await;
    let anchor = Utc::now();
    assert!(!ledger
        .check_and_increment(&key, PlanType::Free, 5, anchor)
        .await
        .unwrap());

    let job_id = submitter.submit(submit_request(), &key, true).await.unwrap();
    assert_eq!(
        store.active_for(&key).await.unwrap().as_deref(),
        Some(job_id.as_str())
    );

    // The provider reports failure through the webhook path.
    let ledger_dyn: Arc<dyn UsageLedger> = ledger.clone();
    let outcome = apply_webhook(
        &store,
        &ledger_dyn,
        WebhookPayload {
            id: job_id.clone(),
            status: "failed".into(),
            output: serde_json::Value::Null,
            error: Some("model error".into()),
        },
    )
    .await
    .unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    // Exactly one slot came back, and the replayed webhook does not add more.
    assert_eq!(ledger.snapshot(&key).await.unwrap().unwrap().count, 4);
    let replay = apply_webhook(
        &store,
        &ledger_dyn,
        WebhookPayload {
            id: job_id.clone(),
            status: "failed".into(),
            output: serde_json::Value::Null,
            error: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(replay, TransitionOutcome::AlreadySettled);
    assert_eq!(ledger.snapshot(&key).await.unwrap().unwrap().count, 4);

    // The recovered slot is usable again.
    assert!(ledger
        .check_and_increment(&key, PlanType::Free, 5, anchor)
        .await
        .unwrap());
    assert!(store.active_for(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn successful_job_keeps_its_charge() {
    let key = AccountingKey::from_anonymous("winner");
    let ledger = Arc::new(MemoryLedger::new());
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let provider = Arc::new(StubProvider::default());
    let submitter = JobSubmitter::new(
        provider,
        Arc::clone(&store),
        ledger.clone() as Arc<dyn UsageLedger>,
        "photo-restoration-v2",
        None,
    );

    charge(&ledger, &key, 1).await;
    let job_id = submitter.submit(submit_request(), &key, true).await.unwrap();

    let ledger_dyn: Arc<dyn UsageLedger> = ledger.clone();
    apply_webhook(
        &store,
        &ledger_dyn,
        WebhookPayload {
            id: job_id.clone(),
            status: "succeeded".into(),
            output: json!(["https://cdn.example/out.png"]),
            error: None,
        },
    )
    .await
    .unwrap();

    let job = store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.output_url.as_deref(), Some("https://cdn.example/out.png"));
    assert_eq!(ledger.snapshot(&key).await.unwrap().unwrap().count, 1);
    assert!(store.active_for(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn provider_rejection_refunds_the_charge() {
    let key = AccountingKey::from_anonymous("unlucky");
    let ledger = Arc::new(MemoryLedger::new());
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let provider = Arc::new(StubProvider {
        fail_create: true,
        ..Default::default()
    });
    let submitter = JobSubmitter::new(
        provider,
        store,
        ledger.clone() as Arc<dyn UsageLedger>,
        "photo-restoration-v2",
        None,
    );

    charge(&ledger, &key, 1).await;
    let err = submitter.submit(submit_request(), &key, true).await.unwrap_err();
    assert!(matches!(err, SubmitError::Provider(_)));
    assert_eq!(ledger.snapshot(&key).await.unwrap().unwrap().count, 0);
}

#[tokio::test]
async fn tracking_failure_cancels_upstream_and_refunds() {
    let key = AccountingKey::from_anonymous("untracked");
    let ledger = Arc::new(MemoryLedger::new());
    let provider = Arc::new(StubProvider::default());
    let submitter = JobSubmitter::new(
        provider.clone(),
        Arc::new(BrokenStore) as Arc<dyn JobStore>,
        ledger.clone() as Arc<dyn UsageLedger>,
        "photo-restoration-v2",
        None,
    );

    charge(&ledger, &key, 1).await;
    let err = submitter.submit(submit_request(), &key, true).await.unwrap_err();
    assert!(matches!(err, SubmitError::Tracking(_)));

    // The accepted upstream job was canceled and the charge reversed, so no
    // charged-but-untracked job remains.
    assert_eq!(provider.canceled.lock().unwrap().as_slice(), ["pred-1"]);
    assert_eq!(ledger.snapshot(&key).await.unwrap().unwrap().count, 0);
}
