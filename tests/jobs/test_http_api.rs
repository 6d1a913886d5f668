// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Tests driving the axum router directly, without a listening socket.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::BodyExt;
use image::ImageFormat;
use revive_node::accounting::key::{FileFallbackStore, StaticEntitlements};
use revive_node::accounting::{EntitlementClient, KeyResolver, MemoryLedger, PlanType};
use revive_node::api::{build_router, AppState};
use revive_node::cache::{ArtifactFetcher, CacheError};
use revive_node::jobs::WatchConfig;
use revive_node::provider::{
    InferenceProvider, Prediction, PredictionRequest, PredictionStatus, ProviderError,
};
use revive_node::{AppSessionContext, MemoryJobStore, ServiceConfig};
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

struct StubProvider {
    created: AtomicU32,
}

#[async_trait]
impl InferenceProvider for StubProvider {
    async fn create_prediction(&self, _req: &PredictionRequest) -> Result<Prediction, ProviderError> {
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

    async fn cancel_prediction(&self, _id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct StubFetcher;

#[async_trait]
impl ArtifactFetcher for StubFetcher {
    async fn fetch(&self, _url: &str) -> Result<Bytes, CacheError> {
        Ok(Bytes::from(vec![5u8; 4096]))
    }
}

fn app(dir: &tempfile::TempDir, free_limit: u32) -> axum::Router {
    app_with(
        dir,
        free_limit,
        StaticEntitlements {
            plan: Some(PlanType::Free),
            anonymous_id: Some("anon-http".into()),
            ..Default::default()
        },
    )
}

fn app_with(
    dir: &tempfile::TempDir,
    free_limit: u32,
    entitlements: StaticEntitlements,
) -> axum::Router {
    let mut config = ServiceConfig::default();
    config.api_token = "test-token".into();
    config.webhook_secret = Some("hook-secret".into());
    config.provider.token = "r8_test".into();
    config.cache.root = dir.path().join("artifacts");
    config.fallback_id_path = dir.path().join("fallback_id");
    config.plans.free = free_limit;

    let entitlements = Arc::new(entitlements);
    let resolver = KeyResolver::new(
        entitlements.clone() as Arc<dyn EntitlementClient>,
        Arc::new(FileFallbackStore::new(config.fallback_id_path.clone())),
    )
    .with_retry(1, std::time::Duration::from_millis(1));

    let ctx = AppSessionContext::new(
        config,
        entitlements,
        resolver,
        Arc::new(MemoryLedger::new()),
        Arc::new(MemoryJobStore::new()),
        Arc::new(StubProvider {
            created: AtomicU32::new(0),
        }),
        Arc::new(StubFetcher),
        WatchConfig::default(),
    );
    build_router(AppState::new(Arc::new(ctx)))
}

fn image_b64() -> String {
    let mut png = Vec::new();
    image::RgbImage::new(8, 8)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();
    BASE64.encode(&png)
}

fn submit_body() -> String {
    serde_json::json!({ "mode": "restoration", "image": image_b64() }).to_string()
}

fn authed(method: &str, uri: &str, body: Option<String>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, "Bearer test-token")
        .header(header::CONTENT_TYPE, "application/json");
    builder.body(body.map(Body::from).unwrap_or_else(Body::empty)).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_needs_no_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, 5);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn client_routes_require_the_bearer_token() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, 5);

    let bare = Request::builder()
        .uri("/v1/generations/abc")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(bare).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/v1/generations/abc")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_poll_webhook_cancel_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, 5);

    let response = app
        .clone()
        .oneshot(authed("POST", "/v1/generations", Some(submit_body())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = json_body(response).await;
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(authed("GET", &format!("/v1/generations/{job_id}"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view = json_body(response).await;
    assert_eq!(view["status"], "starting");

    let active = app
        .clone()
        .oneshot(authed("GET", "/v1/generations/active", None))
        .await
        .unwrap();
    assert_eq!(json_body(active).await["job_id"], job_id.as_str());

    // Provider pushes the terminal status.
    let hook = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/provider")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-webhook-secret", "hook-secret")
        .body(Body::from(
            serde_json::json!({
                "id": job_id,
                "status": "succeeded",
                "output": "https://cdn.example/final.png",
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(hook).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(authed("GET", &format!("/v1/generations/{job_id}"), None))
        .await
        .unwrap();
    let view = json_body(response).await;
    assert_eq!(view["status"], "succeeded");
    assert_eq!(view["output_url"], "https://cdn.example/final.png");

    // Canceling a settled job is a conflict, not a second terminal write.
    let response = app
        .oneshot(authed(
            "POST",
            &format!("/v1/generations/{job_id}/cancel"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn webhooks_require_the_shared_secret() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, 5);
    let hook = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/provider")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "id": "pred-1", "status": "succeeded" }).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(hook).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, 5);
    let response = app
        .oneshot(authed("GET", "/v1/generations/missing", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn active_lookup_denies_paying_user_without_a_durable_key() {
    let dir = tempfile::tempdir().unwrap();
    // Paying plan with no resolvable identifier: a fabricated fallback key
    // could never match the key the job was submitted under.
    let app = app_with(
        &dir,
        5,
        StaticEntitlements {
            plan: Some(PlanType::Monthly),
            ..Default::default()
        },
    );
    let response = app
        .oneshot(authed("GET", "/v1/generations/active", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "PRO_REQUIRED");
}

#[tokio::test]
async fn video_mode_is_gated_to_paying_plans() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, 5);
    let body = serde_json::json!({ "mode": "video", "image": image_b64() }).to_string();
    let response = app
        .oneshot(authed("POST", "/v1/generations", Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "PRO_REQUIRED");
}

#[tokio::test]
async fn exhausted_limit_returns_the_stable_error_code() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir, 1);

    let response = app
        .clone()
        .oneshot(authed("POST", "/v1/generations", Some(submit_body())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .oneshot(authed("POST", "/v1/generations", Some(submit_body())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "PHOTO_LIMIT_EXCEEDED");
}
