// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Axum HTTP surface for the generation lifecycle service.

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::errors::ApiError;
use super::handlers;
use crate::session::AppSessionContext;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppSessionContext>,
    pub limiter: Arc<DefaultDirectRateLimiter>,
}

impl AppState {
    pub fn new(ctx: Arc<AppSessionContext>) -> Self {
        let per_minute = NonZeroU32::new(ctx.config.submits_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            ctx,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let client_routes = Router::new()
        .route("/v1/generations", post(handlers::submit_generation))
        .route("/v1/generations/active", get(handlers::get_active_generation))
        .route("/v1/generations/:id", get(handlers::get_generation))
        .route(
            "/v1/generations/:id/result",
            get(handlers::get_generation_result),
        )
        .route(
            "/v1/generations/:id/cancel",
            post(handlers::cancel_generation),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    // Webhooks authenticate with the shared secret, not the client bearer.
    let webhook_routes = Router::new()
        .route("/v1/webhooks/provider", post(handlers::provider_webhook))
        .route(
            "/v1/webhooks/subscription",
            post(handlers::subscription_webhook),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .merge(client_routes)
        .merge(webhook_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(ctx: Arc<AppSessionContext>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = ctx.config.listen_addr;
    let state = AppState::new(ctx);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("generation service listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = format!("Bearer {}", state.ctx.config.api_token);
    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected.as_str()) {
        return Err(ApiError::Unauthorized("missing or invalid bearer token".into()));
    }
    Ok(next.run(request).await)
}
