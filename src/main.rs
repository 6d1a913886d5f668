// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{anyhow, Result};
use clap::Parser;
use revive_node::accounting::key::{FileFallbackStore, StaticEntitlements};
use revive_node::api::start_server;
use revive_node::{
    AppSessionContext, HttpFetcher, HttpProvider, KeyResolver, MemoryJobStore, MemoryLedger,
    ServiceConfig, WatchConfig,
};
use std::env;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "revive-node", about = "Photo/video generation lifecycle service")]
struct Cli {
    /// Path to a TOML config file; environment variables override it.
    #[arg(long, env = "REVIVE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::from_env()?,
    };

    let entitlements = Arc::new(StaticEntitlements {
        anonymous_id: env::var("REVIVE_ANON_ID").ok(),
        ..Default::default()
    });
    let fallback = Arc::new(FileFallbackStore::new(config.fallback_id_path.clone()));
    let resolver = KeyResolver::new(entitlements.clone(), fallback);

    let provider = Arc::new(HttpProvider::new(
        config.provider.base_url.clone(),
        config.provider.token.clone(),
    ));

    let ctx = AppSessionContext::new(
        config,
        entitlements,
        resolver,
        Arc::new(MemoryLedger::new()),
        Arc::new(MemoryJobStore::new()),
        provider,
        Arc::new(HttpFetcher::new()),
        WatchConfig::default(),
    );

    start_server(Arc::new(ctx))
        .await
        .map_err(|e| anyhow!("server error: {e}"))
}
