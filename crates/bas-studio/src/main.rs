// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! bas-studio - Browser Automation Studio API server
//!
//! An HTTP server responsible for:
//! - Workflow catalog (projects, workflows, versions, project folders)
//! - Executions against the browser driver, with live telemetry
//! - Record mode and workflow generation from recorded actions
//! - Cron schedules
//! - Recording import and replay export

use std::sync::Arc;

use bas_core::entitlement::{
    DEFAULT_CACHE_TTL, EntitlementSource, HttpEntitlementSource, StaticEntitlementSource,
};
use bas_core::{EntitlementGate, FsBlobStore, SqliteIndexStore, Tier, TtlCache};
use bas_driver::{DriverConfig, HttpDriverClient};
use tracing::{error, info, warn};

use bas_studio::caption::OpenAiCaptionGenerator;
use bas_studio::config::Config;
use bas_studio::runtime::StudioRuntime;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bas_studio=info,bas_core=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "bas-studio failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        api_addr = %config.api_addr,
        driver_url = %config.driver_url,
        database = %config.database_path.display(),
        "Starting bas-studio"
    );

    let store = Arc::new(SqliteIndexStore::from_path(&config.database_path).await?);
    info!("Index store ready");

    let driver = Arc::new(HttpDriverClient::new(DriverConfig::new(&config.driver_url))?);

    let source: Arc<dyn EntitlementSource> = match &config.entitlement_url {
        Some(url) => Arc::new(HttpEntitlementSource::new(url)),
        None => Arc::new(StaticEntitlementSource::new(Tier::default())),
    };
    let entitlements = Arc::new(EntitlementGate::new(
        config.entitlements_enabled,
        source,
        Arc::new(TtlCache::new(DEFAULT_CACHE_TTL)),
    ));

    let mut builder = StudioRuntime::builder()
        .store(store)
        .driver(driver)
        .blob_store(Arc::new(FsBlobStore::new(&config.blob_root)))
        .entitlements(entitlements)
        .bind_addr(config.api_addr)
        .recordings_root(&config.recordings_root)
        .projects_root(&config.projects_root)
        .profiles_root(&config.profiles_root)
        .browserless_url(config.browserless_url.clone())
        .scheduler_tick(config.scheduler_tick);
    if let Some(url) = &config.ai_url {
        builder = builder.caption_generator(Arc::new(OpenAiCaptionGenerator::new(
            url,
            config.ai_api_key.clone(),
            config.ai_model.clone(),
        )));
    }

    let runtime = builder.build()?.start().await?;
    info!(addr = %runtime.bind_addr(), "bas-studio ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("bas-studio shut down");

    Ok(())
}
