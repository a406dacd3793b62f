// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for bas-studio.
//!
//! [`StudioRuntime`] wires the index, driver and blob store into the studio
//! services, then runs the scheduler and the HTTP API until shut down.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bas_core::{FsBlobStore, SqliteIndexStore};
//! use bas_driver::HttpDriverClient;
//! use bas_studio::runtime::StudioRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteIndexStore::from_path(".data/studio.db").await?);
//!     let driver = Arc::new(HttpDriverClient::from_url("http://127.0.0.1:39400")?);
//!
//!     let runtime = StudioRuntime::builder()
//!         .store(store)
//!         .driver(driver)
//!         .blob_store(Arc::new(FsBlobStore::new(".data/blobs")))
//!         .bind_addr("127.0.0.1:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bas_core::{ArtifactGateway, BlobStore, EntitlementGate, IndexStore, TelemetryHub};
use bas_driver::BrowserDriver;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::caption::CaptionGenerator;
use crate::catalog::WorkflowCatalog;
use crate::execution::{EngineConfig, ExecutionEngine};
use crate::handlers::{DEFAULT_REQUEST_TIMEOUT, StudioHandlerState};
use crate::http;
use crate::link_preview::LinkPreviewService;
use crate::recording::{ProfileStore, RecordingService};
use crate::scheduler::{DEFAULT_TICK_INTERVAL, Scheduler, SchedulerConfig};
use crate::transfer::{Compositor, TransferService};

/// Builder for creating a [`StudioRuntime`].
pub struct StudioRuntimeBuilder {
    store: Option<Arc<dyn IndexStore>>,
    driver: Option<Arc<dyn BrowserDriver>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    entitlements: Option<Arc<EntitlementGate>>,
    compositor: Option<Arc<dyn Compositor>>,
    caption_generator: Option<Arc<dyn CaptionGenerator>>,
    bind_addr: SocketAddr,
    recordings_root: PathBuf,
    projects_root: PathBuf,
    profiles_root: PathBuf,
    browserless_url: Option<String>,
    scheduler_tick: Duration,
    request_timeout: Duration,
    sync_on_start: bool,
}

impl Default for StudioRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            driver: None,
            blob_store: None,
            entitlements: None,
            compositor: None,
            caption_generator: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            recordings_root: PathBuf::from(".data/recordings"),
            projects_root: PathBuf::from(".data/projects"),
            profiles_root: PathBuf::from(".data/profiles"),
            browserless_url: None,
            scheduler_tick: DEFAULT_TICK_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sync_on_start: true,
        }
    }
}

impl StudioRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the index store (required).
    pub fn store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the browser driver (required).
    pub fn driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the blob store behind the artifact gateway (required).
    pub fn blob_store(mut self, blob_store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(blob_store);
        self
    }

    /// Set the entitlement gate. Defaults to a disabled gate.
    pub fn entitlements(mut self, entitlements: Arc<EntitlementGate>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    pub fn compositor(mut self, compositor: Arc<dyn Compositor>) -> Self {
        self.compositor = Some(compositor);
        self
    }

    pub fn caption_generator(mut self, generator: Arc<dyn CaptionGenerator>) -> Self {
        self.caption_generator = Some(generator);
        self
    }

    /// Set the HTTP bind address. Port 0 picks a free port.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn recordings_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.recordings_root = path.into();
        self
    }

    pub fn projects_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.projects_root = path.into();
        self
    }

    pub fn profiles_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.profiles_root = path.into();
        self
    }

    pub fn browserless_url(mut self, url: Option<String>) -> Self {
        self.browserless_url = url;
        self
    }

    /// Set the scheduler tick (clamped to 1..=30 seconds by the scheduler).
    pub fn scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether to reconcile project folders with the index on start.
    pub fn sync_on_start(mut self, enabled: bool) -> Self {
        self.sync_on_start = enabled;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<StudioRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver is required"))?;
        let blob_store = self
            .blob_store
            .ok_or_else(|| anyhow::anyhow!("blob_store is required"))?;

        Ok(StudioRuntimeConfig {
            store,
            driver,
            blob_store,
            entitlements: self
                .entitlements
                .unwrap_or_else(|| Arc::new(EntitlementGate::disabled())),
            compositor: self.compositor,
            caption_generator: self.caption_generator,
            bind_addr: self.bind_addr,
            recordings_root: self.recordings_root,
            projects_root: self.projects_root,
            profiles_root: self.profiles_root,
            browserless_url: self.browserless_url,
            scheduler_tick: self.scheduler_tick,
            request_timeout: self.request_timeout,
            sync_on_start: self.sync_on_start,
        })
    }
}

/// Configuration for a [`StudioRuntime`].
pub struct StudioRuntimeConfig {
    store: Arc<dyn IndexStore>,
    driver: Arc<dyn BrowserDriver>,
    blob_store: Arc<dyn BlobStore>,
    entitlements: Arc<EntitlementGate>,
    compositor: Option<Arc<dyn Compositor>>,
    caption_generator: Option<Arc<dyn CaptionGenerator>>,
    bind_addr: SocketAddr,
    recordings_root: PathBuf,
    projects_root: PathBuf,
    profiles_root: PathBuf,
    browserless_url: Option<String>,
    scheduler_tick: Duration,
    request_timeout: Duration,
    sync_on_start: bool,
}

impl StudioRuntimeConfig {
    /// Wire the studio services into handler state without starting anything.
    pub fn handler_state(&self) -> Arc<StudioHandlerState> {
        let hub = Arc::new(TelemetryHub::new());
        let artifacts = Arc::new(ArtifactGateway::new(self.blob_store.clone()));
        let catalog = Arc::new(WorkflowCatalog::new(
            self.store.clone(),
            self.projects_root.clone(),
        ));

        let mut engine_config = EngineConfig::new(self.recordings_root.clone());
        engine_config.browserless_url = self.browserless_url.clone();
        let engine = ExecutionEngine::new(
            self.store.clone(),
            self.driver.clone(),
            artifacts.clone(),
            hub.clone(),
            engine_config,
        );

        let recording = RecordingService::new(
            self.driver.clone(),
            hub.clone(),
            catalog.clone(),
            ProfileStore::new(self.profiles_root.clone()),
        )
        .with_browserless_url(self.browserless_url.clone());

        let scheduler = Scheduler::new(
            self.store.clone(),
            engine.clone(),
            SchedulerConfig {
                tick_interval: self.scheduler_tick,
            },
        );

        let transfer = TransferService::new(
            self.store.clone(),
            engine.clone(),
            self.entitlements.clone(),
        )
        .with_compositor(self.compositor.clone())
        .with_caption_generator(self.caption_generator.clone());

        Arc::new(StudioHandlerState {
            store: self.store.clone(),
            driver: self.driver.clone(),
            artifacts,
            hub,
            entitlements: self.entitlements.clone(),
            catalog,
            engine,
            recording,
            scheduler,
            transfer,
            link_preview: LinkPreviewService::with_default_cache(),
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: self.request_timeout,
        })
    }

    /// Start the runtime, spawning the scheduler and HTTP server tasks.
    pub async fn start(self) -> Result<StudioRuntime> {
        let state = self.handler_state();

        if self.sync_on_start {
            match state.catalog.sync_all_projects().await {
                Ok(synced) => info!(projects = synced, "Project folders synchronized"),
                Err(e) => warn!(error = %e, "Failed to synchronize project folders (non-fatal)"),
            }
        }

        let scheduler = state.scheduler.clone();
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run().await;
        });

        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;
        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let router = http::build_router(state.clone());
        let server_handle = tokio::spawn(async move {
            http::serve(listener, router, async move {
                let _ = server_shutdown_rx.changed().await;
            })
            .await
        });

        info!(
            bind_addr = %bind_addr,
            recordings_root = %self.recordings_root.display(),
            "StudioRuntime started"
        );

        Ok(StudioRuntime {
            server_handle,
            scheduler_handle,
            server_shutdown_tx,
            scheduler_shutdown,
            state,
            bind_addr,
        })
    }
}

/// A running studio instance.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct StudioRuntime {
    server_handle: JoinHandle<std::io::Result<()>>,
    scheduler_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    scheduler_shutdown: Arc<Notify>,
    state: Arc<StudioHandlerState>,
    bind_addr: SocketAddr,
}

impl StudioRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> StudioRuntimeBuilder {
        StudioRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn state(&self) -> &Arc<StudioHandlerState> {
        &self.state
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("StudioRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.scheduler_shutdown.notify_one();

        if let Err(e) = self.scheduler_handle.await {
            error!("Scheduler task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("StudioRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("StudioRuntime server error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("StudioRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.scheduler_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bas_core::{FsBlobStore, SqliteIndexStore};
    use bas_driver::MockDriver;

    #[test]
    fn test_builder_defaults() {
        let builder = StudioRuntime::builder();
        assert_eq!(builder.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(builder.scheduler_tick, DEFAULT_TICK_INTERVAL);
        assert_eq!(builder.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(builder.sync_on_start);
    }

    #[test]
    fn test_builder_chaining() {
        let builder = StudioRuntimeBuilder::new()
            .bind_addr("127.0.0.1:9000".parse().unwrap())
            .recordings_root("/data/recordings")
            .scheduler_tick(Duration::from_secs(5))
            .sync_on_start(false);

        assert_eq!(builder.bind_addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(builder.recordings_root, PathBuf::from("/data/recordings"));
        assert_eq!(builder.scheduler_tick, Duration::from_secs(5));
        assert!(!builder.sync_on_start);
    }

    #[test]
    fn test_builder_build_fails_without_store() {
        let result = StudioRuntimeBuilder::new().build();
        match result {
            Err(err) => assert!(err.to_string().contains("store is required")),
            Ok(_) => panic!("build should fail without a store"),
        }
    }

    #[tokio::test]
    async fn test_builder_build_fails_without_blob_store() {
        let store = Arc::new(SqliteIndexStore::in_memory().await.unwrap());
        let result = StudioRuntimeBuilder::new()
            .driver(Arc::new(MockDriver::new()))
            .store(store)
            .build();
        match result {
            Err(err) => assert!(err.to_string().contains("blob_store is required")),
            Ok(_) => panic!("build should fail without a blob store"),
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteIndexStore::in_memory().await.unwrap());
        let runtime = StudioRuntime::builder()
            .store(store)
            .driver(Arc::new(MockDriver::new()))
            .blob_store(Arc::new(FsBlobStore::new(dir.path().join("blobs"))))
            .recordings_root(dir.path().join("recordings"))
            .projects_root(dir.path().join("projects"))
            .profiles_root(dir.path().join("profiles"))
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_ne!(runtime.bind_addr().port(), 0);
        assert!(runtime.is_running());
        assert_eq!(runtime.state().version, env!("CARGO_PKG_VERSION"));

        runtime.shutdown().await.unwrap();
    }
}
