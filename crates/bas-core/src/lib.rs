// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! bas-core - persistent state and shared services of the studio
//!
//! This crate holds everything the studio services share:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Projects, workflows, versions, executions, schedules, exports, settings |
//! | [`persistence`] | [`IndexStore`] trait and the SQLite backend |
//! | [`timeline`] | Per-execution timeline and result files on disk |
//! | [`artifacts`] | Artifact Store Gateway over a [`BlobStore`] |
//! | [`telemetry`] | In-process pub/sub for execution and page events |
//! | [`cache`] | TTL caches injected into services |
//! | [`entitlement`] | Tier-based permission checks |
//!
//! # Example
//!
//! ```ignore
//! use bas_core::{IndexStore, SqliteIndexStore, models::Project};
//!
//! let store = SqliteIndexStore::from_path(".data/studio.db").await?;
//! store.create_project(&Project::new("demo", "/srv/projects/demo")).await?;
//! ```

pub mod artifacts;
pub mod cache;
pub mod entitlement;
pub mod error;
pub mod models;
pub mod persistence;
pub mod telemetry;
pub mod timeline;

pub use artifacts::{
    ArtifactGateway, ArtifactKind, BlobError, BlobMeta, BlobObject, BlobStore, ExecutionArtifact,
    FsBlobStore,
};
pub use cache::{Cache, TtlCache};
pub use entitlement::{Entitlement, EntitlementGate, EntitlementSource, Tier};
pub use error::{CoreError, Result};
pub use persistence::{IndexStore, SqliteIndexStore};
pub use telemetry::{EventType, Subscription, SubscriptionFilter, TelemetryEvent, TelemetryHub};
pub use timeline::{ExecutionTimeline, Frame, FrameStatus, LogEntry, PageEvent, PageEventKind};
