// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! bas-studio - Browser Automation Studio control plane
//!
//! This crate runs saved browser workflows against a remote browser driver,
//! records user sessions into new workflows, fires cron schedules and moves
//! recordings in and out of the studio as archives.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Studio UI / API clients                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                │ HTTP /api/v1                    │ WebSocket /api/v1/ws
//!                ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      bas-studio (This Crate)                            │
//! │  ┌──────────┐ ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌──────────┐    │
//! │  │ Workflow │ │ Execution │ │  Record   │ │ Scheduler │ │ Import / │    │
//! │  │ Catalog  │ │  Engine   │ │   Mode    │ │           │ │  Export  │    │
//! │  └──────────┘ └───────────┘ └───────────┘ └───────────┘ └──────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                    │                          │
//!        ▼                    ▼                          ▼
//! ┌──────────────┐   ┌──────────────────┐     ┌─────────────────────────┐
//! │  bas-core    │   │   bas-driver     │     │  Artifact blob store    │
//! │ (SQLite idx) │   │ (browser driver) │     │  (filesystem)           │
//! └──────────────┘   └──────────────────┘     └─────────────────────────┘
//! ```
//!
//! # Execution Status State Machine
//!
//! ```text
//!        ┌─────────┐
//!        │ PENDING │
//!        └────┬────┘
//!             │ dispatch
//!             ▼
//!        ┌─────────┐  pause   ┌────────┐
//!        │ RUNNING │─────────►│ PAUSED │
//!        └────┬────┘          └───┬────┘
//!             │      resume       │
//!             │◄──────────────────┘
//!   ┌─────────┼──────────┐
//!   ▼         ▼          ▼
//! COMPLETED  FAILED  CANCELLED
//! ```
//!
//! # Configuration
//!
//! See [`config::Config`] for the environment variables the binary reads.

pub mod caption;
pub mod catalog;
pub mod config;
pub mod error;
pub mod execution;
pub mod handlers;
pub mod http;
pub mod link_preview;
pub mod recording;
pub mod runtime;
pub mod scheduler;
pub mod transfer;

pub use error::{Error, Result};
