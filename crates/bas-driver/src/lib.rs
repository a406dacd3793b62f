// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! bas-driver - client for the external browser driver
//!
//! The driver is a separate process that owns the browsers. This crate
//! speaks its JSON-over-HTTP API:
//!
//! | Group | Calls |
//! |-------|-------|
//! | Sessions | `create_session`, `close_session` |
//! | Actions | `navigate`, `click`, `type_text`, `scroll`, `select`, `keyboard`, `wait`, `element_exists`, `extract`, `screenshot` |
//! | Recording | `start_recording`, `stop_recording`, `recording_status`, `get_actions`, `validate_selector` |
//! | Pages | `create_page`, `get_pages`, `activate_page`, `close_page` |
//! | Observability | `health`, `collect_artifacts` |
//!
//! Driver status codes map to [`DriverError`]: 404 is
//! [`DriverError::SessionNotFound`], 409 is
//! [`DriverError::RecordingInProgress`] and network failures are
//! [`DriverError::Unavailable`].

pub mod client;
pub mod error;
pub mod mock;
pub mod types;

pub use client::{BrowserDriver, DEFAULT_DRIVER_URL, DriverConfig, HttpDriverClient};
pub use error::{DriverError, Result};
pub use mock::MockDriver;
pub use types::*;
