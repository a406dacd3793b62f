// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for bas-studio.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bas_driver::DEFAULT_DRIVER_URL;

/// Studio configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite index file
    pub database_path: PathBuf,
    /// HTTP API bind address
    pub api_addr: SocketAddr,
    /// Browser driver base URL
    pub driver_url: String,
    /// Browser farm endpoint forwarded to driver sessions
    pub browserless_url: Option<String>,
    /// Root of per-execution artifact directories
    pub recordings_root: PathBuf,
    /// Default root for auto-provisioned project folders
    pub projects_root: PathBuf,
    /// Session profile store
    pub profiles_root: PathBuf,
    /// Filesystem blob store root
    pub blob_root: PathBuf,
    /// Scheduler tick
    pub scheduler_tick: Duration,
    /// Global entitlement switch
    pub entitlements_enabled: bool,
    /// External entitlement source
    pub entitlement_url: Option<String>,
    /// OpenAI-compatible endpoint for captions
    pub ai_url: Option<String>,
    pub ai_api_key: Option<String>,
    pub ai_model: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("BAS_API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;
        let api_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let tick_secs: u64 = std::env::var("BAS_SCHEDULER_TICK_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("BAS_SCHEDULER_TICK_SECS", "not a number"))?;
        if !(1..=30).contains(&tick_secs) {
            return Err(ConfigError::InvalidValue(
                "BAS_SCHEDULER_TICK_SECS",
                "must be between 1 and 30",
            ));
        }

        let entitlements_enabled = std::env::var("BAS_ENTITLEMENTS_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            database_path: path_var("BAS_DATABASE_PATH", ".data/studio.db"),
            api_addr,
            driver_url: std::env::var("PLAYWRIGHT_DRIVER_URL")
                .unwrap_or_else(|_| DEFAULT_DRIVER_URL.to_string()),
            browserless_url: optional_var("BROWSERLESS_URL"),
            recordings_root: path_var("BAS_RECORDINGS_ROOT", ".data/recordings"),
            projects_root: path_var("BAS_PROJECTS_ROOT", ".data/projects"),
            profiles_root: path_var("BAS_PROFILES_ROOT", ".data/profiles"),
            blob_root: path_var("BAS_BLOB_ROOT", ".data/blobs"),
            scheduler_tick: Duration::from_secs(tick_secs),
            entitlements_enabled,
            entitlement_url: optional_var("BAS_ENTITLEMENT_URL"),
            ai_url: optional_var("BAS_AI_URL"),
            ai_api_key: optional_var("BAS_AI_API_KEY"),
            ai_model: optional_var("BAS_AI_MODEL"),
        })
    }
}

fn path_var(key: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// An environment variable has an invalid value.
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    const ALL_VARS: &[&str] = &[
        "BAS_DATABASE_PATH",
        "BAS_API_PORT",
        "PLAYWRIGHT_DRIVER_URL",
        "BROWSERLESS_URL",
        "BAS_RECORDINGS_ROOT",
        "BAS_SCHEDULER_TICK_SECS",
        "BAS_ENTITLEMENTS_ENABLED",
        "BAS_AI_URL",
    ];

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        for var in ALL_VARS {
            guard.remove(var);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.api_addr.port(), 8080);
        assert_eq!(config.driver_url, "http://127.0.0.1:39400");
        assert_eq!(config.recordings_root, PathBuf::from(".data/recordings"));
        assert_eq!(config.scheduler_tick, Duration::from_secs(15));
        assert!(!config.entitlements_enabled);
        assert!(config.browserless_url.is_none());
        assert!(config.ai_url.is_none());
    }

    #[test]
    fn test_config_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("BAS_API_PORT", "9090");
        guard.set("PLAYWRIGHT_DRIVER_URL", "http://driver:39400");
        guard.set("BROWSERLESS_URL", "ws://farm:3000");
        guard.set("BAS_SCHEDULER_TICK_SECS", "5");
        guard.set("BAS_ENTITLEMENTS_ENABLED", "true");

        let config = Config::from_env().unwrap();
        assert_eq!(config.api_addr.port(), 9090);
        assert_eq!(config.driver_url, "http://driver:39400");
        assert_eq!(config.browserless_url.as_deref(), Some("ws://farm:3000"));
        assert_eq!(config.scheduler_tick, Duration::from_secs(5));
        assert!(config.entitlements_enabled);
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("BAS_API_PORT", "not_a_number");

        assert!(matches!(Config::from_env(), Err(ConfigError::InvalidPort)));
    }

    #[test]
    fn test_config_tick_out_of_range() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("BAS_API_PORT");
        guard.set("BAS_SCHEDULER_TICK_SECS", "60");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue("BAS_SCHEDULER_TICK_SECS", _)
        ));
    }
}
