// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entitlement Gate.
//!
//! Maps a user identity to tier-based permissions. Entitlements come from
//! an external source and are cached with a TTL. When the gate is disabled
//! every check answers "allowed".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::cache::{Cache, TtlCache};

/// Feature flag names.
pub mod features {
    pub const AI: &str = "ai";
    pub const RECORDING: &str = "recording";
    pub const NO_WATERMARK: &str = "no_watermark";
    pub const EXPORT: &str = "export";
}

/// Identity used when a request carries none.
pub const ANONYMOUS_IDENTITY: &str = "anonymous";

/// Default cache TTL for fetched entitlements.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Subscription tier.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Team,
    Enterprise,
}

impl Tier {
    /// Features granted by the tier when the source lists none.
    pub fn default_features(&self) -> Vec<String> {
        let names: &[&str] = match self {
            Self::Free => &[features::RECORDING],
            Self::Pro => &[features::RECORDING, features::AI, features::NO_WATERMARK],
            Self::Team | Self::Enterprise => &[
                features::RECORDING,
                features::AI,
                features::NO_WATERMARK,
                features::EXPORT,
            ],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Monthly execution limit; -1 means unlimited.
    pub fn default_execution_limit(&self) -> i64 {
        match self {
            Self::Free => 50,
            Self::Pro => 1_000,
            Self::Team => 10_000,
            Self::Enterprise => -1,
        }
    }
}

/// Subscription status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntitlementStatus {
    #[default]
    Active,
    Inactive,
    /// Lapsed but still honoured.
    Grace,
}

/// A user's entitlement as reported by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_identity: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub status: EntitlementStatus,
    #[serde(default)]
    pub features: Vec<String>,
    /// -1 means unlimited.
    #[serde(default = "default_limit")]
    pub monthly_execution_limit: i64,
}

fn default_limit() -> i64 {
    Tier::Free.default_execution_limit()
}

impl Entitlement {
    /// Active entitlement with the tier's defaults.
    pub fn for_tier(user_identity: impl Into<String>, tier: Tier) -> Self {
        Self {
            user_identity: user_identity.into(),
            tier,
            status: EntitlementStatus::Active,
            features: tier.default_features(),
            monthly_execution_limit: tier.default_execution_limit(),
        }
    }

    /// Active or in grace.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            EntitlementStatus::Active | EntitlementStatus::Grace
        )
    }

    /// Features in effect: inactive users fall back to the free tier.
    pub fn effective_features(&self) -> Vec<String> {
        if !self.is_active() {
            return Tier::Free.default_features();
        }
        if self.features.is_empty() {
            self.tier.default_features()
        } else {
            self.features.clone()
        }
    }

    /// Whether a feature is in effect.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.effective_features().iter().any(|f| f == feature)
    }

    /// Limit in effect.
    pub fn effective_execution_limit(&self) -> i64 {
        if self.is_active() {
            self.monthly_execution_limit
        } else {
            Tier::Free.default_execution_limit()
        }
    }
}

/// Errors fetching entitlements.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EntitlementError {
    #[error("entitlement service unavailable: {0}")]
    Unavailable(String),
    #[error("invalid entitlement response: {0}")]
    InvalidResponse(String),
}

/// Where entitlements come from.
#[async_trait::async_trait]
pub trait EntitlementSource: Send + Sync {
    /// Fetch the entitlement of one identity.
    async fn fetch(&self, user_identity: &str) -> Result<Entitlement, EntitlementError>;
}

/// Fixed entitlements, with a default tier for unknown identities.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlementSource {
    entitlements: HashMap<String, Entitlement>,
    default_tier: Tier,
}

impl StaticEntitlementSource {
    /// Every identity gets `default_tier`.
    pub fn new(default_tier: Tier) -> Self {
        Self {
            entitlements: HashMap::new(),
            default_tier,
        }
    }

    /// Add an explicit entitlement.
    pub fn with(mut self, entitlement: Entitlement) -> Self {
        self.entitlements
            .insert(entitlement.user_identity.clone(), entitlement);
        self
    }
}

#[async_trait::async_trait]
impl EntitlementSource for StaticEntitlementSource {
    async fn fetch(&self, user_identity: &str) -> Result<Entitlement, EntitlementError> {
        Ok(self
            .entitlements
            .get(user_identity)
            .cloned()
            .unwrap_or_else(|| Entitlement::for_tier(user_identity, self.default_tier)))
    }
}

/// Entitlements served by an HTTP endpoint at `GET {base}/entitlements/{identity}`.
#[derive(Debug, Clone)]
pub struct HttpEntitlementSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEntitlementSource {
    /// Create a source for `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl EntitlementSource for HttpEntitlementSource {
    async fn fetch(&self, user_identity: &str) -> Result<Entitlement, EntitlementError> {
        let url = format!("{}/entitlements/{}", self.base_url, user_identity);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EntitlementError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Entitlement::for_tier(user_identity, Tier::Free));
        }
        if !response.status().is_success() {
            return Err(EntitlementError::Unavailable(format!(
                "status {}",
                response.status()
            )));
        }

        let mut entitlement: Entitlement = response
            .json()
            .await
            .map_err(|e| EntitlementError::InvalidResponse(e.to_string()))?;
        if entitlement.user_identity.is_empty() {
            entitlement.user_identity = user_identity.to_string();
        }
        Ok(entitlement)
    }
}

/// Cached, switchable entitlement checks.
#[derive(Clone)]
pub struct EntitlementGate {
    enabled: bool,
    source: Arc<dyn EntitlementSource>,
    cache: Arc<dyn Cache<String, Entitlement>>,
}

impl EntitlementGate {
    /// Create a gate with an injected cache.
    pub fn new(
        enabled: bool,
        source: Arc<dyn EntitlementSource>,
        cache: Arc<dyn Cache<String, Entitlement>>,
    ) -> Self {
        Self {
            enabled,
            source,
            cache,
        }
    }

    /// A gate that allows everything.
    pub fn disabled() -> Self {
        Self::new(
            false,
            Arc::new(StaticEntitlementSource::new(Tier::Enterprise)),
            Arc::new(TtlCache::new(DEFAULT_CACHE_TTL)),
        )
    }

    /// Whether checks are enforced.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current entitlement of an identity (cached).
    ///
    /// Source failures degrade to the free tier and are not cached.
    pub async fn entitlement(&self, user_identity: &str) -> Entitlement {
        let key = user_identity.to_string();
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }
        match self.source.fetch(user_identity).await {
            Ok(entitlement) => {
                debug!(user = %user_identity, tier = %entitlement.tier, "Fetched entitlement");
                self.cache.set(key, entitlement.clone());
                entitlement
            }
            Err(e) => {
                warn!(user = %user_identity, error = %e, "Entitlement fetch failed, using free tier");
                Entitlement::for_tier(user_identity, Tier::Free)
            }
        }
    }

    /// May the user use AI features.
    pub async fn can_use_ai(&self, user_identity: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.entitlement(user_identity)
            .await
            .has_feature(features::AI)
    }

    /// May the user record sessions.
    pub async fn can_use_recording(&self, user_identity: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.entitlement(user_identity)
            .await
            .has_feature(features::RECORDING)
    }

    /// Must exports of this user carry a watermark.
    pub async fn requires_watermark(&self, user_identity: &str) -> bool {
        if !self.enabled {
            return false;
        }
        !self
            .entitlement(user_identity)
            .await
            .has_feature(features::NO_WATERMARK)
    }

    /// Executions left this month given `used`; -1 means unlimited.
    pub async fn get_remaining_executions(&self, user_identity: &str, used: i64) -> i64 {
        if !self.enabled {
            return -1;
        }
        let limit = self
            .entitlement(user_identity)
            .await
            .effective_execution_limit();
        if limit < 0 {
            -1
        } else {
            (limit - used).max(0)
        }
    }

    /// Force the next check for `user_identity` to refetch.
    pub fn invalidate_cache(&self, user_identity: &str) {
        self.cache.invalidate(&user_identity.to_string());
    }
}
