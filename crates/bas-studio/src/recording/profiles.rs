// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session profiles persisted as `<profiles_root>/<profile_id>.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A named browser profile carrying cookies and origin storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    /// Playwright-style `{cookies, origins}` document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_state: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    /// Profiles sorted by name. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<Profile>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut profiles = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_profile(&path).await {
                Ok(profile) => profiles.push(profile),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable profile (non-fatal)")
                }
            }
        }
        profiles.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(profiles)
    }

    /// Create an empty profile.
    pub async fn create(&self, name: &str) -> Result<Profile> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::MissingField("name"));
        }
        let now = Utc::now();
        let profile = Profile {
            id: Uuid::new_v4(),
            name: name.to_string(),
            storage_state: None,
            created_at: now,
            updated_at: now,
        };
        self.save(&profile).await?;
        info!(profile_id = %profile.id, name = %profile.name, "Profile created");
        Ok(profile)
    }

    pub async fn get(&self, id: Uuid) -> Result<Profile> {
        let path = self.path_for(id);
        match tokio::fs::metadata(&path).await {
            Ok(_) => read_profile(&path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("profile", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn rename(&self, id: Uuid, name: &str) -> Result<Profile> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::MissingField("name"));
        }
        let mut profile = self.get(id).await?;
        profile.name = name.to_string();
        profile.updated_at = Utc::now();
        self.save(&profile).await?;
        Ok(profile)
    }

    pub async fn update_storage_state(&self, id: Uuid, storage_state: Value) -> Result<Profile> {
        let mut profile = self.get(id).await?;
        profile.storage_state = Some(storage_state);
        profile.updated_at = Utc::now();
        self.save(&profile).await?;
        Ok(profile)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => {
                info!(profile_id = %id, "Profile deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("profile", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, profile: &Profile) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(profile.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(profile)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

async fn read_profile(path: &Path) -> Result<Profile> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_profile_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("profiles"));

        assert!(store.list().await.unwrap().is_empty());

        let b = store.create("beta").await.unwrap();
        let a = store.create("alpha").await.unwrap();
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let renamed = store.rename(a.id, "gamma").await.unwrap();
        assert_eq!(renamed.name, "gamma");

        let state = json!({"cookies": [{"name": "sid", "value": "1"}], "origins": []});
        store.update_storage_state(b.id, state.clone()).await.unwrap();
        assert_eq!(store.get(b.id).await.unwrap().storage_state, Some(state));

        store.delete(b.id).await.unwrap();
        assert!(matches!(
            store.get(b.id).await,
            Err(Error::NotFound { entity: "profile", .. })
        ));
        assert!(matches!(store.delete(b.id).await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_create_requires_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path());
        assert!(matches!(store.create("  ").await, Err(Error::MissingField("name"))));
    }
}
