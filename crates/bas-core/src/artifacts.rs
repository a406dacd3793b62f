// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact Store Gateway.
//!
//! Typed facade over a blob store holding screenshots, videos, traces, HAR
//! files and export bundles. Object names are derived deterministically from
//! `(execution, step, kind)` so repeated writes overwrite the same object.
//! Transient blob failures are retried with capped, jittered backoff.

use std::future::Future;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};
use uuid::Uuid;

/// URL scheme of gateway storage URLs.
pub const BLOB_URL_PREFIX: &str = "blob://";

/// Errors returned by blob stores.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlobError {
    /// Worth retrying.
    #[error("transient blob store error: {0}")]
    Transient(String),
    /// Not worth retrying.
    #[error("blob store error: {0}")]
    Fatal(String),
    /// The object does not exist.
    #[error("blob '{0}' not found")]
    NotFound(String),
}

/// Result type for blob operations.
pub type Result<T> = std::result::Result<T, BlobError>;

/// Object metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Object content (possibly a byte range of it).
#[derive(Debug, Clone, PartialEq)]
pub struct BlobObject {
    /// Metadata of the whole object.
    pub meta: BlobMeta,
    pub bytes: Vec<u8>,
}

/// Object API of the external blob store.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Write an object, replacing any existing one.
    async fn put(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<BlobMeta>;

    /// Read an object or a byte range of it.
    async fn get(&self, name: &str, range: Option<Range<u64>>) -> Result<BlobObject>;

    /// Read object metadata.
    async fn stat(&self, name: &str) -> Result<BlobMeta>;

    /// List objects whose name starts with `prefix`, sorted by name.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;
}

// ============================================================================
// Filesystem backend
// ============================================================================

/// Blob store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root` (created on first write).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let safe = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BlobError::Fatal(format!("invalid object name '{}'", name)));
        }
        Ok(self.root.join(relative))
    }

    fn meta(name: &str, size_bytes: u64) -> BlobMeta {
        BlobMeta {
            name: name.to_string(),
            content_type: content_type_for(name).to_string(),
            size_bytes,
        }
    }
}

fn classify_io(name: &str, err: std::io::Error) -> BlobError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => BlobError::NotFound(name.to_string()),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            BlobError::Transient(format!("{}: {}", name, err))
        }
        _ => BlobError::Fatal(format!("{}: {}", name, err)),
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, bytes: &[u8], _content_type: &str) -> Result<BlobMeta> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| classify_io(name, e))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| classify_io(name, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| classify_io(name, e))?;
        Ok(Self::meta(name, bytes.len() as u64))
    }

    async fn get(&self, name: &str, range: Option<Range<u64>>) -> Result<BlobObject> {
        let path = self.resolve(name)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| classify_io(name, e))?;
        let meta = Self::meta(name, bytes.len() as u64);
        let bytes = match range {
            None => bytes,
            Some(range) => {
                let len = bytes.len() as u64;
                if range.start > range.end || range.start > len {
                    return Err(BlobError::Fatal(format!(
                        "range {}..{} outside object of {} bytes",
                        range.start, range.end, len
                    )));
                }
                let end = range.end.min(len);
                bytes[range.start as usize..end as usize].to_vec()
            }
        };
        Ok(BlobObject { meta, bytes })
    }

    async fn stat(&self, name: &str) -> Result<BlobMeta> {
        let path = self.resolve(name)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| classify_io(name, e))?;
        if !metadata.is_file() {
            return Err(BlobError::NotFound(name.to_string()));
        }
        Ok(Self::meta(name, metadata.len()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(classify_io(prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| classify_io(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| classify_io(prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.starts_with(prefix) && !name.contains(".tmp-") {
                    let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                    out.push(Self::meta(&name, size));
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

/// Content type guessed from an object name's extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webm" => "video/webm",
        "mp4" => "video/mp4",
        "json" => "application/json",
        "zip" => "application/zip",
        "html" => "text/html",
        "txt" | "log" => "text/plain",
        _ => "application/octet-stream",
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Logical artifact kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    Video,
    VideoMeta,
    Trace,
    Har,
    ExtractedData,
    Log,
    ExportBundle,
}

impl ArtifactKind {
    fn dir(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshots",
            Self::Video | Self::VideoMeta => "video",
            Self::Trace => "traces",
            Self::Har => "har",
            Self::ExtractedData => "data",
            Self::Log => "logs",
            Self::ExportBundle => "exports",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Screenshot => "png",
            Self::Video => "webm",
            Self::Trace => "zip",
            Self::Log => "log",
            Self::VideoMeta | Self::Har | Self::ExtractedData | Self::ExportBundle => "json",
        }
    }
}

/// A stored execution artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionArtifact {
    pub artifact_type: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    pub storage_url: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Inline JSON for small structured artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Retry policy for transient blob failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Jittered delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let cap = exp.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(cap / 2..=cap);
        Duration::from_millis(jittered)
    }
}

/// Typed facade over a [`BlobStore`].
#[derive(Clone)]
pub struct ArtifactGateway {
    store: Arc<dyn BlobStore>,
    policy: RetryPolicy,
}

impl ArtifactGateway {
    /// Create a gateway with the default retry policy.
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Deterministic object name for an execution artifact.
    pub fn object_name(execution_id: Uuid, step_index: Option<u32>, kind: ArtifactKind) -> String {
        let step = step_index.map(|s| s.to_string()).unwrap_or_else(|| "run".to_string());
        let digest = Sha256::digest(format!("{}:{}:{}", execution_id, step, kind).as_bytes());
        let short = &hex::encode(digest)[..16];
        let label = match step_index {
            Some(s) => format!("step-{:04}", s),
            None => "run".to_string(),
        };
        format!(
            "executions/{}/{}/{}-{}.{}",
            execution_id,
            kind.dir(),
            label,
            short,
            kind.extension()
        )
    }

    /// Storage URL for an object name.
    pub fn storage_url(name: &str) -> String {
        format!("{}{}", BLOB_URL_PREFIX, name)
    }

    /// Object name for a storage URL (plain names pass through).
    pub fn object_name_from_url(storage_url: &str) -> &str {
        storage_url
            .strip_prefix(BLOB_URL_PREFIX)
            .unwrap_or(storage_url)
    }

    /// Store an execution artifact.
    pub async fn put_artifact(
        &self,
        execution_id: Uuid,
        step_index: Option<u32>,
        kind: ArtifactKind,
        bytes: &[u8],
        payload: Option<Value>,
    ) -> Result<ExecutionArtifact> {
        let name = Self::object_name(execution_id, step_index, kind);
        let content_type = content_type_for(&name);
        let meta = self
            .with_retry("put", || self.store.put(&name, bytes, content_type))
            .await?;
        debug!(
            execution_id = %execution_id,
            object = %meta.name,
            size = meta.size_bytes,
            "Stored artifact"
        );
        Ok(ExecutionArtifact {
            artifact_type: kind,
            step_index,
            storage_url: Self::storage_url(&meta.name),
            content_type: meta.content_type,
            size_bytes: meta.size_bytes,
            payload,
            timestamp: Utc::now(),
        })
    }

    /// Store an object under an explicit name.
    pub async fn put_named(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<BlobMeta> {
        self.with_retry("put", || self.store.put(name, bytes, content_type))
            .await
    }

    /// Read an object (or a byte range) by storage URL.
    pub async fn open(&self, storage_url: &str, range: Option<Range<u64>>) -> Result<BlobObject> {
        let name = Self::object_name_from_url(storage_url);
        self.with_retry("get", || self.store.get(name, range.clone()))
            .await
    }

    /// Stat an object by storage URL.
    pub async fn stat(&self, storage_url: &str) -> Result<BlobMeta> {
        let name = Self::object_name_from_url(storage_url);
        self.with_retry("stat", || self.store.stat(name)).await
    }

    /// All stored artifacts of one kind for an execution.
    pub async fn list_artifacts(
        &self,
        execution_id: Uuid,
        kind: ArtifactKind,
    ) -> Result<Vec<BlobMeta>> {
        let prefix = format!("executions/{}/{}/", execution_id, kind.dir());
        self.with_retry("list", || self.store.list(&prefix)).await
    }

    /// Write and stat a marker object.
    pub async fn health_check(&self) -> Result<()> {
        let name = ".health/marker.txt";
        self.put_named(name, b"ok", "text/plain").await?;
        self.with_retry("stat", || self.store.stat(name)).await?;
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(BlobError::Transient(message)) if attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient blob store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails transiently a fixed number of times.
    struct FlakyStore {
        inner: FsBlobStore,
        failures_left: AtomicU32,
        calls: AtomicU32,
        fatal: bool,
    }

    impl FlakyStore {
        fn new(root: &Path, failures: u32, fatal: bool) -> Self {
            Self {
                inner: FsBlobStore::new(root),
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                fatal,
            }
        }

        fn fail(&self) -> Option<BlobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Some(BlobError::Fatal("denied".to_string()));
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Some(BlobError::Transient("flaky".to_string()));
            }
            None
        }
    }

    #[async_trait::async_trait]
    impl BlobStore for FlakyStore {
        async fn put(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<BlobMeta> {
            match self.fail() {
                Some(e) => Err(e),
                None => self.inner.put(name, bytes, content_type).await,
            }
        }
        async fn get(&self, name: &str, range: Option<Range<u64>>) -> Result<BlobObject> {
            self.inner.get(name, range).await
        }
        async fn stat(&self, name: &str) -> Result<BlobMeta> {
            self.inner.stat(name).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
            self.inner.list(prefix).await
        }
    }

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_fs_store_put_get_range_stat() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let meta = store.put("a/b/hello.txt", b"hello world", "text/plain").await.unwrap();
        assert_eq!(meta.size_bytes, 11);
        assert_eq!(meta.content_type, "text/plain");

        let full = store.get("a/b/hello.txt", None).await.unwrap();
        assert_eq!(full.bytes, b"hello world");

        let part = store.get("a/b/hello.txt", Some(6..100)).await.unwrap();
        assert_eq!(part.bytes, b"world");
        assert_eq!(part.meta.size_bytes, 11);

        assert_eq!(store.stat("a/b/hello.txt").await.unwrap().size_bytes, 11);
        assert_eq!(
            store.stat("missing.png").await.unwrap_err(),
            BlobError::NotFound("missing.png".to_string())
        );
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.put("../escape.txt", b"x", "text/plain").await,
            Err(BlobError::Fatal(_))
        ));
        assert!(matches!(
            store.get("/etc/passwd", None).await,
            Err(BlobError::Fatal(_))
        ));
    }

    #[test]
    fn test_object_names_are_deterministic() {
        let id = Uuid::new_v4();
        let a = ArtifactGateway::object_name(id, Some(3), ArtifactKind::Screenshot);
        let b = ArtifactGateway::object_name(id, Some(3), ArtifactKind::Screenshot);
        let c = ArtifactGateway::object_name(id, Some(4), ArtifactKind::Screenshot);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(&format!("executions/{}/screenshots/step-0003-", id)));
        assert!(a.ends_with(".png"));
    }

    #[tokio::test]
    async fn test_put_is_idempotent_and_listable() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = ArtifactGateway::new(Arc::new(FsBlobStore::new(dir.path())));
        let id = Uuid::new_v4();

        let first = gateway
            .put_artifact(id, Some(0), ArtifactKind::Screenshot, b"png-1", None)
            .await
            .unwrap();
        let second = gateway
            .put_artifact(id, Some(0), ArtifactKind::Screenshot, b"png-22", None)
            .await
            .unwrap();
        assert_eq!(first.storage_url, second.storage_url);

        let listed = gateway
            .list_artifacts(id, ArtifactKind::Screenshot)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size_bytes, 6);

        let object = gateway.open(&second.storage_url, None).await.unwrap();
        assert_eq!(object.bytes, b"png-22");
        assert_eq!(object.meta.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(dir.path(), 2, false));
        let gateway = ArtifactGateway::new(store.clone()).with_retry_policy(no_delay());

        gateway
            .put_named("x.json", b"{}", "application/json")
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(dir.path(), 10, false));
        let gateway = ArtifactGateway::new(store.clone()).with_retry_policy(no_delay());

        let err = gateway
            .put_named("x.json", b"{}", "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Transient(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_failures_surface_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(dir.path(), 0, true));
        let gateway = ArtifactGateway::new(store.clone()).with_retry_policy(no_delay());

        let err = gateway
            .put_named("x.json", b"{}", "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Fatal(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            assert!(policy.delay_for(attempt) <= policy.max_delay);
        }
        assert!(policy.delay_for(0) >= Duration::from_millis(50));
    }
}
