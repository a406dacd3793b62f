// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Import / Export Orchestrator.
//!
//! Recording archives come in through [`TransferService::import_archive`];
//! executions go out through [`TransferService::export_execution`]. The
//! service also owns export rows, the persisted `replay_config` overrides
//! and AI captions of exports.

mod export;
mod import;

pub use export::{
    CANVAS_HEIGHT, CANVAS_WIDTH, Compositor, DEFAULT_THEME, ExportOutcome, ExportRequest,
    ExportTarget, PreviewMetadata, Rect, RenderSource, ReplayMovieSpec, ReplayOverrides,
    ResolvedStyle, Size, TitleCard, Watermark,
};
pub use import::{
    IMPORT_TIMEOUT, ImportOptions, ImportSummary, MANIFEST_FILE, MAX_IMPORT_BYTES, ManifestFrame,
    RecordingManifest,
};

use std::sync::Arc;

use bas_core::entitlement::features;
use bas_core::models::{Export, ExportFilter, ExportFormat, ExportStatus, SETTING_REPLAY_CONFIG};
use bas_core::{EntitlementGate, IndexStore};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::caption::{CAPTION_TIMEOUT, CaptionContext, CaptionGenerator};
use crate::error::{Error, Result};
use crate::execution::ExecutionEngine;

/// Default page size of export listings.
pub const DEFAULT_EXPORT_PAGE: i64 = 50;
pub const MAX_EXPORT_PAGE: i64 = 200;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateExportRequest {
    pub execution_id: Uuid,
    pub name: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub settings: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateExportRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub storage_url: Option<String>,
    #[serde(default)]
    pub status: Option<ExportStatus>,
    #[serde(default)]
    pub file_size_bytes: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn IndexStore>,
    engine: ExecutionEngine,
    entitlements: Arc<EntitlementGate>,
    compositor: Option<Arc<dyn Compositor>>,
    captioner: Option<Arc<dyn CaptionGenerator>>,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn IndexStore>,
        engine: ExecutionEngine,
        entitlements: Arc<EntitlementGate>,
    ) -> Self {
        Self {
            store,
            engine,
            entitlements,
            compositor: None,
            captioner: None,
        }
    }

    pub fn with_compositor(mut self, compositor: Option<Arc<dyn Compositor>>) -> Self {
        self.compositor = compositor;
        self
    }

    pub fn with_caption_generator(mut self, captioner: Option<Arc<dyn CaptionGenerator>>) -> Self {
        self.captioner = captioner;
        self
    }

    fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    // ========================================================================
    // Replay config
    // ========================================================================

    pub async fn get_replay_config(&self) -> Result<ReplayOverrides> {
        self.persisted_overrides().await
    }

    /// Validate and persist overrides.
    pub async fn put_replay_config(&self, value: Value) -> Result<ReplayOverrides> {
        let overrides: ReplayOverrides = serde_json::from_value(value)
            .map_err(|e| Error::InvalidRequest(format!("invalid replay config: {}", e)))?;
        overrides.validate()?;
        self.store
            .put_setting(SETTING_REPLAY_CONFIG, &serde_json::to_value(&overrides)?)
            .await?;
        info!("Replay config updated");
        Ok(overrides)
    }

    /// Returns whether a config was stored.
    pub async fn delete_replay_config(&self) -> Result<bool> {
        Ok(self.store.delete_setting(SETTING_REPLAY_CONFIG).await?)
    }

    // ========================================================================
    // Exports
    // ========================================================================

    pub async fn create_export(&self, req: CreateExportRequest) -> Result<Export> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(Error::MissingField("name"));
        }
        let execution = self.engine.get_execution(req.execution_id).await?;
        let mut export = Export::new(execution.id, name, req.format);
        export.workflow_id = execution.workflow_id;
        if let Some(settings) = req.settings {
            if !settings.is_object() {
                return Err(Error::InvalidRequest("settings must be an object".to_string()));
            }
            export.settings = settings;
        }
        self.store.create_export(&export).await?;
        info!(export_id = %export.id, execution_id = %export.execution_id, format = %export.format, "Export created");
        Ok(export)
    }

    pub async fn get_export(&self, id: Uuid) -> Result<Export> {
        Ok(self.store.get_export(id).await?)
    }

    pub async fn list_exports(
        &self,
        filter: &ExportFilter,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Export>> {
        let limit = limit.unwrap_or(DEFAULT_EXPORT_PAGE).clamp(1, MAX_EXPORT_PAGE);
        let offset = offset.unwrap_or(0).max(0);
        Ok(self.store.list_exports(filter, limit, offset).await?)
    }

    pub async fn update_export(&self, id: Uuid, req: UpdateExportRequest) -> Result<Export> {
        let mut export = self.store.get_export(id).await?;
        if let Some(name) = req.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::MissingField("name"));
            }
            export.name = name.to_string();
        }
        if let Some(settings) = req.settings {
            if !settings.is_object() {
                return Err(Error::InvalidRequest("settings must be an object".to_string()));
            }
            export.settings = settings;
        }
        if req.storage_url.is_some() {
            export.storage_url = req.storage_url;
        }
        if let Some(status) = req.status {
            export.status = status;
        }
        if req.file_size_bytes.is_some() {
            export.file_size_bytes = req.file_size_bytes;
        }
        if req.duration_ms.is_some() {
            export.duration_ms = req.duration_ms;
        }
        if req.error.is_some() {
            export.error = req.error;
        }
        export.updated_at = Utc::now();
        self.store.update_export(&export).await?;
        Ok(export)
    }

    pub async fn delete_export(&self, id: Uuid) -> Result<()> {
        self.store.delete_export(id).await?;
        info!(export_id = %id, "Export deleted");
        Ok(())
    }

    /// Generate and store an AI caption for an export.
    pub async fn generate_caption(&self, id: Uuid, user_identity: &str) -> Result<Export> {
        if !self.entitlements.can_use_ai(user_identity).await {
            return Err(Error::FeatureNotAvailable(features::AI));
        }
        let Some(captioner) = self.captioner.clone() else {
            return Err(Error::ServiceUnavailable(
                "caption generation is not configured".to_string(),
            ));
        };
        let mut export = self.store.get_export(id).await?;
        let context = self.caption_context(&export).await;

        let caption = tokio::time::timeout(CAPTION_TIMEOUT, captioner.generate(&context))
            .await
            .map_err(|_| {
                Error::RequestTimeout(format!(
                    "caption generation exceeded {} s",
                    CAPTION_TIMEOUT.as_secs()
                ))
            })??;

        export.ai_caption = Some(caption);
        export.updated_at = Utc::now();
        self.store.update_export(&export).await?;
        info!(export_id = %id, "Export caption generated");
        Ok(export)
    }

    async fn caption_context(&self, export: &Export) -> CaptionContext {
        let mut context = CaptionContext {
            export_name: export.name.clone(),
            ..Default::default()
        };
        if let Some(workflow_id) = export.workflow_id {
            match self.store.get_workflow(workflow_id).await {
                Ok(workflow) => context.workflow_name = Some(workflow.name),
                Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Caption without workflow name (non-fatal)"),
            }
        }
        match self.engine.get_timeline(export.execution_id).await {
            Ok(timeline) => {
                context.steps = timeline.entries.iter().map(|f| f.step_type.clone()).collect();
                for url in timeline.entries.iter().filter_map(|f| f.url.as_ref()) {
                    if !context.urls.contains(url) {
                        context.urls.push(url.clone());
                    }
                }
                if let (Some(first), Some(last)) = (timeline.entries.first(), timeline.entries.last()) {
                    context.duration_ms = (last.ended_at - first.started_at).num_milliseconds().max(0);
                }
            }
            Err(e) => {
                warn!(execution_id = %export.execution_id, error = %e, "Caption without timeline (non-fatal)")
            }
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::EngineConfig;
    use bas_core::entitlement::StaticEntitlementSource;
    use bas_core::{ArtifactGateway, FsBlobStore, Tier, TelemetryHub, TtlCache};
    use bas_driver::MockDriver;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        service: TransferService,
        _dir: tempfile::TempDir,
    }

    async fn fixture(gate: EntitlementGate) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn IndexStore> =
            Arc::new(bas_core::SqliteIndexStore::in_memory().await.unwrap());
        let engine = ExecutionEngine::new(
            store.clone(),
            Arc::new(MockDriver::new()),
            Arc::new(ArtifactGateway::new(Arc::new(FsBlobStore::new(dir.path().join("blobs"))))),
            Arc::new(TelemetryHub::new()),
            EngineConfig::new(dir.path().join("recordings")),
        );
        Fixture {
            service: TransferService::new(store, engine, Arc::new(gate)),
            _dir: dir,
        }
    }

    fn archive() -> Vec<u8> {
        import::tests::build_archive(
            &json!({"frames": [
                {"step_index": 0, "node_id": "n1", "step_type": "navigate", "duration_ms": 100, "url": "https://example.com"},
                {"step_index": 1, "node_id": "n2", "step_type": "screenshot", "duration_ms": 50, "screenshot": "shot.png"}
            ]}),
            &[("shot.png", b"png")],
        )
    }

    struct FixedCaption;

    #[async_trait::async_trait]
    impl CaptionGenerator for FixedCaption {
        async fn generate(&self, context: &CaptionContext) -> Result<String> {
            Ok(format!("{} steps", context.steps.len()))
        }
    }

    #[tokio::test]
    async fn test_import_rejects_empty_and_oversized() {
        let f = fixture(EntitlementGate::disabled()).await;
        let err = f.service.import_archive(Vec::new(), ImportOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "archive missing");
        let oversized = vec![0u8; MAX_IMPORT_BYTES as usize + 1];
        let err = f.service.import_archive(oversized, ImportOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "REQUEST_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_import_export_reimport_keeps_counts() {
        let f = fixture(EntitlementGate::disabled()).await;
        let first = f.service.import_archive(archive(), ImportOptions::default()).await.unwrap();
        assert_eq!((first.frames, first.assets, first.duration_ms), (2, 1, 150));

        let execution = f.service.engine.get_execution(first.execution_id).await.unwrap();
        assert_eq!(execution.status, bas_core::models::ExecutionStatus::Completed);
        assert_eq!(execution.trigger_type, bas_core::models::TriggerType::RecordingImport);

        let ExportOutcome::Spec(spec) = f
            .service
            .export_execution(first.execution_id, ExportRequest::new(ExportTarget::Json), "anonymous")
            .await
            .unwrap()
        else {
            panic!("expected a movie spec");
        };
        assert_eq!(spec.render_source, RenderSource::ReplayFrames);

        let dir = f.service.engine.result_dir(first.execution_id).await.unwrap();
        let mut assets = Vec::new();
        for name in &spec.assets {
            assets.push((name.as_str(), std::fs::read(dir.join(name)).unwrap()));
        }
        let asset_refs: Vec<(&str, &[u8])> = assets.iter().map(|(n, b)| (*n, b.as_slice())).collect();
        let bytes = import::tests::build_archive(&serde_json::to_value(&spec.manifest).unwrap(), &asset_refs);
        let second = f.service.import_archive(bytes, ImportOptions::default()).await.unwrap();
        assert_eq!(second.frames, first.frames);
        assert_eq!(second.assets, first.assets);
    }

    #[tokio::test]
    async fn test_export_precedence_and_webm_rejection() {
        let f = fixture(EntitlementGate::disabled()).await;
        let summary = f.service.import_archive(archive(), ImportOptions::default()).await.unwrap();
        f.service
            .put_replay_config(json!({"chromeTheme": "aurora", "backgroundTheme": "aurora", "cursorTheme": "black"}))
            .await
            .unwrap();

        let mut request = ExportRequest::new(ExportTarget::Json);
        request.overrides = serde_json::from_value(json!({"chromeTheme": "solar", "backgroundTheme": "dawn"})).unwrap();
        let ExportOutcome::Spec(spec) = f
            .service
            .export_execution(summary.execution_id, request, "anonymous")
            .await
            .unwrap()
        else {
            panic!("expected a movie spec");
        };
        assert_eq!(spec.style.chrome_theme, "solar");
        assert_eq!(spec.style.background_theme, "dawn");
        assert_eq!(spec.style.cursor_theme, "black");
        assert!(spec.style.watermark.is_none());

        let mut webm = ExportRequest::new(ExportTarget::Webm);
        webm.render_source = Some(RenderSource::ReplayFrames);
        let err = f.service.export_execution(summary.execution_id, webm, "anonymous").await.unwrap_err();
        assert_eq!(err.to_string(), "webm format is only available for recorded video exports");

        let mut mp4 = ExportRequest::new(ExportTarget::Mp4);
        mp4.movie_spec = Some(*spec);
        let err = f.service.export_execution(summary.execution_id, mp4, "anonymous").await.unwrap_err();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_folder_export_requires_absolute_dir() {
        let f = fixture(EntitlementGate::disabled()).await;
        let summary = f.service.import_archive(archive(), ImportOptions::default()).await.unwrap();
        let mut request = ExportRequest::new(ExportTarget::Folder);
        request.output_dir = Some("relative/out".into());
        assert!(matches!(
            f.service.export_execution(summary.execution_id, request, "anonymous").await,
            Err(Error::InvalidRequest(_))
        ));

        let out = tempfile::tempdir().unwrap();
        let mut request = ExportRequest::new(ExportTarget::Folder);
        request.output_dir = Some(out.path().join("copy"));
        let outcome = f.service.export_execution(summary.execution_id, request, "anonymous").await.unwrap();
        let ExportOutcome::Folder { files, .. } = outcome else {
            panic!("expected folder outcome");
        };
        // screenshot + timeline
        assert_eq!(files, 2);
    }

    #[tokio::test]
    async fn test_replay_config_rejects_unknown_keys() {
        let f = fixture(EntitlementGate::disabled()).await;
        assert!(matches!(
            f.service.put_replay_config(json!({"chrome_theme": "solar"})).await,
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(f.service.get_replay_config().await.unwrap(), ReplayOverrides::default());
        assert!(!f.service.delete_replay_config().await.unwrap());
    }

    #[tokio::test]
    async fn test_caption_gated_by_entitlement() {
        let free = EntitlementGate::new(
            true,
            Arc::new(StaticEntitlementSource::new(Tier::Free)),
            Arc::new(TtlCache::new(Duration::from_secs(60))),
        );
        let f = fixture(free).await;
        let summary = f.service.import_archive(archive(), ImportOptions::default()).await.unwrap();
        let export = f
            .service
            .create_export(CreateExportRequest {
                execution_id: summary.execution_id,
                name: "demo".into(),
                format: ExportFormat::Mp4,
                settings: None,
            })
            .await
            .unwrap();
        let err = f.service.generate_caption(export.id, "someone").await.unwrap_err();
        assert_eq!(err.code(), "FEATURE_NOT_AVAILABLE");

        let open = fixture(EntitlementGate::disabled()).await;
        let service = open.service.clone().with_caption_generator(Some(Arc::new(FixedCaption)));
        let summary = service.import_archive(archive(), ImportOptions::default()).await.unwrap();
        let export = service
            .create_export(CreateExportRequest {
                execution_id: summary.execution_id,
                name: "demo".into(),
                format: ExportFormat::Gif,
                settings: Some(json!({"fps": 12})),
            })
            .await
            .unwrap();
        let captioned = service.generate_caption(export.id, "someone").await.unwrap();
        assert_eq!(captioned.ai_caption.as_deref(), Some("2 steps"));
        assert_eq!(service.get_export(export.id).await.unwrap().ai_caption, captioned.ai_caption);
    }
}
