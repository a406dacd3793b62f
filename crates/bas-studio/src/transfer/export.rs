// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution export.
//!
//! Every export starts from a [`ReplayMovieSpec`]: the execution's manifest
//! and assets plus the resolved replay style. Style resolution layers
//! server defaults, the persisted `replay_config` setting and the request's
//! overrides, later layers winning field by field.

use std::path::{Path, PathBuf};

use bas_core::models::{ExportFormat, SETTING_REPLAY_CONFIG};
use bas_core::timeline::VIDEO_FILE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tracing::{info, warn};
use uuid::Uuid;

use super::TransferService;
use super::import::{RecordingManifest, list_assets};
use crate::error::{Error, Result};

/// Fixed render canvas.
pub const CANVAS_WIDTH: u32 = 1920;
pub const CANVAS_HEIGHT: u32 = 1080;

pub const DEFAULT_THEME: &str = "aurora";
pub const DEFAULT_CURSOR_THEME: &str = "white";

/// Text stamped on exports of accounts without the no-watermark feature.
pub const REQUIRED_WATERMARK_TEXT: &str = "Made with BAS";

const WEBM_REQUIRES_VIDEO: &str = "webm format is only available for recorded video exports";

// ============================================================================
// Overrides
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Watermark {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Intro or outro title card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TitleCard {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Partial replay style. Unset fields fall through to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayOverrides {
    #[serde(rename = "chromeTheme", default, skip_serializing_if = "Option::is_none")]
    pub chrome_theme: Option<String>,
    #[serde(rename = "backgroundTheme", default, skip_serializing_if = "Option::is_none")]
    pub background_theme: Option<String>,
    #[serde(rename = "cursorTheme", default, skip_serializing_if = "Option::is_none")]
    pub cursor_theme: Option<String>,
    #[serde(rename = "cursorScale", default, skip_serializing_if = "Option::is_none")]
    pub cursor_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<Watermark>,
    #[serde(rename = "introCard", default, skip_serializing_if = "Option::is_none")]
    pub intro_card: Option<TitleCard>,
    #[serde(rename = "outroCard", default, skip_serializing_if = "Option::is_none")]
    pub outro_card: Option<TitleCard>,
    /// Fraction of the canvas the browser frame occupies, in (0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_scale: Option<f64>,
}

impl ReplayOverrides {
    pub fn validate(&self) -> Result<()> {
        if let Some(scale) = self.cursor_scale
            && !(scale.is_finite() && scale > 0.0 && scale <= 4.0)
        {
            return Err(Error::InvalidRequest(format!(
                "cursorScale must be in (0, 4], got {}",
                scale
            )));
        }
        if let Some(scale) = self.browser_scale
            && !(scale.is_finite() && scale > 0.0 && scale <= 1.0)
        {
            return Err(Error::InvalidRequest(format!(
                "browser_scale must be in (0, 1], got {}",
                scale
            )));
        }
        Ok(())
    }

    /// Fields set in `other` replace ours.
    pub fn layer(mut self, other: &ReplayOverrides) -> Self {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        take(&mut self.chrome_theme, &other.chrome_theme);
        take(&mut self.background_theme, &other.background_theme);
        take(&mut self.cursor_theme, &other.cursor_theme);
        take(&mut self.cursor_scale, &other.cursor_scale);
        take(&mut self.watermark, &other.watermark);
        take(&mut self.intro_card, &other.intro_card);
        take(&mut self.outro_card, &other.outro_card);
        take(&mut self.browser_scale, &other.browser_scale);
        self
    }
}

/// Fully resolved replay style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStyle {
    #[serde(rename = "chromeTheme")]
    pub chrome_theme: String,
    #[serde(rename = "backgroundTheme")]
    pub background_theme: String,
    #[serde(rename = "cursorTheme")]
    pub cursor_theme: String,
    #[serde(rename = "cursorScale")]
    pub cursor_scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<Watermark>,
    #[serde(rename = "introCard", default, skip_serializing_if = "Option::is_none")]
    pub intro_card: Option<TitleCard>,
    #[serde(rename = "outroCard", default, skip_serializing_if = "Option::is_none")]
    pub outro_card: Option<TitleCard>,
    pub browser_scale: f64,
}

impl Default for ResolvedStyle {
    fn default() -> Self {
        Self {
            chrome_theme: DEFAULT_THEME.to_string(),
            background_theme: DEFAULT_THEME.to_string(),
            cursor_theme: DEFAULT_CURSOR_THEME.to_string(),
            cursor_scale: 1.0,
            watermark: None,
            intro_card: None,
            outro_card: None,
            browser_scale: 1.0,
        }
    }
}

impl ResolvedStyle {
    /// Defaults with the merged overrides applied.
    pub fn resolve(overrides: &ReplayOverrides) -> Self {
        let defaults = Self::default();
        Self {
            chrome_theme: overrides.chrome_theme.clone().unwrap_or(defaults.chrome_theme),
            background_theme: overrides
                .background_theme
                .clone()
                .unwrap_or(defaults.background_theme),
            cursor_theme: overrides.cursor_theme.clone().unwrap_or(defaults.cursor_theme),
            cursor_scale: overrides.cursor_scale.unwrap_or(defaults.cursor_scale),
            watermark: overrides.watermark.clone().filter(|w| w.enabled),
            intro_card: overrides.intro_card.clone(),
            outro_card: overrides.outro_card.clone(),
            browser_scale: overrides.browser_scale.unwrap_or(defaults.browser_scale),
        }
    }

    /// Enforce the account watermark, keeping a custom position.
    fn force_watermark(&mut self) {
        let position = self.watermark.as_ref().and_then(|w| w.position.clone());
        self.watermark = Some(Watermark {
            enabled: true,
            text: Some(REQUIRED_WATERMARK_TEXT.to_string()),
            position,
        });
    }
}

// ============================================================================
// Movie spec
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RenderSource {
    /// The driver's `video.webm` capture.
    RecordedVideo,
    /// Screenshots replayed frame by frame.
    ReplayFrames,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// A `scale`-sized frame centered on the canvas.
    pub fn centered(canvas: Size, scale: f64) -> Self {
        let width = ((canvas.width as f64) * scale).round() as u32;
        let height = ((canvas.height as f64) * scale).round() as u32;
        Self {
            x: canvas.width.saturating_sub(width) / 2,
            y: canvas.height.saturating_sub(height) / 2,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewMetadata {
    pub frame_count: usize,
    pub screenshot_count: usize,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_url: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Declarative description of how to render an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayMovieSpec {
    pub execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub render_source: RenderSource,
    pub manifest: RecordingManifest,
    /// Result-directory-relative paths.
    pub assets: Vec<String>,
    pub style: ResolvedStyle,
    pub canvas: Size,
    pub browser_frame: Rect,
    pub preview: PreviewMetadata,
}

/// Renders a movie spec into video bytes.
#[async_trait::async_trait]
pub trait Compositor: Send + Sync {
    async fn render(
        &self,
        spec: &ReplayMovieSpec,
        format: ExportFormat,
        result_path: &Path,
    ) -> Result<Vec<u8>>;
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExportTarget {
    Folder,
    Json,
    Mp4,
    Gif,
    Webm,
}

impl ExportTarget {
    fn video_format(&self) -> Option<ExportFormat> {
        match self {
            Self::Mp4 => Some(ExportFormat::Mp4),
            Self::Gif => Some(ExportFormat::Gif),
            Self::Webm => Some(ExportFormat::Webm),
            Self::Folder | Self::Json => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportRequest {
    pub format: ExportTarget,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub overrides: ReplayOverrides,
    #[serde(default)]
    pub render_source: Option<RenderSource>,
    /// Spec from a previous `json` export; required for video formats.
    #[serde(default)]
    pub movie_spec: Option<ReplayMovieSpec>,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl ExportRequest {
    pub fn new(format: ExportTarget) -> Self {
        Self {
            format,
            output_dir: None,
            overrides: ReplayOverrides::default(),
            render_source: None,
            movie_spec: None,
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportOutcome {
    Folder { output_dir: PathBuf, files: usize },
    Spec(Box<ReplayMovieSpec>),
    Rendered {
        bytes: Vec<u8>,
        content_type: &'static str,
        file_name: String,
    },
}

// ============================================================================
// Orchestration
// ============================================================================

impl TransferService {
    /// Persisted replay overrides; an unreadable value is ignored.
    pub async fn persisted_overrides(&self) -> Result<ReplayOverrides> {
        let Some(setting) = self.store().get_setting(SETTING_REPLAY_CONFIG).await? else {
            return Ok(ReplayOverrides::default());
        };
        match serde_json::from_value::<ReplayOverrides>(setting.value) {
            Ok(overrides) => Ok(overrides),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable replay_config setting (non-fatal)");
                Ok(ReplayOverrides::default())
            }
        }
    }

    /// Defaults < persisted replay_config < request.
    pub async fn resolve_style(
        &self,
        request: &ReplayOverrides,
        user_identity: &str,
    ) -> Result<ResolvedStyle> {
        request.validate()?;
        let merged = self.persisted_overrides().await?.layer(request);
        let mut style = ResolvedStyle::resolve(&merged);
        if self.entitlements.requires_watermark(user_identity).await {
            style.force_watermark();
        }
        Ok(style)
    }

    /// Build the movie spec of an execution.
    pub async fn build_movie_spec(
        &self,
        execution_id: Uuid,
        overrides: &ReplayOverrides,
        render_source: Option<RenderSource>,
        user_identity: &str,
    ) -> Result<ReplayMovieSpec> {
        let execution = self.engine.get_execution(execution_id).await?;
        let dir = self.engine.result_dir(execution_id).await?;
        let timeline = self.engine.get_timeline(execution_id).await?;
        let has_video = tokio::fs::try_exists(dir.join(VIDEO_FILE)).await?;
        let render_source = render_source.unwrap_or(if has_video {
            RenderSource::RecordedVideo
        } else {
            RenderSource::ReplayFrames
        });
        if render_source == RenderSource::RecordedVideo && !has_video {
            return Err(Error::InvalidRequest(format!(
                "execution {} has no recorded video",
                execution_id
            )));
        }

        let style = self.resolve_style(overrides, user_identity).await?;
        let assets_dir = dir.clone();
        let assets = tokio::task::spawn_blocking(move || list_assets(&assets_dir))
            .await
            .map_err(|e| Error::Internal(format!("asset listing task failed: {}", e)))??;
        let manifest = RecordingManifest::from_timeline(&timeline);
        let canvas = Size {
            width: CANVAS_WIDTH,
            height: CANVAS_HEIGHT,
        };
        let preview = PreviewMetadata {
            frame_count: manifest.frames.len(),
            screenshot_count: manifest.frames.iter().filter(|f| f.screenshot.is_some()).count(),
            duration_ms: manifest.duration_ms.unwrap_or(0),
            first_url: manifest.frames.iter().find_map(|f| f.url.clone()),
            generated_at: Utc::now(),
        };
        Ok(ReplayMovieSpec {
            execution_id,
            workflow_id: execution.workflow_id,
            render_source,
            manifest,
            assets,
            browser_frame: Rect::centered(canvas, style.browser_scale),
            style,
            canvas,
            preview,
        })
    }

    /// Export an execution in the requested format.
    pub async fn export_execution(
        &self,
        execution_id: Uuid,
        request: ExportRequest,
        user_identity: &str,
    ) -> Result<ExportOutcome> {
        if request.format == ExportTarget::Webm
            && request.render_source == Some(RenderSource::ReplayFrames)
        {
            return Err(Error::InvalidRequest(WEBM_REQUIRES_VIDEO.to_string()));
        }
        match request.format {
            ExportTarget::Folder => self.export_folder(execution_id, request.output_dir).await,
            ExportTarget::Json => {
                let spec = self
                    .build_movie_spec(
                        execution_id,
                        &request.overrides,
                        request.render_source,
                        user_identity,
                    )
                    .await?;
                info!(
                    execution_id = %execution_id,
                    frames = spec.preview.frame_count,
                    render_source = %spec.render_source,
                    "Replay movie spec built"
                );
                Ok(ExportOutcome::Spec(Box::new(spec)))
            }
            ExportTarget::Mp4 | ExportTarget::Gif | ExportTarget::Webm => {
                self.export_video(execution_id, request, user_identity).await
            }
        }
    }

    async fn export_folder(
        &self,
        execution_id: Uuid,
        output_dir: Option<PathBuf>,
    ) -> Result<ExportOutcome> {
        let output_dir = output_dir.ok_or(Error::MissingField("output_dir"))?;
        if !output_dir.is_absolute() {
            return Err(Error::InvalidRequest(format!(
                "output_dir must be an absolute path: {}",
                output_dir.display()
            )));
        }
        let source = self.engine.result_dir(execution_id).await?;
        let target = output_dir.clone();
        let files = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| Error::Internal(format!("folder export task failed: {}", e)))??;
        info!(execution_id = %execution_id, output_dir = %output_dir.display(), files, "Execution exported to folder");
        Ok(ExportOutcome::Folder { output_dir, files })
    }

    async fn export_video(
        &self,
        execution_id: Uuid,
        request: ExportRequest,
        user_identity: &str,
    ) -> Result<ExportOutcome> {
        let Some(format) = request.format.video_format() else {
            return Err(Error::Internal(format!("{} is not a video format", request.format)));
        };
        let mut spec = request.movie_spec.ok_or(Error::MissingField("movie_spec"))?;
        if spec.execution_id != execution_id {
            return Err(Error::InvalidRequest(format!(
                "movie_spec belongs to execution {}, not {}",
                spec.execution_id, execution_id
            )));
        }
        if format == ExportFormat::Webm && spec.render_source != RenderSource::RecordedVideo {
            return Err(Error::InvalidRequest(WEBM_REQUIRES_VIDEO.to_string()));
        }
        if self.entitlements.requires_watermark(user_identity).await {
            spec.style.force_watermark();
        }
        let Some(compositor) = self.compositor.as_ref() else {
            return Err(Error::ServiceUnavailable("no compositor configured".to_string()));
        };
        let dir = self.engine.result_dir(execution_id).await?;
        let bytes = compositor.render(&spec, format, &dir).await?;
        let file_name = request
            .file_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("execution-{}", execution_id));
        let extension = format.to_string();
        let file_name = if file_name.ends_with(&format!(".{}", extension)) {
            file_name
        } else {
            format!("{}.{}", file_name, extension)
        };
        info!(execution_id = %execution_id, format = %format, size = bytes.len(), "Execution rendered");
        Ok(ExportOutcome::Rendered {
            bytes,
            content_type: format.content_type(),
            file_name,
        })
    }
}

/// Copy every file under `source` into `target`; returns the file count.
fn copy_tree(source: &Path, target: &Path) -> Result<usize> {
    let mut copied = 0;
    let mut stack = vec![PathBuf::new()];
    while let Some(relative) = stack.pop() {
        let dir = source.join(&relative);
        std::fs::create_dir_all(target.join(&relative))?;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let child = relative.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                stack.push(child);
            } else {
                std::fs::copy(entry.path(), target.join(&child))?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}
