//! Upload preview: convert each file through the engine, wait for the
//! thumbnail it writes, and hand back metadata plus an inline PNG.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReadinessConfig;
use crate::engine::{EngineError, SharedEngineHandle};
use crate::pipeline::execution::{sanitize_file_name, OUTPUT_LOG_FILE_NAME};
use crate::pipeline::macro_script::ConversionTemplate;
use crate::pipeline::readiness::{
    await_file_content, await_stable_file, ReadinessError, StabilityPolicy,
};
use crate::pipeline::UploadedFile;
use crate::worker::cleanup::CleanupScheduler;

pub const METADATA_PATH_MARKER: &str = "METADATA_PATH:";
pub const PREVIEW_PATH_MARKER: &str = "PREVIEW_PATH:";
pub const THUMBNAIL_EDGE: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewMetadata {
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewEntry {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PreviewMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreviewEntry {
    fn failed(filename: &str, error: &PreviewError) -> Self {
        Self {
            filename: filename.to_string(),
            unique_filename: None,
            preview: None,
            metadata: None,
            file_type: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("No files uploaded")]
    NoInputFiles,
    #[error("failed to prepare preview directory: {0}")]
    Workspace(std::io::Error),
    #[error("Failed to generate preview: {0}")]
    Engine(#[from] EngineError),
    #[error("Failed to generate preview: {0}")]
    Readiness(#[from] ReadinessError),
    #[error("Failed to generate preview: conversion log has no {0} line")]
    MissingMarker(&'static str),
    #[error("Failed to generate image preview: {0}")]
    Thumbnail(#[from] image::ImageError),
    #[error("preview task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait PreviewGenerator: Send + Sync + 'static {
    async fn preview(&self, files: Vec<UploadedFile>) -> Result<Vec<PreviewEntry>, PreviewError>;
}

pub type SharedPreviewGenerator = Arc<dyn PreviewGenerator>;

pub struct EnginePreviewGenerator {
    engine: SharedEngineHandle,
    template: ConversionTemplate,
    work_root: PathBuf,
    log_timeout: Duration,
    file_policy: StabilityPolicy,
    cleanup: CleanupScheduler,
}

impl EnginePreviewGenerator {
    pub fn new(
        engine: SharedEngineHandle,
        template: ConversionTemplate,
        work_root: impl Into<PathBuf>,
        readiness: &ReadinessConfig,
        cleanup: CleanupScheduler,
    ) -> Self {
        Self {
            engine,
            template,
            work_root: work_root.into(),
            log_timeout: Duration::from_secs(readiness.log_timeout_secs),
            file_policy: StabilityPolicy::from_config(readiness),
            cleanup,
        }
    }

    fn schedule_cleanup(&self, dir: PathBuf) {
        if self.cleanup.schedule(dir.as_path()).is_ok() {
            debug!(dir = %dir.display(), "preview cleanup scheduled");
        }
    }

    async fn preview_one(&self, dir: &Path, upload: UploadedFile) -> Result<PreviewEntry, PreviewError> {
        let unique_filename = match sanitize_file_name(upload.file_name.as_str()) {
            name if name.is_empty() => String::from("upload"),
            name => name,
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(PreviewError::Workspace)?;
        let input_path = dir.join(unique_filename.as_str());
        tokio::fs::write(input_path.as_path(), upload.bytes.as_slice())
            .await
            .map_err(PreviewError::Workspace)?;
        info!(path = %input_path.display(), "saved original file");

        let stem = Path::new(unique_filename.as_str())
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(unique_filename.as_str())
            .to_string();
        let file_type = Path::new(unique_filename.as_str())
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        let log_path = dir.join(OUTPUT_LOG_FILE_NAME);
        let script = self
            .template
            .render(input_path.as_path(), dir, stem.as_str(), log_path.as_path());

        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.invoke(script.as_str())).await??;

        let log = await_file_content(
            log_path.as_path(),
            self.log_timeout,
            self.file_policy.poll_interval,
        )
        .await?;
        let markers = parse_preview_markers(log.as_str());
        let preview_path = markers
            .preview_path
            .ok_or(PreviewError::MissingMarker(PREVIEW_PATH_MARKER))?;
        await_stable_file(preview_path.as_path(), &self.file_policy).await?;

        let metadata = match markers.metadata_path {
            Some(path) => match tokio::fs::read_to_string(path.as_path()).await {
                Ok(raw) => Some(PreviewMetadata { raw }),
                Err(_) => {
                    warn!(path = %path.display(), "metadata file not found at expected path");
                    None
                }
            },
            None => None,
        };

        let preview =
            tokio::task::spawn_blocking(move || thumbnail_data_url(preview_path.as_path())).await??;

        Ok(PreviewEntry {
            filename: upload.file_name,
            unique_filename: Some(unique_filename),
            preview: Some(preview),
            metadata,
            file_type,
            error: None,
        })
    }
}

#[async_trait]
impl PreviewGenerator for EnginePreviewGenerator {
    async fn preview(&self, files: Vec<UploadedFile>) -> Result<Vec<PreviewEntry>, PreviewError> {
        if files.is_empty() {
            return Err(PreviewError::NoInputFiles);
        }
        let mut results = Vec::with_capacity(files.len());
        for upload in files {
            let dir = self
                .work_root
                .join(format!("preview_{}", Uuid::new_v4().simple()));
            let filename = upload.file_name.clone();
            match self.preview_one(dir.as_path(), upload).await {
                Ok(entry) => {
                    info!(file = %filename, "preview generated");
                    results.push(entry);
                }
                Err(preview_error) => {
                    error!(file = %filename, error = %preview_error, "preview failed");
                    results.push(PreviewEntry::failed(filename.as_str(), &preview_error));
                }
            }
            self.schedule_cleanup(dir);
        }
        Ok(results)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PreviewMarkers {
    pub metadata_path: Option<PathBuf>,
    pub preview_path: Option<PathBuf>,
}

pub(crate) fn parse_preview_markers(log: &str) -> PreviewMarkers {
    let mut markers = PreviewMarkers::default();
    for line in log.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(METADATA_PATH_MARKER) {
            markers.metadata_path = Some(PathBuf::from(rest.trim()));
        } else if let Some(rest) = line.strip_prefix(PREVIEW_PATH_MARKER) {
            markers.preview_path = Some(PathBuf::from(rest.trim()));
        }
    }
    markers
}

/// Shrinks the image to fit a 200x200 box (aspect kept) and encodes it as a
/// PNG data URL.
pub fn thumbnail_data_url(path: &Path) -> Result<String, PreviewError> {
    let thumbnail = image::open(path)?.thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE);
    let mut png = Cursor::new(Vec::new());
    thumbnail.write_to(&mut png, image::ImageFormat::Png)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(png.into_inner());
    Ok(format!("data:image/png;base64,{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineHandle, MacroEngine};
    use crate::worker::cleanup::CleanupRequest;
    use base64::Engine as _;
    use image::{GenericImageView, ImageBuffer, Rgb};
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("atlas_preview_{label}_{stamp}"));
        fs::create_dir_all(path.as_path()).expect("temp dir should exist");
        path
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, _| Rgb([(x % 255) as u8, 10, 200]));
        img.save(path).expect("png should save");
    }

    /// Plays the conversion macro: reads the placeholders back out of the
    /// rendered script, writes metadata and a preview, then the log.
    struct ConvertingEngine {
        write_preview: bool,
    }

    fn quoted_after<'a>(script: &'a str, prefix: &str) -> &'a str {
        let start = script.find(prefix).expect("prefix should be rendered") + prefix.len();
        let rest = &script[start..];
        &rest[..rest.find('"').expect("closing quote")]
    }

    /// The log path is the second argument of the closing `File.saveString`.
    fn log_path_in(script: &str) -> &str {
        quoted_after(script, "previewPath + \"\\n\", \"")
    }

    impl MacroEngine for ConvertingEngine {
        fn start(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn run_macro(&mut self, script: &str) -> Result<String, EngineError> {
            let metadata = quoted_after(script, "metadataPath = \"");
            let preview = quoted_after(script, "previewPath = \"");
            let log = log_path_in(script);
            fs::write(metadata, "Width: 400 pixels").expect("metadata write");
            if self.write_preview {
                write_png(Path::new(preview), 400, 100);
            }
            fs::write(
                log,
                format!("METADATA_PATH: {metadata}\nPREVIEW_PATH: {preview}\n"),
            )
            .expect("log write");
            Ok(String::new())
        }

        fn log(&mut self) -> String {
            String::new()
        }

        fn dispose(&mut self) {}
    }

    fn generator(
        write_preview: bool,
    ) -> (
        EnginePreviewGenerator,
        tokio::sync::mpsc::UnboundedReceiver<CleanupRequest>,
    ) {
        let engine = EngineHandle::new(Box::new(ConvertingEngine { write_preview }));
        let (cleanup, rx) = CleanupScheduler::channel(Duration::from_secs(300));
        let readiness = ReadinessConfig {
            log_timeout_secs: 1,
            file_timeout_secs: 0,
            poll_interval_ms: 10,
            stability_rounds: 5,
        };
        let generator = EnginePreviewGenerator::new(
            Arc::new(engine),
            ConversionTemplate::default(),
            temp_dir("work"),
            &readiness,
            cleanup,
        );
        (generator, rx)
    }

    #[test]
    fn parse_preview_markers_reads_both_paths() {
        let markers = parse_preview_markers(
            "noise\nMETADATA_PATH: /tmp/a_metadata.txt\n  PREVIEW_PATH:/tmp/a_preview.png  \n",
        );
        assert_eq!(
            markers,
            PreviewMarkers {
                metadata_path: Some(PathBuf::from("/tmp/a_metadata.txt")),
                preview_path: Some(PathBuf::from("/tmp/a_preview.png")),
            }
        );
    }

    #[test]
    fn default_conversion_template_exposes_every_path() {
        let script = ConversionTemplate::default().render(
            Path::new("/work/p/cells.tif"),
            Path::new("/work/p"),
            "cells",
            Path::new("/work/p/output_log.txt"),
        );

        assert_eq!(
            quoted_after(script.as_str(), "metadataPath = \""),
            "/work/p/cells_metadata.txt"
        );
        assert_eq!(
            quoted_after(script.as_str(), "previewPath = \""),
            "/work/p/cells_preview.png"
        );
        assert_eq!(log_path_in(script.as_str()), "/work/p/output_log.txt");
    }

    #[test]
    fn thumbnail_fits_in_bounding_box() {
        let dir = temp_dir("thumb");
        let path = dir.join("wide.png");
        write_png(path.as_path(), 800, 400);

        let url = thumbnail_data_url(path.as_path()).expect("thumbnail should encode");

        let encoded = url
            .strip_prefix("data:image/png;base64,")
            .expect("data url prefix");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .expect("valid base64");
        let decoded = image::load_from_memory(bytes.as_slice()).expect("valid png");
        assert_eq!(decoded.dimensions(), (200, 100));
    }

    #[tokio::test]
    async fn preview_returns_thumbnail_metadata_and_schedules_cleanup() {
        let (generator, mut rx) = generator(true);

        let results = generator
            .preview(vec![UploadedFile::new("cells one.tif", b"raw".to_vec())])
            .await
            .expect("preview should run");

        assert_eq!(results.len(), 1);
        let entry = &results[0];
        assert_eq!(entry.filename, "cells one.tif");
        assert_eq!(entry.unique_filename.as_deref(), Some("cells_one.tif"));
        assert_eq!(entry.file_type.as_deref(), Some("tif"));
        assert_eq!(
            entry.metadata,
            Some(PreviewMetadata {
                raw: String::from("Width: 400 pixels")
            })
        );
        assert!(entry
            .preview
            .as_deref()
            .is_some_and(|url| url.starts_with("data:image/png;base64,")));
        assert!(entry.error.is_none());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn missing_preview_is_reported_inline() {
        let (generator, mut rx) = generator(false);

        let results = generator
            .preview(vec![
                UploadedFile::new("a.tif", b"raw".to_vec()),
                UploadedFile::new("b.tif", b"raw".to_vec()),
            ])
            .await
            .expect("preview should run");

        assert_eq!(results.len(), 2);
        for entry in &results {
            assert!(entry.preview.is_none());
            assert!(entry
                .error
                .as_deref()
                .is_some_and(|error| error.contains("file not created")));
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn preview_still_reports_results_when_cleanup_worker_is_gone() {
        let (generator, rx) = generator(true);
        drop(rx);

        let results = generator
            .preview(vec![UploadedFile::new("c.tif", b"raw".to_vec())])
            .await
            .expect("preview should run");

        assert_eq!(results.len(), 1);
        assert!(results[0].error.is_none());
        assert!(results[0].preview.is_some());
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let (generator, _rx) = generator(true);
        assert!(matches!(
            generator.preview(Vec::new()).await,
            Err(PreviewError::NoInputFiles)
        ));
    }
}
