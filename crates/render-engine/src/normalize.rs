//! Asset normalization: turn a still image or a video file into a
//! [`VisualAsset`] the orchestrator can decode frame by frame.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::RgbaImage;

use overlaykit_common::config::{Container, ExportQuality, RendererConfig};
use overlaykit_common::error::{OverlayKitError, OverlayKitResult};
use overlaykit_overlay_model::{PixelSize, TrackTransform};

use crate::media::{
    AssetOrigin, ImageSource, MediaBackend, SourceMedia, VideoTrack, VisualAsset, WriterConfig,
};

/// Parameters for still-image synthesis.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub scratch_dir: PathBuf,
    pub container: Container,
    pub quality: ExportQuality,
    pub frame_interval_secs: f64,
    pub writer_ready_timeout: Duration,
    pub ready_poll_interval: Duration,
}

impl NormalizeOptions {
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            scratch_dir: config.scratch_dir.clone(),
            container: config.export.container,
            quality: config.export.quality,
            frame_interval_secs: config.synthesis.frame_interval_secs,
            writer_ready_timeout: Duration::from_millis(config.synthesis.writer_ready_timeout_ms),
            ready_poll_interval: Duration::from_millis(config.synthesis.ready_poll_interval_ms),
        }
    }
}

/// Largest even size with the image's aspect ratio that fits in `target`.
pub fn fit_size(image: PixelSize, target: PixelSize) -> PixelSize {
    if image.is_empty() || target.is_empty() {
        return PixelSize::new(0, 0);
    }
    let scale = (target.width as f64 / image.width as f64)
        .min(target.height as f64 / image.height as f64);
    let even = |v: f64| {
        let v = (v.floor() as u32).min(u32::MAX - 1);
        (v - v % 2).max(2)
    };
    PixelSize::new(
        even(image.width as f64 * scale),
        even(image.height as f64 * scale),
    )
}

/// Frames synthesized for a still held for `duration_secs`.
pub fn synthesized_frame_count(duration_secs: f64, frame_interval_secs: f64) -> u64 {
    if !(duration_secs.is_finite() && frame_interval_secs.is_finite()) || frame_interval_secs <= 0.0 {
        return 1;
    }
    ((duration_secs / frame_interval_secs + 1e-9).floor() as u64).max(1)
}

/// Normalize `source` on the tokio blocking pool.
pub async fn normalize(
    backend: Arc<dyn MediaBackend>,
    source: SourceMedia,
    duration_secs: f64,
    resolution: PixelSize,
    options: NormalizeOptions,
) -> OverlayKitResult<VisualAsset> {
    tokio::task::spawn_blocking(move || {
        normalize_blocking(backend.as_ref(), &source, duration_secs, resolution, &options)
    })
    .await
    .map_err(|e| OverlayKitError::Other(anyhow::anyhow!("normalize task failed: {e}")))?
}

/// Normalize `source` on the calling thread.
pub fn normalize_blocking(
    backend: &dyn MediaBackend,
    source: &SourceMedia,
    duration_secs: f64,
    resolution: PixelSize,
    options: &NormalizeOptions,
) -> OverlayKitResult<VisualAsset> {
    match source {
        SourceMedia::Unsupported { path, kind } => {
            tracing::warn!(path = %path.display(), kind = kind.as_str(), "Unsupported source media");
            Err(OverlayKitError::wrong_asset_type(kind.as_str()))
        }
        SourceMedia::Video(path) => passthrough_video(backend, path),
        SourceMedia::Image(image) => {
            let pixels = load_image(image)?;
            synthesize_still(backend, &pixels, duration_secs, resolution, options)
        }
    }
}

fn passthrough_video(backend: &dyn MediaBackend, path: &Path) -> OverlayKitResult<VisualAsset> {
    let info = backend.probe(path).map_err(|e| match e {
        OverlayKitError::FailedToExtractVideo { .. } => e,
        other => OverlayKitError::extract_video(other.to_string()),
    })?;
    tracing::info!(
        path = %path.display(),
        size = %info.natural_size,
        duration_secs = info.duration_secs,
        "Using video source"
    );
    Ok(VisualAsset {
        path: path.to_path_buf(),
        track: VideoTrack {
            natural_size: info.natural_size,
            transform: info.transform,
        },
        duration_secs: info.duration_secs,
        origin: AssetOrigin::Passthrough,
    })
}

fn load_image(source: &ImageSource) -> OverlayKitResult<Arc<RgbaImage>> {
    let image = match source {
        ImageSource::Pixels(pixels) => Arc::clone(pixels),
        ImageSource::File(path) => {
            let decoded = image::open(path).map_err(|e| {
                OverlayKitError::extract_image(format!("failed to decode '{}': {e}", path.display()))
            })?;
            Arc::new(decoded.to_rgba8())
        }
    };
    if image.width() == 0 || image.height() == 0 {
        return Err(OverlayKitError::extract_image("image has no pixels"));
    }
    Ok(image)
}

fn synthesize_still(
    backend: &dyn MediaBackend,
    image: &RgbaImage,
    duration_secs: f64,
    resolution: PixelSize,
    options: &NormalizeOptions,
) -> OverlayKitResult<VisualAsset> {
    let fitted_size = fit_size(PixelSize::new(image.width(), image.height()), resolution);
    if fitted_size.is_empty() {
        return Err(OverlayKitError::extract_image(format!(
            "cannot fit image into {resolution}"
        )));
    }
    let fitted = imageops::resize(image, fitted_size.width, fitted_size.height, FilterType::Triangle);

    let frame_count = synthesized_frame_count(duration_secs, options.frame_interval_secs);
    let path = options
        .scratch_dir
        .join(format!("{}.{}", uuid::Uuid::new_v4(), options.container.extension()));

    tracing::info!(
        output = %path.display(),
        size = %fitted_size,
        frames = frame_count,
        "Synthesizing video from still image"
    );

    let result = write_still_frames(backend, &fitted, fitted_size, frame_count, &path, options);
    if let Err(e) = result {
        remove_scratch_file(&path);
        return Err(match e {
            OverlayKitError::RenderingFailed { message } => OverlayKitError::extract_image(message),
            OverlayKitError::Io(e) => OverlayKitError::extract_image(format!(
                "cannot write synthesized video '{}': {e}",
                path.display()
            )),
            other => other,
        });
    }

    Ok(VisualAsset {
        path,
        track: VideoTrack {
            natural_size: fitted_size,
            transform: TrackTransform::IDENTITY,
        },
        duration_secs,
        origin: AssetOrigin::Synthesized,
    })
}

fn write_still_frames(
    backend: &dyn MediaBackend,
    frame: &RgbaImage,
    size: PixelSize,
    frame_count: u64,
    path: &Path,
    options: &NormalizeOptions,
) -> OverlayKitResult<()> {
    let mut writer = backend.open_writer(WriterConfig {
        path: path.to_path_buf(),
        size,
        frame_rate: 1.0 / options.frame_interval_secs,
        quality: options.quality,
        optimize_for_network: false,
        ready_poll_interval: options.ready_poll_interval,
    })?;

    for index in 0..frame_count {
        writer.wait_until_ready(options.writer_ready_timeout)?;
        writer.append(frame, index as f64 * options.frame_interval_secs)?;
    }
    writer.finish()
}

/// Delete a file the pipeline created, logging instead of failing.
pub(crate) fn remove_scratch_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed scratch file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Can't delete file"),
    }
}
