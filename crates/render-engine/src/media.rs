//! Media types and the backend traits that decode, probe and encode them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;

use overlaykit_common::config::ExportQuality;
use overlaykit_common::error::{OverlayKitError, OverlayKitResult};
use overlaykit_overlay_model::{PixelSize, TrackTransform};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "m4v", "mkv", "webm", "avi"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac", "flac"];

/// Broad media classification of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Unknown,
}

impl MediaKind {
    /// Classify by file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Audio
        } else {
            MediaKind::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Unknown => "unknown",
        }
    }
}

/// Where a still image's pixels come from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    File(PathBuf),
    Pixels(Arc<RgbaImage>),
}

/// Caller-supplied source media for an export.
#[derive(Debug, Clone)]
pub enum SourceMedia {
    Image(ImageSource),
    Video(PathBuf),
    Unsupported { path: PathBuf, kind: MediaKind },
}

impl SourceMedia {
    /// Classify a file on disk.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match MediaKind::from_path(&path) {
            MediaKind::Image => SourceMedia::Image(ImageSource::File(path)),
            MediaKind::Video => SourceMedia::Video(path),
            kind => SourceMedia::Unsupported { path, kind },
        }
    }

    /// An in-memory still image.
    pub fn pixels(image: RgbaImage) -> Self {
        SourceMedia::Image(ImageSource::Pixels(Arc::new(image)))
    }
}

/// The single video track of a [`VisualAsset`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoTrack {
    /// Stored pixel size, before the display transform.
    pub natural_size: PixelSize,

    /// Preferred display transform.
    pub transform: TrackTransform,
}

/// How a [`VisualAsset`] came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetOrigin {
    /// Written by the normalizer; deleted once the export finishes.
    Synthesized,
    /// The caller's own file; never deleted.
    Passthrough,
}

/// Normalized, time-bounded compositing input.
#[derive(Debug, Clone)]
pub struct VisualAsset {
    pub path: PathBuf,
    pub track: VideoTrack,
    pub duration_secs: f64,
    pub origin: AssetOrigin,
}

/// Stream metadata returned by [`MediaBackend::probe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeInfo {
    pub natural_size: PixelSize,
    pub transform: TrackTransform,
    pub duration_secs: f64,
}

/// Parameters for opening a [`FrameWriter`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub path: PathBuf,
    pub size: PixelSize,

    /// Frames per second of the written stream. Fractional for synthesized
    /// stills spaced more than a second apart.
    pub frame_rate: f64,

    pub quality: ExportQuality,
    pub optimize_for_network: bool,

    /// Sleep between readiness checks for writers without a notification.
    pub ready_poll_interval: Duration,
}

/// Sequential encoder input.
pub trait FrameWriter: Send {
    /// Whether the next [`append`](FrameWriter::append) would be accepted
    /// without buffering past the writer's limit.
    fn is_ready_for_more_data(&self) -> bool;

    /// Sleep between readiness checks in the default wait loop.
    fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }

    /// Block until the writer is ready or `timeout` elapses.
    fn wait_until_ready(&mut self, timeout: Duration) -> OverlayKitResult<()> {
        let start = Instant::now();
        while !self.is_ready_for_more_data() {
            if start.elapsed() >= timeout {
                return Err(OverlayKitError::WriterTimedOut {
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(self.ready_poll_interval());
        }
        Ok(())
    }

    /// Append one frame. `pts_secs` must strictly increase.
    fn append(&mut self, frame: &RgbaImage, pts_secs: f64) -> OverlayKitResult<()>;

    /// Flush and close the output file.
    fn finish(self: Box<Self>) -> OverlayKitResult<()>;
}

/// Sequential decoder output at a fixed frame rate, natural orientation.
pub trait FrameReader: Send {
    /// The next frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> OverlayKitResult<Option<RgbaImage>>;
}

/// A media toolkit able to probe, decode and encode video files.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Check if this backend can run on the system.
    fn is_available(&self) -> bool;

    /// Read the first video stream's metadata.
    fn probe(&self, path: &Path) -> OverlayKitResult<ProbeInfo>;

    fn open_writer(&self, config: WriterConfig) -> OverlayKitResult<Box<dyn FrameWriter>>;

    fn open_reader(&self, asset: &VisualAsset, fps: u32) -> OverlayKitResult<Box<dyn FrameReader>>;
}

/// Strictly increasing presentation time check shared by writers.
pub(crate) fn check_pts(last: Option<f64>, pts_secs: f64) -> OverlayKitResult<()> {
    if !pts_secs.is_finite() || pts_secs < 0.0 {
        return Err(OverlayKitError::rendering_failed(format!(
            "invalid presentation time {pts_secs}"
        )));
    }
    if let Some(last) = last {
        if pts_secs <= last {
            return Err(OverlayKitError::rendering_failed(format!(
                "presentation time {pts_secs} does not follow {last}"
            )));
        }
    }
    Ok(())
}
