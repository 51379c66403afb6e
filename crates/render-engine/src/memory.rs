//! In-memory media backend.
//!
//! Clips live in a path-keyed table instead of on disk, so the whole export
//! pipeline can run without external tools. Writers still touch the output
//! path so temporary-file handling behaves as it does with a real encoder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use image::{Rgba, RgbaImage};

use overlaykit_common::error::{OverlayKitError, OverlayKitResult};
use overlaykit_overlay_model::{PixelSize, TrackTransform};

use crate::media::{
    check_pts, FrameReader, FrameWriter, MediaBackend, ProbeInfo, VisualAsset, WriterConfig,
};

const TIME_EPSILON: f64 = 1e-9;

/// One stored frame and its presentation time.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    pub presentation_secs: f64,
    pub image: Arc<RgbaImage>,
}

/// A virtual video file.
#[derive(Debug, Clone)]
pub struct MemoryClip {
    pub natural_size: PixelSize,
    pub transform: TrackTransform,
    pub duration_secs: f64,
    pub frames: Vec<TimedFrame>,
}

impl MemoryClip {
    /// A clip of one solid color frame held for `duration_secs`.
    pub fn solid(
        natural_size: PixelSize,
        transform: TrackTransform,
        duration_secs: f64,
        color: [u8; 4],
    ) -> Self {
        let image = RgbaImage::from_pixel(natural_size.width, natural_size.height, Rgba(color));
        Self {
            natural_size,
            transform,
            duration_secs,
            frames: vec![TimedFrame {
                presentation_secs: 0.0,
                image: Arc::new(image),
            }],
        }
    }

    pub fn frame_times(&self) -> Vec<f64> {
        self.frames.iter().map(|f| f.presentation_secs).collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    clips: HashMap<PathBuf, MemoryClip>,
    stall_writers: bool,
    fail_encoding: bool,
    probes: usize,
    writers_opened: usize,
}

/// Path-addressed clip store implementing [`MediaBackend`].
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a clip at `path`.
    pub fn insert_clip(&self, path: impl Into<PathBuf>, clip: MemoryClip) {
        self.lock().clips.insert(path.into(), clip);
    }

    /// A copy of the clip stored at `path`.
    pub fn clip(&self, path: &Path) -> Option<MemoryClip> {
        self.lock().clips.get(path).cloned()
    }

    /// Writers opened from now on never report readiness.
    pub fn set_stall_writers(&self, stall: bool) {
        self.lock().stall_writers = stall;
    }

    /// Writers opened from now on fail in `finish`.
    pub fn set_fail_encoding(&self, fail: bool) {
        self.lock().fail_encoding = fail;
    }

    /// Number of `probe` calls so far.
    pub fn probes(&self) -> usize {
        self.lock().probes
    }

    /// Number of writers opened so far.
    pub fn writers_opened(&self) -> usize {
        self.lock().writers_opened
    }
}

impl MediaBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn probe(&self, path: &Path) -> OverlayKitResult<ProbeInfo> {
        let mut state = self.lock();
        state.probes += 1;
        let clip = state.clips.get(path).ok_or_else(|| {
            OverlayKitError::extract_video(format!("no clip registered at '{}'", path.display()))
        })?;
        Ok(ProbeInfo {
            natural_size: clip.natural_size,
            transform: clip.transform,
            duration_secs: clip.duration_secs,
        })
    }

    fn open_writer(&self, config: WriterConfig) -> OverlayKitResult<Box<dyn FrameWriter>> {
        if config.size.is_empty() {
            return Err(OverlayKitError::rendering_failed(
                "writer size must be non-zero",
            ));
        }
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&config.path)?;

        let (stalled, fail) = {
            let mut state = self.lock();
            state.writers_opened += 1;
            (state.stall_writers, state.fail_encoding)
        };
        tracing::debug!(output = %config.path.display(), size = %config.size, "Opened memory writer");

        Ok(Box::new(MemoryWriter {
            backend: self.clone(),
            path: config.path,
            size: config.size,
            frame_rate: config.frame_rate,
            poll_interval: config.ready_poll_interval,
            frames: Vec::new(),
            last_pts: None,
            stalled,
            fail,
        }))
    }

    fn open_reader(&self, asset: &VisualAsset, fps: u32) -> OverlayKitResult<Box<dyn FrameReader>> {
        let clip = self.clip(&asset.path).ok_or_else(|| {
            OverlayKitError::rendering_failed(format!(
                "no clip registered at '{}'",
                asset.path.display()
            ))
        })?;
        Ok(Box::new(MemoryReader {
            frames: clip.frames,
            duration_secs: asset.duration_secs,
            fps: fps.max(1),
            index: 0,
        }))
    }
}

struct MemoryWriter {
    backend: MemoryBackend,
    path: PathBuf,
    size: PixelSize,
    frame_rate: f64,
    poll_interval: Duration,
    frames: Vec<TimedFrame>,
    last_pts: Option<f64>,
    stalled: bool,
    fail: bool,
}

impl FrameWriter for MemoryWriter {
    fn is_ready_for_more_data(&self) -> bool {
        !self.stalled
    }

    fn ready_poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn append(&mut self, frame: &RgbaImage, pts_secs: f64) -> OverlayKitResult<()> {
        check_pts(self.last_pts, pts_secs)?;
        if frame.dimensions() != (self.size.width, self.size.height) {
            return Err(OverlayKitError::rendering_failed(format!(
                "frame size {}x{} does not match writer size {}",
                frame.width(),
                frame.height(),
                self.size
            )));
        }
        self.frames.push(TimedFrame {
            presentation_secs: pts_secs,
            image: Arc::new(frame.clone()),
        });
        self.last_pts = Some(pts_secs);
        Ok(())
    }

    fn finish(self: Box<Self>) -> OverlayKitResult<()> {
        let this = *self;
        if this.fail {
            return Err(OverlayKitError::rendering_failed("encoder reported failure"));
        }
        let frame_secs = if this.frame_rate > 0.0 {
            1.0 / this.frame_rate
        } else {
            0.0
        };
        let duration_secs = this.last_pts.map_or(0.0, |pts| pts + frame_secs);
        std::fs::write(&this.path, format!("memory clip: {} frames\n", this.frames.len()))?;

        let clip = MemoryClip {
            natural_size: this.size,
            transform: TrackTransform::IDENTITY,
            duration_secs,
            frames: this.frames,
        };
        this.backend.insert_clip(this.path, clip);
        Ok(())
    }
}

struct MemoryReader {
    frames: Vec<TimedFrame>,
    duration_secs: f64,
    fps: u32,
    index: u64,
}

impl FrameReader for MemoryReader {
    fn next_frame(&mut self) -> OverlayKitResult<Option<RgbaImage>> {
        let t = self.index as f64 / self.fps as f64;
        if t >= self.duration_secs - TIME_EPSILON {
            return Ok(None);
        }
        let frame = self
            .frames
            .iter()
            .rev()
            .find(|f| f.presentation_secs <= t + TIME_EPSILON)
            .or_else(|| self.frames.first());
        self.index += 1;
        Ok(frame.map(|f| (*f.image).clone()))
    }
}
