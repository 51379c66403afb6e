//! Built-in animation players.
//!
//! Real animation engines live outside OverlayKit; these players cover
//! pre-rendered frame sequences and simple fills.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};

use overlaykit_common::error::{OverlayKitError, OverlayKitResult};

use crate::overlay::AnimationPlayer;

/// Plays a pre-rendered sequence of frames spread evenly over `[0, 1]`.
#[derive(Debug, Clone)]
pub struct FrameSequencePlayer {
    frames: Arc<Vec<RgbaImage>>,
    current: usize,
}

impl FrameSequencePlayer {
    /// Create a player from decoded frames. The sequence must not be empty.
    pub fn new(frames: Vec<RgbaImage>) -> OverlayKitResult<Self> {
        if frames.is_empty() {
            return Err(OverlayKitError::extract_image(
                "frame sequence contains no frames",
            ));
        }
        Ok(Self {
            frames: Arc::new(frames),
            current: 0,
        })
    }

    /// Load every image in `dir`, ordered by file name.
    pub fn load_dir(dir: &Path) -> OverlayKitResult<Self> {
        let mut paths = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read frame directory '{}'", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && ImageFormat::from_path(&path).is_ok() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in &paths {
            let frame = image::open(path).map_err(|e| {
                OverlayKitError::extract_image(format!(
                    "failed to decode overlay frame '{}': {e}",
                    path.display()
                ))
            })?;
            frames.push(frame.to_rgba8());
        }

        tracing::debug!(dir = %dir.display(), frames = frames.len(), "Loaded frame sequence");
        Self::new(frames)
    }

    /// Number of frames in the sequence.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Index of the frame shown at the current progress.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Frame index for `progress` in a sequence of `count` frames.
    pub fn index_for(progress: f64, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let p = progress.clamp(0.0, 1.0);
        ((p * count as f64).floor() as usize).min(count - 1)
    }
}

impl AnimationPlayer for FrameSequencePlayer {
    fn set_progress(&mut self, progress: f64) {
        self.current = Self::index_for(progress, self.frames.len());
    }

    fn render(&mut self, width: u32, height: u32) -> Option<RgbaImage> {
        let frame = self.frames.get(self.current)?;
        if frame.dimensions() == (width, height) {
            return Some(frame.clone());
        }
        Some(imageops::resize(frame, width, height, FilterType::Triangle))
    }
}

/// Fills its frame with a single color, optionally fading in with progress.
#[derive(Debug, Clone, Copy)]
pub struct FillPlayer {
    color: [u8; 4],
    fade_in: bool,
    progress: f64,
}

impl FillPlayer {
    /// Constant fill with straight-alpha RGBA `color`.
    pub fn new(color: [u8; 4]) -> Self {
        Self {
            color,
            fade_in: false,
            progress: 0.0,
        }
    }

    /// Fill whose alpha is scaled by the current progress.
    pub fn fading_in(color: [u8; 4]) -> Self {
        Self {
            fade_in: true,
            ..Self::new(color)
        }
    }

    fn current_color(&self) -> [u8; 4] {
        let mut color = self.color;
        if self.fade_in {
            color[3] = (color[3] as f64 * self.progress).round() as u8;
        }
        color
    }
}

impl AnimationPlayer for FillPlayer {
    fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 1.0);
    }

    fn render(&mut self, width: u32, height: u32) -> Option<RgbaImage> {
        Some(RgbaImage::from_pixel(width, height, Rgba(self.current_color())))
    }
}
