//! Orientation resolution for video tracks.
//!
//! Raw pixel dimensions of a phone clip say nothing about how it is meant
//! to be displayed. The track's display transform does, so the render
//! canvas is derived from it once per export.

use image::imageops;
use image::RgbaImage;

use overlaykit_overlay_model::{PixelSize, Size, TrackTransform};

use crate::media::VideoTrack;

/// Output pixel geometry for one export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderCanvas {
    /// Render size in display orientation.
    pub size: PixelSize,

    /// Transform taking natural frames to display orientation.
    pub transform: TrackTransform,

    /// Whether the transform is a 90 or 270 degree rotation.
    pub is_portrait: bool,
}

/// Resolve the render canvas for a track.
pub fn resolve(track: &VideoTrack) -> RenderCanvas {
    let is_portrait = matches!(track.transform.quarter_turns(), Some(1) | Some(3));
    let size = if is_portrait {
        track.natural_size.swapped()
    } else {
        track.natural_size
    };
    tracing::debug!(
        natural = %track.natural_size,
        render = %size,
        is_portrait,
        "Resolved render canvas"
    );
    RenderCanvas {
        size,
        transform: track.transform,
        is_portrait,
    }
}

impl RenderCanvas {
    /// Canvas size in points, for overlay placement.
    pub fn point_size(&self) -> Size {
        self.size.into()
    }

    /// Rotate a natural-orientation frame into display orientation.
    ///
    /// Transforms that are not whole quarter turns are left unapplied.
    pub fn orient(&self, frame: RgbaImage) -> RgbaImage {
        match self.transform.quarter_turns() {
            Some(1) => imageops::rotate90(&frame),
            Some(2) => imageops::rotate180(&frame),
            Some(3) => imageops::rotate270(&frame),
            _ => frame,
        }
    }
}
