//! OverlayKit Overlay Model
//!
//! Defines what an overlay is from the renderer's point of view:
//! - **Geometry:** canvas sizes, placement rectangles, and track transforms
//! - **Overlay contract:** placement, preparation, progress, rasterization
//! - **Animated overlays:** an [`Overlay`] backed by an opaque animation player

pub mod geometry;
pub mod overlay;
pub mod player;

pub use geometry::{PixelSize, Rect, Size, TrackTransform};
pub use overlay::{AnimatedOverlay, AnimationPlayer, Overlay, OverlayLayout};
pub use player::{FillPlayer, FrameSequencePlayer};
