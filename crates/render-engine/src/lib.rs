//! OverlayKit Render Engine
//!
//! Composites time-varying overlays onto a still image or a video clip and
//! encodes the result to a new video file.
//!
//! # Pipeline Architecture
//!
//! ```text
//! image.png ──── Synthesize (1 frame/s, aspect-fit) ──┐
//!                                                     ├── VisualAsset
//! clip.mov ───── Probe (size, rotation, duration) ────┘        │
//!                                                              ▼
//!                                              Resolve RenderCanvas (once)
//!                                                              │
//!                     ┌── per frame i at t = i / fps ──────────┤
//!                     │                                        ▼
//!                     │                          Decode + orient source frame
//!                     │                                        │
//!   overlays ─────────┼── advance_to(t / duration) ── rasterize (main context)
//!                     │                                        │
//!                     │                                 Blend source-atop
//!                     │                                        │
//!                     └────────────────────────────── Encode (H.264)
//!                                                              │
//!                                                              ▼
//!                                                 scratch/<uuid>.mov
//! ```

pub mod blend;
pub mod compositor;
pub mod export;
pub mod ffmpeg;
pub mod main_context;
pub mod media;
pub mod memory;
pub mod normalize;
pub mod orientation;

pub use export::*;
pub use ffmpeg::FfmpegBackend;
pub use main_context::MainContext;
pub use media::{
    AssetOrigin, FrameReader, FrameWriter, ImageSource, MediaBackend, MediaKind, ProbeInfo,
    SourceMedia, VideoTrack, VisualAsset, WriterConfig,
};
pub use memory::{MemoryBackend, MemoryClip, TimedFrame};
pub use orientation::RenderCanvas;
