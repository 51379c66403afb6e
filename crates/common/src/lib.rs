//! OverlayKit Common Utilities
//!
//! Shared infrastructure for all OverlayKit crates:
//! - Error taxonomy and result alias
//! - Playback-progress clock used to drive overlays from frame timestamps
//! - Tracing subscriber setup
//! - Renderer configuration

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
