//! OverlayKit Platform Integration
//!
//! Collaborators that sit around the rendering core:
//! - **Permissions:** whether the host may write into its media library
//! - **Media store:** where finished exports are persisted

pub mod media_store;
pub mod permissions;

pub use media_store::{DirectoryMediaStore, MediaStore};
pub use permissions::{Capability, PermissionProvider};
