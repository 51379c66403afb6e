//! Permission providers for media library access.
//!
//! Hosts pick one provider from configuration instead of overriding a base
//! type; every provider answers the same two questions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Source of truth for media library access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "provider")]
pub enum PermissionProvider {
    /// A directory-backed library; access means the directory is writable.
    MediaLibrary { library_dir: PathBuf },
    /// Always granted (tests, sandboxes that manage access elsewhere).
    Unrestricted,
    /// Never granted.
    Denied,
}

/// A capability report entry for display to users.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub available: bool,
    pub required: bool,
    pub fix_instructions: Option<String>,
}

impl PermissionProvider {
    /// Whether access is currently granted.
    pub fn has_permission(&self) -> bool {
        match self {
            PermissionProvider::MediaLibrary { library_dir } => is_writable_dir(library_dir),
            PermissionProvider::Unrestricted => true,
            PermissionProvider::Denied => false,
        }
    }

    /// Ask for access and report the outcome through `completion`.
    ///
    /// For a directory library this creates the directory if needed.
    pub fn request_permission(&self, completion: impl FnOnce(bool) + Send + 'static) {
        let granted = match self {
            PermissionProvider::MediaLibrary { library_dir } => {
                if let Err(e) = std::fs::create_dir_all(library_dir) {
                    tracing::warn!(
                        dir = %library_dir.display(),
                        error = %e,
                        "Failed to create media library directory"
                    );
                }
                is_writable_dir(library_dir)
            }
            PermissionProvider::Unrestricted => true,
            PermissionProvider::Denied => false,
        };
        tracing::debug!(provider = ?self, granted, "Permission request finished");
        completion(granted);
    }

    /// Describe this provider's status for a capability report.
    pub fn capability(&self) -> Capability {
        let available = self.has_permission();
        let (description, fix_instructions) = match self {
            PermissionProvider::MediaLibrary { library_dir } => (
                format!("Write access to {}", library_dir.display()),
                (!available).then(|| {
                    format!(
                        "Create the directory and grant write access: mkdir -p {}",
                        library_dir.display()
                    )
                }),
            ),
            PermissionProvider::Unrestricted => ("Unrestricted media access".to_string(), None),
            PermissionProvider::Denied => (
                "Media library access is disabled".to_string(),
                Some("Configure a media library provider".to_string()),
            ),
        };

        Capability {
            name: "Media Library".to_string(),
            description,
            available,
            required: false,
            fix_instructions,
        }
    }
}

fn is_writable_dir(dir: &Path) -> bool {
    match std::fs::metadata(dir) {
        Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
        Err(_) => false,
    }
}
