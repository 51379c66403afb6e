//! Persistence sink for finished exports.

use std::path::{Path, PathBuf};

use anyhow::Context as _;

use overlaykit_common::error::{OverlayKitError, OverlayKitResult};

use crate::permissions::PermissionProvider;

/// Destination for finished exports.
pub trait MediaStore: Send + Sync {
    /// Store name for logs.
    fn name(&self) -> &str;

    /// Persist the file at `file`, returning where it was stored.
    ///
    /// The source file is left in place; deleting it is the caller's job.
    fn save(&self, file: &Path) -> OverlayKitResult<PathBuf>;
}

/// Copies exports into a library directory under timestamped names.
#[derive(Debug, Clone)]
pub struct DirectoryMediaStore {
    library_dir: PathBuf,
    permission: PermissionProvider,
}

impl DirectoryMediaStore {
    /// A store gated on write access to `library_dir`.
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        let library_dir = library_dir.into();
        Self {
            permission: PermissionProvider::MediaLibrary {
                library_dir: library_dir.clone(),
            },
            library_dir,
        }
    }

    /// Override the permission provider.
    pub fn with_permission(mut self, permission: PermissionProvider) -> Self {
        self.permission = permission;
        self
    }

    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }

    fn destination_for(&self, file: &Path) -> PathBuf {
        let ext = file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mov");
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
        let mut candidate = self.library_dir.join(format!("overlay-{stamp}.{ext}"));
        let mut n = 1;
        while candidate.exists() {
            candidate = self
                .library_dir
                .join(format!("overlay-{stamp}-{n}.{ext}"));
            n += 1;
        }
        candidate
    }
}

impl MediaStore for DirectoryMediaStore {
    fn name(&self) -> &str {
        "directory"
    }

    fn save(&self, file: &Path) -> OverlayKitResult<PathBuf> {
        if !self.permission.has_permission() {
            let (tx, rx) = std::sync::mpsc::channel();
            self.permission
                .request_permission(move |granted| tx.send(granted).unwrap_or(()));
            if !rx.recv().unwrap_or(false) {
                return Err(OverlayKitError::permission_denied(format!(
                    "no write access to media library '{}'",
                    self.library_dir.display()
                )));
            }
        }

        let destination = self.destination_for(file);
        std::fs::copy(file, &destination).with_context(|| {
            format!(
                "failed to copy '{}' into media library '{}'",
                file.display(),
                self.library_dir.display()
            )
        })?;

        tracing::info!(
            source = %file.display(),
            destination = %destination.display(),
            "Saved export to media library"
        );
        Ok(destination)
    }
}
