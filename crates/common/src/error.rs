//! Error types shared across OverlayKit crates.
//!
//! The taxonomy is flat: every variant is terminal for the export job that
//! produced it and nothing is retried automatically.

/// Top-level error type for OverlayKit operations.
#[derive(Debug, thiserror::Error)]
pub enum OverlayKitError {
    #[error("Invalid duration provided: {duration_secs}s (expected more than 0.1s and at most 60s)")]
    InvalidDuration { duration_secs: f64 },

    #[error("Asset provided was not image or video: {kind}")]
    WrongAssetType { kind: String },

    #[error("Failed to extract image from image asset: {message}")]
    FailedToExtractImage { message: String },

    #[error("Failed to extract video from video asset: {message}")]
    FailedToExtractVideo { message: String },

    #[error("Failed to get output image from filter: {message}")]
    FailedToGetOutputImage { message: String },

    #[error("Rendering failed: {message}")]
    RenderingFailed { message: String },

    #[error("Writer was not ready for more data after {waited_ms}ms")]
    WriterTimedOut { waited_ms: u64 },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Main execution context is closed")]
    ContextClosed,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using OverlayKitError.
pub type OverlayKitResult<T> = Result<T, OverlayKitError>;

impl OverlayKitError {
    pub fn invalid_duration(duration_secs: f64) -> Self {
        Self::InvalidDuration { duration_secs }
    }

    pub fn wrong_asset_type(kind: impl Into<String>) -> Self {
        Self::WrongAssetType { kind: kind.into() }
    }

    pub fn extract_image(msg: impl Into<String>) -> Self {
        Self::FailedToExtractImage {
            message: msg.into(),
        }
    }

    pub fn extract_video(msg: impl Into<String>) -> Self {
        Self::FailedToExtractVideo {
            message: msg.into(),
        }
    }

    pub fn output_image(msg: impl Into<String>) -> Self {
        Self::FailedToGetOutputImage {
            message: msg.into(),
        }
    }

    pub fn rendering_failed(msg: impl Into<String>) -> Self {
        Self::RenderingFailed {
            message: msg.into(),
        }
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Stable identifier for presenting the error to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDuration { .. } => "invalidDuration",
            Self::WrongAssetType { .. } => "wrongAssetType",
            Self::FailedToExtractImage { .. } => "failedToExtractImage",
            Self::FailedToExtractVideo { .. } => "failedToExtractVideo",
            Self::FailedToGetOutputImage { .. } => "failedToGetOutputImage",
            Self::RenderingFailed { .. } => "renderingFailed",
            Self::WriterTimedOut { .. } => "writerTimedOut",
            Self::PermissionDenied { .. } => "permissionDenied",
            Self::ContextClosed => "contextClosed",
            Self::Config { .. } => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}
