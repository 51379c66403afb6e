//! Renderer configuration.
//!
//! OverlayKit is embedded, so there is no standard config file location.
//! Hosts either build a [`RendererConfig`] in code or load one from a JSON
//! file of their choosing with [`RendererConfig::load_from`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OverlayKitError, OverlayKitResult};

/// Configuration for a video renderer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Directory for temporary outputs and synthesized image videos.
    pub scratch_dir: PathBuf,

    /// Output encoding parameters.
    pub export: ExportDefaults,

    /// Still-image to video synthesis parameters.
    pub synthesis: SynthesisDefaults,

    /// Directory used by the default media store.
    pub media_library_dir: PathBuf,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Output encoding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDefaults {
    /// Output frame rate.
    pub fps: u32,

    /// Encoder quality preset.
    pub quality: ExportQuality,

    /// Move stream metadata to the front of the file for progressive download.
    pub optimize_for_network: bool,

    /// Output container.
    pub container: Container,
}

/// Encoder quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportQuality {
    Low,
    Medium,
    #[default]
    Highest,
}

/// Output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    #[default]
    Mov,
    Mp4,
}

impl Container {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mov => "mov",
            Container::Mp4 => "mp4",
        }
    }
}

/// Still-image to video synthesis parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisDefaults {
    /// Spacing between synthesized frames.
    pub frame_interval_secs: f64,

    /// Upper bound on waiting for a writer to accept the next frame.
    pub writer_ready_timeout_ms: u64,

    /// Sleep between readiness checks for writers without a notification.
    pub ready_poll_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "overlaykit=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("overlaykit"),
            export: ExportDefaults::default(),
            synthesis: SynthesisDefaults::default(),
            media_library_dir: default_media_library_dir(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ExportDefaults {
    fn default() -> Self {
        Self {
            fps: 60,
            quality: ExportQuality::Highest,
            optimize_for_network: false,
            container: Container::Mov,
        }
    }
}

impl Default for SynthesisDefaults {
    fn default() -> Self {
        Self {
            frame_interval_secs: 1.0,
            writer_ready_timeout_ms: 10_000,
            ready_poll_interval_ms: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RendererConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(content: &str) -> OverlayKitResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match Self::from_json_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config as pretty JSON.
    pub fn save_to(&self, path: &Path) -> OverlayKitResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject values the pipeline cannot honor.
    pub fn validate(&self) -> OverlayKitResult<()> {
        if self.export.fps == 0 {
            return Err(OverlayKitError::config("export.fps must be non-zero"));
        }
        let interval = self.synthesis.frame_interval_secs;
        if interval.is_nan() || interval <= 0.0 {
            return Err(OverlayKitError::config(
                "synthesis.frame_interval_secs must be positive",
            ));
        }
        if self.synthesis.writer_ready_timeout_ms == 0 {
            return Err(OverlayKitError::config(
                "synthesis.writer_ready_timeout_ms must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Default media library directory.
fn default_media_library_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_VIDEOS_DIR") {
        return PathBuf::from(dir).join("overlaykit");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join("Videos").join("overlaykit")
}
