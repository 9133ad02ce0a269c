//! Overlay configuration.
//!
//! Loaded from an optional JSON file, then overridden field by field from
//! the command line. Every field has a default so an empty file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Which upscale stage the orchestrator binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UpscalerKind {
    /// Built-in identity stage
    Identity,
    /// No stage; the render image is blitted straight to the output
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Window to capture; the focused top-level window when unset
    pub target_window: Option<u32>,
    /// Time given to focus the target before it is picked
    pub start_delay_ms: u64,
    /// Cover the whole screen instead of matching the target's size
    pub fullscreen: bool,
    pub upscaler: UpscalerKind,
    pub jitter: bool,
    pub prefer_low_latency: bool,
    pub fence_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    /// Keysym that ends the session (F12)
    pub toggle_keysym: u32,
    /// Log a metrics summary every this many presented frames; 0 disables
    pub stats_interval_frames: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            target_window: None,
            start_delay_ms: 3000,
            fullscreen: true,
            upscaler: UpscalerKind::Identity,
            jitter: true,
            prefer_low_latency: true,
            fence_timeout_ms: 1000,
            acquire_timeout_ms: 1000,
            toggle_keysym: 0xFFC9,
            stats_interval_frames: 600,
        }
    }
}

impl OverlayConfig {
    /// `~/.config/glasspane/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("glasspane").join("config.json"))
    }

    pub fn from_json(text: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&text, &path.display().to_string())?;
        info!("[Config] Loaded {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, else the default path if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("[Config] No config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::Invalid("fence_timeout_ms must be non-zero".into()));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid("acquire_timeout_ms must be non-zero".into()));
        }
        if self.toggle_keysym == 0 {
            return Err(ConfigError::Invalid("toggle_keysym must be a valid keysym".into()));
        }
        Ok(())
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = OverlayConfig::from_json("{}", "inline").unwrap();
        assert_eq!(config, OverlayConfig::default());
        assert_eq!(config.start_delay(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_override() {
        let config = OverlayConfig::from_json(
            r#"{ "upscaler": "none", "target_window": 12582919, "jitter": false }"#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.upscaler, UpscalerKind::None);
        assert_eq!(config.target_window, Some(12582919));
        assert!(!config.jitter);
        assert_eq!(config.fence_timeout_ms, 1000);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = OverlayConfig {
            fence_timeout_ms: 0,
            ..OverlayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = OverlayConfig {
            acquire_timeout_ms: 0,
            ..OverlayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_reports_origin() {
        let err = OverlayConfig::from_json("{ nope", "test.json").unwrap_err();
        assert!(err.to_string().contains("test.json"));
    }
}
