//! Camera configuration files

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::controls::CameraControls;
use crate::mode::VideoMode;
use crate::transfer::DEFAULT_DRAIN_TIMEOUT;

/// Errors loading or saving a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid configuration JSON
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Requested mode, initial controls and shutdown bound for a session
///
/// ```json
/// {
///   "width": 320,
///   "height": 240,
///   "fps": 125,
///   "controls": { "auto_gain": true },
///   "drain_timeout_ms": 1000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Requested width; 0 picks the largest mode
    pub width: u32,
    /// Requested height; 0 picks the largest mode
    pub height: u32,
    /// Requested frame rate
    pub fps: u8,
    /// Image controls applied when streaming starts
    pub controls: CameraControls,
    /// Bound on the transfer drain when stopping
    pub drain_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 60,
            controls: CameraControls::default(),
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl CameraConfig {
    /// Load a configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Json`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save the configuration as pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Json`].
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Drain bound as a [`Duration`]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// The mode `init` will select for this request
    pub fn video_mode(&self) -> VideoMode {
        VideoMode::select(self.width, self.height, self.fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Resolution;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = CameraConfig::default();
        assert_eq!(config.video_mode().resolution, Resolution::Vga);
        assert_eq!(config.drain_timeout(), Duration::from_millis(2000));
        assert_eq!(config.controls, CameraControls::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: CameraConfig =
            serde_json::from_str(r#"{"width": 320, "height": 240, "controls": {"gain": 40}}"#)
                .unwrap();
        assert_eq!(config.video_mode().resolution, Resolution::Qvga);
        assert_eq!(config.fps, 60);
        assert_eq!(config.controls.gain, 40);
        assert_eq!(config.controls.exposure, 120);
        assert_eq!(config.drain_timeout_ms, 2000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("camera.json");

        let mut config = CameraConfig {
            fps: 15,
            drain_timeout_ms: 500,
            ..Default::default()
        };
        config.controls.auto_gain = true;
        config.controls.flip_vertical = true;
        config.save(&path).unwrap();

        assert_eq!(CameraConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            CameraConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(CameraConfig::load(&path), Err(ConfigError::Json(_))));
    }
}
