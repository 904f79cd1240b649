//! Viewer configuration
//!
//! Loaded from a TOML file. Every section and key is optional; missing
//! values take the defaults below, and out-of-range camera settings are
//! replaced by safe fallbacks in [`ViewerConfig::sanitize`].
//!
//! ```toml
//! [camera]
//! fps = 30.0
//! width = 640
//! height = 480
//!
//! [viewer]
//! viewpoint_x = 0.0
//! viewpoint_y = -0.7
//! viewpoint_z = -1.8
//! viewpoint_f = 500.0
//!
//! [stream]
//! enabled = true
//! port = 7681
//! tick_yield_ms = 1
//!
//! [logging]
//! level = "info"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Frame rate used when the configured one is unusable.
pub const FALLBACK_FPS: f32 = 30.0;
/// Resolution used when either configured dimension is unusable.
pub const FALLBACK_RESOLUTION: (i32, i32) = (640, 480);

/// Top-level viewer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub camera: CameraConfig,
    pub viewer: ViewpointConfig,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

/// Camera timing and display resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Target frames per second; drives the tick period.
    pub fps: f32,
    pub width: i32,
    pub height: i32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fps: FALLBACK_FPS,
            width: FALLBACK_RESOLUTION.0,
            height: FALLBACK_RESOLUTION.1,
        }
    }
}

/// Initial viewpoint handed to clients that render the map.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewpointConfig {
    pub viewpoint_x: f32,
    pub viewpoint_y: f32,
    pub viewpoint_z: f32,
    /// Focal length in pixels.
    pub viewpoint_f: f32,
}

impl Default for ViewpointConfig {
    fn default() -> Self {
        Self {
            viewpoint_x: 0.0,
            viewpoint_y: -0.7,
            viewpoint_z: -1.8,
            viewpoint_f: 500.0,
        }
    }
}

/// WebSocket streaming settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Open the listener at loop start.
    pub enabled: bool,
    /// Listening port (0 picks an ephemeral port).
    pub port: u16,
    /// Minimum sleep between ticks, even when a tick overruns its period.
    pub tick_yield_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7681,
            tick_yield_ms: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ViewerConfig {
    /// Load and sanitize configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and sanitize configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: ViewerConfig = basic_toml::from_str(contents)?;
        config.sanitize();
        Ok(config)
    }

    /// Replace unusable camera settings with fallbacks.
    pub fn sanitize(&mut self) {
        if self.camera.fps.is_nan() || self.camera.fps < 1.0 {
            log::warn!(
                "Invalid camera fps {}, using {}",
                self.camera.fps,
                FALLBACK_FPS
            );
            self.camera.fps = FALLBACK_FPS;
        }

        if self.camera.width < 1 || self.camera.height < 1 {
            log::warn!(
                "Invalid camera resolution {}x{}, using {}x{}",
                self.camera.width,
                self.camera.height,
                FALLBACK_RESOLUTION.0,
                FALLBACK_RESOLUTION.1
            );
            self.camera.width = FALLBACK_RESOLUTION.0;
            self.camera.height = FALLBACK_RESOLUTION.1;
        }
    }

    /// Target duration of one tick (1000 / fps milliseconds).
    pub fn tick_period(&self) -> Duration {
        let fps = if self.camera.fps >= 1.0 {
            self.camera.fps
        } else {
            FALLBACK_FPS
        };
        Duration::from_secs_f64(1.0 / fps as f64)
    }

    /// Minimum sleep between ticks.
    pub fn tick_yield(&self) -> Duration {
        Duration::from_millis(self.stream.tick_yield_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ViewerConfig::default();
        assert_eq!(config.camera.fps, 30.0);
        assert_eq!((config.camera.width, config.camera.height), (640, 480));
        assert_eq!(config.viewer.viewpoint_y, -0.7);
        assert!(config.stream.enabled);
        assert_eq!(config.stream.port, 7681);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ViewerConfig::from_toml_str(
            r#"
[camera]
fps = 20.0

[stream]
port = 9000
"#,
        )
        .unwrap();

        assert_eq!(config.camera.fps, 20.0);
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.stream.port, 9000);
        assert_eq!(config.stream.tick_yield_ms, 1);
        assert_eq!(config.viewer.viewpoint_f, 500.0);
    }

    #[test]
    fn test_invalid_camera_values_fall_back() {
        let config = ViewerConfig::from_toml_str(
            r#"
[camera]
fps = 0.0
width = 0
height = 720
"#,
        )
        .unwrap();

        assert_eq!(config.camera.fps, FALLBACK_FPS);
        assert_eq!((config.camera.width, config.camera.height), (640, 480));
    }

    #[test]
    fn test_tick_period_from_fps() {
        let mut config = ViewerConfig::default();
        config.camera.fps = 20.0;
        assert_relative_eq!(config.tick_period().as_secs_f64(), 0.05, epsilon = 1e-9);

        config.camera.fps = 30.0;
        assert_relative_eq!(
            config.tick_period().as_secs_f64() * 1000.0,
            33.333,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        assert!(ViewerConfig::from_toml_str("[camera\nfps = 30").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();

        let config = ViewerConfig::load(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = ViewerConfig::load("/nonexistent/prasaran.toml");
        assert!(matches!(result, Err(crate::error::Error::Io(_))));
    }
}
