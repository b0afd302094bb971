//! Configuration management for nestcomp

use crate::engine::OutputMode;
use crate::render::RenderMode;
use crate::view::{FullscreenPolicy, ViewPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable selecting the hardware render path
pub const HARDWARE_ENV: &str = "NESTCOMP_HARDWARE";

/// Truthy values accepted for boolean environment toggles
pub fn env_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Render mode requested through the environment, if any
pub fn render_mode_from_env() -> Option<RenderMode> {
    let value = std::env::var(HARDWARE_ENV).ok()?;
    Some(if env_flag(&value) {
        RenderMode::Hardware
    } else {
        RenderMode::Software
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Render configuration
    #[serde(default)]
    pub render: RenderConfig,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// View placement configuration
    #[serde(default)]
    pub views: ViewsConfig,

    /// Input configuration
    #[serde(default)]
    pub input: InputConfig,

    /// Seat configuration
    #[serde(default)]
    pub seat: SeatConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Requested render path; hardware falls back to software when unavailable
    #[serde(default)]
    pub mode: RenderMode,

    /// Skip frame-ready callbacks for frames identical to the previous one
    #[serde(default)]
    pub skip_unchanged_frames: bool,

    /// Frame pump rate of the demo host
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: RenderMode::Software,
            skip_unchanged_frames: false,
            frame_rate: default_frame_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Mode used when the backend reports none
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Refresh rate in mHz
    #[serde(default = "default_refresh_mhz")]
    pub refresh_mhz: i32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            refresh_mhz: default_refresh_mhz(),
        }
    }
}

impl OutputConfig {
    pub fn mode(&self) -> OutputMode {
        OutputMode {
            width: self.width,
            height: self.height,
            refresh_mhz: self.refresh_mhz,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewsConfig {
    /// Position of newly created views
    #[serde(default = "default_view_position")]
    pub default_x: i32,

    #[serde(default = "default_view_position")]
    pub default_y: i32,

    /// Size proposed in the first configure
    #[serde(default = "default_initial_width")]
    pub initial_width: i32,

    #[serde(default = "default_initial_height")]
    pub initial_height: i32,

    /// Force clients fullscreen in configures
    #[serde(default)]
    pub fullscreen_policy: FullscreenPolicy,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            default_x: default_view_position(),
            default_y: default_view_position(),
            initial_width: default_initial_width(),
            initial_height: default_initial_height(),
            fullscreen_policy: FullscreenPolicy::Always,
        }
    }
}

impl ViewsConfig {
    pub fn policy(&self) -> ViewPolicy {
        ViewPolicy {
            default_x: self.default_x,
            default_y: self.default_y,
            initial_width: self.initial_width,
            initial_height: self.initial_height,
            fullscreen: self.fullscreen_policy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Scroll distance of one wheel click
    #[serde(default = "default_scroll_step")]
    pub scroll_step: f64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            scroll_step: default_scroll_step(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatConfig {
    /// Seat name advertised to clients
    #[serde(default = "default_seat_name")]
    pub name: String,

    /// XKB layout of the keymap
    #[serde(default = "default_keymap_layout")]
    pub keymap_layout: String,

    /// Key repeat rate in keys per second
    #[serde(default = "default_repeat_rate")]
    pub repeat_rate: i32,

    /// Key repeat delay in ms
    #[serde(default = "default_repeat_delay")]
    pub repeat_delay: i32,
}

impl Default for SeatConfig {
    fn default() -> Self {
        Self {
            name: default_seat_name(),
            keymap_layout: default_keymap_layout(),
            repeat_rate: default_repeat_rate(),
            repeat_delay: default_repeat_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Some(mode) = render_mode_from_env() {
            self.render.mode = mode;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.output.width == 0 || self.output.height == 0 {
            return Err("Output dimensions must be non-zero".into());
        }

        if self.output.refresh_mhz <= 0 {
            return Err("Output refresh rate must be positive".into());
        }

        if self.render.frame_rate == 0 || self.render.frame_rate > 240 {
            return Err("Frame rate must be between 1 and 240".into());
        }

        if self.views.initial_width <= 0 || self.views.initial_height <= 0 {
            return Err("Initial view size must be positive".into());
        }

        if !self.input.scroll_step.is_finite() || self.input.scroll_step <= 0.0 {
            return Err("Scroll step must be a positive number".into());
        }

        if self.seat.name.trim().is_empty() {
            return Err("Seat name must not be empty".into());
        }

        if self.seat.keymap_layout.trim().is_empty() {
            return Err("Keymap layout must not be empty".into());
        }

        if self.seat.repeat_rate < 0 || self.seat.repeat_delay < 0 {
            return Err("Key repeat settings must not be negative".into());
        }

        match self.logging.level.to_ascii_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(format!("Unknown log level: {}", self.logging.level).into()),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_invalid_dimensions() {
        let mut cfg = Config::default();
        cfg.output.width = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_scroll_step() {
        let mut cfg = Config::default();
        cfg.input.scroll_step = 0.0;
        assert!(cfg.validate().is_err());
        cfg.input.scroll_step = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_log_level() {
        let mut cfg = Config::default();
        cfg.logging.level = "loud".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.output.mode().to_string(), "1280x720@60.000Hz");
        assert_eq!(cfg.views.policy(), ViewPolicy::default());
        assert_eq!(cfg.input.scroll_step, 15.0);
        assert_eq!((cfg.seat.repeat_rate, cfg.seat.repeat_delay), (25, 600));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [render]
            mode = "hardware"

            [views]
            fullscreen_policy = "never"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.mode, RenderMode::Hardware);
        assert_eq!(cfg.views.fullscreen_policy, FullscreenPolicy::Never);
        assert_eq!(cfg.output.width, 1280);
        assert_eq!(cfg.seat.name, "seat0");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = Config::load(&PathBuf::from("/nonexistent/nestcomp.toml")).unwrap();
        assert_eq!(cfg.render.mode, RenderMode::Software);
    }

    #[test]
    fn env_flag_values() {
        assert!(env_flag("1"));
        assert!(env_flag("TRUE"));
        assert!(!env_flag("0"));
        assert!(!env_flag(""));
    }
}

fn default_frame_rate() -> u32 {
    60
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_refresh_mhz() -> i32 {
    60_000
}

fn default_view_position() -> i32 {
    50
}

fn default_initial_width() -> i32 {
    640
}

fn default_initial_height() -> i32 {
    480
}

fn default_scroll_step() -> f64 {
    15.0
}

fn default_seat_name() -> String {
    "seat0".to_string()
}

fn default_keymap_layout() -> String {
    "us".to_string()
}

fn default_repeat_rate() -> i32 {
    25
}

fn default_repeat_delay() -> i32 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}
