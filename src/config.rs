//! Rig configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/ir_align.toml` by default)
//! 2. environment variables prefixed with `IR_ALIGN_`, nested keys separated
//!    by a double underscore
//!
//! Every field has a default, so an empty or missing file yields the rig
//! values of the bench setup.
//!
//! # Example
//! ```no_run
//! use ir_align::config::RigConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // IR_ALIGN_SCAN__HORIZONTAL_STEP=0.25 overrides the file
//! let config = RigConfig::load()?;
//! config.validate()?;
//! println!("scanning at {:?} baud", config.link.speeds);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, IrAlignError};
use crate::experiment::scan_path::ScanParams;
use crate::geometry::Position;
use crate::hardware::marlin::MarlinSettings;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/ir_align.toml";
/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "IR_ALIGN_";

/// Top-level rig configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub application: ApplicationConfig,
    pub motion: MotionConfig,
    pub link: LinkConfig,
    pub scan: ScanConfig,
    pub storage: StorageConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "IR alignment rig".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Motion stage (Marlin printer) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub port: String,
    pub baud: u32,
    /// Absolute machine position of the relative origin, mm.
    pub origin: [f64; 3],
    /// Feedrate for scan moves and reset-to-origin, mm/min.
    pub safe_feedrate: f64,
    /// Feedrate for manual jogs, mm/min.
    pub jog_feedrate: f64,
    /// Jog step per axis, mm.
    pub jog_step: [f64; 3],
    /// Factor from counter units to mm, per axis.
    pub count_scale: [f64; 3],
    /// Maximum L1 distance between commanded and reported position, mm.
    pub match_tolerance: f64,
    pub poll_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub home_timeout_ms: u64,
    pub short_timeout_ms: u64,
    pub write_settle_ms: u64,
    /// Window for discarding stale printer output before each command.
    pub stale_window_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 250_000,
            origin: [116.5, 108.0, 11.25],
            safe_feedrate: 1200.0,
            jog_feedrate: 1200.0,
            jog_step: [0.5, 0.5, 0.25],
            count_scale: [1.0, 1.0, 1.0],
            match_tolerance: 0.04,
            poll_interval_ms: 67,
            ack_timeout_ms: 500,
            home_timeout_ms: 30_000,
            short_timeout_ms: 250,
            write_settle_ms: 25,
            stale_window_ms: 2,
        }
    }
}

/// IR link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub rx_port: String,
    /// Same as `rx_port` for a loop-back adapter.
    pub tx_port: String,
    /// Link speeds to map, in scan order.
    pub speeds: Vec<u32>,
    /// Probe passes averaged into one sample.
    pub passes: u32,
    /// Pause after a speed change before flushing.
    pub settle_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            rx_port: "/dev/ttyUSB1".to_string(),
            tx_port: "/dev/ttyUSB1".to_string(),
            speeds: vec![9600],
            passes: 1,
            settle_ms: 100,
        }
    }
}

/// Scan geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub horizontal_step: f64,
    pub vertical_step: f64,
    pub max_radius: f64,
    pub max_height: f64,
    pub continuation_threshold: f64,
    /// Empty layers tolerated before giving up on a speed.
    pub vertical_stop_layers: u32,
    pub counter_clockwise: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            horizontal_step: 0.5,
            vertical_step: 0.5,
            max_radius: 10.0,
            max_height: 10.0,
            continuation_threshold: 127.0 / 256.0,
            vertical_stop_layers: 10,
            counter_clockwise: false,
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory receiving sample tables.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl RigConfig {
    /// Load from the default file and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file (which may be missing) and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: RigConfig = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject values that parse but cannot drive the rig.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(IrAlignError::Configuration(msg));

        if !VALID_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            ));
        }
        if !VALID_FORMATS.contains(&self.application.log_format.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                VALID_FORMATS.join(", ")
            ));
        }

        let scan = &self.scan;
        for (name, value) in [
            ("scan.horizontal_step", scan.horizontal_step),
            ("scan.vertical_step", scan.vertical_step),
            ("scan.max_radius", scan.max_radius),
            ("scan.max_height", scan.max_height),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return invalid(format!("{} must be a positive number, got {}", name, value));
            }
        }
        if !(0.0..=1.0).contains(&scan.continuation_threshold) {
            return invalid(format!(
                "scan.continuation_threshold must be within [0, 1], got {}",
                scan.continuation_threshold
            ));
        }
        if scan.vertical_stop_layers == 0 {
            return invalid("scan.vertical_stop_layers must be at least 1".to_string());
        }

        if self.link.speeds.is_empty() {
            return invalid("link.speeds must list at least one speed".to_string());
        }
        if let Some(zero) = self.link.speeds.iter().find(|&&s| s == 0) {
            return invalid(format!("link.speeds contains invalid speed {}", zero));
        }
        if self.link.passes == 0 {
            return invalid("link.passes must be at least 1".to_string());
        }

        let motion = &self.motion;
        if motion.match_tolerance.is_nan() || motion.match_tolerance < 0.0 {
            return invalid(format!(
                "motion.match_tolerance must not be negative, got {}",
                motion.match_tolerance
            ));
        }
        if motion.count_scale.iter().any(|&s| s == 0.0 || !s.is_finite()) {
            return invalid(format!(
                "motion.count_scale entries must be finite and non-zero, got {:?}",
                motion.count_scale
            ));
        }
        if motion.jog_step.iter().any(|&s| s.is_nan() || s <= 0.0) {
            return invalid(format!(
                "motion.jog_step entries must be positive, got {:?}",
                motion.jog_step
            ));
        }
        if motion.poll_interval_ms == 0 {
            return invalid("motion.poll_interval_ms must be at least 1".to_string());
        }

        Ok(())
    }

    /// Scan-path parameters; the vertical stop is derived from the layer count.
    pub fn scan_params(&self) -> ScanParams {
        let scan = &self.scan;
        ScanParams {
            horizontal_step: scan.horizontal_step,
            vertical_step: scan.vertical_step,
            max_radius: scan.max_radius,
            max_height: scan.max_height,
            continuation_threshold: scan.continuation_threshold,
            vertical_stop: f64::from(scan.vertical_stop_layers) * scan.vertical_step,
            counter_clockwise: scan.counter_clockwise,
        }
    }

    pub fn marlin_settings(&self) -> MarlinSettings {
        let motion = &self.motion;
        MarlinSettings {
            count_scale: motion.count_scale,
            ack_timeout: Duration::from_millis(motion.ack_timeout_ms),
            home_timeout: Duration::from_millis(motion.home_timeout_ms),
            short_timeout: Duration::from_millis(motion.short_timeout_ms),
            write_settle: Duration::from_millis(motion.write_settle_ms),
            stale_window: Duration::from_millis(motion.stale_window_ms),
        }
    }

    pub fn origin(&self) -> Position {
        Position::from_array(self.motion.origin)
    }

    pub fn jog_step(&self) -> Position {
        Position::from_array(self.motion.jog_step)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.motion.poll_interval_ms)
    }

    /// The effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| IrAlignError::Configuration(format!("cannot render configuration: {}", e)))
    }
}
