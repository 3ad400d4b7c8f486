//! Configuration loading and validation.
//!
//! The multiplexer is configured from a flat TOML document plus
//! `RELAYMUX_*` environment-variable overrides. Defaults follow the values
//! the splice engine and arbiter were tuned with; anything structurally
//! invalid (no fallback input, duplicate output PIDs, unknown role strings)
//! is rejected at startup.

use crate::error::{RelayError, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;

/// Role an input plays in source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputRole {
    /// Preferred source; selected whenever healthy and ready
    Live,
    /// Always-available loop the output falls back to
    Fallback,
}

/// One upstream transport stream.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Label used in logs and health reporting
    pub name: String,
    /// FIFO path or `tcp://host:port`
    pub source: String,
    /// `live` or `fallback`
    pub role: InputRole,
}

/// Output side: where the merged stream goes and which PIDs it uses.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// FIFO path the downstream publisher reads
    pub pipe: String,
    /// Normalized video PID (also the PCR PID)
    #[serde(default = "default_pid_video")]
    pub pid_video: u16,
    /// Normalized audio PID
    #[serde(default = "default_pid_audio")]
    pub pid_audio: u16,
    /// PID the regenerated PMT is carried on
    #[serde(default = "default_pid_pmt")]
    pub pid_pmt: u16,
    /// Program number announced in PAT/PMT
    #[serde(default = "default_program_number")]
    pub program_number: u16,
}

/// Arbiter and splice-engine timers.
#[derive(Debug, Clone, Deserialize)]
pub struct SpliceConfig {
    /// Minimum time between any two transitions (anti-flap)
    #[serde(default = "default_min_dwell_ms")]
    pub min_dwell_ms: u64,
    /// How long live must be continuously healthy before cutting back in
    #[serde(default = "default_recovery_dwell_ms")]
    pub recovery_dwell_ms: u64,
    /// How long live may be unhealthy before cutting away
    #[serde(default = "default_loss_tolerance_ms")]
    pub loss_tolerance_ms: u64,
    /// Deadline for the fallback source to become ready at boot
    #[serde(default = "default_boot_deadline_ms")]
    pub boot_deadline_ms: u64,
    /// Upper bound on PTS−DTS in emitted PES headers
    #[serde(default = "default_max_reorder_ms")]
    pub max_reorder_ms: u64,
    /// Permit switching to a live source whose PMT carries no audio
    #[serde(default)]
    pub allow_video_only: bool,
}

/// Input health thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// A source with no bytes for this long is unhealthy
    #[serde(default = "default_max_data_age_ms")]
    pub max_data_age_ms: u64,
    /// Rolling bitrate below this is unhealthy; 0 disables the check
    #[serde(default)]
    pub min_bitrate_bps: u64,
    /// Window the rolling bitrate is measured over
    #[serde(default = "default_bitrate_window_seconds")]
    pub bitrate_window_seconds: u64,
}

/// Logging options.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// `debug`, `info`, `warn`, or `error`
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upstream sources; exactly one must have the `fallback` role
    pub inputs: Vec<InputConfig>,
    /// Output pipe and PID normalization
    pub output: OutputConfig,
    /// Arbiter timers
    #[serde(default)]
    pub splice: SpliceConfig,
    /// Health thresholds
    #[serde(default)]
    pub health: HealthConfig,
    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

fn default_pid_video() -> u16 {
    0x100
}
fn default_pid_audio() -> u16 {
    0x101
}
fn default_pid_pmt() -> u16 {
    0x1000
}
fn default_program_number() -> u16 {
    1
}
fn default_min_dwell_ms() -> u64 {
    3000
}
fn default_recovery_dwell_ms() -> u64 {
    2000
}
fn default_loss_tolerance_ms() -> u64 {
    2000
}
fn default_boot_deadline_ms() -> u64 {
    15000
}
fn default_max_reorder_ms() -> u64 {
    700
}
fn default_max_data_age_ms() -> u64 {
    3000
}
fn default_bitrate_window_seconds() -> u64 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            min_dwell_ms: default_min_dwell_ms(),
            recovery_dwell_ms: default_recovery_dwell_ms(),
            loss_tolerance_ms: default_loss_tolerance_ms(),
            boot_deadline_ms: default_boot_deadline_ms(),
            max_reorder_ms: default_max_reorder_ms(),
            allow_video_only: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_data_age_ms: default_max_data_age_ms(),
            min_bitrate_bps: 0,
            bitrate_window_seconds: default_bitrate_window_seconds(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads a config file, applies environment overrides, and validates.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("parse error: {}", e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables take precedence over the file, keyed as
    /// `RELAYMUX_<SECTION>_<OPTION>`.
    fn apply_env_overrides(&mut self) {
        if let Ok(pipe) = env::var("RELAYMUX_OUTPUT_PIPE") {
            self.output.pipe = pipe;
        }
        if let Ok(level) = env::var("RELAYMUX_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(v) = env::var("RELAYMUX_SPLICE_MIN_DWELL_MS") {
            if let Ok(ms) = v.parse() {
                self.splice.min_dwell_ms = ms;
            }
        }
        if let Ok(v) = env::var("RELAYMUX_HEALTH_MIN_BITRATE_BPS") {
            if let Ok(bps) = v.parse() {
                self.health.min_bitrate_bps = bps;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(RelayError::Config("no inputs configured".into()));
        }
        let fallbacks = self
            .inputs
            .iter()
            .filter(|i| i.role == InputRole::Fallback)
            .count();
        if fallbacks != 1 {
            return Err(RelayError::Config(format!(
                "exactly one fallback input required, found {}",
                fallbacks
            )));
        }
        let mut pids = [
            self.output.pid_video,
            self.output.pid_audio,
            self.output.pid_pmt,
        ];
        pids.sort_unstable();
        if pids.windows(2).any(|w| w[0] == w[1]) {
            return Err(RelayError::Config("output PIDs must be distinct".into()));
        }
        for pid in pids {
            if pid == 0 || pid >= 0x1fff {
                return Err(RelayError::Config(format!(
                    "output PID 0x{:x} collides with reserved PID space",
                    pid
                )));
            }
        }
        match self.log.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(RelayError::Config(format!(
                    "unknown log level {:?}",
                    other
                )))
            }
        }
        for input in &self.inputs {
            if input.source.is_empty() {
                return Err(RelayError::Config(format!(
                    "input {:?} has an empty source",
                    input.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[inputs]]
        name = "cam"
        source = "tcp://127.0.0.1:9000"
        role = "live"

        [[inputs]]
        name = "loop"
        source = "/pipe/fallback.ts"
        role = "fallback"

        [output]
        pipe = "/pipe/ts_output.pipe"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.output.pid_video, 0x100);
        assert_eq!(config.splice.min_dwell_ms, 3000);
        assert_eq!(config.health.max_data_age_ms, 3000);
        assert!(!config.splice.allow_video_only);
        config.inputs.retain(|i| i.role == InputRole::Live);
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_output_pids_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.output.pid_audio = config.output.pid_video;
        assert!(config.validate().is_err());
    }

    #[test]
    fn two_fallbacks_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.inputs[0].role = InputRole::Fallback;
        assert!(config.validate().is_err());
    }
}
