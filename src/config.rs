/// Runtime configuration
///
/// Defaults, overridden by an optional JSON file, then by `SOUND_DETECTOR_*`
/// environment variables. The binary applies its CLI flags last.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::detector::DetectorConfig;
use crate::notify::SOUND_PLACEHOLDER;
use crate::recorder::RecorderConfig;
use crate::spectrum::frame_len;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "SOUND_DETECTOR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Capture sample rate (Hz)
    pub sample_rate: u32,

    /// Listening frame length (seconds)
    pub frame_duration: f64,

    /// Recording frame length (seconds)
    pub record_frame_duration: f64,

    /// Frames discarded before calibrating the recorder
    pub warmup_frames: usize,

    /// Onset threshold, as a multiple of ambient energy
    pub min_energy_ratio: f64,

    /// Offset threshold, as a multiple of ambient energy
    pub offset_energy_ratio: f64,

    pub similarity_threshold: f64,
    pub min_consecutive_ok: u32,
    pub trigger_min_interval_secs: f64,

    /// Directory holding `*.npy` reference spectra
    pub references_dir: PathBuf,

    /// Webhook template, `{sound}` is replaced by the sound name
    pub notify_url: Option<String>,

    pub heartbeat_url: Option<String>,
    pub heartbeat_payload: Option<serde_json::Value>,
    pub heartbeat_period_secs: u64,

    /// Timeout for outbound HTTP calls
    pub http_timeout_secs: u64,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            frame_duration: 0.10,
            record_frame_duration: 0.10,
            warmup_frames: 5,
            min_energy_ratio: 100.0,
            offset_energy_ratio: 2.0,
            similarity_threshold: 0.8,
            min_consecutive_ok: 3,
            trigger_min_interval_secs: 10.0,
            references_dir: PathBuf::from("."),
            notify_url: None,
            heartbeat_url: None,
            heartbeat_payload: None,
            heartbeat_period_secs: 300,
            http_timeout_secs: 10,
            debug: false,
        }
    }
}

impl Config {
    /// Load a JSON config file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults or `path`, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `SOUND_DETECTOR_<KEY>` overrides found through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "SAMPLE_RATE", &mut self.sample_rate)?;
        override_parsed(&lookup, "FRAME_DURATION", &mut self.frame_duration)?;
        override_parsed(&lookup, "RECORD_FRAME_DURATION", &mut self.record_frame_duration)?;
        override_parsed(&lookup, "WARMUP_FRAMES", &mut self.warmup_frames)?;
        override_parsed(&lookup, "MIN_ENERGY_RATIO", &mut self.min_energy_ratio)?;
        override_parsed(&lookup, "OFFSET_ENERGY_RATIO", &mut self.offset_energy_ratio)?;
        override_parsed(&lookup, "SIMILARITY_THRESHOLD", &mut self.similarity_threshold)?;
        override_parsed(&lookup, "MIN_CONSECUTIVE_OK", &mut self.min_consecutive_ok)?;
        override_parsed(
            &lookup,
            "TRIGGER_MIN_INTERVAL_SECS",
            &mut self.trigger_min_interval_secs,
        )?;
        override_parsed(&lookup, "REFERENCES_DIR", &mut self.references_dir)?;
        override_optional(&lookup, "NOTIFY_URL", &mut self.notify_url);
        override_optional(&lookup, "HEARTBEAT_URL", &mut self.heartbeat_url);
        override_parsed(&lookup, "HEARTBEAT_PERIOD_SECS", &mut self.heartbeat_period_secs)?;
        override_parsed(&lookup, "HTTP_TIMEOUT_SECS", &mut self.http_timeout_secs)?;

        let key = format!("{}HEARTBEAT_PAYLOAD", ENV_PREFIX);
        if let Some(value) = lookup(&key) {
            self.heartbeat_payload = if value.trim().is_empty() {
                None
            } else {
                Some(
                    serde_json::from_str(&value)
                        .map_err(|_| ConfigError::InvalidEnv { key, value })?,
                )
            };
        }

        let key = format!("{}DEBUG", ENV_PREFIX);
        if let Some(value) = lookup(&key) {
            self.debug = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => return Err(ConfigError::InvalidEnv { key, value }),
            };
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate must be positive"));
        }

        for (key, duration) in [
            ("frame_duration", self.frame_duration),
            ("record_frame_duration", self.record_frame_duration),
        ] {
            if !(duration.is_finite() && duration > 0.0) {
                return Err(invalid(format!("{} must be positive", key)));
            }
            if frame_len(self.sample_rate, duration) < 2 {
                return Err(invalid(format!(
                    "{} is shorter than 2 samples at {} Hz",
                    key, self.sample_rate
                )));
            }
        }

        self.recorder_config()
            .validate()
            .map_err(|e| invalid(e.to_string()))?;

        if Duration::try_from_secs_f64(self.trigger_min_interval_secs).is_err() {
            return Err(invalid(format!(
                "trigger_min_interval_secs must be a non-negative number of seconds, got {}",
                self.trigger_min_interval_secs
            )));
        }

        self.detector_config()
            .validate()
            .map_err(|e| invalid(e.to_string()))?;

        if self.heartbeat_period_secs == 0 {
            return Err(invalid("heartbeat_period_secs must be positive"));
        }

        if self.http_timeout_secs == 0 {
            return Err(invalid("http_timeout_secs must be positive"));
        }

        if let Some(url) = &self.notify_url {
            if !url.contains(SOUND_PLACEHOLDER) {
                warn!("notify_url has no {} placeholder", SOUND_PLACEHOLDER);
            }
        }

        Ok(())
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            warmup_frames: self.warmup_frames,
            min_energy_ratio: self.min_energy_ratio,
            offset_energy_ratio: self.offset_energy_ratio,
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            similarity_threshold: self.similarity_threshold,
            min_consecutive_ok: self.min_consecutive_ok,
            trigger_min_interval: Duration::try_from_secs_f64(self.trigger_min_interval_secs)
                .unwrap_or(Duration::MAX),
        }
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn override_parsed<T, F>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    if let Some(value) = lookup(&key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { key, value })?;
    }
    Ok(())
}

/// An empty value clears the setting
fn override_optional<F>(lookup: &F, name: &str, target: &mut Option<String>)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(&format!("{}{}", ENV_PREFIX, name)) {
        *target = Some(value).filter(|v| !v.trim().is_empty());
    }
}
