use crate::buffer_queue::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_QUEUED_BUFFERS};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "ws://0.0.0.0:8080";
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_INITIAL_FREQUENCY_HZ: u64 = 90_700_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
}

/// Client settings, from the environment (and `.env`) with CLI overrides
/// applied on top by the binary.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    /// Samples per audio buffer
    pub buffer_size: usize,
    /// Upper bound on buffers waiting for playback
    pub max_queued_buffers: usize,
    pub output_sample_rate: u32,
    pub output_device: Option<String>,
    /// Sent as soon as a connection opens
    pub initial_frequency_hz: u64,
    pub record_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_queued_buffers: DEFAULT_MAX_QUEUED_BUFFERS,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            output_device: None,
            initial_frequency_hz: DEFAULT_INITIAL_FREQUENCY_HZ,
            record_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from `SDR_*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("SDR_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(value) = lookup("SDR_BUFFER_SIZE") {
            config.buffer_size = parse_var("SDR_BUFFER_SIZE", &value)?;
        }
        if let Some(value) = lookup("SDR_MAX_QUEUED_BUFFERS") {
            config.max_queued_buffers = parse_var("SDR_MAX_QUEUED_BUFFERS", &value)?;
        }
        if let Some(value) = lookup("SDR_OUTPUT_SAMPLE_RATE") {
            config.output_sample_rate = parse_var("SDR_OUTPUT_SAMPLE_RATE", &value)?;
        }
        if let Some(device) = lookup("SDR_OUTPUT_DEVICE") {
            config.output_device = Some(device).filter(|d| !d.trim().is_empty());
        }
        if let Some(value) = lookup("SDR_INITIAL_FREQUENCY_HZ") {
            config.initial_frequency_hz = parse_var("SDR_INITIAL_FREQUENCY_HZ", &value)?;
        }
        if let Some(path) = lookup("SDR_RECORD_PATH") {
            config.record_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// The endpoint itself is validated on connect; an invalid one leaves
    /// the client idle rather than failing startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(invalid("buffer_size", "0", "must be at least 1"));
        }
        if self.max_queued_buffers == 0 {
            return Err(invalid("max_queued_buffers", "0", "must be at least 1"));
        }
        if self.output_sample_rate == 0 {
            return Err(invalid("output_sample_rate", "0", "must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, value, &e.to_string()))
}

fn invalid(var: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
