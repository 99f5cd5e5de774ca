use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

/// Router settings, loadable from a JSON file. Every field has a default,
/// so `{}` is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Timeout applied by `AddressRouter::request` when the caller does not pass one.
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub default_request_timeout: Duration,

    /// Bound of each registration's delivery queue.
    #[serde(default = "default_handler_queue_capacity")]
    pub handler_queue_capacity: usize,

    /// Buffer of the broadcast channel used by `ChannelErrorSink`.
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_request_timeout: default_request_timeout(),
            handler_queue_capacity: default_handler_queue_capacity(),
            error_channel_capacity: default_error_channel_capacity(),
        }
    }
}

impl RouterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(s: &str) -> ConfigResult<Self> {
        let config: Self = from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.handler_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "handler_queue_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.error_channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "error_channel_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.default_request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "default_request_timeout".to_string(),
                message: "must be greater than 0ms".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }

    pub fn with_handler_queue_capacity(mut self, capacity: usize) -> Self {
        self.handler_queue_capacity = capacity;
        self
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_handler_queue_capacity() -> usize {
    1000
}
fn default_error_channel_capacity() -> usize {
    100
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
