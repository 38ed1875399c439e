//! Configuration file support for the Cast CLI tools
//!
//! One TOML file can describe both ends of a stream. The `[sender.session]`
//! and `[receiver.session]` tables must match for the two tools to talk to
//! each other; `Config::generate` produces such a pair with fresh keys.

use cast_crypto::RandomSource;
use cast_protocol::RtpPayloadType;
use cast_transport::config::DEFAULT_MAX_BITRATE;
use cast_transport::{SessionConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Sender tool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    pub session: SessionConfig,
    /// Where the receiver listens
    pub remote: SocketAddr,
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Input file, or "-" for stdin
    #[serde(default = "default_stdio")]
    pub input: String,
    /// Bytes of input carried by each frame
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Force a key frame every this many frames; zero for only on request
    #[serde(default)]
    pub key_frame_interval: u32,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: i64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Receiver tool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub session: SessionConfig,
    pub listen: SocketAddr,
    /// Output file, or "-" for stdout
    #[serde(default = "default_stdio")]
    pub output: String,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_stdio() -> String {
    "-".to_string()
}

fn default_frame_size() -> usize {
    8192
}

fn default_frame_rate() -> u32 {
    30
}

fn default_max_bitrate() -> i64 {
    DEFAULT_MAX_BITRATE
}

fn default_stats_interval() -> u64 {
    1
}

/// Combined configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    pub sender: Option<SenderConfig>,
    pub receiver: Option<ReceiverConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid session: {0}")]
    Session(#[from] cast_transport::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// A matching sender/receiver pair for a video stream with fresh SSRCs
    /// and keys
    pub fn generate(listen: SocketAddr, remote: SocketAddr) -> Result<Self, ConfigError> {
        let session = SessionConfig::generate(RtpPayloadType::VideoVp8, 90_000, &RandomSource::new())?;
        Ok(Config {
            sender: Some(SenderConfig {
                session: session.clone(),
                remote,
                bind: default_bind(),
                input: default_stdio(),
                frame_size: default_frame_size(),
                frame_rate: default_frame_rate(),
                key_frame_interval: 0,
                max_bitrate: DEFAULT_MAX_BITRATE,
                stats_interval_secs: default_stats_interval(),
            }),
            receiver: Some(ReceiverConfig {
                session,
                listen,
                output: default_stdio(),
                stats_interval_secs: default_stats_interval(),
            }),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(sender) = &self.sender {
            sender.validate()?;
        }
        if let Some(receiver) = &self.receiver {
            receiver.session.validate()?;
        }
        if let (Some(sender), Some(receiver)) = (&self.sender, &self.receiver) {
            if sender.session != receiver.session {
                return Err(ConfigError::Invalid(
                    "sender and receiver sessions differ".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        self.transport().validate()?;
        if self.frame_rate == 0 {
            return Err(ConfigError::Invalid("frame_rate must be positive".to_string()));
        }
        if self.frame_size == 0 {
            return Err(ConfigError::Invalid("frame_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_bitrate: self.max_bitrate,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl ReceiverConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
