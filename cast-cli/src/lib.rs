//! Cast CLI Library
//!
//! Configuration files, logging setup and statistics output shared by the
//! `cast-sender` and `cast-receiver` tools.

pub mod config;
pub mod stats;

pub use config::{Config, ConfigError, ReceiverConfig, SenderConfig};
pub use stats::{format_bandwidth, format_bytes, format_duration, sender_stats_line, receiver_stats_line};

/// Install the tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise each `-v` raises the level from
/// `info` through `debug` to `trace`.
pub fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
