//! Session and transport configuration
//!
//! Both sides of a session must agree on the `SessionConfig`: the stream
//! identifiers, payload type, RTP timebase and the AES key material. Keys are
//! written as hex strings in configuration files.

use cast_crypto::{CryptoError, RandomSource, KEY_SIZE};
use cast_protocol::ssrc::ssrc_from_random;
use cast_protocol::{RtpPayloadType, Ssrc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default maximum bitrate, in bits per second
pub const DEFAULT_MAX_BITRATE: i64 = 24 << 20;

/// Default target playout delay, in milliseconds
pub const DEFAULT_TARGET_PLAYOUT_DELAY_MS: u64 = 400;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unsupported RTP payload type: {0}")]
    InvalidPayloadType(u8),

    #[error("RTP timebase must be positive")]
    InvalidTimebase,

    #[error("Sender and receiver SSRC must differ (both {0})")]
    DuplicateSsrc(Ssrc),

    #[error("Max bitrate must be positive, got {0}")]
    InvalidBitrate(i64),

    #[error("Random source failed: {0}")]
    Random(#[from] CryptoError),
}

/// Parameters both peers of one stream share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub sender_ssrc: Ssrc,
    pub receiver_ssrc: Ssrc,
    /// Raw RTP payload type (96 through 102)
    pub rtp_payload_type: u8,
    /// RTP ticks per second: the sample rate for audio, 90000 for video
    pub rtp_timebase: u32,
    #[serde(with = "hex_key")]
    pub aes_key: [u8; KEY_SIZE],
    #[serde(with = "hex_key")]
    pub aes_iv_mask: [u8; KEY_SIZE],
    #[serde(default = "default_target_playout_delay_ms")]
    pub target_playout_delay_ms: u64,
}

fn default_target_playout_delay_ms() -> u64 {
    DEFAULT_TARGET_PLAYOUT_DELAY_MS
}

impl SessionConfig {
    /// Fresh session with random SSRCs and key material
    ///
    /// Audio streams take SSRCs from the higher-priority range.
    pub fn generate(
        payload_type: RtpPayloadType,
        rtp_timebase: u32,
        random: &RandomSource,
    ) -> Result<Self, ConfigError> {
        let higher_priority = payload_type.is_audio();
        let sender_ssrc = ssrc_from_random(random.next_u32()?, higher_priority);
        let mut receiver_ssrc = ssrc_from_random(random.next_u32()?, higher_priority);
        if receiver_ssrc == sender_ssrc {
            receiver_ssrc = ssrc_from_random(receiver_ssrc.wrapping_add(1), higher_priority);
        }
        let config = SessionConfig {
            sender_ssrc,
            receiver_ssrc,
            rtp_payload_type: payload_type.as_u8(),
            rtp_timebase,
            aes_key: random.generate_key()?,
            aes_iv_mask: random.generate_key()?,
            target_playout_delay_ms: DEFAULT_TARGET_PLAYOUT_DELAY_MS,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.payload_type()?;
        if self.rtp_timebase == 0 {
            return Err(ConfigError::InvalidTimebase);
        }
        if self.sender_ssrc == self.receiver_ssrc {
            return Err(ConfigError::DuplicateSsrc(self.sender_ssrc));
        }
        Ok(())
    }

    pub fn payload_type(&self) -> Result<RtpPayloadType, ConfigError> {
        RtpPayloadType::from_u8(self.rtp_payload_type)
            .filter(|pt| *pt != RtpPayloadType::Null)
            .ok_or(ConfigError::InvalidPayloadType(self.rtp_payload_type))
    }

    pub fn target_playout_delay(&self) -> Duration {
        Duration::from_millis(self.target_playout_delay_ms)
    }
}

/// Sender-side pacing limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Upper bound on the paced send rate, in bits per second
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: i64,
}

fn default_max_bitrate() -> i64 {
    DEFAULT_MAX_BITRATE
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bitrate <= 0 {
            return Err(ConfigError::InvalidBitrate(self.max_bitrate));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_bitrate: DEFAULT_MAX_BITRATE,
        }
    }
}

mod hex_key {
    use cast_crypto::KEY_SIZE;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; KEY_SIZE], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; KEY_SIZE], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text.trim()).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| D::Error::custom(format!("expected {} key bytes, got {}", KEY_SIZE, v.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionConfig {
        SessionConfig {
            sender_ssrc: 50_001,
            receiver_ssrc: 50_002,
            rtp_payload_type: 100,
            rtp_timebase: 90_000,
            aes_key: [0x11; KEY_SIZE],
            aes_iv_mask: [0xA0; KEY_SIZE],
            target_playout_delay_ms: 250,
        }
    }

    #[test]
    fn test_toml_roundtrip_hex_keys() {
        let config = sample();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("aes_key = \"11111111111111111111111111111111\""));
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_default_playout_delay() {
        let text = r#"
            sender_ssrc = 1
            receiver_ssrc = 2
            rtp_payload_type = 96
            rtp_timebase = 48000
            aes_key = "000102030405060708090a0b0c0d0e0f"
            aes_iv_mask = "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff"
        "#;
        let config: SessionConfig = toml::from_str(text).unwrap();
        assert_eq!(config.target_playout_delay(), Duration::from_millis(400));
        assert_eq!(config.aes_key[15], 0x0f);
        assert_eq!(config.payload_type().unwrap(), RtpPayloadType::AudioOpus);
    }

    #[test]
    fn test_bad_key_length() {
        let text = r#"
            sender_ssrc = 1
            receiver_ssrc = 2
            rtp_payload_type = 96
            rtp_timebase = 48000
            aes_key = "0001"
            aes_iv_mask = "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff"
        "#;
        assert!(toml::from_str::<SessionConfig>(text).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut config = sample();
        config.rtp_payload_type = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPayloadType(0))));

        let mut config = sample();
        config.rtp_timebase = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimebase)));

        let mut config = sample();
        config.receiver_ssrc = config.sender_ssrc;
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateSsrc(_))));

        assert!(TransportConfig::default().validate().is_ok());
        assert!(TransportConfig { max_bitrate: 0 }.validate().is_err());
    }

    #[test]
    fn test_generate() {
        let random = RandomSource::new();
        let audio = SessionConfig::generate(RtpPayloadType::AudioOpus, 48_000, &random).unwrap();
        assert!(audio.sender_ssrc <= 50_000);
        assert_ne!(audio.sender_ssrc, audio.receiver_ssrc);

        let video = SessionConfig::generate(RtpPayloadType::VideoVp8, 90_000, &random).unwrap();
        assert!(video.sender_ssrc > 50_000);
        assert_ne!(video.aes_key, video.aes_iv_mask);
    }
}
