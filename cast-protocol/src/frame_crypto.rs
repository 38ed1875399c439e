//! Per-frame payload encryption
//!
//! Wraps the session cipher and keys each frame's keystream by its frame id,
//! so identical payloads in different frames encrypt differently and a frame
//! always decrypts the same way regardless of packet arrival order.

use crate::encoded_frame::{EncodedFrame, EncryptedFrame};
use bytes::Bytes;
use cast_crypto::{FrameCipher, KEY_SIZE};

#[derive(Debug, Clone)]
pub struct FrameCrypto {
    cipher: FrameCipher,
}

impl FrameCrypto {
    pub fn new(aes_key: [u8; KEY_SIZE], aes_iv_mask: [u8; KEY_SIZE]) -> Self {
        FrameCrypto {
            cipher: FrameCipher::new(aes_key, aes_iv_mask),
        }
    }

    pub fn encrypt(&self, frame: &EncodedFrame) -> EncryptedFrame {
        EncryptedFrame::from_encrypted_parts(self.transform(frame))
    }

    pub fn decrypt(&self, frame: &EncryptedFrame) -> EncodedFrame {
        self.transform(frame)
    }

    fn transform(&self, frame: &EncodedFrame) -> EncodedFrame {
        let mut data = frame.data.to_vec();
        self.cipher
            .apply_keystream(frame.frame_id.lower_32_bits(), &mut data);
        EncodedFrame {
            data: Bytes::from(data),
            ..frame.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoded_frame::Dependency;
    use crate::frame_id::FrameId;
    use crate::rtp_time::RtpTimeTicks;
    use std::time::Duration;

    fn crypto() -> FrameCrypto {
        FrameCrypto::new([0x01; KEY_SIZE], [0xA5; KEY_SIZE])
    }

    fn frame(id: i64, payload: &'static [u8]) -> EncodedFrame {
        EncodedFrame::new(
            Dependency::Dependent,
            FrameId::new(id),
            FrameId::new(id - 1),
            RtpTimeTicks::from_ticks(id * 3_000),
            Bytes::from_static(payload),
        )
        .with_new_playout_delay(Duration::from_millis(250))
    }

    #[test]
    fn test_roundtrip_keeps_metadata() {
        let crypto = crypto();
        let original = frame(12, b"hello cast streaming");
        let encrypted = crypto.encrypt(&original);

        assert_ne!(encrypted.data, original.data);
        assert_eq!(encrypted.data.len(), original.data.len());
        assert_eq!(encrypted.frame_id, original.frame_id);
        assert_eq!(encrypted.new_playout_delay, original.new_playout_delay);
        assert_eq!(crypto.decrypt(&encrypted), original);
    }

    #[test]
    fn test_same_payload_different_ids() {
        let crypto = crypto();
        let a = crypto.encrypt(&frame(1, b"identical payload"));
        let b = crypto.encrypt(&frame(2, b"identical payload"));
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_empty_payload() {
        let crypto = crypto();
        let original = frame(3, b"");
        let encrypted = crypto.encrypt(&original);
        assert!(encrypted.data.is_empty());
        assert_eq!(crypto.decrypt(&encrypted), original);
    }
}
