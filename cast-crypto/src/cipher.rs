//! Frame Cipher
//!
//! Payloads are encrypted with AES-128 in counter mode. The key is fixed for
//! the whole session; the 128-bit initial counter block is derived from the
//! frame counter XORed with a session-random IV mask, so no counter block is
//! reused as long as frame counters do not repeat.

use aes::cipher::{KeyIvInit, StreamCipher};
use std::fmt;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Size of the AES key and of the IV mask, in bytes
pub const KEY_SIZE: usize = 16;

/// Offset of the big-endian frame counter within the nonce
const FRAME_COUNTER_OFFSET: usize = 8;

/// Session-keyed counter-mode cipher
#[derive(Clone)]
pub struct FrameCipher {
    key: [u8; KEY_SIZE],
    iv_mask: [u8; KEY_SIZE],
}

impl FrameCipher {
    /// Create a cipher from a session key and IV mask
    pub fn new(key: [u8; KEY_SIZE], iv_mask: [u8; KEY_SIZE]) -> Self {
        FrameCipher { key, iv_mask }
    }

    /// Compute the initial counter block for the given frame counter
    pub fn nonce_for(&self, frame_counter: u32) -> [u8; KEY_SIZE] {
        let mut nonce = [0u8; KEY_SIZE];
        nonce[FRAME_COUNTER_OFFSET..FRAME_COUNTER_OFFSET + 4]
            .copy_from_slice(&frame_counter.to_be_bytes());
        for (byte, mask) in nonce.iter_mut().zip(self.iv_mask.iter()) {
            *byte ^= mask;
        }
        nonce
    }

    /// XOR `data` in place with the keystream for `frame_counter`
    ///
    /// Encryption and decryption are the same operation. Output length always
    /// equals input length.
    pub fn apply_keystream(&self, frame_counter: u32, data: &mut [u8]) {
        let nonce = self.nonce_for(frame_counter);
        let mut cipher = Aes128Ctr::new(self.key.as_slice().into(), nonce.as_slice().into());
        cipher.apply_keystream(data);
    }
}

impl fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCipher").finish_non_exhaustive()
    }
}
