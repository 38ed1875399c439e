//! Cast Streaming Encryption
//!
//! This crate provides the per-frame payload cipher (AES-128 in counter mode)
//! and the cryptographically-secure random source used to seed session keys,
//! IV masks, SSRCs and RTP sequence numbers.

pub mod cipher;
pub mod random;

pub use cipher::{FrameCipher, KEY_SIZE};
pub use random::RandomSource;

use thiserror::Error;

/// Crypto errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Secure random source is unavailable")]
    RandomUnavailable,
}
