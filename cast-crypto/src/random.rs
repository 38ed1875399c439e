//! Secure random source

use crate::cipher::KEY_SIZE;
use crate::CryptoError;
use ring::rand::{SecureRandom, SystemRandom};

/// Cryptographically-secure random source backed by the operating system
#[derive(Debug, Clone)]
pub struct RandomSource {
    rng: SystemRandom,
}

impl RandomSource {
    pub fn new() -> Self {
        RandomSource {
            rng: SystemRandom::new(),
        }
    }

    /// Fill `dest` with random bytes
    pub fn fill(&self, dest: &mut [u8]) -> Result<(), CryptoError> {
        self.rng
            .fill(dest)
            .map_err(|_| CryptoError::RandomUnavailable)
    }

    /// Generate a fresh AES key or IV mask
    pub fn generate_key(&self) -> Result<[u8; KEY_SIZE], CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        self.fill(&mut key)?;
        Ok(key)
    }

    pub fn next_u16(&self) -> Result<u16, CryptoError> {
        let mut bytes = [0u8; 2];
        self.fill(&mut bytes)?;
        Ok(u16::from_be_bytes(bytes))
    }

    pub fn next_u32(&self) -> Result<u32, CryptoError> {
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes)?;
        Ok(u32::from_be_bytes(bytes))
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new()
    }
}
