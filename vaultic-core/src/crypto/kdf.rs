//! Argon2id key derivation for the master key.
//!
//! Default parameters:
//! - Memory cost: 256 MB (262,144 KiB)
//! - Time cost: 3 iterations
//! - Parallelism: 4 lanes
//! - Output length: 32 bytes (256 bits)
//! - Salt length: 16 bytes

use crate::crypto::cipher::SymmetricKey;
use crate::crypto::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Minimum accepted memory cost in KiB.
pub const MIN_MEM_COST: u32 = 64_000;

/// Parameters for Argon2id key derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Salt for key derivation (16 bytes)
    pub salt: [u8; 16],

    /// Memory cost in KiB
    pub mem_cost: u32,

    /// Time cost (number of iterations)
    pub time_cost: u32,

    /// Parallelism (number of lanes)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            salt: rand::random(),
            mem_cost: 262_144, // 256 MB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Create new parameters with a random salt
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify that parameters are within acceptable ranges
    pub fn validate(&self) -> CryptoResult<()> {
        if self.mem_cost < MIN_MEM_COST {
            return Err(CryptoError::KdfFailed(
                "Memory cost too low (minimum: 64 MB)".to_string(),
            ));
        }
        if self.time_cost < 1 {
            return Err(CryptoError::KdfFailed(
                "Time cost too low (minimum: 1)".to_string(),
            ));
        }
        if self.parallelism < 1 {
            return Err(CryptoError::KdfFailed(
                "Parallelism too low (minimum: 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Derive the 32-byte master key from the master password.
///
/// The master key never leaves the device; it only lives in the session
/// [`KeyCache`](crate::crypto::KeyCache).
pub fn derive_master_key(password: &[u8], params: &KdfParams) -> CryptoResult<SymmetricKey> {
    params.validate()?;

    let argon_params = Params::new(params.mem_cost, params.time_cost, params.parallelism, Some(32))
        .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, &params.salt, &mut output)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    let key = SymmetricKey::from_bytes(output);
    output.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost: MIN_MEM_COST,
            time_cost: 1,
            parallelism: 1,
            ..KdfParams::default()
        }
    }

    #[test]
    fn test_kdf_params_default() {
        let params = KdfParams::default();
        assert_eq!(params.mem_cost, 262_144);
        assert_eq!(params.time_cost, 3);
        assert_eq!(params.parallelism, 4);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_kdf_params_validation() {
        let mut params = KdfParams::default();

        params.mem_cost = 1000;
        assert!(params.validate().is_err());

        params.mem_cost = 262_144;
        params.time_cost = 0;
        assert!(params.validate().is_err());

        params.time_cost = 3;
        params.parallelism = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_derive_master_key() {
        let params = fast_params();

        let key1 = derive_master_key(b"test_password_123!", &params).unwrap();
        let key2 = derive_master_key(b"test_password_123!", &params).unwrap();
        assert_eq!(key1, key2);

        let key3 = derive_master_key(b"different_password", &params).unwrap();
        assert_ne!(key1, key3);

        let mut salted = params.clone();
        salted.salt = rand::random();
        let key4 = derive_master_key(b"test_password_123!", &salted).unwrap();
        assert_ne!(key1, key4);
    }
}
