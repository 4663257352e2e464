//! Memory-hard password KDF.
//!
//! Sequential-memory-hard ROMix over SHA-512: fill a lookup table with a
//! hash chain, then walk it data-dependently. The cost parameters live in
//! the KDF spec itself and the spec's identity is the Hash160 of its
//! serialized parameters, so two specs with the same id derive identical
//! keys from identical passphrases and are interchangeable.

use std::time::Instant;

use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::crypto::hash160;
use crate::prng::prng;
use crate::util::{BinaryReader, BinaryWriter, CodecError, SecureBytes};

/// Serialization tag for the Romix algorithm.
const KDF_TYPE_ROMIX: u8 = 0x01;

/// Lookup-table row width, the SHA-512 output size.
const ROW_WIDTH: usize = 64;

/// Default memory target: 16 MiB.
pub const DEFAULT_MEMORY_TARGET: u32 = 16 * 1024 * 1024;

/// Floor for the table so degenerate parameters still mix.
const MIN_ROWS: u32 = 2;

#[derive(Debug, Error)]
pub enum KdfError {
    #[error("unknown kdf algorithm tag: {0:#04x}")]
    UnknownAlgorithm(u8),

    #[error("invalid kdf parameters")]
    BadParameters,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Romix KDF spec: cost parameters, salt, and the derived identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KdfRomix {
    memory_target: u32,
    iterations: u32,
    salt: Vec<u8>,
    id: Vec<u8>,
}

impl KdfRomix {
    pub fn new(memory_target: u32, iterations: u32, salt: Vec<u8>) -> Result<Self, KdfError> {
        if memory_target < ROW_WIDTH as u32 * MIN_ROWS || iterations == 0 || salt.is_empty() {
            return Err(KdfError::BadParameters);
        }
        let id = Self::compute_id(memory_target, iterations, &salt);
        Ok(Self {
            memory_target,
            iterations,
            salt,
            id,
        })
    }

    /// Fresh spec with a random 32-byte salt and a single iteration.
    pub fn random() -> Self {
        let salt = prng().random(32).to_vec();
        Self::new(DEFAULT_MEMORY_TARGET, 1, salt).expect("default parameters are valid")
    }

    /// Fresh spec tuned so one derivation takes roughly `target_ms`.
    pub fn tuned(memory_target: u32, target_ms: u64) -> Result<Self, KdfError> {
        let salt = prng().random(32).to_vec();
        let probe = Self::new(memory_target, 1, salt.clone())?;

        let start = Instant::now();
        let _ = probe.derive(b"timing probe");
        let elapsed = start.elapsed().as_millis().max(1) as u64;

        let iterations = (target_ms / elapsed).clamp(1, 64) as u32;
        Self::new(memory_target, iterations, salt)
    }

    pub fn memory_target(&self) -> u32 {
        self.memory_target
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Hash160 of the serialized parameters; the spec's identity.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    fn compute_id(memory_target: u32, iterations: u32, salt: &[u8]) -> Vec<u8> {
        let mut bw = BinaryWriter::new();
        bw.put_u8(KDF_TYPE_ROMIX);
        bw.put_u32_be(memory_target);
        bw.put_u32_be(iterations);
        bw.put_var_bytes(salt);
        hash160(bw.as_slice()).to_vec()
    }

    /// Derive a 32-byte key from a passphrase.
    pub fn derive(&self, passphrase: &[u8]) -> SecureBytes {
        let rows = (self.memory_target as usize / ROW_WIDTH).max(MIN_ROWS as usize);

        let mut x: [u8; 64] = {
            let mut h = Sha512::new();
            h.update(&self.salt);
            h.update(passphrase);
            h.finalize().into()
        };

        let mut table = vec![0u8; rows * ROW_WIDTH];
        for _ in 0..self.iterations {
            // Fill: V[i] = H^i(X)
            for row in table.chunks_exact_mut(ROW_WIDTH) {
                row.copy_from_slice(&x);
                x = Sha512::digest(x).into();
            }

            // Mix: data-dependent walk over the table
            for _ in 0..rows {
                let j = integerify(&x) % rows as u64;
                let row = &table[j as usize * ROW_WIDTH..(j as usize + 1) * ROW_WIDTH];
                let mut mixed = [0u8; 64];
                for (m, (a, b)) in mixed.iter_mut().zip(x.iter().zip(row.iter())) {
                    *m = a ^ b;
                }
                x = Sha512::digest(mixed).into();
            }
        }

        SecureBytes::from(&x[..32])
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bw = BinaryWriter::new();
        bw.put_u8(KDF_TYPE_ROMIX);
        bw.put_u32_be(self.memory_target);
        bw.put_u32_be(self.iterations);
        bw.put_var_bytes(&self.salt);
        bw.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, KdfError> {
        let mut br = BinaryReader::new(data);
        let tag = br.get_u8()?;
        if tag != KDF_TYPE_ROMIX {
            return Err(KdfError::UnknownAlgorithm(tag));
        }
        let memory_target = br.get_u32_be()?;
        let iterations = br.get_u32_be()?;
        let salt = br.get_var_bytes()?;
        br.expect_exhausted()?;
        Self::new(memory_target, iterations, salt)
    }
}

/// Low 8 bytes of the running hash, little-endian, as the table index seed.
fn integerify(x: &[u8; 64]) -> u64 {
    u64::from_le_bytes(x[56..64].try_into().expect("fixed slice"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_kdf() -> KdfRomix {
        KdfRomix::new(4096, 2, vec![0xAB; 32]).unwrap()
    }

    #[test]
    fn same_parameters_same_id_same_key() {
        let a = small_kdf();
        let b = KdfRomix::deserialize(&a.serialize()).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.derive(b"passphrase"), b.derive(b"passphrase"));
    }

    #[test]
    fn different_salt_different_id_and_key() {
        let a = small_kdf();
        let b = KdfRomix::new(4096, 2, vec![0xCD; 32]).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.derive(b"passphrase"), b.derive(b"passphrase"));
    }

    #[test]
    fn different_passphrases_differ() {
        let kdf = small_kdf();
        assert_ne!(kdf.derive(b"alpha"), kdf.derive(b"beta"));
    }

    #[test]
    fn cost_parameters_change_the_key() {
        let salt = vec![0xAB; 32];
        let a = KdfRomix::new(4096, 2, salt.clone()).unwrap();
        let b = KdfRomix::new(8192, 2, salt.clone()).unwrap();
        let c = KdfRomix::new(4096, 3, salt).unwrap();
        assert_ne!(a.derive(b"x"), b.derive(b"x"));
        assert_ne!(a.derive(b"x"), c.derive(b"x"));
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(KdfRomix::new(16, 1, vec![1; 32]).is_err());
        assert!(KdfRomix::new(4096, 0, vec![1; 32]).is_err());
        assert!(KdfRomix::new(4096, 1, vec![]).is_err());
    }
}
