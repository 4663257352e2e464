//! Process-wide cryptographic PRNG.
//!
//! Fortuna-style construction: a ChaCha20 core keyed from OS entropy,
//! re-keyed after every mebibyte of output so a state compromise cannot be
//! wound backwards. The generator sits behind a mutex; concurrent draws are
//! serialized and can never overlap. Independent instances (separate
//! processes) key themselves from independent OS entropy, so their output
//! streams are disjoint except with negligible probability.

use std::sync::{Mutex, OnceLock};

use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::crypto::sha256;
use crate::util::SecureBytes;

/// Output budget between re-keys.
const REKEY_INTERVAL: usize = 1 << 20;

struct PrngState {
    rng: ChaCha20Rng,
    since_rekey: usize,
}

impl PrngState {
    fn seeded() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self {
            rng: ChaCha20Rng::from_seed(seed),
            since_rekey: 0,
        }
    }

    fn rekey(&mut self) {
        // Fold fresh OS entropy into the outgoing state so the new key is
        // unpredictable even if either source alone is weak.
        let mut material = [0u8; 64];
        self.rng.fill_bytes(&mut material[..32]);
        OsRng.fill_bytes(&mut material[32..]);
        self.rng = ChaCha20Rng::from_seed(sha256(&material));
        self.since_rekey = 0;
    }

    fn fill(&mut self, out: &mut [u8]) {
        self.rng.fill_bytes(out);
        self.since_rekey += out.len();
        if self.since_rekey >= REKEY_INTERVAL {
            self.rekey();
        }
    }
}

/// Thread-safe random generator. One shared instance serves the whole
/// process; see [`prng`].
pub struct Prng {
    state: Mutex<PrngState>,
}

impl Prng {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PrngState::seeded()),
        }
    }

    /// Draw `len` random bytes.
    pub fn random(&self, len: usize) -> SecureBytes {
        let mut out = vec![0u8; len];
        self.fill(&mut out);
        SecureBytes::new(out)
    }

    pub fn fill(&self, out: &mut [u8]) {
        let mut state = self.state.lock().expect("prng poisoned");
        state.fill(out);
    }

    /// 16-byte IV for AES-CBC.
    pub fn random_iv(&self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        self.fill(&mut iv);
        iv
    }
}

impl Default for Prng {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide generator.
pub fn prng() -> &'static Prng {
    static INSTANCE: OnceLock<Prng> = OnceLock::new();
    INSTANCE.get_or_init(Prng::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn output_lengths() {
        let p = Prng::new();
        for len in [0usize, 1, 15, 16, 31, 32, 33, 1024] {
            assert_eq!(p.random(len).len(), len);
        }
    }

    #[test]
    fn two_instances_do_not_collide() {
        let p1 = Prng::new();
        let p2 = Prng::new();

        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(p1.random(32).to_vec()));
            assert!(seen.insert(p2.random(32).to_vec()));
        }
        assert_eq!(seen.len(), 20_000);
    }

    #[test]
    fn concurrent_draws_are_unique() {
        let p = Arc::new(Prng::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let p = Arc::clone(&p);
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| p.random(32).to_vec()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for draw in h.join().unwrap() {
                assert!(seen.insert(draw));
            }
        }
        assert_eq!(seen.len(), 8_000);
    }

    // full-size disjointness run, ~64 MiB of draws; run with --ignored
    #[test]
    #[ignore]
    fn million_draws_from_two_instances_never_collide() {
        let p1 = Prng::new();
        let p2 = Prng::new();

        let mut seen = HashSet::with_capacity(2_000_000);
        for _ in 0..1_000_000 {
            assert!(seen.insert(p1.random(32).to_vec()));
            assert!(seen.insert(p2.random(32).to_vec()));
        }
        assert_eq!(seen.len(), 2_000_000);
    }

    #[test]
    fn rekey_does_not_repeat_output() {
        let p = Prng::new();
        // Push well past the rekey interval and check a window across it.
        let before = p.random(32).to_vec();
        let mut sink = vec![0u8; REKEY_INTERVAL + 64];
        p.fill(&mut sink);
        let after = p.random(32).to_vec();
        assert_ne!(before, after);
    }
}
