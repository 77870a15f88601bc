//! Secure random number generation.
//!
//! Wraps the operating system's entropy source (e.g., /dev/urandom on Unix,
//! BCryptGenRandom on Windows) behind the few operations the session core
//! needs: key/nonce material, session ids, and the one-shot remote shuffle.

use rand::{Rng, RngCore};
use rand_core::OsRng;

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Fisher-Yates shuffle driven by OS entropy. Used for `remote-random`.
    pub fn shuffle<T>(items: &mut [T]) {
        let mut rng = OsRng;
        for i in (1..items.len()).rev() {
            let j = rng.gen_range(0..=i);
            items.swap(i, j);
        }
    }
}
