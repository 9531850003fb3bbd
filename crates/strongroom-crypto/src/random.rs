//! OS-backed randomness for seeds, IVs, and stream keys.
//!
//! Everything security-relevant (master seed, transform seed, encryption IV,
//! inner stream key) is drawn from the operating system CSPRNG directly
//! rather than a userspace generator.

use rand::rngs::OsRng;
use rand::RngCore;

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

pub fn random_vec(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}
