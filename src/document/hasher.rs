// # Rolling Hasher
//
// Rabin-Karp rolling hashes over rune windows. Two variants with identical
// output: a scalar loop and a 3-way unrolled loop; benches compare them.
//
// The hash of runes r_i..r_{i+W-1} is sum(r_{i+k} * B^{W-1-k}) mod 2^H.
// Arithmetic is wrapping u64; because 2^H divides 2^64, masking the low H
// bits of the wrapped value yields the exact modular result.

use serde::{Deserialize, Serialize};

use crate::error::{MatchError, Result};

/// Fixed odd prime base for the polynomial hash.
pub const BASE: u64 = (1u64 << 32) - 5;

/// Hashing parameters, fixed process-wide at startup. A mismatch between
/// cooperating processes is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashKey {
    pub window_size: u32,
    pub hash_width: u32,
}

impl HashKey {
    pub fn new(window_size: u32, hash_width: u32) -> Self {
        Self {
            window_size,
            hash_width,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(4..=255).contains(&self.window_size) {
            return Err(MatchError::Configuration(format!(
                "window_size {} out of range [4, 255]",
                self.window_size
            )));
        }
        if !(8..=64).contains(&self.hash_width) {
            return Err(MatchError::Configuration(format!(
                "hash_width {} out of range [8, 64]",
                self.hash_width
            )));
        }
        Ok(())
    }

    /// Bitmask selecting the low `hash_width` bits.
    #[inline]
    pub fn mask(&self) -> u64 {
        if self.hash_width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.hash_width) - 1
        }
    }

    /// Number of distinct hash values, as u128 to hold 2^64.
    pub fn space(&self) -> u128 {
        1u128 << self.hash_width
    }
}

impl Default for HashKey {
    fn default() -> Self {
        Self {
            window_size: 30,
            hash_width: 24,
        }
    }
}

/// Signature shared by both hasher variants. `emit` is called exactly once
/// per window index in increasing order with the window's masked hash.
pub type HasherFn = fn(&str, usize, HashKey, &mut dyn FnMut(usize, u64));

#[inline]
fn base_pow(exp: u32) -> u64 {
    let mut pow: u64 = 1;
    for _ in 0..exp {
        pow = pow.wrapping_mul(BASE);
    }
    pow
}

#[inline(always)]
fn roll(hash: u64, outgoing: u64, incoming: u64, pow: u64) -> u64 {
    hash.wrapping_mul(BASE)
        .wrapping_sub(outgoing.wrapping_mul(pow))
        .wrapping_add(incoming)
}

/// Scalar rolling Rabin-Karp. Emits `count` hashes; no per-window allocation.
pub fn rolling_rabin_karp(
    text: &str,
    count: usize,
    key: HashKey,
    emit: &mut dyn FnMut(usize, u64),
) {
    if count == 0 {
        return;
    }
    let window = key.window_size;
    let mask = key.mask();
    let pow = base_pow(window);

    // `tail` trails `head` by exactly one window; both walk the same rune
    // sequence so nothing is buffered.
    let mut head = text.chars();
    let mut tail = text.chars();

    let mut hash: u64 = 0;
    for _ in 0..window {
        let r = head.next().map(|c| c as u64).unwrap_or(0);
        hash = hash.wrapping_mul(BASE).wrapping_add(r);
    }
    emit(0, hash & mask);

    for i in 1..count {
        let outgoing = tail.next().map(|c| c as u64).unwrap_or(0);
        let incoming = head.next().map(|c| c as u64).unwrap_or(0);
        hash = roll(hash, outgoing, incoming, pow);
        emit(i, hash & mask);
    }
}

/// 3-way unrolled rolling Rabin-Karp. Byte-identical output to
/// [`rolling_rabin_karp`] on every input.
pub fn rolling_rabin_karp3(
    text: &str,
    count: usize,
    key: HashKey,
    emit: &mut dyn FnMut(usize, u64),
) {
    if count == 0 {
        return;
    }
    let window = key.window_size;
    let mask = key.mask();
    let pow = base_pow(window);

    let mut head = text.chars();
    let mut tail = text.chars();

    let mut hash: u64 = 0;
    for _ in 0..window {
        let r = head.next().map(|c| c as u64).unwrap_or(0);
        hash = hash.wrapping_mul(BASE).wrapping_add(r);
    }
    emit(0, hash & mask);

    let mut i = 1;
    while i + 3 <= count {
        let out0 = tail.next().map(|c| c as u64).unwrap_or(0);
        let in0 = head.next().map(|c| c as u64).unwrap_or(0);
        let h0 = roll(hash, out0, in0, pow);
        emit(i, h0 & mask);

        let out1 = tail.next().map(|c| c as u64).unwrap_or(0);
        let in1 = head.next().map(|c| c as u64).unwrap_or(0);
        let h1 = roll(h0, out1, in1, pow);
        emit(i + 1, h1 & mask);

        let out2 = tail.next().map(|c| c as u64).unwrap_or(0);
        let in2 = head.next().map(|c| c as u64).unwrap_or(0);
        let h2 = roll(h1, out2, in2, pow);
        emit(i + 2, h2 & mask);

        hash = h2;
        i += 3;
    }
    while i < count {
        let outgoing = tail.next().map(|c| c as u64).unwrap_or(0);
        let incoming = head.next().map(|c| c as u64).unwrap_or(0);
        hash = roll(hash, outgoing, incoming, pow);
        emit(i, hash & mask);
        i += 1;
    }
}
