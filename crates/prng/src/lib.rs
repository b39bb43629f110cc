//! Counter-based generators for differential privacy noise.
//!
//! Noise used by the privacy engine must not share state with whatever
//! generator the training loop seeds for reproducibility. This crate gives
//! each engine its own Threefry-2x32 stream, seeded once from the operating
//! system and bound to a compute [`Device`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod device;
pub mod entropy;

pub use device::{Device, DeviceGenerator};
pub use entropy::{os_seed, EntropyError};

use rand::{CryptoRng, RngCore};

/// Key of a Threefry-2x32 stream (two u32 words).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreefryKey {
    /// First 32-bit key word.
    pub k1: u32,
    /// Second 32-bit key word.
    pub k2: u32,
}

impl ThreefryKey {
    /// Create a key from a signed 64-bit seed.
    pub fn from_seed(seed: i64) -> Self {
        let (k1, k2) = split_words(seed as u64);
        Self { k1, k2 }
    }

    /// Create a key directly from raw u32 words.
    pub fn from_u32s(k1: u32, k2: u32) -> Self {
        Self { k1, k2 }
    }

    /// Deterministically derive a subkey from additional data.
    pub fn fold_in(self, data: u64) -> Self {
        let (d1, d2) = split_words(data);
        let (k1, k2) = threefry2x32_pair(self, d1, d2);
        Self { k1, k2 }
    }

    /// Convert the key into a generator stream.
    pub fn to_rng(self) -> ThreefryRng {
        ThreefryRng::new(self)
    }
}

/// Threefry stream derived from a key and an internal counter.
#[derive(Debug)]
pub struct ThreefryRng {
    key: ThreefryKey,
    counter: u64,
    buffer: [u32; 2],
    index: usize,
}

impl ThreefryRng {
    /// Create a new stream from a key.
    pub fn new(key: ThreefryKey) -> Self {
        Self {
            key,
            counter: 0,
            buffer: [0; 2],
            index: 2,
        }
    }

    fn refill(&mut self) {
        let c0 = self.counter as u32;
        let c1 = self.counter.wrapping_add(1) as u32;
        let (y0, y1) = threefry2x32_pair(self.key, c0, c1);
        self.buffer = [y0, y1];
        self.index = 0;
        self.counter = self.counter.wrapping_add(2);
    }
}

impl RngCore for ThreefryRng {
    fn next_u32(&mut self) -> u32 {
        if self.index >= 2 {
            self.refill();
        }
        let out = self.buffer[self.index];
        self.index += 1;
        out
    }

    fn next_u64(&mut self) -> u64 {
        let lo = self.next_u32() as u64;
        let hi = self.next_u32() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut remaining = dest;
        while !remaining.is_empty() {
            let chunk = self.next_u64().to_le_bytes();
            let take = remaining.len().min(chunk.len());
            remaining[..take].copy_from_slice(&chunk[..take]);
            remaining = &mut remaining[take..];
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for ThreefryRng {}

fn split_words(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, (value & 0xFFFF_FFFF) as u32)
}

/// Apply the Threefry 2x32 hash (20 rounds) to a single pair.
fn threefry2x32_pair(key: ThreefryKey, x0: u32, x1: u32) -> (u32, u32) {
    const ROTATIONS: [[u32; 4]; 2] = [[13, 15, 26, 6], [17, 29, 16, 24]];

    let ks = [key.k1, key.k2, key.k1 ^ key.k2 ^ 0x1BD1_1BDA];
    let mut x0 = x0.wrapping_add(ks[0]);
    let mut x1 = x1.wrapping_add(ks[1]);

    for block in 0..5u32 {
        for &rot in &ROTATIONS[(block % 2) as usize] {
            round(&mut x0, &mut x1, rot);
        }
        let b = block as usize;
        x0 = x0.wrapping_add(ks[(b + 1) % 3]);
        x1 = x1.wrapping_add(ks[(b + 2) % 3]).wrapping_add(block + 1);
    }

    (x0, x1)
}

#[inline]
fn round(x0: &mut u32, x1: &mut u32, rot: u32) {
    *x0 = x0.wrapping_add(*x1);
    *x1 = x1.rotate_left(rot);
    *x1 ^= *x0;
}

/// Common imports for generator utilities.
pub mod prelude {
    pub use crate::{os_seed, Device, DeviceGenerator, ThreefryKey, ThreefryRng};
}
