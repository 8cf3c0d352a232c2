//! Non-cryptographic pseudo-random generator.
//!
//! George Marsaglia's multiply-with-carry generator. Used for test payloads
//! with high entropy and for jittering background polls; never for anything
//! security sensitive.

use parking_lot::Mutex;

const DEFAULT_SEED_Z: u32 = 362_436_069;
const DEFAULT_SEED_W: u32 = 521_288_629;

#[derive(Debug)]
struct Seeds {
    z: u32,
    w: u32,
}

/// Thread-safe multiply-with-carry PRNG
#[derive(Debug)]
pub struct SimpleRandom {
    seeds: Mutex<Seeds>,
}

impl SimpleRandom {
    pub fn new() -> Self {
        Self::with_seeds(DEFAULT_SEED_Z, DEFAULT_SEED_W)
    }

    /// Seeds of zero would make a half of the generator degenerate.
    pub fn with_seeds(z: u32, w: u32) -> Self {
        Self {
            seeds: Mutex::new(Seeds {
                z: if z == 0 { DEFAULT_SEED_Z } else { z },
                w: if w == 0 { DEFAULT_SEED_W } else { w },
            }),
        }
    }

    /// Next 32 pseudo-random bits
    pub fn next_u32(&self) -> u32 {
        let mut seeds = self.seeds.lock();
        Self::step(&mut seeds)
    }

    /// Uniform-ish value in `0..upper`; returns 0 when `upper` is 0
    pub fn next_below(&self, upper: u32) -> u32 {
        if upper == 0 {
            return 0;
        }
        self.next_u32() % upper
    }

    /// Random bytes with enough entropy to defeat compression
    pub fn generate_high_entropy_bytes(&self, size: usize) -> Vec<u8> {
        let mut seeds = self.seeds.lock();
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let word = Self::step(&mut seeds).to_le_bytes();
            let take = (size - out.len()).min(word.len());
            out.extend_from_slice(&word[..take]);
        }
        out
    }

    fn step(seeds: &mut Seeds) -> u32 {
        seeds.z = 36969u32
            .wrapping_mul(seeds.z & 0xffff)
            .wrapping_add(seeds.z >> 16);
        seeds.w = 18000u32
            .wrapping_mul(seeds.w & 0xffff)
            .wrapping_add(seeds.w >> 16);
        (seeds.z << 16).wrapping_add(seeds.w)
    }
}

impl Default for SimpleRandom {
    fn default() -> Self {
        Self::new()
    }
}
