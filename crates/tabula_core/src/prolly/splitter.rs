//! Node boundary decisions.
//!
//! A splitter sees the items of one node in order and says after which item
//! the node ends. The decision may only depend on the items appended since the
//! last boundary, which is what keeps trees independent of edit history.

use crate::config::ChunkConfig;
use std::fmt::Debug;
use xxhash_rust::xxh3::xxh3_64_with_seed;

pub trait Splitter: Send {
    /// Feed one item; `true` means the current node ends after it.
    fn append(&mut self, key: &[u8], value: &[u8]) -> bool;

    /// Start a new node.
    fn reset(&mut self);
}

/// Creates one splitter per tree level.
pub trait SplitterFactory: Debug + Send + Sync {
    fn splitter(&self, level: u8) -> Box<dyn Splitter>;

    fn config(&self) -> ChunkConfig;
}

// Weibull shape; larger values give node sizes tighter around the target.
const K: f64 = 4.0;
// per-item framing on top of key and value bytes (two u16 offsets)
const ITEM_OVERHEAD: u32 = 4;

/// Hashes each key (seeded by level) and splits when the hash falls under a
/// probability that grows with the node's size, following the Weibull CDF
/// centred on the target size. Hard bounds come from [`ChunkConfig`].
#[derive(Debug, Clone)]
pub struct RollingHashSplitter {
    salt: u64,
    size: u32,
    min: u32,
    target: f64,
    max: u32,
}

impl RollingHashSplitter {
    pub fn new(level: u8, cfg: &ChunkConfig) -> Self {
        Self {
            salt: level as u64,
            size: 0,
            min: cfg.min_chunk_size,
            target: cfg.target_chunk_size as f64,
            max: cfg.max_chunk_size,
        }
    }

    fn cdf(&self, x: f64) -> f64 {
        1.0 - (-(x / self.target).powf(K)).exp()
    }

    /// Chance of a boundary while the node grows from `start` to `end` bytes,
    /// given that none happened before `start`.
    fn boundary_probability(&self, start: u32, end: u32) -> f64 {
        let p_start = self.cdf(start as f64);
        let p_end = self.cdf(end as f64);
        if p_start >= 1.0 {
            return 1.0;
        }
        (p_end - p_start) / (1.0 - p_start)
    }
}

impl Splitter for RollingHashSplitter {
    fn append(&mut self, key: &[u8], value: &[u8]) -> bool {
        let start = self.size;
        self.size = self
            .size
            .saturating_add(key.len() as u32 + value.len() as u32 + ITEM_OVERHEAD);
        if self.size < self.min {
            return false;
        }
        if self.size >= self.max {
            return true;
        }
        let h = xxh3_64_with_seed(key, self.salt);
        let p = self.boundary_probability(start, self.size);
        (h as f64) < p * (u64::MAX as f64)
    }

    fn reset(&mut self) { self.size = 0; }
}

#[derive(Debug, Clone)]
pub struct RollingHashSplitterFactory {
    cfg: ChunkConfig,
}

impl RollingHashSplitterFactory {
    pub fn new(cfg: ChunkConfig) -> Self { Self { cfg } }
}

impl SplitterFactory for RollingHashSplitterFactory {
    fn splitter(&self, level: u8) -> Box<dyn Splitter> {
        Box::new(RollingHashSplitter::new(level, &self.cfg))
    }

    fn config(&self) -> ChunkConfig { self.cfg.clone() }
}
