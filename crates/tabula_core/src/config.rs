//! Engine tuning knobs. Everything has a default in code; a JSON file may
//! override any subset of fields.

use crate::errors::{Result, TabulaError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Nodes never split below this many payload bytes.
    pub min_chunk_size: u32,
    /// Expected node payload size.
    pub target_chunk_size: u32,
    /// Nodes always split once they reach this many payload bytes.
    pub max_chunk_size: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { min_chunk_size: 512, target_chunk_size: 4096, max_chunk_size: 16 * 1024 }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0
            || self.min_chunk_size > self.target_chunk_size
            || self.target_chunk_size > self.max_chunk_size
        {
            return Err(TabulaError::InvalidInput(format!(
                "chunk sizes must satisfy 0 < min <= target <= max, got {}/{}/{}",
                self.min_chunk_size, self.target_chunk_size, self.max_chunk_size
            )));
        }
        // key/value offsets are u16
        if self.max_chunk_size > 32 * 1024 {
            return Err(TabulaError::InvalidInput(format!(
                "max_chunk_size {} exceeds 32KiB", self.max_chunk_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub max_rows_per_partition: u64,
    /// Tables smaller than this are scanned as one partition.
    pub min_rows_per_partition: u64,
    /// Partitions requested per worker.
    pub multiplier: u64,
    /// Worker count; `None` means available parallelism.
    pub workers: Option<usize>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self { max_rows_per_partition: 32 * 1024, min_rows_per_partition: 1024, multiplier: 2, workers: None }
    }
}

impl PartitionConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunking: ChunkConfig,
    pub partition: PartitionConfig,
    /// Decoded nodes kept by a node store.
    pub node_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { chunking: ChunkConfig::default(), partition: PartitionConfig::default(), node_cache_capacity: 4096 }
    }
}

impl EngineConfig {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let s = fs::read_to_string(path)?;
        let cfg: EngineConfig = serde_json::from_str(&s)?;
        cfg.chunking.validate()?;
        Ok(cfg)
    }
}
