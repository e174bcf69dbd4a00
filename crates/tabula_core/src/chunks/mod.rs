//! Content-addressed chunk storage.
//!
//! Chunks are immutable byte blobs keyed by [`Address`]. A store also keeps a
//! single head pointer (the current root value address) that writers move with
//! compare-and-set.

mod file;
pub mod manifest;
mod memory;
pub mod segment;

pub use file::FileChunkStore;
pub use memory::MemoryChunkStore;

use crate::errors::Result;
use crate::hash::Address;
use std::fmt::Debug;
use std::sync::Arc;

/// Shared immutable chunk payload.
pub type Chunk = Arc<[u8]>;

pub trait ChunkStore: Debug + Send + Sync {
    /// Fetch a chunk; `Ok(None)` when the address is unknown.
    fn get(&self, addr: &Address) -> Result<Option<Chunk>>;

    fn has(&self, addr: &Address) -> Result<bool> {
        Ok(self.get(addr)?.is_some())
    }

    /// Store bytes and return their address. Storing the same bytes twice is a no-op.
    fn put(&self, bytes: &[u8]) -> Result<Address>;

    fn get_many(&self, addrs: &[Address]) -> Result<Vec<Option<Chunk>>> {
        addrs.iter().map(|a| self.get(a)).collect()
    }

    fn put_many(&self, chunks: &[&[u8]]) -> Result<Vec<Address>> {
        chunks.iter().map(|c| self.put(c)).collect()
    }

    /// Current head root address (`Address::EMPTY` for a fresh store).
    fn root(&self) -> Result<Address>;

    /// Move the head from `expected` to `new`. Returns `false` without
    /// changing anything when the head is no longer `expected`.
    fn set_root(&self, expected: Address, new: Address) -> Result<bool>;

    /// Make every chunk put so far durable.
    fn flush(&self) -> Result<()>;
}
