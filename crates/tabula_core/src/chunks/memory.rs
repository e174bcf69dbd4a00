use super::{Chunk, ChunkStore};
use crate::errors::Result;
use crate::hash::Address;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Process-local store, used by tests and scratch sessions.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<Address, Chunk>>,
    root: Mutex<Address>,
}

impl MemoryChunkStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize {
        self.chunks.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl ChunkStore for MemoryChunkStore {
    fn get(&self, addr: &Address) -> Result<Option<Chunk>> {
        let map = self.chunks.read().unwrap_or_else(|p| p.into_inner());
        Ok(map.get(addr).cloned())
    }

    fn put(&self, bytes: &[u8]) -> Result<Address> {
        let addr = Address::of(bytes);
        let mut map = self.chunks.write().unwrap_or_else(|p| p.into_inner());
        map.entry(addr).or_insert_with(|| Chunk::from(bytes));
        Ok(addr)
    }

    fn root(&self) -> Result<Address> {
        Ok(*self.root.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn set_root(&self, expected: Address, new: Address) -> Result<bool> {
        let mut root = self.root.lock().unwrap_or_else(|p| p.into_inner());
        if *root != expected {
            return Ok(false);
        }
        *root = new;
        Ok(true)
    }

    fn flush(&self) -> Result<()> { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent() {
        let s = MemoryChunkStore::new();
        let a = s.put(b"hello").unwrap();
        let b = s.put(b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(s.len(), 1);
        assert_eq!(&*s.get(&a).unwrap().unwrap(), b"hello");
        assert!(s.get(&Address::of(b"nope")).unwrap().is_none());
    }

    #[test]
    fn root_compare_and_set() {
        let s = MemoryChunkStore::new();
        let r1 = Address::of(b"r1");
        assert!(s.set_root(Address::EMPTY, r1).unwrap());
        assert!(!s.set_root(Address::EMPTY, Address::of(b"r2")).unwrap());
        assert_eq!(s.root().unwrap(), r1);
    }
}
