use super::splitter::{RollingHashSplitterFactory, SplitterFactory};
use crate::chunks::{Chunk, ChunkStore};
use crate::config::{ChunkConfig, EngineConfig};
use crate::ctx::Ctx;
use crate::errors::{Result, TabulaError};
use crate::hash::Address;
use crate::message::{
    AddressMapSerializer, ItemArray, Message, MessageKind, Serializer, Subtrees, ValueMapSerializer,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// One decoded tree node together with its address.
#[derive(Clone, Debug)]
pub struct Node {
    addr: Address,
    msg: Message,
}

impl Node {
    /// The zero-item leaf standing in for an empty tree. It is never written;
    /// its address is `Address::EMPTY`.
    pub fn empty(kind: MessageKind) -> Node {
        Node { addr: Address::EMPTY, msg: Message::empty(kind) }
    }

    pub fn address(&self) -> Address { self.addr }

    pub fn message(&self) -> &Message { &self.msg }

    pub fn kind(&self) -> MessageKind { self.msg.kind() }

    pub fn level(&self) -> u8 { self.msg.tree_level() }

    pub fn is_leaf(&self) -> bool { self.level() == 0 }

    /// Items stored directly in this node.
    pub fn count(&self) -> usize { self.msg.count() }

    pub fn is_empty(&self) -> bool { self.count() == 0 }

    /// Leaf entries under this node.
    pub fn tree_count(&self) -> u64 { self.msg.tree_count() }

    pub fn keys(&self) -> ItemArray<'_> { self.msg.keys() }

    pub fn values(&self) -> ItemArray<'_> { self.msg.values() }

    pub fn key(&self, i: usize) -> &[u8] { self.msg.keys().get(i) }

    pub fn value(&self, i: usize) -> &[u8] { self.msg.values().get(i) }

    pub fn child(&self, i: usize) -> Result<Address> { self.msg.address(i) }

    pub fn subtrees(&self) -> Subtrees<'_> { self.msg.subtrees() }

    /// Child slot to descend into for `key`: the greatest separator <= key,
    /// or the first child when key sorts before every separator.
    pub fn child_index(&self, key: &[u8]) -> usize {
        let keys = self.keys();
        let i = keys.search(key);
        if i < keys.len() && keys.get(i) == key {
            i
        } else {
            i.saturating_sub(1)
        }
    }
}

struct NodeCache {
    cap: usize,
    nodes: HashMap<Address, Node>,
    order: VecDeque<Address>,
}

impl NodeCache {
    fn get(&self, addr: &Address) -> Option<Node> { self.nodes.get(addr).cloned() }

    fn insert(&mut self, node: Node) {
        if self.cap == 0 || self.nodes.contains_key(&node.addr) {
            return;
        }
        while self.nodes.len() >= self.cap {
            match self.order.pop_front() {
                Some(old) => { self.nodes.remove(&old); }
                None => break,
            }
        }
        self.order.push_back(node.addr);
        self.nodes.insert(node.addr, node);
    }
}

/// Reads and writes tree nodes through a chunk store, keeping recently used
/// nodes decoded. Cheap to clone.
#[derive(Clone)]
pub struct NodeStore {
    chunks: Arc<dyn ChunkStore>,
    cache: Arc<Mutex<NodeCache>>,
    splitters: Arc<dyn SplitterFactory>,
}

impl fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStore").field("chunks", &self.chunks).finish_non_exhaustive()
    }
}

impl NodeStore {
    /// Node store over `chunks`. Fails when the chunk sizes are unusable.
    pub fn new(chunks: Arc<dyn ChunkStore>, config: &EngineConfig) -> Result<Self> {
        Self::with_splitter(
            chunks,
            config.node_cache_capacity,
            Arc::new(RollingHashSplitterFactory::new(config.chunking.clone())),
        )
    }

    pub fn with_splitter(
        chunks: Arc<dyn ChunkStore>,
        cache_capacity: usize,
        splitters: Arc<dyn SplitterFactory>,
    ) -> Result<Self> {
        splitters.config().validate()?;
        Ok(Self::assemble(chunks, cache_capacity, splitters))
    }

    fn assemble(chunks: Arc<dyn ChunkStore>, cache_capacity: usize, splitters: Arc<dyn SplitterFactory>) -> Self {
        let cache = NodeCache { cap: cache_capacity, nodes: HashMap::new(), order: VecDeque::new() };
        Self { chunks, cache: Arc::new(Mutex::new(cache)), splitters }
    }

    /// Default engine settings over an in-memory store.
    pub fn in_memory() -> Self {
        let cfg = EngineConfig::default();
        Self::assemble(
            Arc::new(crate::chunks::MemoryChunkStore::new()),
            cfg.node_cache_capacity,
            Arc::new(RollingHashSplitterFactory::new(cfg.chunking)),
        )
    }

    pub fn chunk_store(&self) -> &Arc<dyn ChunkStore> { &self.chunks }

    pub fn splitters(&self) -> &Arc<dyn SplitterFactory> { &self.splitters }

    pub fn chunk_config(&self) -> ChunkConfig { self.splitters.config() }

    pub fn read(&self, ctx: &Ctx, addr: &Address) -> Result<Node> {
        ctx.check()?;
        if let Some(n) = self.cache.lock().unwrap_or_else(|p| p.into_inner()).get(addr) {
            return Ok(n);
        }
        let chunk = self.chunks.get(addr)?.ok_or(TabulaError::ChunkNotFound(*addr))?;
        let node = Node { addr: *addr, msg: Message::decode(chunk)? };
        trace!(addr = ?addr, level = node.level(), items = node.count(), "node loaded");
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).insert(node.clone());
        Ok(node)
    }

    /// Serialize and store one node. Internal levels are always address maps;
    /// leaves use `kind`.
    pub fn write(
        &self,
        ctx: &Ctx,
        kind: MessageKind,
        keys: &[&[u8]],
        values: &[&[u8]],
        subtrees: &[u64],
        level: u8,
    ) -> Result<Node> {
        ctx.check()?;
        let bytes = if level > 0 || kind == MessageKind::AddressMap {
            AddressMapSerializer.serialize(keys, values, subtrees, level)?
        } else {
            ValueMapSerializer.serialize(keys, values, subtrees, level)?
        };
        let addr = self.chunks.put(&bytes)?;
        let node = Node { addr, msg: Message::decode(Chunk::from(bytes))? };
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).insert(node.clone());
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::MemoryChunkStore;

    #[test]
    fn write_then_read_through_cache_and_store() {
        let store = Arc::new(MemoryChunkStore::new());
        let ns = NodeStore::new(store.clone(), &EngineConfig::default()).unwrap();
        let ctx = Ctx::new();
        let n = ns.write(&ctx, MessageKind::ValueMap, &[b"a", b"b"], &[b"1", b"2"], &[], 0).unwrap();
        assert_eq!(n.tree_count(), 2);

        // a second store instance has a cold cache
        let cold = NodeStore::new(store, &EngineConfig::default()).unwrap();
        let back = cold.read(&ctx, &n.address()).unwrap();
        assert_eq!(back.key(1), b"b");
        assert_eq!(back.value(0), b"1");
    }

    #[test]
    fn oversized_chunk_config_is_refused_up_front() {
        let mut cfg = EngineConfig::default();
        cfg.chunking.max_chunk_size = 64 * 1024;
        let err = NodeStore::new(Arc::new(MemoryChunkStore::new()), &cfg).unwrap_err();
        assert!(matches!(err, TabulaError::InvalidInput(_)));

        cfg.chunking = ChunkConfig { min_chunk_size: 0, ..ChunkConfig::default() };
        assert!(NodeStore::new(Arc::new(MemoryChunkStore::new()), &cfg).is_err());
    }

    #[test]
    fn missing_chunk_is_reported() {
        let ns = NodeStore::in_memory();
        let err = ns.read(&Ctx::new(), &Address::of(b"nope")).unwrap_err();
        assert!(matches!(err, TabulaError::ChunkNotFound(_)));
    }

    #[test]
    fn cancelled_ctx_stops_reads() {
        let ns = NodeStore::in_memory();
        let ctx = Ctx::new();
        let n = ns.write(&ctx, MessageKind::ValueMap, &[b"a"], &[b"1"], &[], 0).unwrap();
        ctx.cancel();
        assert!(matches!(ns.read(&ctx, &n.address()), Err(TabulaError::Cancelled)));
    }

    #[test]
    fn child_index_picks_greatest_separator() {
        let ns = NodeStore::in_memory();
        let a = Address::of(b"x");
        let n = ns
            .write(&Ctx::new(), MessageKind::ValueMap, &[b"b", b"d"], &[a.as_bytes(), a.as_bytes()], &[1, 1], 1)
            .unwrap();
        assert_eq!(n.child_index(b"a"), 0);
        assert_eq!(n.child_index(b"b"), 0);
        assert_eq!(n.child_index(b"c"), 0);
        assert_eq!(n.child_index(b"d"), 1);
        assert_eq!(n.child_index(b"z"), 1);
    }

    #[test]
    fn cache_evicts_oldest() {
        let mut c = NodeCache { cap: 2, nodes: HashMap::new(), order: VecDeque::new() };
        let ns = NodeStore::in_memory();
        let ctx = Ctx::new();
        let nodes: Vec<Node> = (0..3u8)
            .map(|i| ns.write(&ctx, MessageKind::ValueMap, &[&[i]], &[b""], &[], 0).unwrap())
            .collect();
        for n in &nodes {
            c.insert(n.clone());
        }
        assert!(c.get(&nodes[0].address()).is_none());
        assert!(c.get(&nodes[2].address()).is_some());
    }
}
