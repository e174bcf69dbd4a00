use super::chunker::{build_up, ChildRef, Chunker};
use super::cursor::LevelCursor;
use super::node::{Node, NodeStore};
use crate::consts::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::ctx::Ctx;
use crate::errors::{Result, TabulaError};
use crate::hash::Address;
use crate::message::MessageKind;
use std::collections::BTreeMap;
use tracing::debug;

/// Ordered key -> `Some(value)` (upsert) / `None` (delete).
pub type Edits = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

// per level: key -> Some((value or child address, subtree count)) / None
type LevelEdits = BTreeMap<Vec<u8>, Option<(Vec<u8>, u64)>>;

/// Immutable ordered map stored as a prolly tree. Every edit returns a new
/// map; the old one stays valid and shares all untouched nodes.
#[derive(Clone, Debug)]
pub struct ProllyMap {
    ns: NodeStore,
    root: Node,
    // leaf payload kind; internal nodes are always address maps
    kind: MessageKind,
}

impl ProllyMap {
    pub fn empty(ns: &NodeStore, kind: MessageKind) -> Self {
        ProllyMap { ns: ns.clone(), root: Node::empty(kind), kind }
    }

    /// Open the tree rooted at `addr`; `Address::EMPTY` is the empty tree.
    pub fn load(ctx: &Ctx, ns: &NodeStore, kind: MessageKind, addr: Address) -> Result<Self> {
        if addr.is_empty() {
            return Ok(Self::empty(ns, kind));
        }
        let root = ns.read(ctx, &addr)?;
        if root.kind() != kind && root.is_leaf() {
            return Err(TabulaError::Corrupt(format!("tree {addr} is a {:?}, expected {kind:?}", root.kind())));
        }
        Ok(ProllyMap { ns: ns.clone(), root, kind })
    }

    /// Build a tree from entries in strictly ascending key order.
    pub fn from_sorted<I>(ctx: &Ctx, ns: &NodeStore, kind: MessageKind, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let mut ch = Chunker::new(ns, kind, 0);
        let mut prev: Option<Vec<u8>> = None;
        for (k, v) in entries {
            check_sizes(&k, Some(&v))?;
            if prev.as_ref().is_some_and(|p| p.as_slice() >= k.as_slice()) {
                return Err(TabulaError::InvalidInput("entries are not in strictly ascending key order".into()));
            }
            ch.append(ctx, &k, &v, 0)?;
            prev = Some(k);
        }
        ch.flush(ctx)?;
        let root = build_up(ctx, ns, kind, ch.take_emitted(), 0)?;
        Ok(ProllyMap { ns: ns.clone(), root, kind })
    }

    pub fn address(&self) -> Address { self.root.address() }

    pub fn kind(&self) -> MessageKind { self.kind }

    pub fn node_store(&self) -> &NodeStore { &self.ns }

    pub fn root(&self) -> &Node { &self.root }

    /// Number of levels above the leaves.
    pub fn height(&self) -> u8 { self.root.level() }

    pub fn count(&self) -> u64 { self.root.tree_count() }

    pub fn is_empty(&self) -> bool { self.count() == 0 }

    pub fn get(&self, ctx: &Ctx, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cur = LevelCursor::seek_key(ctx, &self.ns, &self.root, 0, key)?;
        let leaf = cur.node();
        let i = leaf.keys().search(key);
        if i < leaf.count() && leaf.key(i) == key {
            Ok(Some(leaf.value(i).to_vec()))
        } else {
            Ok(None)
        }
    }

    pub fn has(&self, ctx: &Ctx, key: &[u8]) -> Result<bool> { Ok(self.get(ctx, key)?.is_some()) }

    pub fn iter_all(&self, ctx: &Ctx) -> Result<MapIter> { self.iter_range(ctx, None, None) }

    /// Entries with `start <= key < end`; a missing bound is open.
    pub fn iter_range(&self, ctx: &Ctx, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<MapIter> {
        let (cur, idx) = match start {
            Some(s) => {
                let cur = LevelCursor::seek_key(ctx, &self.ns, &self.root, 0, s)?;
                let idx = cur.node().keys().search(s);
                (cur, idx)
            }
            None => LevelCursor::seek_ordinal(ctx, &self.ns, &self.root, 0)?,
        };
        let stop = match end {
            Some(e) => Stop::Key(e.to_vec()),
            None => Stop::Never,
        };
        Ok(MapIter { ctx: ctx.clone(), cur: Some(cur), idx, stop })
    }

    /// Entries at ordinal positions `start..end`.
    pub fn iter_ordinal_range(&self, ctx: &Ctx, start: u64, end: u64) -> Result<MapIter> {
        let end = end.min(self.count());
        let start = start.min(end);
        let (cur, idx) = LevelCursor::seek_ordinal(ctx, &self.ns, &self.root, start)?;
        Ok(MapIter { ctx: ctx.clone(), cur: Some(cur), idx, stop: Stop::After(end - start) })
    }

    /// Apply `edits` and return the new map. Only nodes holding edited keys
    /// (and their ancestors) are rewritten; chunking resumes sharing the old
    /// nodes at the first boundary both versions agree on.
    pub fn mutate(&self, ctx: &Ctx, edits: &Edits) -> Result<ProllyMap> {
        for (k, v) in edits {
            check_sizes(k, v.as_deref())?;
        }
        if edits.is_empty() {
            return Ok(self.clone());
        }
        let mut pending: LevelEdits =
            edits.iter().map(|(k, v)| (k.clone(), v.as_ref().map(|v| (v.clone(), 0)))).collect();
        let top = self.root.level();
        let mut level = 0u8;
        loop {
            let (emitted, consumed) = self.rewrite_level(ctx, level, &pending)?;
            if level == top {
                let mut root = build_up(ctx, &self.ns, self.kind, emitted, level)?;
                while !root.is_leaf() && root.count() == 1 {
                    root = self.ns.read(ctx, &root.child(0)?)?;
                }
                debug!(
                    edits = edits.len(),
                    old = ?self.address(),
                    new = ?root.address(),
                    count = root.tree_count(),
                    "tree mutated"
                );
                return Ok(ProllyMap { ns: self.ns.clone(), root, kind: self.kind });
            }
            pending = parent_edits(emitted, consumed);
            if pending.is_empty() {
                return Ok(self.clone());
            }
            level += 1;
        }
    }

    /// Re-chunk every stretch of `level` touched by `edits`. Returns the new
    /// nodes and the old nodes they replace, keyed by first key.
    fn rewrite_level(
        &self,
        ctx: &Ctx,
        level: u8,
        edits: &LevelEdits,
    ) -> Result<(Vec<ChildRef>, BTreeMap<Vec<u8>, (Address, u64)>)> {
        let mut ch = Chunker::new(&self.ns, self.kind, level);
        let mut consumed = BTreeMap::new();
        let mut todo = edits.iter().peekable();

        while let Some((first, _)) = todo.peek() {
            let mut cur = LevelCursor::seek_key(ctx, &self.ns, &self.root, level, first)?;
            ch.reset();
            loop {
                let node = cur.node().clone();
                if !node.is_empty() {
                    consumed.insert(node.key(0).to_vec(), (node.address(), node.tree_count()));
                }
                let limit = cur.peek_next_key().map(<[u8]>::to_vec);
                let counts: Vec<u64> = node.subtrees().collect();
                let subtree = |i: usize| counts.get(i).copied().unwrap_or(0);

                let mut i = 0;
                loop {
                    let edit = todo
                        .peek()
                        .filter(|(k, _)| limit.as_deref().map_or(true, |l| k.as_slice() < l))
                        .map(|(k, v)| (*k, *v));
                    match edit {
                        None if i < node.count() => {
                            ch.append(ctx, node.key(i), node.value(i), subtree(i))?;
                            i += 1;
                        }
                        None => break,
                        Some((k, v)) => {
                            if i < node.count() && node.key(i) < k.as_slice() {
                                ch.append(ctx, node.key(i), node.value(i), subtree(i))?;
                                i += 1;
                                continue;
                            }
                            if i < node.count() && node.key(i) == k.as_slice() {
                                i += 1;
                            }
                            if let Some((val, c)) = v {
                                ch.append(ctx, k, val, *c)?;
                            }
                            todo.next();
                        }
                    }
                }

                // re-synced: every later node is unchanged up to the next edit
                if !ch.has_pending() {
                    break;
                }
                if !cur.advance(ctx)? {
                    ch.flush(ctx)?;
                    break;
                }
            }
        }
        Ok((ch.take_emitted(), consumed))
    }

    /// Visit the address of every chunk reachable from the root, root first,
    /// stopping at the first visitor error.
    pub fn walk_addresses<F>(&self, ctx: &Ctx, mut visit: F) -> Result<()>
    where
        F: FnMut(&Address) -> Result<()>,
    {
        if self.root.address().is_empty() {
            return Ok(());
        }
        visit(&self.root.address())?;
        self.walk_children(ctx, &self.root, &mut visit)
    }

    fn walk_children<F>(&self, ctx: &Ctx, node: &Node, visit: &mut F) -> Result<()>
    where
        F: FnMut(&Address) -> Result<()>,
    {
        if node.is_leaf() {
            return Ok(());
        }
        node.message().walk_addresses(ctx, |a| visit(a))?;
        for i in 0..node.count() {
            let child = self.ns.read(ctx, &node.child(i)?)?;
            self.walk_children(ctx, &child, visit)?;
        }
        Ok(())
    }
}

pub(crate) fn check_sizes(key: &[u8], value: Option<&[u8]>) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(TabulaError::InvalidInput(format!("key of {} bytes exceeds {MAX_KEY_SIZE}", key.len())));
    }
    if let Some(v) = value {
        if v.len() > MAX_VALUE_SIZE {
            return Err(TabulaError::InvalidInput(format!("value of {} bytes exceeds {MAX_VALUE_SIZE}", v.len())));
        }
    }
    Ok(())
}

/// Separator edits for the level above: replaced nodes go away, new nodes
/// come in. A node rebuilt byte-for-byte needs no parent change.
fn parent_edits(emitted: Vec<ChildRef>, consumed: BTreeMap<Vec<u8>, (Address, u64)>) -> LevelEdits {
    let mut next: LevelEdits = BTreeMap::new();
    for r in emitted {
        next.insert(r.first_key, Some((r.addr.as_bytes().to_vec(), r.count)));
    }
    for (k, (addr, count)) in consumed {
        match next.get(&k) {
            Some(Some((a, c))) if a.as_slice() == addr.as_bytes() && *c == count => {
                next.remove(&k);
            }
            Some(_) => {}
            None => {
                next.insert(k, None);
            }
        }
    }
    next
}

enum Stop {
    Never,
    Key(Vec<u8>),
    After(u64),
}

/// Lazy forward iterator over tree entries. Once it returns `None` or an
/// error it stays exhausted.
pub struct MapIter {
    ctx: Ctx,
    cur: Option<LevelCursor>,
    idx: usize,
    stop: Stop,
}

impl Iterator for MapIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Stop::After(0) = self.stop {
            self.cur = None;
        }
        loop {
            let cur = self.cur.as_mut()?;
            let leaf = cur.node();
            if self.idx < leaf.count() {
                let key = leaf.key(self.idx);
                if let Stop::Key(end) = &self.stop {
                    if key >= end.as_slice() {
                        self.cur = None;
                        return None;
                    }
                }
                let item = (key.to_vec(), leaf.value(self.idx).to_vec());
                self.idx += 1;
                if let Stop::After(n) = &mut self.stop {
                    *n -= 1;
                }
                return Some(Ok(item));
            }
            match cur.advance(&self.ctx) {
                Ok(true) => self.idx = 0,
                Ok(false) => {
                    self.cur = None;
                    return None;
                }
                Err(e) => {
                    self.cur = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::MemoryChunkStore;
    use crate::config::{ChunkConfig, EngineConfig};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn small_ns() -> NodeStore {
        let cfg = EngineConfig {
            chunking: ChunkConfig { min_chunk_size: 64, target_chunk_size: 256, max_chunk_size: 1024 },
            ..EngineConfig::default()
        };
        NodeStore::new(Arc::new(MemoryChunkStore::new()), &cfg).unwrap()
    }

    fn key(i: u32) -> Vec<u8> { format!("k{i:06}").into_bytes() }

    fn val(i: u32) -> Vec<u8> { format!("v{i:07}").into_bytes() }

    fn build(ns: &NodeStore, n: u32) -> ProllyMap {
        ProllyMap::from_sorted(&Ctx::new(), ns, MessageKind::ValueMap, (0..n).map(|i| (key(i), val(i)))).unwrap()
    }

    fn addresses(m: &ProllyMap) -> HashSet<Address> {
        let mut out = HashSet::new();
        m.walk_addresses(&Ctx::new(), |a| { out.insert(*a); Ok(()) }).unwrap();
        out
    }

    fn collect(it: MapIter) -> Vec<(Vec<u8>, Vec<u8>)> { it.map(|r| r.unwrap()).collect() }

    #[test]
    fn lookups_on_a_multi_level_tree() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let m = build(&ns, 3000);
        assert!(m.height() >= 2, "height {}", m.height());
        assert_eq!(m.count(), 3000);
        for i in (0..3000).step_by(97) {
            assert_eq!(m.get(&ctx, &key(i)).unwrap(), Some(val(i)));
        }
        assert_eq!(m.get(&ctx, b"a").unwrap(), None);
        assert_eq!(m.get(&ctx, b"k9").unwrap(), None);
        assert_eq!(m.get(&ctx, b"k000010x").unwrap(), None);
    }

    #[test]
    fn range_and_ordinal_iteration() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let m = build(&ns, 1000);

        let all = collect(m.iter_all(&ctx).unwrap());
        assert_eq!(all.len(), 1000);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

        let mid = collect(m.iter_range(&ctx, Some(&key(100)), Some(&key(250))).unwrap());
        assert_eq!(mid.len(), 150);
        assert_eq!(mid[0].0, key(100));
        assert_eq!(mid[149].0, key(249));

        // bounds between keys
        let between = collect(m.iter_range(&ctx, Some(b"k000099x"), Some(b"k000102x")).unwrap());
        assert_eq!(between.iter().map(|e| e.0.clone()).collect::<Vec<_>>(), vec![key(100), key(101), key(102)]);

        let ord = collect(m.iter_ordinal_range(&ctx, 500, 520).unwrap());
        assert_eq!(ord.len(), 20);
        assert_eq!(ord[0].0, key(500));
        assert_eq!(ord[19].0, key(519));

        assert!(collect(m.iter_ordinal_range(&ctx, 990, 5000).unwrap()).len() == 10);
        assert!(collect(m.iter_ordinal_range(&ctx, 2000, 3000).unwrap()).is_empty());
    }

    #[test]
    fn exhausted_iterator_stays_exhausted() {
        let ns = small_ns();
        let m = build(&ns, 10);
        let mut it = m.iter_all(&Ctx::new()).unwrap();
        assert_eq!(it.by_ref().count(), 10);
        assert!(it.next().is_none());
    }

    #[test]
    fn edit_log_matches_model_and_fresh_build() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let mut rng = StdRng::seed_from_u64(0x7ab1a);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut m = ProllyMap::empty(&ns, MessageKind::ValueMap);

        for round in 0..40 {
            let mut edits = Edits::new();
            for _ in 0..rng.random_range(1..200) {
                let k = key(rng.random_range(0..4000));
                if rng.random_bool(0.3) {
                    edits.insert(k, None);
                } else {
                    edits.insert(k, Some(format!("r{round}-{}", rng.random::<u16>()).into_bytes()));
                }
            }
            for (k, v) in &edits {
                match v {
                    Some(v) => { model.insert(k.clone(), v.clone()); }
                    None => { model.remove(k); }
                }
            }
            m = m.mutate(&ctx, &edits).unwrap();

            assert_eq!(m.count(), model.len() as u64, "round {round}");
            let fresh = ProllyMap::from_sorted(&ctx, &ns, MessageKind::ValueMap, model.clone()).unwrap();
            assert_eq!(m.address(), fresh.address(), "history dependent root at round {round}");
        }
        let got = collect(m.iter_all(&ctx).unwrap());
        assert_eq!(got, model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn same_edits_same_root() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let base = build(&ns, 2000);
        let mut edits = Edits::new();
        edits.insert(key(5), None);
        edits.insert(key(1500), Some(b"changed".to_vec()));
        edits.insert(b"k0007775".to_vec(), Some(b"new".to_vec()));
        let a = base.mutate(&ctx, &edits).unwrap();
        let b = base.mutate(&ctx, &edits).unwrap();
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), base.address());
    }

    #[test]
    fn single_edit_shares_structure() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let base = build(&ns, 5000);
        let before = addresses(&base);

        let mut edits = Edits::new();
        edits.insert(key(2500), Some(b"patched".to_vec()));
        let after_map = base.mutate(&ctx, &edits).unwrap();
        let after = addresses(&after_map);

        let fresh: Vec<_> = after.difference(&before).collect();
        // one rewritten node per level, plus a possible neighbour merge
        let bound = 2 * (base.height() as usize + 1);
        assert!(!fresh.is_empty());
        assert!(fresh.len() <= bound, "{} new chunks, bound {bound}", fresh.len());
        assert!(before.len() - before.intersection(&after).count() <= bound);
    }

    #[test]
    fn noop_edit_keeps_root() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let base = build(&ns, 800);
        let mut edits = Edits::new();
        edits.insert(key(10), Some(val(10)));
        edits.insert(b"zzz".to_vec(), None);
        assert_eq!(base.mutate(&ctx, &edits).unwrap().address(), base.address());
    }

    #[test]
    fn deleting_everything_gives_the_empty_tree() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let base = build(&ns, 600);
        let edits: Edits = (0..600).map(|i| (key(i), None)).collect();
        let empty = base.mutate(&ctx, &edits).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.address(), Address::EMPTY);
        assert_eq!(empty.height(), 0);
        assert!(addresses(&empty).is_empty());
    }

    #[test]
    fn shrinking_collapses_the_root() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let base = build(&ns, 2000);
        let edits: Edits = (3..2000).map(|i| (key(i), None)).collect();
        let small = base.mutate(&ctx, &edits).unwrap();
        assert_eq!(small.count(), 3);
        assert_eq!(small.height(), 0);
        assert_eq!(small.address(), build(&ns, 3).address());
    }

    #[test]
    fn walk_visits_every_node_once_and_stops_on_error() {
        let ns = small_ns();
        let m = build(&ns, 1500);
        let mut seen = Vec::new();
        m.walk_addresses(&Ctx::new(), |a| { seen.push(*a); Ok(()) }).unwrap();
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), seen.len());
        assert_eq!(seen[0], m.address());

        let mut calls = 0;
        let r = m.walk_addresses(&Ctx::new(), |_| {
            calls += 1;
            if calls == 3 { Err(TabulaError::Cancelled) } else { Ok(()) }
        });
        assert!(r.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn cancellation_interrupts_iteration() {
        let ns = small_ns();
        let m = build(&ns, 2000);
        let ctx = Ctx::new();
        let mut it = m.iter_all(&ctx).unwrap();
        assert!(it.next().unwrap().is_ok());
        ctx.cancel();
        let rest: Vec<_> = it.collect();
        assert!(matches!(rest.last(), Some(Err(TabulaError::Cancelled))));
    }

    #[test]
    fn oversized_and_unsorted_input_rejected() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let mut edits = Edits::new();
        edits.insert(vec![0u8; MAX_KEY_SIZE + 1], Some(vec![]));
        assert!(ProllyMap::empty(&ns, MessageKind::ValueMap).mutate(&ctx, &edits).is_err());
        let unsorted = vec![(b"b".to_vec(), vec![]), (b"a".to_vec(), vec![])];
        assert!(ProllyMap::from_sorted(&ctx, &ns, MessageKind::ValueMap, unsorted).is_err());
    }

    #[test]
    fn reload_by_address() {
        let ns = small_ns();
        let ctx = Ctx::new();
        let m = build(&ns, 700);
        let back = ProllyMap::load(&ctx, &ns, MessageKind::ValueMap, m.address()).unwrap();
        assert_eq!(back.count(), 700);
        assert_eq!(back.get(&ctx, &key(699)).unwrap(), Some(val(699)));
    }
}
