use super::node::{Node, NodeStore};
use super::splitter::Splitter;
use crate::ctx::Ctx;
use crate::errors::Result;
use crate::hash::Address;
use crate::message::MessageKind;

/// Pointer to a finished node, as its parent will store it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChildRef {
    pub first_key: Vec<u8>,
    pub addr: Address,
    pub count: u64,
}

impl ChildRef {
    fn of(node: &Node) -> Self {
        ChildRef { first_key: node.key(0).to_vec(), addr: node.address(), count: node.tree_count() }
    }
}

/// Cuts a stream of items at one level into nodes.
pub(crate) struct Chunker {
    ns: NodeStore,
    kind: MessageKind,
    level: u8,
    splitter: Box<dyn Splitter>,
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
    subtrees: Vec<u64>,
    emitted: Vec<ChildRef>,
}

impl Chunker {
    pub fn new(ns: &NodeStore, kind: MessageKind, level: u8) -> Self {
        Chunker {
            splitter: ns.splitters().splitter(level),
            ns: ns.clone(),
            kind,
            level,
            keys: Vec::new(),
            values: Vec::new(),
            subtrees: Vec::new(),
            emitted: Vec::new(),
        }
    }

    pub fn append(&mut self, ctx: &Ctx, key: &[u8], value: &[u8], subtree: u64) -> Result<()> {
        self.keys.push(key.to_vec());
        self.values.push(value.to_vec());
        if self.level > 0 {
            self.subtrees.push(subtree);
        }
        let boundary = self.splitter.append(key, value);
        // internal nodes need two children or the tree would never narrow
        if boundary && (self.level == 0 || self.keys.len() >= 2) {
            self.emit(ctx)?;
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool { !self.keys.is_empty() }

    /// Start a fresh node. Only valid at a node boundary.
    pub fn reset(&mut self) {
        debug_assert!(!self.has_pending());
        self.splitter.reset();
    }

    /// Close the trailing partial node, if any.
    pub fn flush(&mut self, ctx: &Ctx) -> Result<()> {
        if self.has_pending() {
            self.emit(ctx)?;
        }
        Ok(())
    }

    pub fn take_emitted(&mut self) -> Vec<ChildRef> { std::mem::take(&mut self.emitted) }

    fn emit(&mut self, ctx: &Ctx) -> Result<()> {
        let keys: Vec<&[u8]> = self.keys.iter().map(Vec::as_slice).collect();
        let values: Vec<&[u8]> = self.values.iter().map(Vec::as_slice).collect();
        let node = self.ns.write(ctx, self.kind, &keys, &values, &self.subtrees, self.level)?;
        self.emitted.push(ChildRef::of(&node));
        self.keys.clear();
        self.values.clear();
        self.subtrees.clear();
        self.splitter.reset();
        Ok(())
    }
}

/// Stack parent levels over `refs` until a single root remains.
pub(crate) fn build_up(ctx: &Ctx, ns: &NodeStore, kind: MessageKind, mut refs: Vec<ChildRef>, mut level: u8) -> Result<Node> {
    loop {
        match refs.len() {
            0 => return Ok(Node::empty(kind)),
            1 => return ns.read(ctx, &refs[0].addr),
            _ => {}
        }
        level += 1;
        let mut ch = Chunker::new(ns, kind, level);
        for r in &refs {
            ch.append(ctx, &r.first_key, r.addr.as_bytes(), r.count)?;
        }
        ch.flush(ctx)?;
        refs = ch.take_emitted();
    }
}
