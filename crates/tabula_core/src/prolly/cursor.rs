use super::node::{Node, NodeStore};
use crate::ctx::Ctx;
use crate::errors::Result;

/// Position on one node of a given level, with the path of ancestors that
/// leads to it. Moving sideways goes through the ancestors, so no sibling
/// links are needed in the nodes themselves.
#[derive(Debug, Clone)]
pub(crate) struct LevelCursor {
    ns: NodeStore,
    // (ancestor, child slot taken), root first
    parents: Vec<(Node, usize)>,
    node: Node,
}

impl LevelCursor {
    /// Node at `level` whose key range holds `key`.
    pub fn seek_key(ctx: &Ctx, ns: &NodeStore, root: &Node, level: u8, key: &[u8]) -> Result<Self> {
        let mut parents = Vec::new();
        let mut node = root.clone();
        while node.level() > level {
            let i = node.child_index(key);
            let child = ns.read(ctx, &node.child(i)?)?;
            parents.push((node, i));
            node = child;
        }
        Ok(LevelCursor { ns: ns.clone(), parents, node })
    }

    /// Leaf holding the `ord`-th entry and the entry's slot in it. Ordinals
    /// past the end land after the last entry of the last leaf.
    pub fn seek_ordinal(ctx: &Ctx, ns: &NodeStore, root: &Node, mut ord: u64) -> Result<(Self, usize)> {
        let mut parents = Vec::new();
        let mut node = root.clone();
        while !node.is_leaf() {
            let mut slot = node.count() - 1;
            for (i, c) in node.subtrees().enumerate() {
                if ord < c {
                    slot = i;
                    break;
                }
                if i + 1 < node.count() {
                    ord -= c;
                }
            }
            let child = ns.read(ctx, &node.child(slot)?)?;
            parents.push((node, slot));
            node = child;
        }
        let idx = (ord as usize).min(node.count());
        Ok((LevelCursor { ns: ns.clone(), parents, node }, idx))
    }

    pub fn node(&self) -> &Node { &self.node }

    /// First key of the node after this one at the same level.
    pub fn peek_next_key(&self) -> Option<&[u8]> {
        self.parents
            .iter()
            .rev()
            .find(|(p, i)| i + 1 < p.count())
            .map(|(p, i)| p.key(i + 1))
    }

    /// Move to the next node at this level. `Ok(false)` at the end.
    pub fn advance(&mut self, ctx: &Ctx) -> Result<bool> {
        let Some(depth) = self.parents.iter().rposition(|(p, i)| i + 1 < p.count()) else {
            return Ok(false);
        };
        self.parents.truncate(depth + 1);
        let (parent, slot) = &mut self.parents[depth];
        *slot += 1;
        let mut node = self.ns.read(ctx, &parent.child(*slot)?)?;
        let level = self.node.level();
        while node.level() > level {
            let child = self.ns.read(ctx, &node.child(0)?)?;
            self.parents.push((node, 0));
            node = child;
        }
        self.node = node;
        Ok(true)
    }
}
