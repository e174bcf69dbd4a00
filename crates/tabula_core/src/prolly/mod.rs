//! Prolly trees: content-chunked persistent search trees.
//!
//! Leaves hold sorted key/value pairs, internal nodes hold the first key and
//! address of each child plus the child's entry count. Node boundaries come
//! from a [`Splitter`], so equal contents give equal trees no matter which
//! edits produced them.

mod chunker;
mod cursor;
mod map;
mod node;
pub mod splitter;

pub(crate) use map::check_sizes;
pub use map::{Edits, MapIter, ProllyMap};
pub use node::{Node, NodeStore};
pub use splitter::{RollingHashSplitter, RollingHashSplitterFactory, Splitter, SplitterFactory};
