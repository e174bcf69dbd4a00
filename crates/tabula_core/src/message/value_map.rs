use super::{encode, MessageKind, Serializer};
use crate::errors::Result;

/// Leaf rows: arbitrary key and value bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueMapSerializer;

impl Serializer for ValueMapSerializer {
    fn serialize(&self, keys: &[&[u8]], values: &[&[u8]], subtrees: &[u64], level: u8) -> Result<Vec<u8>> {
        encode(MessageKind::ValueMap, keys, values, subtrees, level)
    }
}
