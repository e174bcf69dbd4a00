use super::{encode, MessageKind, Serializer};
use crate::errors::Result;

/// Internal tree nodes and name -> address maps. Every value is a
/// fixed-width child address.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressMapSerializer;

impl Serializer for AddressMapSerializer {
    fn serialize(&self, keys: &[&[u8]], values: &[&[u8]], subtrees: &[u64], level: u8) -> Result<Vec<u8>> {
        encode(MessageKind::AddressMap, keys, values, subtrees, level)
    }
}
