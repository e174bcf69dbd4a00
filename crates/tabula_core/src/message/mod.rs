//! Tree node payloads.
//!
//! Every node is one chunk with a fixed 32-byte header followed by packed
//! regions (LE):
//!
//! ```text
//! 0   [4] file id ("VMAP" | "AMAP")
//! 4   u16 format version
//! 6   u16 item count
//! 8   u32 key bytes length
//! 12  u32 value bytes length
//! 16  u32 subtree count bytes length
//! 20  u8  tree level
//! 21  [3] reserved
//! 24  u64 tree count
//! 32  key bytes | key offsets (count+1) x u16
//!     | value bytes | value offsets (count+1) x u16   (VMAP only)
//!     | subtree counts, uvarint each                  (level > 0)
//! ```
//!
//! Address maps store 20-byte child addresses back to back, so they carry no
//! value offsets. Decoding never copies: [`Message`] keeps the chunk and hands
//! out [`ItemArray`] views into it.

mod address_map;
mod value_map;

pub use address_map::AddressMapSerializer;
pub use value_map::ValueMapSerializer;

use crate::chunks::Chunk;
use crate::consts::{
    ADDR_LEN, FILE_ID_ADDRESS_MAP, FILE_ID_VALUE_MAP, MESSAGE_HDR_SIZE, MESSAGE_VERSION, OFFSET_SIZE,
};
use crate::ctx::Ctx;
use crate::errors::{Result, TabulaError};
use crate::hash::Address;
use crate::utils::{uvarint_decode, uvarint_encode, uvarint_len};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Leaf payload carrying arbitrary value bytes.
    ValueMap,
    /// Payload whose values are child chunk addresses.
    AddressMap,
}

impl MessageKind {
    pub fn file_id(self) -> &'static [u8; 4] {
        match self {
            MessageKind::ValueMap => FILE_ID_VALUE_MAP,
            MessageKind::AddressMap => FILE_ID_ADDRESS_MAP,
        }
    }

    fn from_file_id(id: &[u8]) -> Option<Self> {
        if id == FILE_ID_VALUE_MAP {
            Some(MessageKind::ValueMap)
        } else if id == FILE_ID_ADDRESS_MAP {
            Some(MessageKind::AddressMap)
        } else {
            None
        }
    }
}

/// Encodes one tree level's worth of items into a node payload.
pub trait Serializer {
    fn serialize(&self, keys: &[&[u8]], values: &[&[u8]], subtrees: &[u64], level: u8) -> Result<Vec<u8>>;
}

/// Borrowed view over a packed item region.
#[derive(Debug, Clone, Copy)]
pub struct ItemArray<'a> {
    items: &'a [u8],
    layout: Layout<'a>,
}

#[derive(Debug, Clone, Copy)]
enum Layout<'a> {
    Offsets(&'a [u8]),
    Fixed(usize),
}

impl<'a> ItemArray<'a> {
    pub fn len(&self) -> usize {
        match self.layout {
            Layout::Offsets(offs) => offs.len() / OFFSET_SIZE - 1,
            Layout::Fixed(width) => self.items.len() / width,
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    #[inline]
    pub fn get(&self, i: usize) -> &'a [u8] {
        match self.layout {
            Layout::Offsets(offs) => {
                let at = i * OFFSET_SIZE;
                let start = u16::from_le_bytes([offs[at], offs[at + 1]]) as usize;
                let stop = u16::from_le_bytes([offs[at + 2], offs[at + 3]]) as usize;
                &self.items[start..stop]
            }
            Layout::Fixed(width) => &self.items[i * width..(i + 1) * width],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Index of the first item >= `key`.
    pub fn search(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0usize, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.get(mid) < key { lo = mid + 1 } else { hi = mid }
        }
        lo
    }
}

/// A decoded node payload. Cloning shares the underlying chunk.
#[derive(Clone)]
pub struct Message {
    buf: Chunk,
    kind: MessageKind,
    count: usize,
    key_len: usize,
    val_len: usize,
    sub_len: usize,
    level: u8,
    tree_count: u64,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("count", &self.count)
            .field("level", &self.level)
            .field("tree_count", &self.tree_count)
            .finish()
    }
}

#[inline]
fn hdr_u32(b: &[u8], at: usize) -> usize {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]) as usize
}

fn corrupt(why: &str) -> TabulaError {
    TabulaError::Corrupt(format!("node message: {why}"))
}

impl Message {
    /// Validate the header and region bounds of a chunk.
    pub fn decode(buf: Chunk) -> Result<Self> {
        if buf.len() < MESSAGE_HDR_SIZE {
            return Err(corrupt("shorter than header"));
        }
        let kind = MessageKind::from_file_id(&buf[0..4]).ok_or(TabulaError::BadHeader)?;
        if u16::from_le_bytes([buf[4], buf[5]]) != MESSAGE_VERSION {
            return Err(TabulaError::BadHeader);
        }
        let count = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        let key_len = hdr_u32(&buf, 8);
        let val_len = hdr_u32(&buf, 12);
        let sub_len = hdr_u32(&buf, 16);
        let level = buf[20];
        let mut tc = [0u8; 8];
        tc.copy_from_slice(&buf[24..32]);
        let tree_count = u64::from_le_bytes(tc);

        let offs_len = (count + 1) * OFFSET_SIZE;
        let mut need = MESSAGE_HDR_SIZE + key_len + offs_len + val_len + sub_len;
        match kind {
            MessageKind::ValueMap => {
                if level != 0 {
                    return Err(corrupt("value map above level 0"));
                }
                need += offs_len;
            }
            MessageKind::AddressMap => {
                if val_len != count * ADDR_LEN {
                    return Err(corrupt("address region length"));
                }
            }
        }
        if need != buf.len() {
            return Err(corrupt("region lengths do not match buffer"));
        }
        if level == 0 && sub_len != 0 {
            return Err(corrupt("subtree counts in a leaf"));
        }
        let msg = Message { buf, kind, count, key_len, val_len, sub_len, level, tree_count };
        msg.check_offsets(msg.key_offs_range(), key_len)?;
        if kind == MessageKind::ValueMap {
            msg.check_offsets(msg.val_offs_range(), val_len)?;
        }
        if level > 0 {
            msg.check_subtrees()?;
        } else if tree_count != count as u64 {
            return Err(corrupt("leaf tree count differs from item count"));
        }
        Ok(msg)
    }

    /// An internal node has one varint per child, nothing after them, and
    /// they add up to the stored tree count.
    fn check_subtrees(&self) -> Result<()> {
        if self.count == 0 {
            return Err(corrupt("internal node without children"));
        }
        let start = self.val_offs_range().end;
        let mut rest = &self.buf[start..start + self.sub_len];
        let mut sum = 0u64;
        for _ in 0..self.count {
            let (c, tail) = uvarint_decode(rest).ok_or_else(|| corrupt("truncated subtree count"))?;
            sum = sum.checked_add(c).ok_or_else(|| corrupt("subtree counts overflow"))?;
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(corrupt("more subtree counts than children"));
        }
        if sum != self.tree_count {
            return Err(corrupt("subtree counts do not add up to tree count"));
        }
        Ok(())
    }

    /// Zero-item leaf of the given kind.
    pub fn empty(kind: MessageKind) -> Self {
        let mut buf = Vec::with_capacity(MESSAGE_HDR_SIZE + 2 * OFFSET_SIZE);
        buf.extend_from_slice(kind.file_id());
        buf.extend_from_slice(&MESSAGE_VERSION.to_le_bytes());
        buf.resize(MESSAGE_HDR_SIZE, 0);
        // key offsets, then value offsets for value maps
        buf.extend_from_slice(&[0u8; OFFSET_SIZE]);
        if kind == MessageKind::ValueMap {
            buf.extend_from_slice(&[0u8; OFFSET_SIZE]);
        }
        Message { buf: Chunk::from(buf), kind, count: 0, key_len: 0, val_len: 0, sub_len: 0, level: 0, tree_count: 0 }
    }

    fn check_offsets(&self, range: std::ops::Range<usize>, region: usize) -> Result<()> {
        let offs = &self.buf[range];
        let mut prev = 0usize;
        for (i, pair) in offs.chunks_exact(OFFSET_SIZE).enumerate() {
            let o = u16::from_le_bytes([pair[0], pair[1]]) as usize;
            if (i == 0 && o != 0) || o < prev || o > region {
                return Err(corrupt("offsets not monotonic"));
            }
            prev = o;
        }
        if prev != region {
            return Err(corrupt("last offset does not close region"));
        }
        Ok(())
    }

    fn key_offs_range(&self) -> std::ops::Range<usize> {
        let start = MESSAGE_HDR_SIZE + self.key_len;
        start..start + (self.count + 1) * OFFSET_SIZE
    }

    fn vals_start(&self) -> usize { self.key_offs_range().end }

    fn val_offs_range(&self) -> std::ops::Range<usize> {
        let start = self.vals_start() + self.val_len;
        match self.kind {
            MessageKind::ValueMap => start..start + (self.count + 1) * OFFSET_SIZE,
            MessageKind::AddressMap => start..start,
        }
    }

    pub fn kind(&self) -> MessageKind { self.kind }

    pub fn bytes(&self) -> &[u8] { &self.buf }

    pub fn chunk(&self) -> &Chunk { &self.buf }

    pub fn count(&self) -> usize { self.count }

    pub fn tree_level(&self) -> u8 { self.level }

    pub fn tree_count(&self) -> u64 { self.tree_count }

    pub fn keys(&self) -> ItemArray<'_> {
        let offs = self.key_offs_range();
        ItemArray {
            items: &self.buf[MESSAGE_HDR_SIZE..MESSAGE_HDR_SIZE + self.key_len],
            layout: Layout::Offsets(&self.buf[offs]),
        }
    }

    pub fn values(&self) -> ItemArray<'_> {
        let start = self.vals_start();
        let items = &self.buf[start..start + self.val_len];
        match self.kind {
            MessageKind::ValueMap => ItemArray { items, layout: Layout::Offsets(&self.buf[self.val_offs_range()]) },
            MessageKind::AddressMap => ItemArray { items, layout: Layout::Fixed(ADDR_LEN) },
        }
    }

    /// Child address at `i`; only meaningful for address maps.
    pub fn address(&self, i: usize) -> Result<Address> {
        if self.kind != MessageKind::AddressMap {
            return Err(TabulaError::Codec("value map has no addresses".into()));
        }
        Address::from_slice(self.values().get(i))
    }

    /// Per-child leaf counts; empty at level 0.
    pub fn subtrees(&self) -> Subtrees<'_> {
        let start = self.val_offs_range().end;
        Subtrees { rest: &self.buf[start..start + self.sub_len] }
    }

    /// Visit every child address in stored order, stopping at the first error.
    pub fn walk_addresses<F>(&self, ctx: &Ctx, mut visit: F) -> Result<()>
    where
        F: FnMut(&Address) -> Result<()>,
    {
        ctx.check()?;
        if self.kind != MessageKind::AddressMap {
            return Ok(());
        }
        for raw in self.values().iter() {
            visit(&Address::from_slice(raw)?)?;
        }
        Ok(())
    }
}

/// Lazy decoder over the subtree count region.
pub struct Subtrees<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Subtrees<'a> {
    type Item = u64;
    fn next(&mut self) -> Option<u64> {
        let (v, rest) = uvarint_decode(self.rest)?;
        self.rest = rest;
        Some(v)
    }
}

/// Shared encoder for both message kinds. The buffer is sized exactly before
/// anything is written.
pub(crate) fn encode(
    kind: MessageKind,
    keys: &[&[u8]],
    values: &[&[u8]],
    subtrees: &[u64],
    level: u8,
) -> Result<Vec<u8>> {
    if keys.len() != values.len() {
        return Err(TabulaError::Codec(format!("{} keys but {} values", keys.len(), values.len())));
    }
    let count = u16::try_from(keys.len())
        .map_err(|_| TabulaError::Codec(format!("{} items do not fit one node", keys.len())))?;
    if level > 0 && subtrees.len() != keys.len() {
        return Err(TabulaError::Codec(format!("{} children but {} subtree counts", keys.len(), subtrees.len())));
    }
    if level == 0 && !subtrees.is_empty() {
        return Err(TabulaError::Codec("leaf with subtree counts".into()));
    }
    if kind == MessageKind::ValueMap && level > 0 {
        return Err(TabulaError::Codec("value map above level 0".into()));
    }
    if kind == MessageKind::AddressMap && values.iter().any(|v| v.len() != ADDR_LEN) {
        return Err(TabulaError::Codec("address of wrong width".into()));
    }

    let key_len: usize = keys.iter().map(|k| k.len()).sum();
    let val_len: usize = values.iter().map(|v| v.len()).sum();
    let sub_len: usize = subtrees.iter().map(|&c| uvarint_len(c)).sum();
    let val_offsets = if kind == MessageKind::ValueMap { val_len } else { 0 };
    for (what, len) in [("key", key_len), ("value", val_offsets)] {
        if len > u16::MAX as usize {
            return Err(TabulaError::Codec(format!("{what} region of {len} bytes exceeds u16 offsets")));
        }
    }
    let offs_len = (keys.len() + 1) * OFFSET_SIZE;
    let mut total = MESSAGE_HDR_SIZE + key_len + offs_len + val_len + sub_len;
    if kind == MessageKind::ValueMap {
        total += offs_len;
    }
    let tree_count = if level > 0 { subtrees.iter().sum() } else { keys.len() as u64 };

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(kind.file_id());
    out.extend_from_slice(&MESSAGE_VERSION.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&(key_len as u32).to_le_bytes());
    out.extend_from_slice(&(val_len as u32).to_le_bytes());
    out.extend_from_slice(&(sub_len as u32).to_le_bytes());
    out.push(level);
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(&tree_count.to_le_bytes());

    write_items(&mut out, keys);
    write_items(&mut out, values);
    if kind == MessageKind::AddressMap {
        // fixed width; the offsets written by write_items are dropped
        out.truncate(out.len() - offs_len);
    }
    for &c in subtrees {
        uvarint_encode(c, &mut out);
    }
    debug_assert_eq!(out.len(), total);
    Ok(out)
}

fn write_items(out: &mut Vec<u8>, items: &[&[u8]]) {
    for it in items {
        out.extend_from_slice(it);
    }
    let mut off = 0u16;
    out.extend_from_slice(&off.to_le_bytes());
    for it in items {
        off = off.wrapping_add(it.len() as u16);
        out.extend_from_slice(&off.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(v: Vec<u8>) -> Chunk { Chunk::from(v) }

    #[test]
    fn value_map_views() {
        let keys: Vec<&[u8]> = vec![b"a", b"bb", b"ccc"];
        let vals: Vec<&[u8]> = vec![b"1", b"", b"333"];
        let buf = ValueMapSerializer.serialize(&keys, &vals, &[], 0).unwrap();
        let m = Message::decode(chunk(buf.clone())).unwrap();
        assert_eq!(m.kind(), MessageKind::ValueMap);
        assert_eq!(m.count(), 3);
        assert_eq!(m.tree_count(), 3);
        assert_eq!(m.tree_level(), 0);
        assert_eq!(m.keys().iter().collect::<Vec<_>>(), keys);
        assert_eq!(m.values().iter().collect::<Vec<_>>(), vals);
        assert_eq!(m.subtrees().count(), 0);

        // re-encoding the decoded views is byte-identical
        let k: Vec<&[u8]> = m.keys().iter().collect();
        let v: Vec<&[u8]> = m.values().iter().collect();
        assert_eq!(ValueMapSerializer.serialize(&k, &v, &[], 0).unwrap(), buf);
    }

    #[test]
    fn address_map_views() {
        let addrs = [Address::of(b"x"), Address::of(b"y")];
        let keys: Vec<&[u8]> = vec![b"k1", b"k2"];
        let vals: Vec<&[u8]> = addrs.iter().map(|a| a.as_bytes().as_slice()).collect();
        let buf = AddressMapSerializer.serialize(&keys, &vals, &[300, 5], 2).unwrap();
        let m = Message::decode(chunk(buf.clone())).unwrap();
        assert_eq!(m.kind(), MessageKind::AddressMap);
        assert_eq!(m.tree_level(), 2);
        assert_eq!(m.tree_count(), 305);
        assert_eq!(m.subtrees().collect::<Vec<_>>(), vec![300, 5]);
        assert_eq!(m.address(1).unwrap(), addrs[1]);

        let k: Vec<&[u8]> = m.keys().iter().collect();
        let v: Vec<&[u8]> = m.values().iter().collect();
        let s: Vec<u64> = m.subtrees().collect();
        assert_eq!(AddressMapSerializer.serialize(&k, &v, &s, 2).unwrap(), buf);
    }

    #[test]
    fn walk_stops_at_first_error() {
        let addrs: Vec<Address> = (0..4u8).map(|i| Address::of(&[i])).collect();
        let keys: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i]).collect();
        let k: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let v: Vec<&[u8]> = addrs.iter().map(|a| a.as_bytes().as_slice()).collect();
        let m = Message::decode(chunk(AddressMapSerializer.serialize(&k, &v, &[1, 1, 1, 1], 1).unwrap())).unwrap();

        let mut seen = Vec::new();
        m.walk_addresses(&Ctx::new(), |a| { seen.push(*a); Ok(()) }).unwrap();
        assert_eq!(seen, addrs);

        let mut visits = 0;
        let err = m.walk_addresses(&Ctx::new(), |_| {
            visits += 1;
            if visits == 2 { Err(TabulaError::Cancelled) } else { Ok(()) }
        });
        assert!(matches!(err, Err(TabulaError::Cancelled)));
        assert_eq!(visits, 2);
    }

    #[test]
    fn empty_node_roundtrip() {
        let buf = ValueMapSerializer.serialize(&[], &[], &[], 0).unwrap();
        assert_eq!(Message::empty(MessageKind::ValueMap).bytes(), &buf[..]);
        let amap = AddressMapSerializer.serialize(&[], &[], &[], 0).unwrap();
        assert_eq!(Message::empty(MessageKind::AddressMap).bytes(), &amap[..]);
        let m = Message::decode(chunk(buf)).unwrap();
        assert_eq!(m.count(), 0);
        assert!(m.keys().is_empty());
        assert_eq!(m.tree_count(), 0);
    }

    #[test]
    fn damaged_buffers_are_rejected() {
        let buf = ValueMapSerializer.serialize(&[b"a"], &[b"b"], &[], 0).unwrap();
        let mut short = buf.clone();
        short.pop();
        assert!(Message::decode(chunk(short)).is_err());
        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        assert!(matches!(Message::decode(chunk(bad_magic)), Err(TabulaError::BadHeader)));
        let mut bad_off = buf;
        // first key offset must be zero
        let off_at = MESSAGE_HDR_SIZE + 1;
        bad_off[off_at] = 1;
        assert!(Message::decode(chunk(bad_off)).is_err());
    }

    #[test]
    fn damaged_internal_nodes_are_rejected() {
        let addrs = [Address::of(b"x"), Address::of(b"y")];
        let vals: Vec<&[u8]> = addrs.iter().map(|a| a.as_bytes().as_slice()).collect();
        let keys: Vec<&[u8]> = vec![b"a", b"m"];
        let good = AddressMapSerializer.serialize(&keys, &vals, &[3, 4], 1).unwrap();
        Message::decode(chunk(good.clone())).unwrap();
        let is_corrupt = |b: Vec<u8>| matches!(Message::decode(chunk(b)), Err(TabulaError::Corrupt(_)));

        // no children, whatever the tree count says
        let mut childless = AddressMapSerializer.serialize(&[], &[], &[], 1).unwrap();
        assert!(is_corrupt(childless.clone()));
        childless[24..32].copy_from_slice(&5u64.to_le_bytes());
        assert!(is_corrupt(childless));

        let mut wrong_total = good.clone();
        wrong_total[24..32].copy_from_slice(&99u64.to_le_bytes());
        assert!(is_corrupt(wrong_total));

        // the two one-byte counts rewritten as a single two-byte varint
        let mut one_count = good.clone();
        let n = one_count.len();
        one_count[n - 2..].copy_from_slice(&[0x87, 0x00]);
        assert!(is_corrupt(one_count));

        // one child, its count rewritten as two varints
        let single = AddressMapSerializer.serialize(&keys[..1], &vals[..1], &[300], 1).unwrap();
        let mut extra = single.clone();
        let n = extra.len();
        extra[n - 2..].copy_from_slice(&[0x05, 0x02]);
        assert!(is_corrupt(extra));
        Message::decode(chunk(single)).unwrap();
    }

    #[test]
    fn search_finds_insertion_point() {
        let keys: Vec<&[u8]> = vec![b"b", b"d", b"f"];
        let buf = ValueMapSerializer.serialize(&keys, &[b"", b"", b""], &[], 0).unwrap();
        let m = Message::decode(chunk(buf)).unwrap();
        assert_eq!(m.keys().search(b"a"), 0);
        assert_eq!(m.keys().search(b"d"), 1);
        assert_eq!(m.keys().search(b"e"), 2);
        assert_eq!(m.keys().search(b"z"), 3);
    }
}
