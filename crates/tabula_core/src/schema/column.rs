use crate::errors::Result;
use crate::tuple::{Encoding, Value};
use std::collections::HashSet;

/// Bit set of column properties, stored as one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ColumnFlags(u8);

impl ColumnFlags {
    pub const PRIMARY_KEY: ColumnFlags = ColumnFlags(1);
    pub const NULLABLE: ColumnFlags = ColumnFlags(1 << 1);
    pub const AUTO_INCREMENT: ColumnFlags = ColumnFlags(1 << 2);
    pub const HIDDEN: ColumnFlags = ColumnFlags(1 << 3);
    pub const GENERATED: ColumnFlags = ColumnFlags(1 << 4);
    pub const VIRTUAL: ColumnFlags = ColumnFlags(1 << 5);

    const ALL: u8 = 0x3f;

    pub fn bits(self) -> u8 { self.0 }

    /// `None` if unknown bits are set.
    pub fn from_bits(b: u8) -> Option<Self> {
        if b & !Self::ALL != 0 { None } else { Some(ColumnFlags(b)) }
    }

    pub fn contains(self, other: ColumnFlags) -> bool { self.0 & other.0 == other.0 }

    pub fn set(&mut self, other: ColumnFlags, on: bool) {
        if on { self.0 |= other.0 } else { self.0 &= !other.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: Option<String>,
    /// Literal default, parsed with the column's encoding.
    pub default: Option<String>,
    pub comment: Option<String>,
    pub display_order: u16,
    /// Stable identity; survives renames and reorders.
    pub tag: u64,
    pub encoding: Encoding,
    pub flags: ColumnFlags,
}

impl Column {
    /// A nullable, non-key column.
    pub fn new(name: impl Into<String>, tag: u64, encoding: Encoding) -> Self {
        let mut flags = ColumnFlags::default();
        flags.set(ColumnFlags::NULLABLE, true);
        Column {
            name: name.into(),
            sql_type: None,
            default: None,
            comment: None,
            display_order: 0,
            tag,
            encoding,
            flags,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.flags.set(ColumnFlags::PRIMARY_KEY, true);
        self.flags.set(ColumnFlags::NULLABLE, false);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.flags.set(ColumnFlags::NULLABLE, false);
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.flags.set(ColumnFlags::AUTO_INCREMENT, true);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.flags.set(ColumnFlags::HIDDEN, true);
        self
    }

    pub fn with_sql_type(mut self, t: impl Into<String>) -> Self {
        self.sql_type = Some(t.into());
        self
    }

    pub fn with_default(mut self, d: impl Into<String>) -> Self {
        self.default = Some(d.into());
        self
    }

    pub fn with_comment(mut self, c: impl Into<String>) -> Self {
        self.comment = Some(c.into());
        self
    }

    pub fn is_primary_key(&self) -> bool { self.flags.contains(ColumnFlags::PRIMARY_KEY) }

    pub fn is_nullable(&self) -> bool { self.flags.contains(ColumnFlags::NULLABLE) }

    pub fn is_auto_increment(&self) -> bool { self.flags.contains(ColumnFlags::AUTO_INCREMENT) }

    /// Value a new row gets when the column is not given.
    pub fn default_value(&self) -> Result<Value> {
        match &self.default {
            Some(d) => self.encoding.parse(d),
            None => Ok(Value::Null),
        }
    }
}

// tags stay clear of the top bits so they print compactly and leave room
// for engine-reserved ranges
const TAG_MASK: u64 = (1 << 50) - 1;

/// Deterministic tag for a new column, re-rolled while it collides with `taken`.
pub fn generate_tag(table: &str, column: &str, sql_type: &str, taken: &HashSet<u64>) -> u64 {
    let mut h = blake3::Hasher::new();
    h.update(table.as_bytes());
    h.update(&[0]);
    h.update(column.as_bytes());
    h.update(&[0]);
    h.update(sql_type.as_bytes());
    let mut seed = *h.finalize().as_bytes();
    loop {
        let mut b = [0u8; 8];
        b.copy_from_slice(&seed[..8]);
        let tag = u64::from_le_bytes(b) & TAG_MASK;
        if !taken.contains(&tag) {
            return tag;
        }
        seed = *blake3::hash(&seed).as_bytes();
    }
}
