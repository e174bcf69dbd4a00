// crates/tabula_core/src/consts.rs

use core::mem::size_of;

/// Length in bytes of a chunk address.
pub const ADDR_LEN: usize = 20;

pub const MAGIC_SEG: &[u8; 4] = b"TCHK";
pub const SEG_VERSION: u16 = 1;
pub const SEG_HDR_SIZE: usize = 48;

/// File identifiers of the serialized message kinds.
pub const FILE_ID_VALUE_MAP: &[u8; 4] = b"VMAP";
pub const FILE_ID_ADDRESS_MAP: &[u8; 4] = b"AMAP";
pub const FILE_ID_SCHEMA: &[u8; 4] = b"DSCH";
pub const FILE_ID_TABLE: &[u8; 4] = b"TABL";

pub const MESSAGE_VERSION: u16 = 1;
pub const SCHEMA_VERSION: u16 = 1;
pub const TABLE_VERSION: u16 = 1;

/// Fixed message header: file id, version, count, three region lengths,
/// level, padding, tree count.
pub const MESSAGE_HDR_SIZE: usize = 32;

pub const OFFSET_SIZE: usize = size_of::<u16>();
pub const MAX_VARINT_LEN: usize = 10;

/// Largest key accepted by a tree edit.
pub const MAX_KEY_SIZE: usize = 2 * 1024;
/// Largest value accepted by a tree edit.
pub const MAX_VALUE_SIZE: usize = 24 * 1024;

/// Names starting with this prefix belong to the engine.
pub const SYSTEM_PREFIX: &str = "tabula_";

const _: () = { assert!(size_of::<[u8; ADDR_LEN]>() == 20); };
const _: () = { assert!(MAX_KEY_SIZE + MAX_VALUE_SIZE < u16::MAX as usize); };
