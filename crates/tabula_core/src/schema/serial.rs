//! `DSCH` schema messages.
//!
//! ```text
//! "DSCH" u16 version u16 reserved
//! u16 ncols, per column:
//!     str name, opt-str sql_type, opt-str default, opt-str comment,
//!     u16 display_order, u64 tag, u8 encoding, u8 flags
//! index clustered
//! u16 nidx, index * nidx
//! u16 nchecks, per check: str name, str expression, u8 enforced
//!
//! index   := str name, u16-list columns, u16-list key_columns,
//!            u16-list value_columns, u8 flags (1 unique, 2 system), opt-str comment
//! str     := u16 len + utf-8
//! opt-str := u8 present + str
//! u16-list:= u16 len + u16 * len
//! ```
//! All integers little-endian.

use super::{Check, Column, ColumnFlags, Index, Schema};
use crate::consts::{FILE_ID_SCHEMA, SCHEMA_VERSION};
use crate::errors::{Result, TabulaError};
use crate::tuple::Encoding;
use crate::utils::{eof, read_opt_str, read_str, read_u16, read_u64, write_opt_str, write_str, write_u16, write_u64};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

const INDEX_UNIQUE: u8 = 1;
const INDEX_SYSTEM: u8 = 2;

fn len16(n: usize, what: &str) -> Result<u16> {
    u16::try_from(n).map_err(|_| TabulaError::Codec(format!("too many {what}: {n}")))
}

fn write_list(out: &mut Vec<u8>, list: &[u16]) -> Result<()> {
    write_u16(out, len16(list.len(), "index columns")?)?;
    for &p in list {
        write_u16(out, p)?;
    }
    Ok(())
}

fn read_list<R: Read>(r: &mut R) -> Result<Vec<u16>> {
    let n = read_u16(r).map_err(eof)?;
    (0..n).map(|_| read_u16(r).map_err(eof)).collect()
}

fn write_index(out: &mut Vec<u8>, idx: &Index) -> Result<()> {
    write_str(out, &idx.name)?;
    write_list(out, &idx.columns)?;
    write_list(out, &idx.key_columns)?;
    write_list(out, &idx.value_columns)?;
    let mut flags = 0u8;
    if idx.unique {
        flags |= INDEX_UNIQUE;
    }
    if idx.system_defined {
        flags |= INDEX_SYSTEM;
    }
    out.write_u8(flags)?;
    write_opt_str(out, idx.comment.as_deref())
}

fn read_index<R: Read>(r: &mut R) -> Result<Index> {
    let name = read_str(r)?;
    let columns = read_list(r)?;
    let key_columns = read_list(r)?;
    let value_columns = read_list(r)?;
    let flags = r.read_u8().map_err(eof)?;
    if flags & !(INDEX_UNIQUE | INDEX_SYSTEM) != 0 {
        return Err(TabulaError::Corrupt(format!("index {name}: unknown flags {flags:#x}")));
    }
    let comment = read_opt_str(r)?;
    Ok(Index {
        name,
        columns,
        key_columns,
        value_columns,
        unique: flags & INDEX_UNIQUE != 0,
        system_defined: flags & INDEX_SYSTEM != 0,
        comment,
    })
}

pub fn encode_schema(s: &Schema) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64 + s.columns.len() * 32);
    out.extend_from_slice(FILE_ID_SCHEMA);
    write_u16(&mut out, SCHEMA_VERSION)?;
    write_u16(&mut out, 0)?;

    write_u16(&mut out, len16(s.columns.len(), "columns")?)?;
    for c in &s.columns {
        write_str(&mut out, &c.name)?;
        write_opt_str(&mut out, c.sql_type.as_deref())?;
        write_opt_str(&mut out, c.default.as_deref())?;
        write_opt_str(&mut out, c.comment.as_deref())?;
        write_u16(&mut out, c.display_order)?;
        write_u64(&mut out, c.tag)?;
        out.write_u8(c.encoding as u8)?;
        out.write_u8(c.flags.bits())?;
    }

    write_index(&mut out, &s.clustered)?;
    write_u16(&mut out, len16(s.indexes.len(), "indexes")?)?;
    for idx in &s.indexes {
        write_index(&mut out, idx)?;
    }

    write_u16(&mut out, len16(s.checks.len(), "checks")?)?;
    for c in &s.checks {
        write_str(&mut out, &c.name)?;
        write_str(&mut out, &c.expression)?;
        out.write_u8(c.enforced as u8)?;
    }
    Ok(out)
}

/// Decode and validate a schema message.
pub fn decode_schema(buf: &[u8]) -> Result<Schema> {
    if buf.len() < 8 || &buf[0..4] != FILE_ID_SCHEMA {
        return Err(TabulaError::BadHeader);
    }
    let mut r = Cursor::new(&buf[4..]);
    if read_u16(&mut r).map_err(eof)? != SCHEMA_VERSION {
        return Err(TabulaError::BadHeader);
    }
    let _reserved = read_u16(&mut r).map_err(eof)?;

    let ncols = read_u16(&mut r).map_err(eof)?;
    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        let name = read_str(&mut r)?;
        let sql_type = read_opt_str(&mut r)?;
        let default = read_opt_str(&mut r)?;
        let comment = read_opt_str(&mut r)?;
        let display_order = read_u16(&mut r).map_err(eof)?;
        let tag = read_u64(&mut r).map_err(eof)?;
        let encoding = Encoding::from_u8(r.read_u8().map_err(eof)?)?;
        let raw = r.read_u8().map_err(eof)?;
        let flags = ColumnFlags::from_bits(raw)
            .ok_or_else(|| TabulaError::Corrupt(format!("column {name}: unknown flags {raw:#x}")))?;
        columns.push(Column { name, sql_type, default, comment, display_order, tag, encoding, flags });
    }

    let clustered = read_index(&mut r)?;
    let nidx = read_u16(&mut r).map_err(eof)?;
    let mut indexes = Vec::with_capacity(nidx as usize);
    for _ in 0..nidx {
        indexes.push(read_index(&mut r)?);
    }

    let nchecks = read_u16(&mut r).map_err(eof)?;
    let mut checks = Vec::with_capacity(nchecks as usize);
    for _ in 0..nchecks {
        let name = read_str(&mut r)?;
        let expression = read_str(&mut r)?;
        let enforced = match r.read_u8().map_err(eof)? {
            0 => false,
            1 => true,
            b => return Err(TabulaError::Corrupt(format!("check {name}: bad enforced flag {b}"))),
        };
        checks.push(Check { name, expression, enforced });
    }
    if (r.position() as usize) != buf.len() - 4 {
        return Err(TabulaError::Corrupt("trailing bytes after schema".into()));
    }
    Schema::from_parts(columns, clustered, indexes, checks)
}
