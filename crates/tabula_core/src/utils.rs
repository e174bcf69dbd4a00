use crate::errors::{Result, TabulaError};
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub fn crc32(data: &[u8]) -> u32 { crc32fast::hash(data) }

pub fn uvarint_encode(mut n: u64, out: &mut Vec<u8>) {
    while n >= 0x80 {
        out.push((n as u8) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

/// Decode one unsigned varint, returning the value and the rest of the input.
/// Truncated or overlong input yields `None`.
pub fn uvarint_decode(mut data: &[u8]) -> Option<(u64, &[u8])> {
    let mut x = 0u64; let mut s = 0u32;
    for _ in 0..crate::consts::MAX_VARINT_LEN {
        let (&b, rest) = data.split_first()?;
        data = rest;
        if b < 0x80 { return Some((x | ((b as u64) << s), data)); }
        x |= ((b & 0x7F) as u64) << s; s += 7;
    }
    None
}

pub fn uvarint_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 0x80 { n >>= 7; len += 1; }
    len
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> { w.write_u64::<LE>(v) }
pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> { w.write_u32::<LE>(v) }
pub fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> { w.write_u16::<LE>(v) }
pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> { r.read_u64::<LE>() }
pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> { r.read_u32::<LE>() }
pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> { r.read_u16::<LE>() }

/// Length-prefixed UTF-8 string (u16 length).
pub fn write_str<W: Write>(w: &mut W, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| TabulaError::Codec(format!("string too long: {} bytes", s.len())))?;
    write_u16(w, len)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u16(r).map_err(eof)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(eof)?;
    String::from_utf8(buf).map_err(|e| TabulaError::Corrupt(format!("invalid utf-8: {e}")))
}

pub fn write_opt_str<W: Write>(w: &mut W, s: Option<&str>) -> Result<()> {
    match s {
        Some(s) => { w.write_u8(1)?; write_str(w, s) }
        None => { w.write_u8(0)?; Ok(()) }
    }
}

pub fn read_opt_str<R: Read>(r: &mut R) -> Result<Option<String>> {
    match r.read_u8().map_err(eof)? {
        0 => Ok(None),
        1 => Ok(Some(read_str(r)?)),
        b => Err(TabulaError::Corrupt(format!("bad option tag {b}"))),
    }
}

/// Short reads inside a chunk mean the chunk is damaged, not that IO failed.
pub fn eof(e: io::Error) -> TabulaError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TabulaError::Corrupt("unexpected end of message".into())
    } else {
        TabulaError::Io(e)
    }
}
