//! Typed field values and their order-preserving byte encoding.
//!
//! Each field is a type tag followed by a payload chosen so that comparing
//! encoded bytes gives the same answer as comparing values of one type:
//! integers are big-endian with the sign bit flipped, floats use the usual
//! sign-magnitude flip, strings escape `0x00` as `0x00 0xff` and end with
//! `0x00 0x00`. A tuple is its fields concatenated, so tuples sort
//! field by field.

use crate::errors::{Result, TabulaError};
use std::cmp::Ordering;
use std::fmt;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_UINT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;

const SIGN: u64 = 1 << 63;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Integer view used by auto-increment.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Int(i) if i >= 0 => Some(i as u64),
            Value::Uint(u) => Some(u),
            _ => None,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(TAG_NULL),
            Value::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            Value::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&((*i as u64) ^ SIGN).to_be_bytes());
            }
            Value::Uint(u) => {
                out.push(TAG_UINT);
                out.extend_from_slice(&u.to_be_bytes());
            }
            Value::Float(f) => {
                out.push(TAG_FLOAT);
                let bits = f.to_bits();
                let ordered = if bits & SIGN != 0 { !bits } else { bits ^ SIGN };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Value::Text(s) => {
                out.push(TAG_TEXT);
                escape_into(s.as_bytes(), out);
            }
            Value::Bytes(b) => {
                out.push(TAG_BYTES);
                escape_into(b, out);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

/// Same ordering as the encoded form.
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(encode(std::slice::from_ref(self)).cmp(&encode(std::slice::from_ref(other))))
    }
}

fn escape_into(b: &[u8], out: &mut Vec<u8>) {
    for &c in b {
        out.push(c);
        if c == 0 {
            out.push(0xff);
        }
    }
    out.extend_from_slice(&[0, 0]);
}

pub fn encode(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 9);
    for v in values {
        v.encode_into(&mut out);
    }
    out
}

pub fn decode(mut b: &[u8]) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    while !b.is_empty() {
        let (v, rest) = decode_one(b)?;
        out.push(v);
        b = rest;
    }
    Ok(out)
}

fn bad(why: &str) -> TabulaError { TabulaError::Corrupt(format!("tuple: {why}")) }

fn fixed8(b: &[u8]) -> Result<(u64, &[u8])> {
    if b.len() < 8 {
        return Err(bad("truncated number"));
    }
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    Ok((u64::from_be_bytes(a), &b[8..]))
}

fn unescape(mut b: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    loop {
        match b {
            [0, 0, rest @ ..] => return Ok((out, rest)),
            [0, 0xff, rest @ ..] => {
                out.push(0);
                b = rest;
            }
            [0, ..] => return Err(bad("bad escape")),
            [c, rest @ ..] => {
                out.push(*c);
                b = rest;
            }
            [] => return Err(bad("unterminated string")),
        }
    }
}

fn decode_one(b: &[u8]) -> Result<(Value, &[u8])> {
    let (&tag, rest) = b.split_first().ok_or_else(|| bad("empty field"))?;
    match tag {
        TAG_NULL => Ok((Value::Null, rest)),
        TAG_BOOL => match rest.split_first() {
            Some((0, r)) => Ok((Value::Bool(false), r)),
            Some((1, r)) => Ok((Value::Bool(true), r)),
            _ => Err(bad("bad bool")),
        },
        TAG_INT => {
            let (u, r) = fixed8(rest)?;
            Ok((Value::Int((u ^ SIGN) as i64), r))
        }
        TAG_UINT => {
            let (u, r) = fixed8(rest)?;
            Ok((Value::Uint(u), r))
        }
        TAG_FLOAT => {
            let (u, r) = fixed8(rest)?;
            let bits = if u & SIGN != 0 { u ^ SIGN } else { !u };
            Ok((Value::Float(f64::from_bits(bits)), r))
        }
        TAG_TEXT => {
            let (raw, r) = unescape(rest)?;
            let s = String::from_utf8(raw).map_err(|_| bad("text is not utf-8"))?;
            Ok((Value::Text(s), r))
        }
        TAG_BYTES => {
            let (raw, r) = unescape(rest)?;
            Ok((Value::Bytes(raw), r))
        }
        t => Err(bad(&format!("unknown tag {t:#x}"))),
    }
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    Int = 1,
    Uint = 2,
    Float = 3,
    Text = 4,
    Bytes = 5,
    Bool = 6,
}

impl Encoding {
    pub fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            1 => Encoding::Int,
            2 => Encoding::Uint,
            3 => Encoding::Float,
            4 => Encoding::Text,
            5 => Encoding::Bytes,
            6 => Encoding::Bool,
            other => return Err(TabulaError::Corrupt(format!("unknown column encoding {other}"))),
        })
    }

    /// Infer from an SQL type name such as `bigint`, `varchar(20)` or `blob`.
    pub fn from_sql_type(t: &str) -> Result<Self> {
        let t = t.trim().to_ascii_lowercase();
        let base = t.split(['(', ' ']).next().unwrap_or("");
        let unsigned = t.contains("unsigned");
        Ok(match base {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" if unsigned => Encoding::Uint,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => Encoding::Int,
            "bool" | "boolean" | "bit" => Encoding::Bool,
            "float" | "double" | "real" | "decimal" => Encoding::Float,
            "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum" | "json" => Encoding::Text,
            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => Encoding::Bytes,
            _ => return Err(TabulaError::InvalidSchema(format!("unsupported sql type {t:?}"))),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Int => "int",
            Encoding::Uint => "uint",
            Encoding::Float => "float",
            Encoding::Text => "text",
            Encoding::Bytes => "bytes",
            Encoding::Bool => "bool",
        }
    }

    pub fn is_integer(self) -> bool { matches!(self, Encoding::Int | Encoding::Uint) }

    /// Whether `v` may be stored in a column of this encoding (NULL always may).
    pub fn accepts(self, v: &Value) -> bool {
        matches!(
            (self, v),
            (_, Value::Null)
                | (Encoding::Int, Value::Int(_))
                | (Encoding::Uint, Value::Uint(_))
                | (Encoding::Float, Value::Float(_))
                | (Encoding::Text, Value::Text(_))
                | (Encoding::Bytes, Value::Bytes(_))
                | (Encoding::Bool, Value::Bool(_))
        )
    }

    /// Parse a literal (defaults, command-line input). `NULL` in any case is null.
    pub fn parse(self, s: &str) -> Result<Value> {
        if s.eq_ignore_ascii_case("null") {
            return Ok(Value::Null);
        }
        let err = || TabulaError::InvalidInput(format!("{s:?} is not a valid {}", self.name()));
        Ok(match self {
            Encoding::Int => Value::Int(s.trim().parse().map_err(|_| err())?),
            Encoding::Uint => Value::Uint(s.trim().parse().map_err(|_| err())?),
            Encoding::Float => Value::Float(s.trim().parse().map_err(|_| err())?),
            Encoding::Bool => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => return Err(err()),
            },
            Encoding::Text => Value::Text(s.to_string()),
            Encoding::Bytes => {
                let h = s.strip_prefix("0x").unwrap_or(s);
                Value::Bytes(hex::decode(h).map_err(|_| err())?)
            }
        })
    }
}
