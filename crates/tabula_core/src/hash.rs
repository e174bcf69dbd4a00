use crate::consts::ADDR_LEN;
use crate::errors::{Result, TabulaError};
use std::fmt;

/// Content address of a chunk: the first 20 bytes of its BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; ADDR_LEN]);

impl Address {
    pub const EMPTY: Address = Address([0u8; ADDR_LEN]);

    pub fn of(bytes: &[u8]) -> Self {
        let h = blake3::hash(bytes);               // 32 byte
        let mut out = [0u8; ADDR_LEN];
        out.copy_from_slice(&h.as_bytes()[..ADDR_LEN]);
        Address(out)
    }

    pub fn from_slice(b: &[u8]) -> Result<Self> {
        let arr: [u8; ADDR_LEN] = b
            .try_into()
            .map_err(|_| TabulaError::Corrupt(format!("address of {} bytes", b.len())))?;
        Ok(Address(arr))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| TabulaError::InvalidInput(format!("address {s:?}: {e}")))?;
        Self::from_slice(&raw).map_err(|_| TabulaError::InvalidInput(format!("address {s:?}: wrong length")))
    }

    pub fn as_bytes(&self) -> &[u8; ADDR_LEN] { &self.0 }

    pub fn is_empty(&self) -> bool { self.0 == [0u8; ADDR_LEN] }

    /// Bucket hash used by the segment hash table.
    pub fn h64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(b)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", &hex::encode(self.0)[..8])
    }
}
