use super::segment::sync_dir;
use crate::errors::Result;
use crate::hash::Address;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRec {
    #[serde(with = "path_serde")]
    pub path: PathBuf,
    pub chunks: u64,
}

mod path_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::path::PathBuf;

    pub fn serialize<S: Serializer>(p: &PathBuf, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&p.to_string_lossy())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PathBuf, D::Error> {
        let s = String::deserialize(d)?;
        Ok(PathBuf::from(s))
    }
}

/// Manifest of a file chunk store: the published segments, oldest first, and
/// the head root address (hex, absent for a fresh store).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub segments: Vec<SegmentRec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let p = dir.join(MANIFEST_FILE);
        if !p.exists() {
            return Ok(Self::default());
        }
        let s = fs::read_to_string(p)?;
        let m: Manifest = serde_json::from_str(&s)?;
        Ok(m)
    }

    pub fn save_atomic(&self, dir: &Path) -> Result<()> {
        let p = dir.join(MANIFEST_FILE);
        let tmp = dir.join("manifest.json.tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, &p)?;
        sync_dir(dir)
    }

    pub fn add_segment(&mut self, name: &str, chunks: u64) {
        self.segments.push(SegmentRec { path: PathBuf::from(name), chunks });
    }

    pub fn root_address(&self) -> Result<Address> {
        match &self.root {
            Some(s) => Address::parse(s),
            None => Ok(Address::EMPTY),
        }
    }

    pub fn set_root_address(&mut self, addr: Address) {
        self.root = if addr.is_empty() { None } else { Some(addr.to_string()) };
    }

    pub fn total_chunks(&self) -> u64 {
        self.segments.iter().map(|s| s.chunks).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let mut m = Manifest::default();
        m.add_segment("seg-1.tchk", 3);
        m.set_root_address(Address::of(b"root"));
        m.save_atomic(dir.path()).unwrap();

        let back = Manifest::load(dir.path()).unwrap();
        assert_eq!(back.segments.len(), 1);
        assert_eq!(back.total_chunks(), 3);
        assert_eq!(back.root_address().unwrap(), Address::of(b"root"));
    }

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempdir().unwrap();
        let m = Manifest::load(dir.path()).unwrap();
        assert!(m.segments.is_empty());
        assert!(m.root_address().unwrap().is_empty());
    }
}
