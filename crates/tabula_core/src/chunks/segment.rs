//! Chunk segment file format & IO
//!
//! Header (LE, 48 bytes):
//!   magic[4]   = "TCHK"
//!   version[2] = 1
//!   rsv[2]     = 0
//!   count[4]   = number of chunks
//!   idx_off[8] = index block offset
//!   flt_off[8] = filter block offset
//!   data_off[8]= data start (SEG_HDR_SIZE)
//!   foot_off[8]= footer offset (end of file)
//!
//! Index:
//!   u32 kind (=2)
//!   u64 cap (power-of-two)
//!   repeat cap * { u64 h, u64 fp, u64 off, u32 size, u32 pad }
//!   h == 0 marks an empty slot.
//!
//! Filter block:
//!   [u32 tag="XOR8"][u32 len][bytes = xorfilter::Xor8::to_bytes()]
//!   len == 0 means the segment holds no chunks.
//!
//! Chunk record: [chunk bytes][crc32(chunk)]

use crate::consts::{MAGIC_SEG, SEG_HDR_SIZE, SEG_VERSION};
use crate::errors::{Result, TabulaError};
use crate::hash::Address;
use crate::utils::{crc32, write_u32};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use xorfilter::Xor8;

const INDEX_KIND_HASHTAB: u32 = 2;
const INDEX_ENTRY_SIZE: usize = 8 + 8 + 8 + 4 + 4;
const FILTER_TAG_XOR8: u32 = u32::from_le_bytes(*b"XOR8");

#[inline]
fn h64(addr: &Address) -> u64 { xxhash_rust::xxh3::xxh3_64(addr.as_bytes()).max(1) }

#[inline]
fn fp64(addr: &Address) -> u64 {
    let b = addr.as_bytes();
    let mut fp = [0u8; 8];
    fp.copy_from_slice(&b[8..16]);
    u64::from_le_bytes(fp)
}

#[inline]
fn le_u32(b: &[u8], at: usize) -> u32 {
    let mut x = [0u8; 4];
    x.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(x)
}

#[inline]
fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut x = [0u8; 8];
    x.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(x)
}

/// Make a rename inside `dir` durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new().read(true).custom_flags(libc::O_DIRECTORY).open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> { Ok(()) }

/// Linear probe order for hash `h` in a table of `cap` slots.
fn probe(h: u64, cap: u64) -> impl Iterator<Item = usize> {
    let mask = cap - 1;
    (0..cap).map(move |i| (h.wrapping_add(i) & mask) as usize)
}

/// Smallest power of two keeping the table at most ~80% full.
fn table_cap(n: usize) -> u64 { ((n as u64) * 5 / 4 + 1).next_power_of_two() }

/// Writer: append-only; writes index & filter blocks, then publishes atomically.
pub struct SegmentWriter {
    path_final: PathBuf,
    tmp: NamedTempFile,
    items: Vec<IndexEntry>,
}

impl SegmentWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path_final = path.as_ref().to_path_buf();
        let dir = path_final.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::Builder::new().prefix("tabula_seg_").tempfile_in(dir)?;
        tmp.as_file_mut().write_all(&[0u8; SEG_HDR_SIZE])?; // header slot
        Ok(Self { path_final, tmp, items: Vec::new() })
    }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Append one chunk record; crc32 of the chunk follows the bytes.
    pub fn add(&mut self, addr: &Address, chunk: &[u8]) -> Result<()> {
        let f = self.tmp.as_file_mut();
        let off = f.seek(SeekFrom::End(0))?;
        f.write_all(chunk)?;
        write_u32(f, crc32(chunk))?;
        let size = u32::try_from(chunk.len() + 4)
            .map_err(|_| TabulaError::InvalidInput(format!("chunk {addr} too large")))?;
        self.items.push(IndexEntry { hash: h64(addr), fingerprint: fp64(addr), off, size });
        Ok(())
    }

    fn build_hashtable(&self) -> Vec<u8> {
        let cap = table_cap(self.items.len());
        let mut slots: Vec<Option<IndexEntry>> = vec![None; cap as usize];
        for e in &self.items {
            // cap exceeds the item count, so a free slot always exists
            if let Some(i) = probe(e.hash, cap).find(|&i| slots[i].is_none()) {
                slots[i] = Some(*e);
            }
        }
        let mut buf = Vec::with_capacity(12 + slots.len() * INDEX_ENTRY_SIZE);
        buf.extend_from_slice(&INDEX_KIND_HASHTAB.to_le_bytes());
        buf.extend_from_slice(&cap.to_le_bytes());
        for slot in slots {
            slot.unwrap_or_default().encode_into(&mut buf);
        }
        buf
    }

    fn build_filter(&self) -> Result<Vec<u8>> {
        let mut digests: Vec<u64> = self.items.iter().map(|e| e.hash).collect();
        digests.sort_unstable();
        digests.dedup();
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let mut xf: Xor8 = Xor8::new();
        xf.build_keys(&digests).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, format!("xor build: {e:?}"))
        })?;
        Ok(xf.to_bytes())
    }

    /// finalize: index + filter + header, then atomic publish
    pub fn finalize(mut self) -> Result<PathBuf> {
        let idx_bytes = self.build_hashtable();
        let filter_bytes = self.build_filter()?;
        let count = self.items.len() as u32;

        let f = self.tmp.as_file_mut();
        let index_off = f.seek(SeekFrom::End(0))?;
        f.write_all(&idx_bytes)?;

        let filter_off = f.seek(SeekFrom::End(0))?;
        f.write_all(&FILTER_TAG_XOR8.to_le_bytes())?;
        write_u32(f, filter_bytes.len() as u32)?;
        f.write_all(&filter_bytes)?;

        let footer_off = f.seek(SeekFrom::End(0))?;

        f.seek(SeekFrom::Start(0))?;
        let mut hdr = Vec::with_capacity(SEG_HDR_SIZE);
        hdr.extend_from_slice(MAGIC_SEG);
        hdr.extend_from_slice(&SEG_VERSION.to_le_bytes());
        hdr.extend_from_slice(&0u16.to_le_bytes());
        hdr.extend_from_slice(&count.to_le_bytes());
        hdr.extend_from_slice(&index_off.to_le_bytes());
        hdr.extend_from_slice(&filter_off.to_le_bytes());
        hdr.extend_from_slice(&(SEG_HDR_SIZE as u64).to_le_bytes());
        hdr.extend_from_slice(&footer_off.to_le_bytes());
        hdr.resize(SEG_HDR_SIZE, 0);
        f.write_all(&hdr)?;
        f.sync_all()?;

        self.tmp.persist(&self.path_final)?;
        if let Err(e) = sync_dir(self.path_final.parent().unwrap_or(Path::new("."))) {
            warn!(path = %self.path_final.display(), "directory sync failed: {e}");
        }
        debug!(path = %self.path_final.display(), chunks = count, "segment published");
        Ok(self.path_final)
    }
}

/// Reader: memory-maps a published segment and resolves addresses through the
/// hash index, consulting the XOR filter first.
pub struct SegmentReader {
    _f: File,
    mmap: Mmap,
    count: u32,
    index_off: usize,
    filter_off: usize,
    filter_cache: OnceLock<Option<Xor8>>,
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader").field("count", &self.count).finish()
    }
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&f)? };
        if mmap.len() < SEG_HDR_SIZE || &mmap[0..4] != MAGIC_SEG { return Err(TabulaError::BadHeader); }
        let ver = u16::from_le_bytes([mmap[4], mmap[5]]);
        if ver != SEG_VERSION { return Err(TabulaError::BadHeader); }
        let count = le_u32(&mmap, 8);
        let index_off = le_u64(&mmap, 12) as usize;
        let filter_off = le_u64(&mmap, 20) as usize;
        if index_off + 12 > mmap.len() || filter_off + 8 > mmap.len() {
            return Err(TabulaError::Corrupt(format!("segment {} offsets out of range", path.as_ref().display())));
        }
        let (kind, cap) = (le_u32(&mmap, index_off), le_u64(&mmap, index_off + 4));
        if kind != INDEX_KIND_HASHTAB
            || !cap.is_power_of_two()
            || index_off + 12 + (cap as usize) * INDEX_ENTRY_SIZE > mmap.len()
        {
            return Err(TabulaError::Corrupt(format!("segment {} index damaged", path.as_ref().display())));
        }
        debug!(path = %path.as_ref().display(), chunks = count, "segment opened");
        Ok(Self { _f: f, mmap, count, index_off, filter_off, filter_cache: OnceLock::new() })
    }

    pub fn len(&self) -> usize { self.count as usize }

    pub fn is_empty(&self) -> bool { self.count == 0 }

    fn filter(&self) -> Option<&Xor8> {
        self.filter_cache
            .get_or_init(|| {
                let tag = le_u32(&self.mmap, self.filter_off);
                let len = le_u32(&self.mmap, self.filter_off + 4) as usize;
                let start = self.filter_off + 8;
                if tag != FILTER_TAG_XOR8 || len == 0 || start + len > self.mmap.len() {
                    return None;
                }
                match Xor8::from_bytes(self.mmap[start..start + len].to_vec()) {
                    Ok(xf) => Some(xf),
                    Err(e) => {
                        // fall back to probing the index for every lookup
                        warn!("segment filter unreadable: {e:?}");
                        None
                    }
                }
            })
            .as_ref()
    }

    fn cap(&self) -> u64 { le_u64(&self.mmap, self.index_off + 4) }

    fn entry(&self, slot: usize) -> IndexEntry {
        IndexEntry::decode_at(&self.mmap, self.index_off + 12 + slot * INDEX_ENTRY_SIZE)
    }

    /// Chunk bytes (crc excluded), verified against the stored crc.
    pub fn get(&self, addr: &Address) -> Result<Option<&[u8]>> {
        if self.count == 0 { return Ok(None); }
        let h = h64(addr);
        if let Some(xf) = self.filter() {
            if !xf.contains_key(h) { return Ok(None); }
        }
        let fp = fp64(addr);
        for i in probe(h, self.cap()) {
            let e = self.entry(i);
            if e.hash == 0 { return Ok(None); }
            if e.hash == h && e.fingerprint == fp {
                return match self.verified_at(e.off as usize, e.size as usize) {
                    Some(v) => Ok(Some(v)),
                    None => Err(TabulaError::Corrupt(format!("chunk {addr} failed crc check"))),
                };
            }
        }
        Ok(None)
    }

    /// [chunk][crc] record at `off`, if in bounds and the crc matches.
    pub fn verified_at(&self, off: usize, size: usize) -> Option<&[u8]> {
        let end = off.checked_add(size)?;
        if end > self.mmap.len() || size < 4 { return None; }
        let val = &self.mmap[off..end - 4];
        let want = le_u32(&self.mmap, end - 4);
        (crc32(val) == want).then_some(val)
    }

    /// Iterator over occupied index slots.
    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.cap() as usize).map(|i| self.entry(i)).filter(|e| e.hash != 0)
    }
}

/// One hash index slot; `hash == 0` marks a free slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexEntry { pub hash: u64, pub fingerprint: u64, pub off: u64, pub size: u32 }

impl IndexEntry {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.hash.to_le_bytes());
        buf.extend_from_slice(&self.fingerprint.to_le_bytes());
        buf.extend_from_slice(&self.off.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
    }

    fn decode_at(b: &[u8], at: usize) -> Self {
        IndexEntry {
            hash: le_u64(b, at),
            fingerprint: le_u64(b, at + 8),
            off: le_u64(b, at + 16),
            size: le_u32(b, at + 24),
        }
    }
}
