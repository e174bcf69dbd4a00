use super::manifest::Manifest;
use super::segment::{SegmentReader, SegmentWriter};
use super::{Chunk, ChunkStore};
use crate::errors::Result;
use crate::hash::Address;
use rand::Rng;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Directory-backed store. Puts accumulate in memory until `flush`, which
/// writes them into one new immutable segment and records it in the manifest.
#[derive(Debug)]
pub struct FileChunkStore {
    dir: PathBuf,
    pending: Mutex<BTreeMap<Address, Chunk>>,
    // newest last
    segments: RwLock<Vec<SegmentReader>>,
    manifest: Mutex<Manifest>,
}

fn segment_name() -> String {
    let now = time::OffsetDateTime::now_utc();
    let r: u16 = rand::rng().random();
    format!("seg-{}-{:09}-{r:04x}.tchk", now.unix_timestamp(), now.nanosecond())
}

impl FileChunkStore {
    /// Open (or initialize) a store at the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let manifest = Manifest::load(&dir)?;
        let mut readers = Vec::with_capacity(manifest.segments.len());
        for s in &manifest.segments {
            readers.push(SegmentReader::open(dir.join(&s.path))?);
        }
        info!(dir = %dir.display(), segments = readers.len(), "chunk store opened");
        Ok(Self {
            dir,
            pending: Mutex::new(BTreeMap::new()),
            segments: RwLock::new(readers),
            manifest: Mutex::new(manifest),
        })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    /// Snapshot of the manifest as last saved.
    pub fn manifest(&self) -> Manifest {
        self.manifest.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Re-read every record of every segment and count crc failures.
    pub fn verify(&self) -> Result<(usize, usize)> {
        let segs = self.segments.read().unwrap_or_else(|p| p.into_inner());
        let (mut ok, mut bad) = (0usize, 0usize);
        for r in segs.iter() {
            for e in r.iter() {
                if r.verified_at(e.off as usize, e.size as usize).is_some() { ok += 1 } else { bad += 1 }
            }
        }
        Ok((ok, bad))
    }

    /// Persist pending chunks as a segment. Caller holds the manifest lock.
    fn flush_locked(&self, manifest: &mut Manifest) -> Result<()> {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            if pending.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };
        let name = segment_name();
        let mut w = SegmentWriter::create(self.dir.join(&name))?;
        for (addr, chunk) in &batch {
            w.add(addr, chunk)?;
        }
        let written = w.len() as u64;
        let path = match w.finalize() {
            Ok(p) => p,
            Err(e) => {
                // keep the batch readable; nothing references the lost segment
                let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                pending.extend(batch);
                return Err(e);
            }
        };
        let reader = SegmentReader::open(&path)?;

        let mut next = manifest.clone();
        next.add_segment(&name, written);
        next.save_atomic(&self.dir)?;
        *manifest = next;
        self.segments.write().unwrap_or_else(|p| p.into_inner()).push(reader);
        debug!(segment = %name, chunks = written, "flushed pending chunks");
        Ok(())
    }
}

impl ChunkStore for FileChunkStore {
    fn get(&self, addr: &Address) -> Result<Option<Chunk>> {
        if let Some(c) = self.pending.lock().unwrap_or_else(|p| p.into_inner()).get(addr) {
            return Ok(Some(c.clone()));
        }
        let segs = self.segments.read().unwrap_or_else(|p| p.into_inner());
        for r in segs.iter().rev() {
            if let Some(bytes) = r.get(addr)? {
                return Ok(Some(Chunk::from(bytes)));
            }
        }
        Ok(None)
    }

    fn put(&self, bytes: &[u8]) -> Result<Address> {
        let addr = Address::of(bytes);
        if self.has(&addr)? {
            return Ok(addr);
        }
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(addr, Chunk::from(bytes));
        Ok(addr)
    }

    fn root(&self) -> Result<Address> {
        self.manifest.lock().unwrap_or_else(|p| p.into_inner()).root_address()
    }

    fn set_root(&self, expected: Address, new: Address) -> Result<bool> {
        let mut manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
        if manifest.root_address()? != expected {
            return Ok(false);
        }
        // the new root must never point at chunks that are not on disk
        self.flush_locked(&mut manifest)?;
        let mut next = manifest.clone();
        next.set_root_address(new);
        next.save_atomic(&self.dir)?;
        *manifest = next;
        Ok(true)
    }

    fn flush(&self) -> Result<()> {
        let mut manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
        self.flush_locked(&mut manifest)
    }
}
