//! Disk-backed persistent bitmap cache.
//!
//! One file per cache id, named `pstcache_<id>_<bpp>`, holding a
//! sequence of records:
//!
//! ```text
//! ┌──────────┬───────┬────────┬────────┬───────┬──────────────┐
//! │ hash (8) │ w (1) │ h (1)  │ len(2) │ stamp │ len bytes    │
//! │          │       │        │  LE    │ (4)LE │ of pixels    │
//! └──────────┴───────┴────────┴────────┴───────┴──────────────┘
//! ```
//!
//! Records are only ever appended. A record whose slot is later reused
//! has its hash zeroed in place and is ignored from then on. A trailing
//! partial record (crash during append) is ignored by readers.
//!
//! The file is locked for the lifetime of the owning session; a file
//! that is already locked leaves that cache id without persistence.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{RdcError, Result};

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Most records one cache id can advertise to the peer.
pub const MAX_PERSISTENT_CELLS: usize = 0x9f6;

/// Offset of the stamp within a record header.
const STAMP_OFFSET: u64 = 12;

/// 8-byte content hash chosen by the peer.
pub type HashKey = [u8; 8];

const ZERO_KEY: HashKey = [0; 8];

// ── RecordHeader ─────────────────────────────────────────────────

/// Fixed-size header preceding every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: HashKey,
    pub width: u8,
    pub height: u8,
    pub length: u16,
    pub stamp: u32,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[..8].copy_from_slice(&self.key);
        out[8] = self.width;
        out[9] = self.height;
        out[10..12].copy_from_slice(&self.length.to_le_bytes());
        out[12..16].copy_from_slice(&self.stamp.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut key = [0u8; 8];
        key.copy_from_slice(&b[..8]);
        Self {
            key,
            width: b[8],
            height: b[9],
            length: u16::from_le_bytes([b[10], b[11]]),
            stamp: u32::from_le_bytes([b[12], b[13], b[14], b[15]]),
        }
    }
}

/// A loaded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentEntry {
    pub header: RecordHeader,
    pub data: Vec<u8>,
}

// ── CacheFile ────────────────────────────────────────────────────

#[derive(Debug)]
struct CacheFile {
    file: File,
    path: PathBuf,
    /// Slot index to record offset.
    slots: HashMap<u16, u64>,
}

impl CacheFile {
    fn read_header(&mut self, offset: u64) -> std::io::Result<RecordHeader> {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(RecordHeader::from_bytes(&buf))
    }

    /// Every complete record as `(offset, header)`, in file order.
    ///
    /// A partial record at the end of the file is cut off so that the
    /// next append lands right after the last complete one.
    fn scan(&mut self) -> std::io::Result<Vec<(u64, RecordHeader)>> {
        let mut contents = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut contents)?;

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + RECORD_HEADER_SIZE <= contents.len() {
            let mut hdr = [0u8; RECORD_HEADER_SIZE];
            hdr.copy_from_slice(&contents[pos..pos + RECORD_HEADER_SIZE]);
            let header = RecordHeader::from_bytes(&hdr);
            let end = pos + RECORD_HEADER_SIZE + usize::from(header.length);
            if end > contents.len() {
                break;
            }
            records.push((pos as u64, header));
            pos = end;
        }
        if pos < contents.len() {
            debug!(
                path = %self.path.display(),
                trailing = contents.len() - pos,
                "truncating partial trailing record"
            );
            self.file.set_len(pos as u64)?;
        }
        Ok(records)
    }
}

// ── PersistentCache ──────────────────────────────────────────────

/// Persistent bitmap cache for one session.
#[derive(Debug)]
pub struct PersistentCache {
    dir: PathBuf,
    bpp: u8,
    files: HashMap<u8, CacheFile>,
    enumerated: HashSet<u8>,
}

impl PersistentCache {
    /// Open (creating if needed) and lock the files for `ids`.
    ///
    /// Ids whose file cannot be opened or is locked by another session
    /// are left without persistence.
    pub fn open(dir: &Path, bpp: u8, ids: &[u8]) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            RdcError::PersistentCache(format!("cannot create {}: {e}", dir.display()))
        })?;

        let mut files = HashMap::new();
        for &id in ids {
            let path = dir.join(format!("pstcache_{id}_{bpp}"));
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path.display(), "cannot open persistent cache: {e}");
                    continue;
                }
            };
            if let Err(e) = file.try_lock() {
                warn!(
                    path = %path.display(),
                    "persistent bitmap caching disabled, file in use: {e}"
                );
                continue;
            }
            let mut cf = CacheFile {
                file,
                path,
                slots: HashMap::new(),
            };
            if let Err(e) = cf.scan() {
                warn!(path = %cf.path.display(), "cannot scan persistent cache: {e}");
                continue;
            }
            debug!(id, path = %cf.path.display(), "persistent cache opened");
            files.insert(id, cf);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            bpp,
            files,
            enumerated: HashSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bpp(&self) -> u8 {
        self.bpp
    }

    /// Whether `id` is backed by a file.
    pub fn is_persistent(&self, id: u8) -> bool {
        self.files.contains_key(&id)
    }

    /// Drop persistence for `id` after an I/O failure.
    pub fn disable(&mut self, id: u8) {
        if let Some(f) = self.files.remove(&id) {
            warn!(id, path = %f.path.display(), "persistent cache disabled for this session");
        }
    }

    /// Read every live record of `id`, assign slot indices in ascending
    /// stamp order and return `(index, header)` pairs in that order.
    ///
    /// The first record carrying a given hash wins; later duplicates are
    /// ignored. Only the first enumeration per session does any work.
    pub fn enumerate(&mut self, id: u8) -> Result<Vec<(u16, RecordHeader)>> {
        if self.enumerated.contains(&id) {
            return Ok(Vec::new());
        }
        let Some(cf) = self.files.get_mut(&id) else {
            return Ok(Vec::new());
        };

        let records = cf.scan().map_err(|e| {
            RdcError::PersistentCache(format!("enumerate {}: {e}", cf.path.display()))
        })?;

        let mut seen = HashSet::new();
        let mut live: Vec<(u64, RecordHeader)> = records
            .into_iter()
            .filter(|(_, h)| h.key != ZERO_KEY && seen.insert(h.key))
            .collect();
        live.sort_by_key(|(_, h)| h.stamp);
        if live.len() > MAX_PERSISTENT_CELLS {
            live.drain(..live.len() - MAX_PERSISTENT_CELLS);
        }

        cf.slots.clear();
        let mut out = Vec::with_capacity(live.len());
        for (idx, (offset, header)) in live.into_iter().enumerate() {
            let idx = idx as u16;
            cf.slots.insert(idx, offset);
            out.push((idx, header));
        }

        self.enumerated.insert(id);
        info!(id, count = out.len(), "persistent bitmap cache enumerated");
        Ok(out)
    }

    /// Load the record in slot `idx`, or `None` on a miss.
    pub fn load(&mut self, id: u8, idx: u16) -> Result<Option<PersistentEntry>> {
        let Some(cf) = self.files.get_mut(&id) else {
            return Ok(None);
        };
        let Some(&offset) = cf.slots.get(&idx) else {
            return Ok(None);
        };

        let io = |e: std::io::Error| RdcError::PersistentCache(format!("load {id}:{idx}: {e}"));
        let header = cf.read_header(offset).map_err(io)?;
        let mut data = vec![0u8; usize::from(header.length)];
        cf.file.read_exact(&mut data).map_err(io)?;

        let expected = usize::from(header.width) * usize::from(header.height) * usize::from(self.bpp);
        if header.key == ZERO_KEY || expected != data.len() {
            warn!(id, idx, "persistent cache record failed verification");
            cf.slots.remove(&idx);
            return Ok(None);
        }
        Ok(Some(PersistentEntry { header, data }))
    }

    /// Append a record for slot `idx`.
    ///
    /// The record is written with a single append; if that fails the
    /// file is truncated back to its previous length. A record that
    /// previously occupied the slot is retired by zeroing its hash.
    pub fn save(
        &mut self,
        id: u8,
        idx: u16,
        key: HashKey,
        width: u8,
        height: u8,
        data: &[u8],
    ) -> Result<bool> {
        if usize::from(idx) >= MAX_PERSISTENT_CELLS {
            return Ok(false);
        }
        let Some(cf) = self.files.get_mut(&id) else {
            return Ok(false);
        };
        let length = u16::try_from(data.len())
            .map_err(|_| RdcError::PersistentCache("record too large".into()))?;

        let header = RecordHeader {
            key,
            width,
            height,
            length,
            stamp: 0,
        };
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + data.len());
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(data);

        let io = |e: std::io::Error| RdcError::PersistentCache(format!("save {id}:{idx}: {e}"));
        let end = cf.file.seek(SeekFrom::End(0)).map_err(io)?;
        if let Err(e) = cf.file.write_all(&record) {
            let _ = cf.file.set_len(end);
            return Err(io(e));
        }

        if let Some(old) = cf.slots.insert(idx, end) {
            cf.file.seek(SeekFrom::Start(old)).map_err(io)?;
            cf.file.write_all(&ZERO_KEY).map_err(io)?;
        }
        Ok(true)
    }

    /// Rewrite the stamp of slot `idx` without touching its content.
    pub fn touch(&mut self, id: u8, idx: u16, stamp: u32) -> Result<()> {
        let Some(cf) = self.files.get_mut(&id) else {
            return Ok(());
        };
        let Some(&offset) = cf.slots.get(&idx) else {
            return Ok(());
        };
        let io = |e: std::io::Error| RdcError::PersistentCache(format!("touch {id}:{idx}: {e}"));
        cf.file.seek(SeekFrom::Start(offset + STAMP_OFFSET)).map_err(io)?;
        cf.file.write_all(&stamp.to_le_bytes()).map_err(io)?;
        Ok(())
    }

    /// Flush every open file to disk.
    pub fn sync(&mut self) -> Result<()> {
        for cf in self.files.values_mut() {
            cf.file
                .sync_data()
                .map_err(|e| RdcError::PersistentCache(format!("sync {}: {e}", cf.path.display())))?;
        }
        Ok(())
    }
}

impl Drop for PersistentCache {
    fn drop(&mut self) {
        for cf in self.files.values() {
            let _ = cf.file.unlock();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rdc-pst-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn record(key: u8, stamp: u32, data: &[u8], w: u8, h: u8) -> Vec<u8> {
        let header = RecordHeader {
            key: [key; 8],
            width: w,
            height: h,
            length: data.len() as u16,
            stamp,
        };
        let mut v = header.to_bytes().to_vec();
        v.extend_from_slice(data);
        v
    }

    #[test]
    fn header_layout() {
        let h = RecordHeader {
            key: [1, 2, 3, 4, 5, 6, 7, 8],
            width: 9,
            height: 10,
            length: 0x0b0c,
            stamp: 0x0d0e0f10,
        };
        let b = h.to_bytes();
        assert_eq!(b, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 0x0c, 0x0b, 0x10, 0x0f, 0x0e, 0x0d]);
        assert_eq!(RecordHeader::from_bytes(&b), h);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = temp_dir("roundtrip");
        let mut pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        assert!(pc.is_persistent(2));
        assert!(!pc.is_persistent(0));

        let pixels: Vec<u8> = (0..16).collect();
        assert!(pc.save(2, 7, [9; 8], 4, 4, &pixels).unwrap());
        let entry = pc.load(2, 7).unwrap().unwrap();
        assert_eq!(entry.data, pixels);
        assert_eq!(entry.header.key, [9; 8]);
        assert_eq!(pc.load(2, 8).unwrap(), None);
        assert!(!pc.save(0, 7, [9; 8], 4, 4, &pixels).unwrap());

        drop(pc);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn enumerate_orders_by_stamp_and_skips_partial_tail() {
        let dir = temp_dir("enumerate");
        std::fs::create_dir_all(&dir).unwrap();
        let mut contents = Vec::new();
        contents.extend(record(0xaa, 300, &[1; 4], 2, 2));
        contents.extend(record(0xbb, 100, &[2; 4], 2, 2));
        contents.extend(record(0xaa, 50, &[3; 4], 2, 2));
        contents.extend(record(0xcc, 200, &[4; 4], 2, 2));
        contents.extend(&record(0xdd, 1, &[5; 4], 2, 2)[..10]);
        std::fs::write(dir.join("pstcache_2_1"), contents).unwrap();

        let mut pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        let listed = pc.enumerate(2).unwrap();
        let keys: Vec<u8> = listed.iter().map(|(_, h)| h.key[0]).collect();
        assert_eq!(keys, vec![0xbb, 0xcc, 0xaa]);
        let idxs: Vec<u16> = listed.iter().map(|(i, _)| *i).collect();
        assert_eq!(idxs, vec![0, 1, 2]);

        // first 0xaa record wins
        assert_eq!(pc.load(2, 2).unwrap().unwrap().data, vec![1; 4]);
        // enumeration happens once per session
        assert!(pc.enumerate(2).unwrap().is_empty());

        drop(pc);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn append_after_a_torn_record_survives_reopening() {
        let dir = temp_dir("torn");
        std::fs::create_dir_all(&dir).unwrap();
        let mut contents = record(0xaa, 5, &[1; 4], 2, 2);
        contents.extend(&record(0xbb, 6, &[2; 4], 2, 2)[..10]);
        std::fs::write(dir.join("pstcache_2_1"), contents).unwrap();

        let mut pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        assert_eq!(
            std::fs::metadata(dir.join("pstcache_2_1")).unwrap().len(),
            (RECORD_HEADER_SIZE + 4) as u64
        );
        assert!(pc.save(2, 5, [0xee; 8], 2, 2, &[7; 4]).unwrap());
        drop(pc);

        let mut pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        let listed = pc.enumerate(2).unwrap();
        let keys: Vec<u8> = listed.iter().map(|(_, h)| h.key[0]).collect();
        assert_eq!(keys, vec![0xee, 0xaa]);
        let (idx, _) = listed.iter().find(|(_, h)| h.key == [0xee; 8]).unwrap();
        assert_eq!(pc.load(2, *idx).unwrap().unwrap().data, vec![7; 4]);

        drop(pc);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overwriting_a_slot_retires_the_old_record() {
        let dir = temp_dir("retire");
        let mut pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        pc.save(2, 0, [1; 8], 1, 1, &[10]).unwrap();
        pc.save(2, 0, [2; 8], 1, 1, &[20]).unwrap();
        assert_eq!(pc.load(2, 0).unwrap().unwrap().data, vec![20]);
        drop(pc);

        let mut pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        let listed = pc.enumerate(2).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.key, [2; 8]);

        drop(pc);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn second_session_cannot_share_the_file() {
        let dir = temp_dir("lock");
        let first = PersistentCache::open(&dir, 2, &[2]).unwrap();
        assert!(first.is_persistent(2));
        let second = PersistentCache::open(&dir, 2, &[2]).unwrap();
        assert!(!second.is_persistent(2));

        drop(second);
        drop(first);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_rejects_size_mismatch() {
        let dir = temp_dir("verify");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("pstcache_2_1"), record(0x11, 5, &[0; 3], 2, 2)).unwrap();
        let mut pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        assert_eq!(pc.enumerate(2).unwrap().len(), 1);
        assert_eq!(pc.load(2, 0).unwrap(), None);

        drop(pc);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
