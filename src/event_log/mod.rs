//! Append-only per-session and per-legion event logs (§4.1).
//!
//! Each record on disk is self-describing and independently checksummed:
//! `[u32 length][u32 crc32][json payload]`. A torn write (process killed
//! mid-`write`) is detected at the record that failed its checksum rather
//! than corrupting the whole file; the log recovers by truncating there. A
//! companion `.idx` file maps `seq -> offset` and is rebuilt from the log
//! itself whenever it is missing or shorter than the log.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};

const HEADER_LEN: usize = 8;

/// One physical append-only log file plus its offset index.
///
/// Writes are serialised through an internal mutex — "one writer per
/// session" (§5) is enforced by construction rather than by convention,
/// since callers only ever reach a log through its owning component.
pub struct EventLog {
    path: PathBuf,
    index_path: PathBuf,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: std::fs::File,
    /// seq -> byte offset of the record's header.
    index: Vec<u64>,
    next_seq: u64,
}

impl EventLog {
    /// Open (creating if absent) the log at `path`, rebuilding or extending
    /// the index as needed, and recovering from any trailing torn write.
    pub fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let index_path = index_path_for(&path);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let index = rebuild_index(&mut file)?;
        let next_seq = index.len() as u64;

        let log = Self {
            index_path: index_path.clone(),
            path,
            inner: Mutex::new(LogInner { file, index, next_seq }),
        };
        log.persist_index()?;
        Ok(log)
    }

    fn persist_index(&self) -> CoreResult<()> {
        let inner = self.inner.lock().expect("event log mutex poisoned");
        let mut buf = Vec::with_capacity(inner.index.len() * 8);
        for off in &inner.index {
            buf.extend_from_slice(&off.to_le_bytes());
        }
        std::fs::write(&self.index_path, buf)?;
        Ok(())
    }

    /// Append one record, returning its assigned sequence number. Fsyncs
    /// before returning so observers are only notified of durable events.
    pub fn append<T: Serialize>(&self, payload: &T) -> CoreResult<u64> {
        let bytes = serde_json::to_vec(payload)?;
        let crc = crc32fast::hash(&bytes);
        let mut inner = self.inner.lock().expect("event log mutex poisoned");

        let offset = inner.file.seek(SeekFrom::End(0))?;
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        header.extend_from_slice(&crc.to_le_bytes());

        inner.file.write_all(&header)?;
        inner.file.write_all(&bytes)?;
        inner.file.sync_data()?;

        let seq = inner.next_seq;
        inner.index.push(offset);
        inner.next_seq += 1;
        drop(inner);
        self.persist_index()?;
        Ok(seq)
    }

    /// Read the record at `seq`, if it exists.
    pub fn read<T: DeserializeOwned>(&self, seq: u64) -> CoreResult<Option<T>> {
        let mut inner = self.inner.lock().expect("event log mutex poisoned");
        let Some(&offset) = inner.index.get(seq as usize) else {
            return Ok(None);
        };
        let record = read_record_at(&mut inner.file, offset)?;
        Ok(Some(serde_json::from_slice(&record)?))
    }

    /// Read records with `from_seq <= seq <= to_seq` (inclusive), clamped to
    /// what exists.
    pub fn read_range<T: DeserializeOwned>(&self, from_seq: u64, to_seq: u64) -> CoreResult<Vec<T>> {
        let mut inner = self.inner.lock().expect("event log mutex poisoned");
        let len = inner.index.len() as u64;
        let hi = to_seq.min(len.saturating_sub(1));
        let mut out = Vec::new();
        if len == 0 || from_seq > hi {
            return Ok(out);
        }
        for seq in from_seq..=hi {
            let offset = inner.index[seq as usize];
            let record = read_record_at(&mut inner.file, offset)?;
            out.push(serde_json::from_slice(&record)?);
        }
        Ok(out)
    }

    /// Read every record from `from_seq` to the current tail.
    pub fn read_tail<T: DeserializeOwned>(&self, from_seq: u64) -> CoreResult<Vec<T>> {
        let count = self.count();
        if count == 0 {
            return Ok(Vec::new());
        }
        self.read_range(from_seq, count - 1)
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().expect("event log mutex poisoned").next_seq
    }

    /// Truncate the log back to empty (used by Session Reset, §4.4).
    pub fn truncate(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().expect("event log mutex poisoned");
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.index.clear();
        inner.next_seq = 0;
        drop(inner);
        self.persist_index()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn index_path_for(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let mut name = p.file_name().unwrap_or_default().to_os_string();
    name.push(".idx");
    p.set_file_name(name);
    p
}

/// Scan the log file from the start, validating each record's checksum, and
/// return the offset of each valid record's header. Stops at the first
/// invalid or incomplete record (a torn write), matching §4.1's "truncation
/// stops at last valid record" contract. The underlying file is left
/// positioned arbitrarily; callers seek before using it further.
fn rebuild_index(file: &mut std::fs::File) -> CoreResult<Vec<u64>> {
    file.seek(SeekFrom::Start(0))?;
    let mut offsets = Vec::new();
    let mut offset: u64 = 0;
    loop {
        let mut header = [0u8; HEADER_LEN];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CoreError::from(e)),
        }
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());

        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).is_err() {
            // Torn write: header present but payload short. Stop here.
            break;
        }
        if crc32fast::hash(&payload) != crc {
            break;
        }
        offsets.push(offset);
        offset += (HEADER_LEN + len) as u64;
    }
    // Recovery: if anything past the last valid record is garbage, drop it
    // so future appends start clean.
    file.set_len(offset)?;
    file.seek(SeekFrom::End(0))?;
    Ok(offsets)
}

fn read_record_at(file: &mut std::fs::File, offset: u64) -> CoreResult<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;
    if crc32fast::hash(&payload) != crc {
        return Err(CoreError::CorruptRecord(format!("checksum mismatch at offset {offset}")));
    }
    Ok(payload)
}

/// Registry of open per-session / per-legion event logs, keyed by owner id
/// string (e.g. a session id or legion id rendered to string) so both share
/// one cache without needing separate types.
pub struct EventLogRegistry {
    root: PathBuf,
    subdir: &'static str,
    open: Mutex<HashMap<String, std::sync::Arc<EventLog>>>,
}

impl EventLogRegistry {
    pub fn new(root: impl Into<PathBuf>, subdir: &'static str) -> Self {
        Self { root: root.into(), subdir, open: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_open(&self, owner_id: &str) -> CoreResult<std::sync::Arc<EventLog>> {
        let mut open = self.open.lock().expect("event log registry mutex poisoned");
        if let Some(log) = open.get(owner_id) {
            return Ok(log.clone());
        }
        let path = self.root.join(self.subdir).join(owner_id).join("events");
        let log = std::sync::Arc::new(EventLog::open(path)?);
        open.insert(owner_id.to_string(), log.clone());
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec(String);

    #[test]
    fn append_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path().join("events")).unwrap();
        let seq0 = log.append(&Rec("a".into())).unwrap();
        let seq1 = log.append(&Rec("b".into())).unwrap();
        assert_eq!(seq0, 0);
        assert_eq!(seq1, 1);
        assert_eq!(log.count(), 2);
        let got: Rec = log.read(0).unwrap().unwrap();
        assert_eq!(got, Rec("a".into()));
        let tail: Vec<Rec> = log.read_tail(1).unwrap();
        assert_eq!(tail, vec![Rec("b".into())]);
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        {
            let log = EventLog::open(&path).unwrap();
            log.append(&Rec("a".into())).unwrap();
            log.append(&Rec("b".into())).unwrap();
        }
        std::fs::remove_file(index_path_for(&path)).unwrap();
        let log = EventLog::open(&path).unwrap();
        assert_eq!(log.count(), 2);
        let got: Rec = log.read(1).unwrap().unwrap();
        assert_eq!(got, Rec("b".into()));
    }

    #[test]
    fn torn_write_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        {
            let log = EventLog::open(&path).unwrap();
            log.append(&Rec("a".into())).unwrap();
        }
        // Simulate a torn write: append a header claiming more bytes than exist.
        {
            use std::io::Write as _;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&100u32.to_le_bytes()).unwrap();
            f.write_all(&0u32.to_le_bytes()).unwrap();
            f.write_all(b"short").unwrap();
        }
        let log = EventLog::open(&path).unwrap();
        assert_eq!(log.count(), 1);
        let seq1 = log.append(&Rec("c".into())).unwrap();
        assert_eq!(seq1, 1);
    }

    #[test]
    fn bit_rot_after_indexing_fails_checksum_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        let log = EventLog::open(&path).unwrap();
        log.append(&Rec("a".into())).unwrap();
        log.append(&Rec("b".into())).unwrap();

        // Flip a byte inside record 0's payload without touching the index
        // or header, simulating bit rot discovered after the record was
        // already indexed as valid.
        {
            use std::io::Write as _;
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(HEADER_LEN as u64 + 2)).unwrap();
            f.write_all(b"X").unwrap();
        }

        let err = log.read::<Rec>(0).unwrap_err();
        assert!(matches!(err, CoreError::CorruptRecord(_)));
        // The untouched record is still readable.
        let ok: Rec = log.read(1).unwrap().unwrap();
        assert_eq!(ok, Rec("b".into()));
    }

    #[test]
    fn truncate_resets_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path().join("events")).unwrap();
        log.append(&Rec("a".into())).unwrap();
        log.truncate().unwrap();
        assert_eq!(log.count(), 0);
        let seq0 = log.append(&Rec("fresh".into())).unwrap();
        assert_eq!(seq0, 0);
    }
}
