//! Append-only file backend.
//!
//! Every mutation is framed into a checksummed record and appended to a
//! single log file; a commit record makes the batch visible. Recovery
//! replays the log, applying each batch only once its commit record is
//! seen, so a crash mid-transaction loses nothing that was acknowledged.

use super::{GetValue, KvBackend};
use crate::item::Item;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Magic number for the log file header.
const LOG_MAGIC: u64 = 0x4341434845494F4C; // "CACHEIOL"

/// Log file format version.
const LOG_VERSION: u32 = 1;

/// Header length in bytes (magic + version).
const HEADER_LEN: u64 = 12;

/// Backend storage error.
#[derive(Error, Debug)]
pub enum BackendError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural damage in the log
    #[error("corrupt log: {0}")]
    Corrupt(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    Set = 1,
    Del = 2,
    DelVbucket = 3,
    VbState = 4,
    Reset = 5,
    Commit = 6,
}

impl TryFrom<u8> for RecordKind {
    type Error = BackendError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordKind::Set),
            2 => Ok(RecordKind::Del),
            3 => Ok(RecordKind::DelVbucket),
            4 => Ok(RecordKind::VbState),
            5 => Ok(RecordKind::Reset),
            6 => Ok(RecordKind::Commit),
            _ => Err(BackendError::Corrupt(format!(
                "invalid record kind: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    kind: RecordKind,
    vbucket: u16,
    rowid: i64,
    flags: u32,
    exptime: u32,
    key: String,
    value: Bytes,
}

impl Record {
    fn set(item: &Item, rowid: i64) -> Self {
        Self {
            kind: RecordKind::Set,
            vbucket: item.vbucket,
            rowid,
            flags: item.flags,
            exptime: item.exptime,
            key: item.key.clone(),
            value: item.value.clone(),
        }
    }

    fn bare(kind: RecordKind) -> Self {
        Self {
            kind,
            vbucket: 0,
            rowid: -1,
            flags: 0,
            exptime: 0,
            key: String::new(),
            value: Bytes::new(),
        }
    }

    fn checksum(&self) -> u32 {
        let mut data = Vec::with_capacity(32 + self.key.len() + self.value.len());
        data.push(self.kind as u8);
        data.extend_from_slice(&self.vbucket.to_le_bytes());
        data.extend_from_slice(&self.rowid.to_le_bytes());
        data.extend_from_slice(&self.flags.to_le_bytes());
        data.extend_from_slice(&self.exptime.to_le_bytes());
        data.extend_from_slice(self.key.as_bytes());
        data.extend_from_slice(&self.value);
        crc32c::crc32c(&data)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40 + self.key.len() + self.value.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.vbucket.to_le_bytes());
        buf.extend_from_slice(&self.rowid.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.exptime.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);
        buf.extend_from_slice(&self.checksum().to_le_bytes());
        buf
    }

    fn deserialize<R: Read>(reader: &mut R) -> BackendResult<Self> {
        let mut kind_buf = [0u8; 1];
        reader.read_exact(&mut kind_buf)?;
        let kind = RecordKind::try_from(kind_buf[0])?;

        let mut u16_buf = [0u8; 2];
        reader.read_exact(&mut u16_buf)?;
        let vbucket = u16::from_le_bytes(u16_buf);

        let mut i64_buf = [0u8; 8];
        reader.read_exact(&mut i64_buf)?;
        let rowid = i64::from_le_bytes(i64_buf);

        let mut u32_buf = [0u8; 4];
        reader.read_exact(&mut u32_buf)?;
        let flags = u32::from_le_bytes(u32_buf);
        reader.read_exact(&mut u32_buf)?;
        let exptime = u32::from_le_bytes(u32_buf);

        reader.read_exact(&mut u16_buf)?;
        let key_len = u16::from_le_bytes(u16_buf) as usize;
        let mut key_buf = vec![0u8; key_len];
        reader.read_exact(&mut key_buf)?;
        let key = String::from_utf8(key_buf)
            .map_err(|e| BackendError::Corrupt(format!("invalid key: {e}")))?;

        reader.read_exact(&mut u32_buf)?;
        let value_len = u32::from_le_bytes(u32_buf) as usize;
        let mut value_buf = vec![0u8; value_len];
        reader.read_exact(&mut value_buf)?;

        reader.read_exact(&mut u32_buf)?;
        let stored_crc = u32::from_le_bytes(u32_buf);

        let record = Self {
            kind,
            vbucket,
            rowid,
            flags,
            exptime,
            key,
            value: Bytes::from(value_buf),
        };
        if record.checksum() != stored_crc {
            return Err(BackendError::Corrupt("checksum mismatch".into()));
        }
        Ok(record)
    }

    fn into_item(self) -> Item {
        Item {
            key: self.key,
            vbucket: self.vbucket,
            flags: self.flags,
            exptime: self.exptime,
            value: self.value,
            cas: 0,
            rowid: self.rowid,
        }
    }
}

struct Inner {
    writer: BufWriter<File>,
    rows: BTreeMap<i64, Item>,
    /// Records appended since the last commit marker.
    pending: Vec<Record>,
    vb_states: BTreeMap<u16, String>,
    next_rowid: i64,
}

impl Inner {
    fn apply(&mut self, record: Record) {
        match record.kind {
            RecordKind::Set => {
                self.next_rowid = self.next_rowid.max(record.rowid + 1);
                self.rows.insert(record.rowid, record.into_item());
            }
            RecordKind::Del => {
                self.rows.remove(&record.rowid);
            }
            RecordKind::DelVbucket => {
                let vbucket = record.vbucket;
                self.rows.retain(|_, item| item.vbucket != vbucket);
            }
            RecordKind::VbState => {
                let state = String::from_utf8_lossy(&record.value).into_owned();
                self.vb_states.insert(record.vbucket, state);
            }
            RecordKind::Reset => {
                self.rows.clear();
                self.vb_states.clear();
            }
            RecordKind::Commit => {}
        }
    }

    fn append(&mut self, record: Record) -> BackendResult<()> {
        self.writer.write_all(&record.serialize())?;
        self.pending.push(record);
        Ok(())
    }
}

/// Log-file implementation of [`KvBackend`].
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<Inner>,
}

// TODO: compact the log once dead records dominate (needs a live-set sweep).
impl FileBackend {
    /// Create or recover a backend at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut inner = Inner {
            writer: BufWriter::new(file.try_clone()?),
            rows: BTreeMap::new(),
            pending: Vec::new(),
            vb_states: BTreeMap::new(),
            next_rowid: 1,
        };

        if file_len == 0 {
            let mut writer = BufWriter::new(file);
            writer.write_all(&LOG_MAGIC.to_le_bytes())?;
            writer.write_all(&LOG_VERSION.to_le_bytes())?;
            writer.flush()?;
        } else {
            Self::recover(&file, &mut inner)?;
        }

        // Position the writer at the end for appends.
        inner.writer.seek(SeekFrom::End(0))?;

        info!(
            path = %path.display(),
            rows = inner.rows.len(),
            "opened file backend"
        );
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn recover(file: &File, inner: &mut Inner) -> BackendResult<()> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut magic_buf = [0u8; 8];
        reader.read_exact(&mut magic_buf)?;
        if u64::from_le_bytes(magic_buf) != LOG_MAGIC {
            return Err(BackendError::Corrupt("bad log magic".into()));
        }
        let mut version_buf = [0u8; 4];
        reader.read_exact(&mut version_buf)?;
        let version = u32::from_le_bytes(version_buf);
        if version != LOG_VERSION {
            return Err(BackendError::Corrupt(format!(
                "unsupported log version: {version}"
            )));
        }

        let mut batch = Vec::new();
        loop {
            match Record::deserialize(&mut reader) {
                Ok(record) if record.kind == RecordKind::Commit => {
                    for r in batch.drain(..) {
                        inner.apply(r);
                    }
                }
                Ok(record) => batch.push(record),
                Err(BackendError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "stopping log recovery at damaged record");
                    break;
                }
            }
        }
        if !batch.is_empty() {
            // Uncommitted tail from a crash mid-transaction.
            warn!(records = batch.len(), "discarding uncommitted log tail");
        }
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn begin(&self) {}

    fn commit(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            return true;
        }
        let result = inner
            .append(Record::bare(RecordKind::Commit))
            .and_then(|()| {
                inner.writer.flush()?;
                inner.writer.get_ref().sync_all()?;
                Ok(())
            });
        match result {
            Ok(()) => {
                let pending = std::mem::take(&mut inner.pending);
                for record in pending {
                    inner.apply(record);
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "log commit failed");
                // Drop the failed commit marker so a retry appends a new one.
                inner.pending.retain(|r| r.kind != RecordKind::Commit);
                false
            }
        }
    }

    fn set(&self, item: &Item, cb: &mut dyn FnMut(i32, i64)) {
        let mut inner = self.inner.lock();
        if item.rowid >= 0 {
            let exists = inner.rows.contains_key(&item.rowid)
                || inner
                    .pending
                    .iter()
                    .any(|r| r.kind == RecordKind::Set && r.rowid == item.rowid);
            if !exists {
                cb(0, 0);
                return;
            }
            match inner.append(Record::set(item, item.rowid)) {
                Ok(()) => cb(1, 0),
                Err(e) => {
                    warn!(key = %item.key, error = %e, "log append failed");
                    cb(-1, 0);
                }
            }
        } else {
            let rowid = inner.next_rowid;
            inner.next_rowid += 1;
            match inner.append(Record::set(item, rowid)) {
                Ok(()) => cb(1, rowid),
                Err(e) => {
                    warn!(key = %item.key, error = %e, "log append failed");
                    cb(-1, 0);
                }
            }
        }
    }

    fn del(&self, key: &str, rowid: i64, cb: &mut dyn FnMut(i32)) {
        let mut inner = self.inner.lock();
        let exists = inner
            .rows
            .get(&rowid)
            .map(|item| item.key == key)
            .unwrap_or(false)
            || inner
                .pending
                .iter()
                .any(|r| r.kind == RecordKind::Set && r.rowid == rowid);
        if !exists {
            cb(0);
            return;
        }
        let mut record = Record::bare(RecordKind::Del);
        record.rowid = rowid;
        record.key = key.to_string();
        match inner.append(record) {
            Ok(()) => cb(1),
            Err(e) => {
                warn!(key, error = %e, "log append failed");
                cb(-1);
            }
        }
    }

    fn get(&self, key: &str, rowid: i64) -> GetValue {
        let inner = self.inner.lock();
        match inner.rows.get(&rowid) {
            Some(item) if item.key == key => GetValue::found(item.clone(), rowid),
            _ => inner
                .rows
                .values()
                .find(|item| item.key == key)
                .map(|item| GetValue::found(item.clone(), item.rowid))
                .unwrap_or_else(GetValue::missing),
        }
    }

    fn del_vbucket(&self, vbucket: u16) -> bool {
        let mut inner = self.inner.lock();
        let mut record = Record::bare(RecordKind::DelVbucket);
        record.vbucket = vbucket;
        let appended = inner.append(record).is_ok();
        if appended
            && inner.writer.flush().is_ok()
            && inner.writer.get_ref().sync_all().is_ok()
        {
            inner.rows.retain(|_, item| item.vbucket != vbucket);
            inner.pending.retain(|r| r.kind != RecordKind::DelVbucket);
            // Keep the marker durable on its own: a vbucket drop is not part
            // of a flush transaction.
            let marker = Record::bare(RecordKind::Commit);
            let _ = inner.append(marker);
            let _ = inner.writer.flush();
            let _ = inner.writer.get_ref().sync_all();
            inner.pending.retain(|r| r.kind != RecordKind::Commit);
            true
        } else {
            false
        }
    }

    fn set_vb_state(&self, vbucket: u16, state: &str) -> bool {
        let mut inner = self.inner.lock();
        let mut record = Record::bare(RecordKind::VbState);
        record.vbucket = vbucket;
        record.value = Bytes::copy_from_slice(state.as_bytes());
        let ok = inner.append(record).is_ok()
            && inner.append(Record::bare(RecordKind::Commit)).is_ok()
            && inner.writer.flush().is_ok();
        if ok {
            inner.vb_states.insert(vbucket, state.to_string());
            inner
                .pending
                .retain(|r| !matches!(r.kind, RecordKind::VbState | RecordKind::Commit));
        }
        ok
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        let ok = inner.append(Record::bare(RecordKind::Reset)).is_ok()
            && inner.append(Record::bare(RecordKind::Commit)).is_ok()
            && inner.writer.flush().is_ok();
        if ok {
            inner.rows.clear();
            inner.vb_states.clear();
            inner
                .pending
                .retain(|r| !matches!(r.kind, RecordKind::Reset | RecordKind::Commit));
        }
    }

    fn dump(&self, cb: &mut dyn FnMut(GetValue)) {
        let rows: Vec<Item> = self.inner.lock().rows.values().cloned().collect();
        for item in rows {
            let rowid = item.rowid;
            cb(GetValue::found(item, rowid));
        }
    }
}
