// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Recovery journal: an append-only write-ahead log of disk mutations,
//! replayed at startup.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::JOURNAL_RECORD_LEN;
use crate::disk::directory::{journal_bak_path, journal_path};
use crate::disk::format::checksum_of;
use crate::error::{Error, Result};

/// The kind of mutation a journal record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Create,
    Delete,
    UpdateLink,
}

impl JournalOp {
    fn to_u8(self) -> u8 {
        match self {
            JournalOp::Create => 1,
            JournalOp::Delete => 2,
            JournalOp::UpdateLink => 3,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(JournalOp::Create),
            2 => Some(JournalOp::Delete),
            3 => Some(JournalOp::UpdateLink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct JournalRecordRaw {
    op: u8,
    target_sector: U32,
    sensor_id: zerocopy::byteorder::little_endian::U16,
    timestamp_ms: U64,
    prior_link: U32,
    checksum: U32,
    padding: u8,
}

const _: () = assert!(std::mem::size_of::<JournalRecordRaw>() == JOURNAL_RECORD_LEN);

/// A decoded journal record.
#[derive(Debug, Clone, Copy)]
pub struct JournalRecord {
    pub op: JournalOp,
    pub target_sector: u32,
    pub sensor_id: u16,
    pub timestamp_ms: u64,
    pub prior_link: u32,
}

impl JournalRecord {
    fn to_raw(self) -> JournalRecordRaw {
        let mut raw = JournalRecordRaw {
            op: self.op.to_u8(),
            target_sector: U32::new(self.target_sector),
            sensor_id: zerocopy::byteorder::little_endian::U16::new(self.sensor_id),
            timestamp_ms: U64::new(self.timestamp_ms),
            prior_link: U32::new(self.prior_link),
            checksum: U32::new(0),
            padding: 0,
        };
        let preceding = &raw.as_bytes()[..JOURNAL_RECORD_LEN - 8];
        raw.checksum = U32::new(checksum_of(preceding));
        raw
    }

    fn from_raw(raw: JournalRecordRaw) -> Option<Self> {
        let preceding = &raw.as_bytes()[..JOURNAL_RECORD_LEN - 8];
        if checksum_of(preceding) != raw.checksum.get() {
            return None;
        }
        Some(Self {
            op: JournalOp::from_u8(raw.op)?,
            target_sector: raw.target_sector.get(),
            sensor_id: raw.sensor_id.get(),
            timestamp_ms: raw.timestamp_ms.get(),
            prior_link: raw.prior_link.get(),
        })
    }
}

/// Owns the active journal file and appends records to it, `fsync`ing after
/// every append: the journal record for a mutation must be durable before
/// the mutation itself takes effect on disk.
pub struct JournalWriter {
    path: PathBuf,
    file: File,
}

impl JournalWriter {
    pub fn open(root: &Path) -> Result<Self> {
        let path = journal_path(root);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::from_io(&path, e))?;
        Ok(Self { path, file })
    }

    /// Appends one record and `fsync`s the journal file.
    pub fn append(&mut self, record: JournalRecord) -> Result<()> {
        let raw = record.to_raw();
        self.file
            .write_all(raw.as_bytes())
            .map_err(|e| Error::from_io(&self.path, e))?;
        self.file.sync_all().map_err(|e| Error::from_io(&self.path, e))
    }

    /// Rotates the active journal to `.bak` and truncates the active file.
    pub fn rotate(&mut self, root: &Path) -> Result<()> {
        let bak = journal_bak_path(root);
        fs_err::rename(&self.path, &bak).map_err(|e| Error::from_io(&self.path, e.into()))?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| Error::from_io(&self.path, e))?;
        Ok(())
    }
}

/// Reads every well-formed record from `<root>/history/recovery.journal`,
/// in order. A journal that doesn't exist is treated as empty. A record
/// that fails its own checksum is dropped (it represents a torn write at
/// the tail of the journal from a crash mid-`fsync`) rather than aborting
/// the whole replay.
pub fn read_all(root: &Path) -> Result<Vec<JournalRecord>> {
    let path = journal_path(root);
    let mut bytes = Vec::new();
    match File::open(&path) {
        Ok(mut f) => {
            f.read_to_end(&mut bytes)
                .map_err(|e| Error::from_io(&path, e))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::from_io(&path, e)),
    }
    let mut out = Vec::new();
    for chunk in bytes.chunks_exact(JOURNAL_RECORD_LEN) {
        if let Ok(raw) = JournalRecordRaw::read_from_bytes(chunk) {
            if let Some(record) = JournalRecord::from_raw(raw) {
                out.push(record);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_checksum() {
        let rec = JournalRecord {
            op: JournalOp::Create,
            target_sector: 0x1234,
            sensor_id: 7,
            timestamp_ms: 42,
            prior_link: 0,
        };
        let raw = rec.to_raw();
        let decoded = JournalRecord::from_raw(raw).unwrap();
        assert_eq!(decoded.op, JournalOp::Create);
        assert_eq!(decoded.target_sector, 0x1234);
        assert_eq!(decoded.sensor_id, 7);
    }

    #[test]
    fn append_and_read_all_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        crate::disk::directory::ensure_dirs(dir.path(), 0, 1000).unwrap();
        let mut w = JournalWriter::open(dir.path()).unwrap();
        w.append(JournalRecord {
            op: JournalOp::Create,
            target_sector: 10,
            sensor_id: 1,
            timestamp_ms: 1,
            prior_link: 0,
        })
        .unwrap();
        w.append(JournalRecord {
            op: JournalOp::Delete,
            target_sector: 20,
            sensor_id: 2,
            timestamp_ms: 2,
            prior_link: 0,
        })
        .unwrap();
        let records = read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, JournalOp::Create);
        assert_eq!(records[1].target_sector, 20);
    }
}
