// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Stream descriptor: per-sensor/control bookkeeping for a single
//! append-only TSD/EVT stream.

use crate::constants::RecordType;

/// Identifies a registered stream (a "sensor" or "control" in the source
/// domain).
pub type StreamId = u16;

/// The mutable chain state for one stream.
#[derive(Debug, Clone, Default)]
pub struct DataStore {
    /// Extended address (RAM or disk) of the chain head, or `None` if the
    /// stream has never had data.
    pub head: Option<u32>,
    /// RAM sector index currently being appended to, or `None` if the
    /// stream's tail has been spilled to disk and no RAM sector has been
    /// allocated since.
    pub tail: Option<u32>,
    /// When `head` names a disk file (a batched blob of several RAM-sector
    /// images), the slot within that file currently being drained. Unused
    /// (always `0`) while `head` is a RAM index.
    pub head_disk_slot: u32,
    /// Entry-granularity offset within the tail sector at which the next
    /// append should land, before adding `count mod entries_per_sector`.
    /// Nonzero only when a tail sector is reused mid-sector, e.g. after
    /// recovery reattaches a partially-filled sector.
    pub start_index_within_tail: u32,
    /// Number of entries already consumed from the current head sector by
    /// `stream_read_next`. Needed to drain a sector entry-by-entry, freeing
    /// it only once fully drained, for partial reads.
    pub head_read_offset: u32,
    /// Total entries ever appended (monotonic; read draining does not
    /// decrement it — `pending` tracks what's left to drain).
    pub count: u64,
    /// Entries appended but not yet drained by a reader.
    pub pending: u64,
    /// Cache of the most recently appended value (the `value` word only,
    /// for both TSD and EVT).
    pub last_value: u32,
    /// Cleared when a chain-walk or checksum failure is detected against
    /// this stream; once false the stream refuses further reads until the
    /// host re-registers it.
    pub valid: bool,
}

impl DataStore {
    fn new() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }
}

/// A registered TSD/EVT stream.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub id: StreamId,
    pub data_type: RecordType,
    /// Sample rate in Hz; `0` means event-driven (EVT streams are always
    /// `0`; TSD streams may be periodic or `0`).
    pub sample_rate: u32,
    pub enabled: bool,
    pub data_store: DataStore,
}

impl StreamDescriptor {
    pub fn new(id: StreamId, data_type: RecordType, sample_rate: u32) -> Self {
        Self {
            id,
            data_type,
            sample_rate,
            enabled: true,
            data_store: DataStore::new(),
        }
    }

    pub fn entries_per_sector(&self, payload_words: u32) -> u32 {
        self.data_type.entries_per_sector(payload_words)
    }
}

/// One decoded stream entry, returned by `stream_read_next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Tsd(u32),
    Evt { timestamp: u32, value: u32 },
}

impl Entry {
    pub fn value(self) -> u32 {
        match self {
            Entry::Tsd(v) => v,
            Entry::Evt { value, .. } => value,
        }
    }
}
