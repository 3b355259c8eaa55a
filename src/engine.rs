// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! The engine facade: the single entry point host code drives. Owns the
//! sector pool, the registered streams, the journal, and the state machine,
//! and is the only place that is allowed to touch more than one of those at
//! once.
//!
//! Mirrors the host-facing API one-to-one; everything below that is
//! orchestration private to this module.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::address::ExtendedAddr;
use crate::constants::{
    RecordType, DEFAULT_BUCKET_SIZE, DEFAULT_CANCEL_TIMEOUT_MS, DEFAULT_HIGH_WATER_PERCENT,
    DEFAULT_SECTOR_SIZE, DEFAULT_TOTAL_SECTORS, END,
};
use crate::disk::journal::{JournalOp, JournalRecord, JournalWriter};
use crate::disk::{directory, file as disk_file};
use crate::error::{Error, Result};
use crate::sector::{chain, SectorPool};
use crate::state_machine::{State, StateMachine, FLUSH_DONE};
use crate::stats::{MemoryStatistics, StatsTracker};
use crate::stream::descriptor::{DataStore, Entry, StreamDescriptor, StreamId};
use crate::stream::writer;

/// Configuration surface. `Default` matches the constants in
/// `constants.rs`; `root` still has to be supplied since there is no sane
/// default directory for a host's telemetry store.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory under which `history/` (and its bucket subdirectories,
    /// `corrupted/`, and the recovery journal) are created.
    pub root: PathBuf,
    /// Fixed size, in bytes, of every RAM sector and of every batched
    /// RAM-sector image stored on disk.
    pub sector_size: u16,
    /// Number of sectors in the RAM pool.
    pub total_sectors: u32,
    /// Sectors `0..reserved_prefix` are never handed out by the allocator.
    pub reserved_prefix: u32,
    /// Usage percentage (of `total_sectors`) at which `tick()` starts
    /// migrating sectors to disk.
    pub high_water_percent: u8,
    /// Upper bound, in milliseconds, on how long `cancel_memory_flush`
    /// should take effect.
    pub cancel_timeout_ms: u64,
    /// Number of consecutive disk sector indices grouped under one bucket
    /// directory.
    pub bucket_size: u32,
    /// First extended address considered a disk address; must exceed
    /// `total_sectors` so no RAM index is ever misclassified.
    pub disk_base: u32,
    /// Maximum number of RAM-sector images batched into one disk file by a
    /// single migration step.
    pub ram_sectors_per_disk: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            sector_size: DEFAULT_SECTOR_SIZE as u16,
            total_sectors: DEFAULT_TOTAL_SECTORS,
            reserved_prefix: 0,
            high_water_percent: DEFAULT_HIGH_WATER_PERCENT,
            cancel_timeout_ms: DEFAULT_CANCEL_TIMEOUT_MS,
            bucket_size: DEFAULT_BUCKET_SIZE,
            disk_base: 0x0001_0000,
            ram_sectors_per_disk: 64,
        }
    }
}

impl EngineConfig {
    /// Convenience constructor overriding only `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sector_size as u32 <= crate::constants::SECTOR_TRAILER_BYTES {
            return Err(Error::InvalidConfig(
                "sector_size must be larger than the trailer",
            ));
        }
        if self.total_sectors == 0 {
            return Err(Error::InvalidConfig("total_sectors must be nonzero"));
        }
        if self.reserved_prefix > self.total_sectors {
            return Err(Error::InvalidConfig(
                "reserved_prefix cannot exceed total_sectors",
            ));
        }
        if !(1..=100).contains(&self.high_water_percent) {
            return Err(Error::InvalidConfig(
                "high_water_percent must be in 1..=100",
            ));
        }
        if self.bucket_size == 0 {
            return Err(Error::InvalidConfig("bucket_size must be nonzero"));
        }
        if self.disk_base <= self.total_sectors {
            return Err(Error::InvalidConfig(
                "disk_base must exceed total_sectors so RAM and disk addresses never overlap",
            ));
        }
        if self.ram_sectors_per_disk == 0 {
            return Err(Error::InvalidConfig(
                "ram_sectors_per_disk must be nonzero",
            ));
        }
        Ok(())
    }
}

/// Outcome of replaying the recovery journal and validating disk files at
/// startup. Returned by [`Engine::init`] alongside the engine itself so the
/// host can log or alert on anomalies.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Number of well-formed journal records replayed.
    pub replayed_records: usize,
    /// `Create` records whose file was never found (the RAM image that
    /// would have recreated it did not survive the crash).
    pub orphaned_sectors: Vec<u32>,
    /// Disk files that failed validation and were quarantined.
    pub quarantined_files: usize,
}

/// The engine facade. Not `Sync`; a host embedding it across threads serializes
/// access through one mutex guarding the whole `Engine`.
pub struct Engine {
    config: EngineConfig,
    pool: SectorPool,
    streams: HashMap<StreamId, StreamDescriptor>,
    journal: JournalWriter,
    state_machine: StateMachine,
    stats: StatsTracker,
    next_disk_index: u32,
}

impl Engine {
    /// Opens (or initializes) the engine rooted at `config.root`, replaying
    /// the recovery journal and validating every disk file before returning.
    pub fn init(config: EngineConfig) -> Result<(Self, RecoveryReport)> {
        config.validate()?;
        directory::ensure_dirs(&config.root, 0, config.bucket_size)?;

        let pool = SectorPool::new(
            config.sector_size as u32,
            config.total_sectors,
            config.reserved_prefix,
        )?;

        let mut state_machine = StateMachine {
            state: State::Recovering,
            ..StateMachine::default()
        };

        let records = crate::disk::journal::read_all(&config.root)?;
        let mut journal = JournalWriter::open(&config.root)?;

        let mut orphaned_sectors = Vec::new();
        for rec in &records {
            match rec.op {
                JournalOp::Create => {
                    let path = directory::path_of(
                        &config.root,
                        rec.target_sector,
                        rec.sensor_id,
                        config.bucket_size,
                    );
                    if !path.exists() {
                        orphaned_sectors.push(rec.target_sector);
                        tracing::warn!(
                            sector = rec.target_sector,
                            sensor_id = rec.sensor_id,
                            "journal create record has no matching file; RAM image did not survive restart"
                        );
                    }
                }
                JournalOp::Delete => {
                    // Idempotent: finishes a delete interrupted mid-fsync.
                    disk_file::delete(
                        &config.root,
                        config.bucket_size,
                        rec.target_sector,
                        rec.sensor_id,
                    )?;
                }
                JournalOp::UpdateLink => {
                    tracing::debug!(
                        sector = rec.target_sector,
                        "update-link record targets RAM state, which does not survive a restart; skipped"
                    );
                }
            }
        }

        let mut quarantined_files = 0usize;
        let mut max_disk_index = None;
        for entry in directory::scan(&config.root)? {
            max_disk_index = Some(max_disk_index.map_or(entry.disk_sector, |m: u32| {
                m.max(entry.disk_sector)
            }));
            if disk_file::read(
                &config.root,
                config.bucket_size,
                entry.disk_sector,
                entry.sensor_id,
            )
            .is_err()
            {
                quarantined_files += 1;
            }
        }

        journal.rotate(&config.root)?;
        state_machine.state = State::Idle;

        let next_disk_index = match max_disk_index {
            Some(m) if m >= config.disk_base => m + 1,
            _ => config.disk_base,
        };

        let report = RecoveryReport {
            replayed_records: records.len(),
            orphaned_sectors,
            quarantined_files,
        };
        tracing::debug!(?report, "recovery complete");

        Ok((
            Self {
                config,
                pool,
                streams: HashMap::new(),
                journal,
                state_machine,
                stats: StatsTracker::default(),
                next_disk_index,
            },
            report,
        ))
    }

    /// Registers a new stream. Returns [`Error::InvalidConfig`] if `id` is
    /// already registered.
    pub fn register_stream(
        &mut self,
        id: StreamId,
        data_type: RecordType,
        sample_rate: u32,
    ) -> Result<()> {
        if self.streams.contains_key(&id) {
            return Err(Error::InvalidConfig("stream id already registered"));
        }
        self.streams
            .insert(id, StreamDescriptor::new(id, data_type, sample_rate));
        Ok(())
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut StreamDescriptor> {
        self.streams.get_mut(&id).ok_or(Error::UnknownStream(id))
    }

    fn stream(&self, id: StreamId) -> Result<&StreamDescriptor> {
        self.streams.get(&id).ok_or(Error::UnknownStream(id))
    }

    /// Appends one entry to `id`. `timestamp` is required for EVT streams
    /// and ignored for TSD streams.
    pub fn stream_append(
        &mut self,
        id: StreamId,
        value: u32,
        timestamp: Option<u32>,
        now_ms: u64,
    ) -> Result<()> {
        let data_type = self.stream(id)?.data_type;
        let entry = match data_type {
            RecordType::Tsd => Entry::Tsd(value),
            RecordType::Evt => Entry::Evt {
                timestamp: timestamp
                    .ok_or(Error::InvalidConfig("EVT append requires a timestamp"))?,
                value,
            },
        };

        let eps = self
            .stream(id)?
            .entries_per_sector(self.pool.payload_words());
        let need_new_tail = {
            let ds = &self.stream(id)?.data_store;
            ds.tail.is_none() || ds.count % eps as u64 == 0
        };

        if need_new_tail {
            self.roll_tail(id, data_type, entry, now_ms)?;
            // roll_tail already wrote the entry (either into the fresh RAM
            // tail or, on total exhaustion, straight into a new disk file)
            // and updated count/pending/last_value.
            return Ok(());
        }

        let ds = &self.stream(id)?.data_store;
        let tail = ds.tail.ok_or(Error::ChainCorrupt {
            stream: id,
            reason: "need_new_tail was false but the stream has no tail sector",
        })?;
        let word_offset =
            writer::write_word_offset(data_type, ds.start_index_within_tail, ds.count, eps);
        let words = writer::encode(data_type, entry)?;
        self.pool
            .write_words(tail, word_offset, &words, data_type.entry_words())?;

        let ds = &mut self.stream_mut(id)?.data_store;
        ds.count += 1;
        ds.pending += 1;
        ds.last_value = entry.value();
        Ok(())
    }

    /// Ensures the stream has a writable RAM tail, allocating one (after one
    /// pressure-relief attempt) or falling back to a single-entry disk file
    /// if RAM is completely exhausted, and writes `entry` into it.
    fn roll_tail(
        &mut self,
        id: StreamId,
        data_type: RecordType,
        entry: Entry,
        now_ms: u64,
    ) -> Result<()> {
        let mut new_sector = self.pool.alloc();
        if new_sector.is_none() {
            let _ = self.migrate_one(now_ms);
            new_sector = self.pool.alloc();
        }

        match new_sector {
            Some(sector) => {
                let (old_tail, had_head) = {
                    let ds = &self.stream(id)?.data_store;
                    (ds.tail, ds.head.is_some())
                };
                if let Some(old_tail) = old_tail {
                    chain::set_next(&mut self.pool, old_tail, Some(sector))?;
                }
                self.stats.record_alloc();

                let words = writer::encode(data_type, entry)?;
                self.pool
                    .write_words(sector, 0, &words, data_type.entry_words())?;

                let ds = &mut self.stream_mut(id)?.data_store;
                if old_tail.is_none() && !had_head {
                    ds.head = Some(sector);
                }
                ds.tail = Some(sector);
                ds.start_index_within_tail = 0;
                ds.count += 1;
                ds.pending += 1;
                ds.last_value = entry.value();
                Ok(())
            }
            None => {
                tracing::warn!(stream = id, "ram exhausted; writing directly to disk");
                self.append_direct_to_disk(id, data_type, entry, now_ms)
            }
        }
    }

    /// Emergency path ("falls back to the disk path" when RAM is completely
    /// exhausted): builds a one-sector image containing `entry` and writes it
    /// straight to a new disk file without ever touching the RAM pool.
    fn append_direct_to_disk(
        &mut self,
        id: StreamId,
        data_type: RecordType,
        entry: Entry,
        now_ms: u64,
    ) -> Result<()> {
        let sector_size = self.pool.sector_size();
        let mut image = vec![0u8; sector_size as usize];
        let words = writer::encode(data_type, entry)?;
        for (i, w) in words.iter().enumerate() {
            image[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        image[sector_size as usize - 4..].copy_from_slice(&END.to_le_bytes());

        let disk_addr = self.next_disk_index;
        self.next_disk_index += 1;
        let eps = self
            .stream(id)?
            .entries_per_sector(self.pool.payload_words());

        disk_file::create(
            &self.config.root,
            self.config.bucket_size,
            disk_addr,
            id,
            data_type,
            sector_size as u16,
            eps as u16,
            1,
            &image,
            now_ms,
        )?;
        self.journal.append(JournalRecord {
            op: JournalOp::Create,
            target_sector: disk_addr,
            sensor_id: id,
            timestamp_ms: now_ms,
            prior_link: 0,
        })?;

        let old_tail = {
            let ds = &mut self.stream_mut(id)?.data_store;
            ds.tail.take()
        };
        if let Some(old_tail) = old_tail {
            self.pool.set_next(old_tail, disk_addr)?;
        }
        let ds = &mut self.stream_mut(id)?.data_store;
        if ds.head.is_none() {
            ds.head = Some(disk_addr);
        }
        ds.count += 1;
        ds.pending += 1;
        ds.last_value = entry.value();
        Ok(())
    }

    /// Reads the next undrained entry from `id`, advancing (and, once a
    /// non-tail sector is fully consumed, freeing or deleting it) the read
    /// cursor.
    pub fn stream_read_next(&mut self, id: StreamId) -> Result<Option<Entry>> {
        if !self.stream(id)?.data_store.valid {
            return Err(Error::ChainCorrupt {
                stream: id,
                reason: "stream marked invalid by a prior chain corruption",
            });
        }
        if self.stream(id)?.data_store.pending == 0 {
            return Ok(None);
        }

        let data_type = self.stream(id)?.data_type;
        let disk_base = self.config.disk_base;
        let head = self.stream(id)?.data_store.head.ok_or(Error::ChainCorrupt {
            stream: id,
            reason: "pending entries but no chain head",
        })?;

        let entry = match ExtendedAddr::classify(head, disk_base) {
            Some(ExtendedAddr::Ram(sector)) => self.read_from_ram_head(id, sector, data_type)?,
            Some(ExtendedAddr::Disk(disk_addr)) => {
                self.read_from_disk_head(id, disk_addr, data_type)?
            }
            None => return Ok(None),
        };

        let ds = &mut self.stream_mut(id)?.data_store;
        ds.pending -= 1;
        Ok(Some(entry))
    }

    /// Validates that `head`'s RAM chain contains no cycle and no link into
    /// a non-allocated sector, bounded by `max_hops`. On failure, marks the
    /// stream invalid so further reads are refused until the host frees and
    /// re-registers it.
    fn validate_ram_chain(&mut self, id: StreamId, head: u32, max_hops: u32) -> Result<()> {
        match chain::walk(&self.pool, head, max_hops, id, |_| {}) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stream_mut(id)?.data_store.valid = false;
                tracing::error!(stream = id, error = %e, "chain corruption detected; stream marked invalid");
                Err(e)
            }
        }
    }

    fn read_from_ram_head(
        &mut self,
        id: StreamId,
        sector: u32,
        data_type: RecordType,
    ) -> Result<Entry> {
        let eps = self
            .stream(id)?
            .entries_per_sector(self.pool.payload_words());
        let max_hops = (self.stream(id)?.data_store.pending).div_ceil(eps.max(1) as u64) as u32 + 1;
        self.validate_ram_chain(id, sector, max_hops)?;
        let read_offset = self.stream(id)?.data_store.head_read_offset;
        let word_offset = writer::read_word_offset(data_type, read_offset);
        let mut words = vec![0u32; data_type.entry_words() as usize];
        self.pool
            .read_words(sector, word_offset, &mut words, data_type.entry_words())?;
        let entry = writer::decode(data_type, &words);

        let (new_offset, is_tail) = {
            let ds = &self.stream(id)?.data_store;
            (ds.head_read_offset + 1, ds.tail == Some(sector))
        };
        let sector_exhausted = new_offset >= eps;

        if sector_exhausted && !is_tail {
            let next = chain::next(&self.pool, sector)?;
            self.pool.free(sector)?;
            self.stats.record_free();
            let ds = &mut self.stream_mut(id)?.data_store;
            ds.head = next;
            ds.head_read_offset = 0;
            ds.head_disk_slot = 0;
        } else {
            let ds = &mut self.stream_mut(id)?.data_store;
            ds.head_read_offset = new_offset;
        }
        Ok(entry)
    }

    fn read_from_disk_head(
        &mut self,
        id: StreamId,
        disk_addr: u32,
        data_type: RecordType,
    ) -> Result<Entry> {
        let (header, payload) = disk_file::read(
            &self.config.root,
            self.config.bucket_size,
            disk_addr,
            id,
        )?;
        let sector_size = header.sector_size() as usize;
        let slot = self.stream(id)?.data_store.head_disk_slot;
        let read_offset = self.stream(id)?.data_store.head_read_offset;

        let slot_start = slot as usize * sector_size;
        let slot_bytes = &payload[slot_start..slot_start + sector_size];
        let word_offset = writer::read_word_offset(data_type, read_offset) as usize;
        let n = data_type.entry_words() as usize;
        let mut words = vec![0u32; n];
        for (i, w) in words.iter_mut().enumerate() {
            let off = word_offset * 4 + i * 4;
            *w = u32::from_le_bytes(slot_bytes[off..off + 4].try_into().unwrap());
        }
        let entry = writer::decode(data_type, &words);

        let ds = &mut self.stream_mut(id)?.data_store;
        ds.head_read_offset += 1;
        if ds.head_read_offset >= header.entries_per_sector() as u32 {
            ds.head_read_offset = 0;
            if slot + 1 < header.sector_count() as u32 {
                ds.head_disk_slot = slot + 1;
            } else {
                // Last slot of this blob drained; the continuation address
                // is the trailer of that last sub-sector, preserved verbatim
                // from RAM at migration time.
                let trailer_off = (header.sector_count() as usize - 1) * sector_size
                    + sector_size
                    - 4;
                let continuation =
                    u32::from_le_bytes(payload[trailer_off..trailer_off + 4].try_into().unwrap());
                ds.head = if continuation == END {
                    None
                } else {
                    Some(continuation)
                };
                ds.head_disk_slot = 0;
                drop(ds);
                self.journal.append(JournalRecord {
                    op: JournalOp::Delete,
                    target_sector: disk_addr,
                    sensor_id: id,
                    timestamp_ms: 0,
                    prior_link: 0,
                })?;
                disk_file::delete(&self.config.root, self.config.bucket_size, disk_addr, id)?;
            }
        }
        Ok(entry)
    }

    /// Frees every RAM sector still held by `id`'s chain and resets it to
    /// empty, without touching any disk files the chain may still reference.
    pub fn free_stream_chain(&mut self, id: StreamId) -> Result<()> {
        let head = self.stream(id)?.data_store.head;
        let disk_base = self.config.disk_base;
        if let Some(ExtendedAddr::Ram(start)) = head.and_then(|h| ExtendedAddr::classify(h, disk_base)) {
            let eps = self
                .stream(id)?
                .entries_per_sector(self.pool.payload_words());
            let count = self.stream(id)?.data_store.count;
            let max_hops = count.div_ceil(eps.max(1) as u64) as u32 + 1;
            self.validate_ram_chain(id, start, max_hops)?;

            let mut current = Some(start);
            while let Some(sector) = current {
                if !self.pool.allocator().is_allocated(sector) {
                    break;
                }
                let next = chain::next(&self.pool, sector)?;
                self.pool.free(sector)?;
                self.stats.record_free();
                current = next.filter(|n| ExtendedAddr::classify(*n, disk_base).map(|a| a.is_ram()).unwrap_or(false));
            }
        }
        let ds = &mut self.stream_mut(id)?.data_store;
        *ds = DataStore::default();
        ds.valid = true;
        Ok(())
    }

    /// Direct RAM sector access, exposed for hosts that manage their own
    /// sectors outside the stream abstraction.
    pub fn alloc_sector(&mut self) -> Option<u32> {
        let s = self.pool.alloc();
        if s.is_some() {
            self.stats.record_alloc();
        }
        s
    }

    pub fn free_sector(&mut self, sector: u32) -> Result<()> {
        self.pool.free(sector)?;
        self.stats.record_free();
        Ok(())
    }

    pub fn read_words(&self, sector: u32, word_offset: u32, dst: &mut [u32], n_words: u32) -> Result<()> {
        self.pool.read_words_checked(sector, word_offset, dst, n_words)
    }

    pub fn write_words(&mut self, sector: u32, word_offset: u32, src: &[u32], n_words: u32) -> Result<()> {
        self.pool.write_words_checked(sector, word_offset, src, n_words)
    }

    /// Extended-address read: dispatches to RAM directly; a disk address
    /// cannot be resolved without stream context (a disk file is named by
    /// sensor id as well as disk sector, and reading past slot 0 needs the
    /// per-stream drain cursor), so callers crossing tiers use
    /// [`Self::stream_read_next`] instead.
    pub fn read_ext(&self, addr: u32, word_offset: u32, dst: &mut [u32], n_words: u32) -> Result<()> {
        match ExtendedAddr::classify(addr, self.config.disk_base) {
            Some(ExtendedAddr::Ram(sector)) => self.read_words(sector, word_offset, dst, n_words),
            Some(ExtendedAddr::Disk(_)) => Err(Error::InvalidConfig(
                "read_ext on a disk address requires stream context; use stream_read_next",
            )),
            None => Err(Error::InvalidSector(addr)),
        }
    }

    pub fn write_ext(&mut self, addr: u32, word_offset: u32, src: &[u32], n_words: u32) -> Result<()> {
        match ExtendedAddr::classify(addr, self.config.disk_base) {
            Some(ExtendedAddr::Ram(sector)) => self.write_words(sector, word_offset, src, n_words),
            Some(ExtendedAddr::Disk(_)) => Err(Error::InvalidConfig(
                "disk sectors are immutable once migrated; cannot write_ext",
            )),
            None => Err(Error::InvalidSector(addr)),
        }
    }

    /// Advances the tiered state machine by one suspension point. A host
    /// drives this on a timer or idle loop; each call does at most one
    /// bounded unit of migration work.
    pub fn tick(&mut self, now_ms: u64) -> Result<()> {
        match self.state_machine.state {
            State::Idle => {
                self.state_machine.state = State::CheckPressure;
            }
            State::CheckPressure => {
                let stats = self.stats.snapshot(self.pool.allocator());
                self.state_machine.state = if stats.usage_percentage >= self.config.high_water_percent {
                    State::MigrateToDisk
                } else {
                    State::Idle
                };
            }
            State::MigrateToDisk => {
                self.state_machine.state = State::WritePending;
                self.state_machine.pending_disk_writes += 1;
                let result = self.migrate_one(now_ms);
                self.state_machine.pending_disk_writes -= 1;
                if let Err(e) = result {
                    tracing::error!(error = %e, "migration to disk failed");
                    self.stats.record_disk_failure();
                }
                self.state_machine.state = if self.state_machine.cancel_requested {
                    State::CancellingFlush
                } else {
                    State::CheckPressure
                };
            }
            State::WritePending => {
                // Never observed between ticks in this synchronous
                // implementation; MigrateToDisk resolves it in the same
                // call. Defensive fallback only.
                self.state_machine.state = State::CheckPressure;
            }
            State::FlushAll => {
                if self.state_machine.cancel_requested {
                    self.state_machine.state = State::CancellingFlush;
                    return Ok(());
                }
                match self.migrate_one(now_ms) {
                    Ok(true) => self.state_machine.migrated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "flush migration step failed");
                        self.stats.record_disk_failure();
                    }
                }
                if self.is_all_ram_empty() {
                    self.state_machine.flush_progress = FLUSH_DONE;
                    self.state_machine.state = State::Idle;
                } else {
                    self.state_machine.flush_progress = StateMachine::progress_for(
                        self.state_machine.migrated,
                        self.state_machine.initial_pending,
                    );
                }
            }
            State::CancellingFlush => {
                self.state_machine.cancel_requested = false;
                self.state_machine.cancel_deadline_ms = None;
                self.state_machine.state = State::Idle;
                tracing::warn!("memory flush cancelled");
            }
            State::Recovering => {
                // Only set during `init`; tick() never observes it.
                self.state_machine.state = State::Idle;
            }
        }
        Ok(())
    }

    /// Starts (or no-ops if already running) a full RAM-to-disk flush.
    pub fn flush_all_to_disk(&mut self) -> Result<()> {
        if self.state_machine.state == State::FlushAll {
            return Ok(());
        }
        let stats = self.stats.snapshot(self.pool.allocator());
        self.state_machine.initial_pending = stats.used_sectors.max(1);
        self.state_machine.migrated = 0;
        self.state_machine.flush_progress = 0;
        self.state_machine.state = State::FlushAll;
        Ok(())
    }

    pub fn get_flush_progress(&self) -> u8 {
        self.state_machine.flush_progress
    }

    /// Requests cancellation of an in-flight migration or flush. No-op if
    /// the machine is already idle.
    pub fn cancel_memory_flush(&mut self) {
        if matches!(
            self.state_machine.state,
            State::MigrateToDisk | State::WritePending | State::FlushAll
        ) {
            self.state_machine.cancel_requested = true;
        }
    }

    /// True iff no stream has a RAM-resident sector (head or tail) with
    /// pending entries. Deliberately does not count pre-allocated sectors
    /// with no data, since that would make this return `false` for streams
    /// that have a tail sector reserved but nothing written to it yet — see
    /// DESIGN.md.
    pub fn is_all_ram_empty(&self) -> bool {
        let disk_base = self.config.disk_base;
        self.streams.values().all(|s| {
            let ds = &s.data_store;
            if ds.count == 0 {
                return true;
            }
            let head_is_ram = ds
                .head
                .and_then(|h| ExtendedAddr::classify(h, disk_base))
                .map(|a| a.is_ram())
                .unwrap_or(false);
            !(head_is_ram || ds.tail.is_some())
        })
    }

    pub fn get_memory_statistics(&mut self) -> MemoryStatistics {
        self.stats.snapshot(self.pool.allocator())
    }

    /// Shuts the engine down cleanly: nothing to flush to disk on its own
    /// (RAM data that hasn't been migrated is simply lost on restart, per
    /// the tiering contract), but an in-flight flush or migration is
    /// cancelled so the journal is left in a consistent state.
    pub fn shutdown(mut self) -> Result<()> {
        self.cancel_memory_flush();
        Ok(())
    }

    /// Performs one bounded migration step: picks the stream with the
    /// oldest-allocated eligible RAM prefix, batches up to
    /// `ram_sectors_per_disk` of its non-tail sectors into one new disk
    /// file, and frees them. Returns `false` if no stream has anything
    /// eligible to migrate.
    fn migrate_one(&mut self, now_ms: u64) -> Result<bool> {
        let Some(candidate) = self.pick_migration_candidate() else {
            return Ok(false);
        };

        let head = match self.stream(candidate)?.data_store.head {
            Some(h) => h,
            None => return Ok(false),
        };
        if ExtendedAddr::classify(head, self.config.disk_base)
            .map(|a| a.is_disk())
            .unwrap_or(true)
        {
            return Ok(false);
        }
        self.validate_ram_chain(
            candidate,
            head,
            self.config.ram_sectors_per_disk.saturating_add(1),
        )?;

        let (secs, continuation, data_type, eps) = {
            let stream = self.stream(candidate)?;
            let ds = &stream.data_store;
            let mut secs = Vec::new();
            let mut cur = head;
            let continuation;
            loop {
                if secs.len() as u32 >= self.config.ram_sectors_per_disk || Some(cur) == ds.tail {
                    continuation = cur;
                    break;
                }
                secs.push(cur);
                match chain::next(&self.pool, cur)? {
                    Some(n) => cur = n,
                    None => {
                        continuation = END;
                        break;
                    }
                }
            }
            (
                secs,
                continuation,
                stream.data_type,
                stream.entries_per_sector(self.pool.payload_words()),
            )
        };

        if secs.is_empty() {
            return Ok(false);
        }

        let mut payload = Vec::with_capacity(secs.len() * self.pool.sector_size() as usize);
        for &s in &secs {
            payload.extend_from_slice(self.pool.raw_image(s)?);
        }

        let disk_addr = self.next_disk_index;
        self.next_disk_index += 1;

        disk_file::create(
            &self.config.root,
            self.config.bucket_size,
            disk_addr,
            candidate,
            data_type,
            self.pool.sector_size() as u16,
            eps as u16,
            secs.len() as u16,
            &payload,
            now_ms,
        )?;
        self.journal.append(JournalRecord {
            op: JournalOp::Create,
            target_sector: disk_addr,
            sensor_id: candidate,
            timestamp_ms: now_ms,
            prior_link: continuation,
        })?;

        for &s in &secs {
            self.pool.free(s)?;
            self.stats.record_free();
        }

        let ds = &mut self.stream_mut(candidate)?.data_store;
        ds.head = Some(disk_addr);
        ds.head_disk_slot = 0;
        // head_read_offset is unchanged: slot 0 of the new blob is exactly
        // the old head sector, with whatever read progress it already had.

        Ok(true)
    }

    fn pick_migration_candidate(&self) -> Option<StreamId> {
        let disk_base = self.config.disk_base;
        self.streams
            .values()
            .filter_map(|s| {
                let head = s.data_store.head?;
                let is_ram = ExtendedAddr::classify(head, disk_base)
                    .map(|a| a.is_ram())
                    .unwrap_or(false);
                if s.enabled
                    && s.data_store.count > 0
                    && is_ram
                    && s.data_store.head != s.data_store.tail
                {
                    Some((self.pool.allocator().alloc_seq(head).unwrap_or(u64::MAX), s.id))
                } else {
                    None
                }
            })
            .min_by_key(|&(seq, id)| (seq, id))
            .map(|(_, id)| id)
    }
}
