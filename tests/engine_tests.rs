// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! End-to-end scenarios driving the engine facade the way a host would:
//! register a stream, append, drain, force spillover, and recover from a
//! simulated crash.

use imx_tiered_store::constants::RecordType;
use imx_tiered_store::disk::{directory, file as disk_file};
use imx_tiered_store::{Engine, EngineConfig, Entry};

fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_test_writer()
        .try_init();
}

fn small_config(root: &std::path::Path) -> EngineConfig {
    EngineConfig {
        total_sectors: 4,
        high_water_percent: 50,
        ..EngineConfig::new(root)
    }
}

#[test]
fn ram_fill_and_drain_round_trips_and_frees() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, report) = Engine::init(EngineConfig::new(dir.path())).unwrap();
    assert_eq!(report.replayed_records, 0);

    engine.register_stream(1, RecordType::Tsd, 0).unwrap();
    for v in 0u32..10 {
        engine.stream_append(1, v, None, v as u64).unwrap();
    }

    let free_before_read = engine.get_memory_statistics().free_sectors;

    let mut values = Vec::new();
    while let Some(entry) = engine.stream_read_next(1).unwrap() {
        values.push(entry);
    }
    let expected: Vec<Entry> = (0u32..10).map(Entry::Tsd).collect();
    assert_eq!(values, expected);

    engine.free_stream_chain(1).unwrap();
    let stats = engine.get_memory_statistics();
    assert_eq!(stats.free_sectors, stats.total_sectors);
    assert!(stats.free_sectors > free_before_read);
}

#[test]
fn pressure_triggers_spillover_and_reads_still_span_tiers() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _report) = Engine::init(small_config(dir.path())).unwrap();
    engine.register_stream(7, RecordType::Tsd, 0).unwrap();

    for v in 0u32..8 {
        engine.stream_append(7, v, None, v as u64).unwrap();
    }

    // CheckPressure -> MigrateToDisk -> (Write+migrate) takes three ticks in
    // this synchronous state machine; drive enough of them to guarantee one
    // full migration happened.
    for t in 0..6u64 {
        engine.tick(100 + t).unwrap();
    }

    let mut values = Vec::new();
    while let Some(entry) = engine.stream_read_next(7).unwrap() {
        values.push(entry);
    }
    let expected: Vec<Entry> = (0u32..8).map(Entry::Tsd).collect();
    assert_eq!(values, expected, "entries must read back in order across RAM and disk");
}

#[test]
fn recovery_after_unclean_shutdown_validates_migrated_files() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    {
        let (mut engine, _report) = Engine::init(small_config(&root)).unwrap();
        engine.register_stream(3, RecordType::Tsd, 0).unwrap();
        for v in 0u32..8 {
            engine.stream_append(3, v, None, v as u64).unwrap();
        }
        for t in 0..6u64 {
            engine.tick(100 + t).unwrap();
        }
        // Dropped without calling `shutdown`, simulating a crash: no extra
        // journal/disk cleanup runs beyond what each operation already made
        // durable via fsync.
    }

    let (_engine, report) = Engine::init(small_config(&root)).unwrap();
    assert_eq!(report.quarantined_files, 0);
    assert!(report.orphaned_sectors.is_empty());

    let entries = directory::scan(&root).unwrap();
    assert_eq!(entries.len(), 1, "the migrated disk file must have survived recovery");
}

#[test]
fn cancelling_a_flush_returns_engine_to_idle_and_usable() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, _report) = Engine::init(small_config(dir.path())).unwrap();
    engine.register_stream(1, RecordType::Tsd, 0).unwrap();
    for v in 0u32..8 {
        engine.stream_append(1, v, None, v as u64).unwrap();
    }

    engine.flush_all_to_disk().unwrap();
    engine.cancel_memory_flush();
    engine.tick(1000).unwrap(); // FlushAll observes the cancel request
    engine.tick(1001).unwrap(); // CancellingFlush -> Idle

    assert!(engine.get_flush_progress() < imx_tiered_store::state_machine::FLUSH_DONE);

    // The engine must still be fully usable after a cancelled flush.
    engine.stream_append(1, 999, None, 1002).unwrap();
}

#[test]
fn corrupted_migrated_file_is_quarantined_on_recovery() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let stream_id = 5u16;

    {
        let (mut engine, _report) = Engine::init(small_config(&root)).unwrap();
        engine.register_stream(stream_id, RecordType::Tsd, 0).unwrap();
        for v in 0u32..8 {
            engine.stream_append(stream_id, v, None, v as u64).unwrap();
        }
        for t in 0..6u64 {
            engine.tick(100 + t).unwrap();
        }
    }

    let entries = directory::scan(&root).unwrap();
    assert_eq!(entries.len(), 1);
    let path = &entries[0].path;
    let mut bytes = fs_err::read(path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs_err::write(path, &bytes).unwrap();

    let (_engine, report) = Engine::init(small_config(&root)).unwrap();
    assert!(report.quarantined_files >= 1);
    assert!(directory::corrupted_dir(&root)
        .join(path.file_name().unwrap())
        .exists());

    // The rejected read is reachable directly too: the disk layer itself
    // reports DataCorrupt rather than silently truncating.
    let direct = disk_file::read(&root, small_config(&root).bucket_size, entries[0].disk_sector, stream_id);
    assert!(direct.is_err());
}

#[test]
fn invalid_config_is_rejected_before_touching_disk() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.total_sectors = 10;
    config.disk_base = 5; // must exceed total_sectors
    assert!(Engine::init(config).is_err());
}
