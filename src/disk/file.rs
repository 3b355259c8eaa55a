// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Disk file layer: encode/decode batched-sector files, atomic create via
//! temp+rename, and quarantine of corrupt files.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::constants::RecordType;
use crate::disk::directory::{self, corrupted_dir, path_of};
use crate::disk::format::{checksum_of, DiskFileHeader};
use crate::error::{Error, Result};

/// Creates a new disk file for `disk_sector`/`sensor_id`, containing
/// `payload` (the concatenated raw images of `sector_count` RAM sectors).
/// Always writes the current v2 format.
///
/// Sequence: write header+payload to a sibling `.tmp` file, `fsync` it,
/// `rename` onto the final name, then `fsync` the containing directory —
/// the file only ever exists at its final name once it is fully durable.
pub fn create(
    root: &Path,
    bucket_size: u32,
    disk_sector: u32,
    sensor_id: u16,
    record_type: RecordType,
    sector_size: u16,
    entries_per_sector: u16,
    sector_count: u16,
    payload: &[u8],
    created_time_ms: u64,
) -> Result<PathBuf> {
    let bucket = directory::ensure_dirs(root, disk_sector, bucket_size)?;
    let final_path = path_of(root, disk_sector, sensor_id, bucket_size);
    let tmp_path = final_path.with_extension("imx.tmp");

    let checksum = checksum_of(payload);
    let header = DiskFileHeader::new_v2(
        sensor_id,
        sector_count,
        sector_size,
        record_type,
        entries_per_sector,
        created_time_ms,
        checksum,
    );

    {
        let mut tmp = File::create(&tmp_path).map_err(|e| Error::from_io(&tmp_path, e))?;
        tmp.write_all(&header.to_bytes())
            .map_err(|e| Error::from_io(&tmp_path, e))?;
        tmp.write_all(payload)
            .map_err(|e| Error::from_io(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| Error::from_io(&tmp_path, e))?;
    }
    set_file_mode(&tmp_path)?;

    fs_err::rename(&tmp_path, &final_path).map_err(|e| Error::from_io(&final_path, e.into()))?;
    sync_dir(&bucket)?;

    tracing::debug!(
        disk_sector,
        sensor_id,
        sector_count,
        bytes = payload.len(),
        "created disk file"
    );
    Ok(final_path)
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perm = std::fs::Permissions::from_mode(0o644);
    std::fs::set_permissions(path, perm).map_err(|e| Error::from_io(path, e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

/// Reads and validates the disk file for `disk_sector`/`sensor_id`,
/// returning its header and payload. On magic/version/sensor-id/checksum
/// failure, the file is moved to `<root>/history/corrupted/` and
/// [`Error::DataCorrupt`] is returned.
pub fn read(
    root: &Path,
    bucket_size: u32,
    disk_sector: u32,
    sensor_id: u16,
) -> Result<(DiskFileHeader, Vec<u8>)> {
    let path = path_of(root, disk_sector, sensor_id, bucket_size);
    match try_read(&path, sensor_id) {
        Ok(result) => Ok(result),
        Err(err @ Error::DataCorrupt { .. }) => {
            quarantine(root, &path)?;
            tracing::warn!(?path, "quarantined corrupt disk file");
            Err(err)
        }
        Err(other) => Err(other),
    }
}

fn try_read(path: &Path, expected_sensor_id: u16) -> Result<(DiskFileHeader, Vec<u8>)> {
    let bytes = fs_err::read(path).map_err(|e| Error::from_io(path, e.into()))?;
    let header = DiskFileHeader::parse(path, &bytes)?;
    if header.sensor_id() != expected_sensor_id {
        return Err(Error::DataCorrupt {
            path: path.to_path_buf(),
            reason: format!(
                "sensor id mismatch: path names {expected_sensor_id}, header says {}",
                header.sensor_id()
            ),
        });
    }
    let payload = bytes[crate::constants::DISK_HEADER_LEN..].to_vec();
    header.verify_checksum(path, &payload)?;
    Ok((header, payload))
}

fn quarantine(root: &Path, path: &Path) -> Result<()> {
    directory::ensure_corrupted_dir(root)?;
    if !path.exists() {
        return Ok(());
    }
    let dest = corrupted_dir(root).join(
        path.file_name()
            .expect("disk file path always has a file name"),
    );
    fs_err::rename(path, &dest).map_err(|e| Error::from_io(path, e.into()))?;
    Ok(())
}

/// Deletes the disk file for `disk_sector`/`sensor_id`. The caller is
/// responsible for emitting the journal record before calling this.
pub fn delete(root: &Path, bucket_size: u32, disk_sector: u32, sensor_id: u16) -> Result<()> {
    let path = path_of(root, disk_sector, sensor_id, bucket_size);
    match fs_err::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::from_io(&path, e.into())),
    }
    sync_dir(&directory::bucket_dir(root, disk_sector, bucket_size))?;
    tracing::debug!(disk_sector, sensor_id, "deleted disk file");
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<()> {
    let f = File::open(dir).map_err(|e| Error::from_io(dir, e))?;
    f.sync_all().map_err(|e| Error::from_io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0xAB; 32];
        create(
            dir.path(),
            1000,
            5,
            200,
            RecordType::Tsd,
            32,
            7,
            1,
            &payload,
            1234,
        )
        .unwrap();
        let (header, read_payload) = read(dir.path(), 1000, 5, 200).unwrap();
        assert_eq!(header.sensor_id(), 200);
        assert_eq!(header.sector_count(), 1);
        assert_eq!(read_payload, payload);
    }

    #[test]
    fn corrupted_checksum_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0xCD; 32];
        let path = create(
            dir.path(),
            1000,
            9,
            3,
            RecordType::Tsd,
            32,
            7,
            1,
            &payload,
            0,
        )
        .unwrap();

        // Flip a payload byte in place to break the checksum.
        let mut bytes = fs_err::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs_err::write(&path, &bytes).unwrap();

        let err = read(dir.path(), 1000, 9, 3).unwrap_err();
        assert!(matches!(err, Error::DataCorrupt { .. }));
        assert!(!path.exists());
        assert!(corrupted_dir(dir.path()).join(path.file_name().unwrap()).exists());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        directory::ensure_dirs(dir.path(), 0, 1000).unwrap();
        delete(dir.path(), 1000, 0, 1).unwrap();
        delete(dir.path(), 1000, 0, 1).unwrap();
    }
}
