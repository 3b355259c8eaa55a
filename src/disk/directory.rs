// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Bucketed directory layout: maps a disk sector index to a path under
//! `<root>/history/<bucket>/` and tolerates foreign entries during scans.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const HISTORY_DIR: &str = "history";
pub const CORRUPTED_DIR: &str = "corrupted";
pub const JOURNAL_FILE: &str = "recovery.journal";
pub const JOURNAL_BAK_FILE: &str = "recovery.journal.bak";

/// `<root>/history`
pub fn history_dir(root: &Path) -> PathBuf {
    root.join(HISTORY_DIR)
}

/// `<root>/history/corrupted`
pub fn corrupted_dir(root: &Path) -> PathBuf {
    history_dir(root).join(CORRUPTED_DIR)
}

/// `<root>/history/recovery.journal`
pub fn journal_path(root: &Path) -> PathBuf {
    history_dir(root).join(JOURNAL_FILE)
}

/// `<root>/history/recovery.journal.bak`
pub fn journal_bak_path(root: &Path) -> PathBuf {
    history_dir(root).join(JOURNAL_BAK_FILE)
}

/// `<root>/history/<disk_sector / bucket_size>`
pub fn bucket_dir(root: &Path, disk_sector: u32, bucket_size: u32) -> PathBuf {
    history_dir(root).join((disk_sector / bucket_size).to_string())
}

/// Filename for a disk sector's file: `sector_<N>_sensor_<S>.imx`.
pub fn file_name(disk_sector: u32, sensor_id: u16) -> String {
    format!("sector_{disk_sector}_sensor_{sensor_id}.imx")
}

/// Full path for a disk sector's data file.
pub fn path_of(root: &Path, disk_sector: u32, sensor_id: u16, bucket_size: u32) -> PathBuf {
    bucket_dir(root, disk_sector, bucket_size).join(file_name(disk_sector, sensor_id))
}

/// Ensures `<root>/history`, the bucket directory for `disk_sector`, and
/// `<root>/history/corrupted` all exist, with 0755 permissions, created
/// with `mkdir -p` semantics.
pub fn ensure_dirs(root: &Path, disk_sector: u32, bucket_size: u32) -> Result<PathBuf> {
    let bucket = bucket_dir(root, disk_sector, bucket_size);
    mkdir_p(&bucket)?;
    mkdir_p(&corrupted_dir(root))?;
    Ok(bucket)
}

/// Ensures `<root>/history/corrupted` exists, independent of any bucket.
pub fn ensure_corrupted_dir(root: &Path) -> Result<PathBuf> {
    let dir = corrupted_dir(root);
    mkdir_p(&dir)?;
    Ok(dir)
}

fn mkdir_p(dir: &Path) -> Result<()> {
    fs_err::create_dir_all(dir).map_err(|e| Error::from_io(dir, e.into()))?;
    set_dir_mode(dir)
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(0o755);
    fs::set_permissions(dir, perm).map_err(|e| Error::from_io(dir, e))
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path) -> Result<()> {
    Ok(())
}

/// One entry discovered by [`scan`].
#[derive(Debug, Clone)]
pub struct DiskFileEntry {
    pub path: PathBuf,
    pub disk_sector: u32,
    pub sensor_id: u16,
}

/// Enumerates every `sector_<N>_sensor_<S>.imx` file under every numbered
/// bucket directory, skipping `corrupted/`, the journal files, and any
/// entry that doesn't parse as a bucket.
pub fn scan(root: &Path) -> Result<Vec<DiskFileEntry>> {
    let hist = history_dir(root);
    let mut out = Vec::new();
    let entries = match fs::read_dir(&hist) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(Error::from_io(&hist, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::from_io(&hist, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == CORRUPTED_DIR || name.parse::<u32>().is_err() {
            continue;
        }
        for file in fs::read_dir(&path).map_err(|e| Error::from_io(&path, e))? {
            let file = file.map_err(|e| Error::from_io(&path, e))?;
            let fpath = file.path();
            if let Some(parsed) = parse_file_name(&fpath) {
                out.push(parsed);
            }
        }
    }
    Ok(out)
}

fn parse_file_name(path: &Path) -> Option<DiskFileEntry> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("sector_")?;
    let (sector_str, rest) = rest.split_once("_sensor_")?;
    let sensor_str = rest.strip_suffix(".imx")?;
    let disk_sector = sector_str.parse().ok()?;
    let sensor_id = sensor_str.parse().ok()?;
    Some(DiskFileEntry {
        path: path.to_path_buf(),
        disk_sector,
        sensor_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_of_groups_into_buckets() {
        let root = Path::new("/r");
        assert_eq!(
            path_of(root, 1500, 7, 1000),
            Path::new("/r/history/1/sector_1500_sensor_7.imx")
        );
        assert_eq!(
            path_of(root, 42, 7, 1000),
            Path::new("/r/history/0/sector_42_sensor_7.imx")
        );
    }

    #[test]
    fn parse_file_name_round_trips() {
        let parsed = parse_file_name(Path::new("sector_99_sensor_3.imx")).unwrap();
        assert_eq!(parsed.disk_sector, 99);
        assert_eq!(parsed.sensor_id, 3);
        assert!(parse_file_name(Path::new("not_a_sector_file.txt")).is_none());
    }
}
