// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! On-disk tier: file format, bucketed directory layout, and the recovery
//! journal.

pub mod directory;
pub mod file;
pub mod format;
pub mod journal;

pub use format::DiskFileHeader;
pub use journal::{JournalOp, JournalRecord, JournalWriter};
