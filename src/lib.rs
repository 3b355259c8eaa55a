// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Tiered sector-based storage engine for embedded telemetry: a fixed RAM
//! sector pool backs append-only TSD/EVT streams, spilling the oldest
//! sectors to a bucketed on-disk history with a write-ahead recovery
//! journal once the pool crosses a configurable high-water mark.
//!
//! [`Engine`] is the single entry point; everything else is the machinery
//! it orchestrates.

pub mod address;
pub mod constants;
pub mod disk;
pub mod engine;
pub mod error;
pub mod sector;
pub mod state_machine;
pub mod stats;
pub mod stream;

pub use address::ExtendedAddr;
pub use constants::RecordType;
pub use engine::{Engine, EngineConfig, RecoveryReport};
pub use error::{Error, Result};
pub use stats::MemoryStatistics;
pub use stream::descriptor::{Entry, StreamId};
