// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! TSD/EVT stream descriptors and the append/read entry codec.

pub mod descriptor;
pub mod writer;

pub use descriptor::{DataStore, Entry, StreamDescriptor, StreamId};
