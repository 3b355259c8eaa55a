// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! RAM sector layer: allocator, word-addressed I/O, and chain traversal.

pub mod allocator;
pub mod chain;
pub mod pool;

pub use allocator::SectorAllocator;
pub use pool::SectorPool;
