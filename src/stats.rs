// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Usage, peaks, fragmentation, and operation counters for the RAM sector
//! pool.

use crate::sector::SectorAllocator;

/// Point-in-time snapshot returned by `get_memory_statistics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStatistics {
    pub total_sectors: u32,
    pub available_sectors: u32,
    pub used_sectors: u32,
    pub free_sectors: u32,
    pub usage_percentage: u8,
    pub peak_usage: u32,
    pub peak_usage_percentage: u8,
    pub allocation_count: u64,
    pub deallocation_count: u64,
    pub allocation_failures: u64,
    pub fragmentation_level: u8,
}

/// Running counters that outlive any single snapshot; `peak_usage` is
/// monotonic non-decreasing across the process lifetime.
#[derive(Debug, Default)]
pub struct StatsTracker {
    peak_usage: u32,
    allocation_count: u64,
    deallocation_count: u64,
    disk_failures: u64,
}

impl StatsTracker {
    pub fn record_alloc(&mut self) {
        self.allocation_count += 1;
    }

    pub fn record_free(&mut self) {
        self.deallocation_count += 1;
    }

    /// Counts a fatal disk error (ENOSPC, EIO, or similar) folded into
    /// `allocation_failures` on the next snapshot, since both represent the
    /// engine failing to produce a sector on demand.
    pub fn record_disk_failure(&mut self) {
        self.disk_failures += 1;
    }

    /// Recomputes a full snapshot from the allocator's current state,
    /// folding in running counters and updating `peak_usage`.
    pub fn snapshot(&mut self, allocator: &SectorAllocator) -> MemoryStatistics {
        let total = allocator.total();
        let used = allocator.count_used();
        let free = allocator.count_free();
        self.peak_usage = self.peak_usage.max(used);
        let usage_percentage = percent(used, total);
        let peak_usage_percentage = percent(self.peak_usage, total);
        MemoryStatistics {
            total_sectors: total,
            available_sectors: total,
            used_sectors: used,
            free_sectors: free,
            usage_percentage,
            peak_usage: self.peak_usage,
            peak_usage_percentage,
            allocation_count: self.allocation_count,
            deallocation_count: self.deallocation_count,
            allocation_failures: allocator.allocation_failures() + self.disk_failures,
            fragmentation_level: allocator.fragmentation_level(),
        }
    }
}

fn percent(part: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    (((part as u64 * 100) / total as u64) as u8).min(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_usage_is_monotonic() {
        let mut allocator = SectorAllocator::new(10, 0).unwrap();
        let mut stats = StatsTracker::default();

        for _ in 0..5 {
            allocator.alloc().unwrap();
        }
        let s1 = stats.snapshot(&allocator);
        assert_eq!(s1.peak_usage, 5);

        allocator.free(0).unwrap();
        allocator.free(1).unwrap();
        let s2 = stats.snapshot(&allocator);
        assert_eq!(s2.used_sectors, 3);
        assert_eq!(s2.peak_usage, 5, "peak must not decrease");
    }
}
