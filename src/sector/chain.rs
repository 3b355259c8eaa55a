// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Singly-linked traversal over RAM sectors via the trailer `next` link.

use crate::constants::END;
use crate::error::{Error, Result};
use crate::sector::pool::SectorPool;

/// Reads the `next` link from `sector`'s trailer, as an `Option` (`None` at
/// `END`).
pub fn next(pool: &SectorPool, sector: u32) -> Result<Option<u32>> {
    let raw = pool.next_raw(sector)?;
    Ok(if raw == END { None } else { Some(raw) })
}

/// Writes `next_sector` into `sector`'s trailer.
pub fn set_next(pool: &mut SectorPool, sector: u32, next_sector: Option<u32>) -> Result<()> {
    pool.set_next(sector, next_sector.unwrap_or(END))
}

/// Walks the chain starting at `head`, calling `visit` with each sector
/// index in order, until `END` is reached. Bounded by `max_hops` (the
/// stream's `ceil(count / entries_per_sector)`) to detect a cycle or an
/// unallocated link; exceeding that bound is reported as
/// [`Error::ChainCorrupt`].
pub fn walk(
    pool: &SectorPool,
    head: u32,
    max_hops: u32,
    stream: u16,
    mut visit: impl FnMut(u32),
) -> Result<()> {
    let mut current = head;
    let mut hops = 0u32;
    loop {
        if !pool.allocator().is_allocated(current) {
            return Err(Error::ChainCorrupt {
                stream,
                reason: "chain references a non-allocated sector",
            });
        }
        visit(current);
        hops += 1;
        if hops > max_hops {
            return Err(Error::ChainCorrupt {
                stream,
                reason: "chain exceeded expected length (possible cycle)",
            });
        }
        match next(pool, current)? {
            Some(n) => current = n,
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_terminates_within_expected_hops() {
        let mut pool = SectorPool::new(32, 8, 0).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        set_next(&mut pool, a, Some(b)).unwrap();
        set_next(&mut pool, b, Some(c)).unwrap();
        set_next(&mut pool, c, None).unwrap();

        let mut seen = Vec::new();
        walk(&pool, a, 3, 1, |s| seen.push(s)).unwrap();
        assert_eq!(seen, vec![a, b, c]);
    }

    #[test]
    fn cycle_is_reported_as_corruption() {
        let mut pool = SectorPool::new(32, 4, 0).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        set_next(&mut pool, a, Some(b)).unwrap();
        set_next(&mut pool, b, Some(a)).unwrap();

        let mut seen = Vec::new();
        let err = walk(&pool, a, 2, 7, |s| seen.push(s)).unwrap_err();
        assert!(matches!(err, Error::ChainCorrupt { stream: 7, .. }));
    }

    #[test]
    fn link_to_freed_sector_is_corruption() {
        let mut pool = SectorPool::new(32, 4, 0).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        set_next(&mut pool, a, Some(b)).unwrap();
        pool.free(b).unwrap();

        let err = walk(&pool, a, 5, 3, |_| {}).unwrap_err();
        assert!(matches!(err, Error::ChainCorrupt { stream: 3, .. }));
    }
}
