//! Memory-registration helpers: deterministic vector slicing and batched
//! multi-segment registration under the provider's per-call segment cap.

use std::ops::Range;

use crate::fabric::{Access, Fabric, FabricError, MemSeg, PayloadCell, RegisteredMr};
use crate::keys::KeySource;

/// Slice `len` bytes into successive Fibonacci lengths `{1,1,2,3,5,8,...}`
/// truncated to `maxsegs - 1` segments, the final segment absorbing any
/// remainder. Deterministically yields multi-segment vectors of varied
/// lengths.
pub fn fibonacci_iov_setup(len: usize, maxsegs: usize) -> Vec<Range<usize>> {
    assert!(maxsegs > 0);
    let mut ranges = Vec::new();
    let (mut a, mut b) = (1usize, 1usize);
    let mut off = 0;
    while off < len && ranges.len() < maxsegs - 1 {
        let seg = a.min(len - off);
        ranges.push(off..off + seg);
        off += seg;
        (a, b) = (b, a + b);
    }
    if off < len {
        ranges.push(off..len);
    }
    ranges
}

/// One segment's citation inside a registration: its zero-based remote
/// offset and length under the registration's key.
#[derive(Debug, Clone, Copy)]
pub struct SegCite {
    pub raddr: u64,
    pub len: usize,
}

/// A registration covering one or more segments that share a handle and
/// local descriptor.
pub struct Registration {
    pub mr: Box<dyn RegisteredMr>,
    pub segs: Vec<SegCite>,
}

/// Register an `n`-segment vector over `cell` in `⌈n / mr_maxsegs⌉` calls.
/// Remote offsets restart at zero in each registration and accumulate across
/// its segments. If a call fails mid-way, dropping the registrations already
/// collected closes them before the error propagates.
pub fn regv_all<F: Fabric>(
    fabric: &F,
    cell: &PayloadCell,
    ranges: &[Range<usize>],
    access: Access,
    keys: &mut KeySource,
) -> Result<Vec<Registration>, FabricError> {
    let maxsegs = fabric.info().mr_maxsegs;
    let mut out = Vec::with_capacity(ranges.len().div_ceil(maxsegs));
    for chunk in ranges.chunks(maxsegs) {
        let segs: Vec<MemSeg> = chunk
            .iter()
            .map(|r| MemSeg {
                cell: cell.clone(),
                offset: r.start,
                len: r.len(),
            })
            .collect();
        let mr = fabric.register(segs, access, keys.next_key())?;
        let mut raddr = 0u64;
        let cites = chunk
            .iter()
            .map(|r| {
                let cite = SegCite {
                    raddr,
                    len: r.len(),
                };
                raddr += r.len() as u64;
                cite
            })
            .collect();
        out.push(Registration { mr, segs: cites });
    }
    Ok(out)
}

/// Register a whole payload buffer as a single registration, Fibonacci-
/// sliced so the multi-segment path is exercised while one key still covers
/// `0..capacity` contiguously.
pub fn register_buffer<F: Fabric>(
    fabric: &F,
    cell: &PayloadCell,
    capacity: usize,
    access: Access,
    keys: &mut KeySource,
) -> Result<Box<dyn RegisteredMr>, FabricError> {
    let ranges = fibonacci_iov_setup(capacity, fabric.info().mr_maxsegs);
    let mut regs = regv_all(fabric, cell, &ranges, access, keys)?;
    debug_assert_eq!(regs.len(), 1);
    Ok(regs.remove(0).mr)
}
