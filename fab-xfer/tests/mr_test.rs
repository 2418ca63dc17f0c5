use fab_xfer::fabric::{Access, Fabric, RegisteredMr, alloc_cell};
use fab_xfer::keys::KeySource;
use fab_xfer::mr::{fibonacci_iov_setup, regv_all};
use fab_xfer::testing::{LoopbackOptions, loopback_pair_with};

#[test]
fn test_fibonacci_slicing_shape() {
    // 37 bytes under a cap of 8: six Fibonacci segments, the seventh
    // absorbing the remainder.
    let ranges = fibonacci_iov_setup(37, 8);
    let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
    assert_eq!(lens, vec![1, 1, 2, 3, 5, 8, 17]);
    assert_eq!(ranges.last().unwrap().end, 37);
}

#[test]
fn test_fibonacci_slicing_covers_contiguously() {
    for len in 1..200 {
        for maxsegs in 1..10 {
            let ranges = fibonacci_iov_setup(len, maxsegs);
            assert!(ranges.len() <= maxsegs);
            let mut at = 0;
            for r in &ranges {
                assert_eq!(r.start, at, "gap at {at} for len={len} maxsegs={maxsegs}");
                assert!(!r.is_empty());
                at = r.end;
            }
            assert_eq!(at, len);
        }
    }
}

#[test]
fn test_fibonacci_small_buffer_fewer_segments() {
    // 2 bytes can only fill two 1-byte Fibonacci slots.
    let ranges = fibonacci_iov_setup(2, 8);
    assert_eq!(ranges.len(), 2);
    // A cap of one means a single segment takes everything.
    let ranges = fibonacci_iov_setup(100, 1);
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].clone().count(), 100);
}

#[test]
fn test_regv_all_batches_by_provider_cap() {
    let opts = LoopbackOptions {
        mr_maxsegs: 4,
        ..LoopbackOptions::default()
    };
    let (fabric, _peer) = loopback_pair_with(opts, LoopbackOptions::default());
    let mut keys = KeySource::new();
    let cell = alloc_cell(100);
    let ranges: Vec<_> = (0..10).map(|i| i * 10..(i + 1) * 10).collect();

    let regs = regv_all(&*fabric, &cell, &ranges, Access::RemoteWrite, &mut keys).unwrap();
    // Ten segments under a cap of four: 4 + 4 + 2.
    assert_eq!(regs.len(), 3);
    assert_eq!(regs[0].segs.len(), 4);
    assert_eq!(regs[1].segs.len(), 4);
    assert_eq!(regs[2].segs.len(), 2);

    // Distinct keys per registration, remote offsets cumulative from zero
    // within each one.
    assert_ne!(regs[0].mr.key(), regs[1].mr.key());
    for reg in &regs {
        let mut at = 0;
        for seg in &reg.segs {
            assert_eq!(seg.raddr, at);
            at += seg.len as u64;
        }
    }
}

#[test]
fn test_register_rejects_overwide_vector() {
    let (fabric, _peer) = loopback_pair_with(
        LoopbackOptions {
            mr_maxsegs: 2,
            ..LoopbackOptions::default()
        },
        LoopbackOptions::default(),
    );
    let cell = alloc_cell(10);
    let segs = (0..3)
        .map(|i| fab_xfer::fabric::MemSeg {
            cell: cell.clone(),
            offset: i,
            len: 1,
        })
        .collect();
    let mut keys = KeySource::new();
    assert!(
        fabric
            .register(segs, Access::RemoteWrite, keys.next_key())
            .is_err()
    );
}
