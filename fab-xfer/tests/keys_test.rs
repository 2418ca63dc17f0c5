use std::collections::HashSet;

use fab_xfer::keys::{KEY_STRIDE, KeySource};

#[test]
fn test_keys_monotonic_within_source() {
    let mut keys = KeySource::new();
    let first = keys.next_key().0;
    for i in 1..10 {
        assert_eq!(keys.next_key().0, first + i);
    }
}

#[test]
fn test_sources_mint_disjoint_keys() {
    let mut a = KeySource::new();
    let mut b = KeySource::new();
    let mut seen = HashSet::new();
    // Run both sources past a stride boundary; no key may repeat.
    for _ in 0..(KEY_STRIDE as usize + 10) {
        assert!(seen.insert(a.next_key()));
        assert!(seen.insert(b.next_key()));
    }
}
