use fab_xfer::fifo::Fifo;

#[test]
fn test_put_get_order() {
    let mut fifo = Fifo::new(8);
    for i in 0..5 {
        fifo.put(i).unwrap();
    }
    assert_eq!(fifo.len(), 5);
    for i in 0..5 {
        assert_eq!(fifo.get(), Some(i));
    }
    assert!(fifo.is_empty());
    assert_eq!(fifo.get(), None);
}

#[test]
fn test_full_put_fails_and_returns_item() {
    let mut fifo = Fifo::new(4);
    for i in 0..4 {
        fifo.put(i).unwrap();
    }
    assert!(fifo.is_full());
    assert_eq!(fifo.put(99), Err(99));
    // The rejected put must not disturb the ring.
    assert_eq!(fifo.len(), 4);
    assert_eq!(fifo.get(), Some(0));
}

#[test]
fn test_peek_is_non_destructive() {
    let mut fifo = Fifo::new(4);
    fifo.put("a").unwrap();
    fifo.put("b").unwrap();
    assert_eq!(fifo.peek(), Some(&"a"));
    assert_eq!(fifo.peek(), Some(&"a"));
    assert_eq!(fifo.len(), 2);
    assert_eq!(fifo.get(), Some("a"));
    assert_eq!(fifo.peek(), Some(&"b"));
}

#[test]
fn test_counters_wrap_past_capacity() {
    // Far more insertions than capacity: the free-running counters only
    // mask into the ring, and the length invariant holds throughout.
    let mut fifo = Fifo::new(8);
    for round in 0..1000u64 {
        fifo.put(round).unwrap();
        assert!(fifo.len() <= fifo.capacity());
        assert_eq!(fifo.get(), Some(round));
    }
    assert!(fifo.is_empty());
}

#[test]
fn test_for_each_mut_walks_oldest_first() {
    let mut fifo = Fifo::new(8);
    // Offset the ring so the live window wraps the array boundary.
    for i in 0..6 {
        fifo.put(i).unwrap();
    }
    for _ in 0..5 {
        fifo.get();
    }
    for i in 6..10 {
        fifo.put(i).unwrap();
    }
    let mut seen = Vec::new();
    fifo.for_each_mut(|v| seen.push(*v));
    assert_eq!(seen, vec![5, 6, 7, 8, 9]);
    // In-place mutation must be visible in subsequent gets.
    fifo.for_each_mut(|v| *v += 100);
    assert_eq!(fifo.get(), Some(105));
}

#[test]
fn test_peek_mut_touches_head() {
    let mut fifo = Fifo::new(2);
    fifo.put(1).unwrap();
    *fifo.peek_mut().unwrap() = 7;
    assert_eq!(fifo.get(), Some(7));
}

#[test]
#[should_panic]
fn test_non_power_of_two_capacity_rejected() {
    let _ = Fifo::<u32>::new(6);
}
