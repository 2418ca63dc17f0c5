use proptest::prelude::*;

use fab_xfer::fifo::Fifo;

proptest! {
    /// Any interleaving of puts and gets keeps `0 <= len <= capacity` and
    /// preserves arrival order.
    #[test]
    fn fifo_structural_invariant(ops in proptest::collection::vec(any::<bool>(), 0..500)) {
        let mut fifo = Fifo::new(16);
        let mut model = std::collections::VecDeque::new();
        let mut next = 0u32;
        for is_put in ops {
            if is_put {
                match fifo.put(next) {
                    Ok(()) => {
                        model.push_back(next);
                        prop_assert!(model.len() <= 16);
                    }
                    Err(v) => {
                        prop_assert_eq!(v, next);
                        prop_assert_eq!(model.len(), 16);
                    }
                }
                next += 1;
            } else {
                prop_assert_eq!(fifo.get(), model.pop_front());
            }
            prop_assert_eq!(fifo.len(), model.len());
            prop_assert_eq!(fifo.peek().copied(), model.front().copied());
        }
    }
}
