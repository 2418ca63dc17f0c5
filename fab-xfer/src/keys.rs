use std::sync::atomic::{AtomicU64, Ordering};

use fab_wire::MrKey;

/// Stride each key source takes from the process-wide pool.
pub const KEY_STRIDE: u64 = 256;

static NEXT_KEY_POOL: AtomicU64 = AtomicU64::new(0);

/// Monotonic allocator of memory-region keys.
///
/// Each source consumes 256-key strides from one process-wide counter, so
/// concurrent sessions mint disjoint keys without further coordination.
#[derive(Debug, Default)]
pub struct KeySource {
    next: u64,
    limit: u64,
}

impl KeySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&mut self) -> MrKey {
        if self.next == self.limit {
            let base = NEXT_KEY_POOL.fetch_add(KEY_STRIDE, Ordering::Relaxed);
            self.next = base;
            self.limit = base + KEY_STRIDE;
        }
        let key = MrKey(self.next);
        self.next += 1;
        key
    }
}
