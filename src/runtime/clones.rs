//! Clone ceiling bookkeeping

/// Maximum number of non-original targets alive at once
pub const MAX_CLONES: usize = 300;

/// Process-wide clone counter, guarded by the scheduler lock.
#[derive(Debug, Default)]
pub struct CloneCounter {
    count: usize,
}

impl CloneCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live clones
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether another clone may be created
    pub fn available(&self) -> bool {
        self.count < MAX_CLONES
    }

    /// Reserve a slot. Returns false at the ceiling.
    pub fn acquire(&mut self) -> bool {
        if !self.available() {
            return false;
        }
        self.count += 1;
        true
    }

    /// Give a slot back after a clone is disposed
    pub fn release(&mut self) {
        self.count = self.count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ceiling_refuses_the_next_clone() {
        let mut counter = CloneCounter::new();
        for _ in 0..MAX_CLONES {
            assert!(counter.acquire());
        }
        assert!(!counter.available());
        assert!(!counter.acquire());
        assert_eq!(counter.count(), MAX_CLONES);

        counter.release();
        assert!(counter.available());
    }

    proptest! {
        #[test]
        fn count_never_exceeds_ceiling(ops in proptest::collection::vec(any::<bool>(), 0..1000)) {
            let mut counter = CloneCounter::new();
            for create in ops {
                if create {
                    counter.acquire();
                } else {
                    counter.release();
                }
                prop_assert!(counter.count() <= MAX_CLONES);
            }
        }
    }
}
