//! Injectable delays and bounded polling.

/// Source of time for every bounded wait in the stack.
///
/// Production code sleeps the calling thread; tests advance a virtual clock
/// and let the simulated device run between polls.
pub trait Delay: Send + Sync {
    /// Blocks the caller for roughly `ms` milliseconds.
    fn delay_ms(&self, ms: u32);

    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
}

/// Evaluates `done` up to `tries + 1` times, delaying `interval_ms` between
/// evaluations. Returns whether `done` reported completion.
pub fn poll_until(
    delay: &dyn Delay,
    tries: u32,
    interval_ms: u32,
    mut done: impl FnMut() -> bool,
) -> bool {
    if done() {
        return true;
    }
    for _ in 0..tries {
        delay.delay_ms(interval_ms);
        if done() {
            return true;
        }
    }
    false
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Delay;
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// Virtual clock that only moves when someone waits on it.
    #[derive(Default)]
    pub struct StepClock {
        now: AtomicU64,
        waits: AtomicU32,
    }

    impl StepClock {
        pub fn waits(&self) -> u32 {
            self.waits.load(Ordering::Relaxed)
        }
    }

    impl Delay for StepClock {
        fn delay_ms(&self, ms: u32) {
            self.waits.fetch_add(1, Ordering::Relaxed);
            self.now.fetch_add(ms as u64, Ordering::Relaxed);
        }

        fn now_ms(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }
    }
}
