use chub_core::delay::Delay;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Virtual time source.
///
/// `delay_ms` advances the clock and runs every hook once. Hooks that wait
/// on the clock themselves do not re-enter the hook list.
#[derive(Default)]
pub struct SimClock {
    now: AtomicU64,
    waits: AtomicU64,
    hooks: Mutex<Vec<Hook>>,
    ticking: AtomicBool,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook to run on every wait.
    pub fn on_tick(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Runs the hooks without advancing time.
    pub fn tick(&self) {
        if self.ticking.swap(true, Ordering::Acquire) {
            return;
        }
        let hooks: Vec<Hook> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook();
        }
        self.ticking.store(false, Ordering::Release);
    }

    /// Number of waits performed so far.
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}

impl Delay for SimClock {
    fn delay_ms(&self, ms: u32) {
        self.now.fetch_add(ms as u64, Ordering::Relaxed);
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.tick();
    }

    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn hooks_run_on_every_wait() {
        let clock = Arc::new(SimClock::new());
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        clock.on_tick(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });
        clock.delay_ms(5);
        clock.delay_ms(10);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        assert_eq!(clock.now_ms(), 15);
        assert_eq!(clock.waits(), 2);
    }

    #[test]
    fn nested_waits_do_not_reenter_hooks() {
        let clock = Arc::new(SimClock::new());
        let runs = Arc::new(AtomicU32::new(0));
        let (c, r) = (Arc::downgrade(&clock), runs.clone());
        clock.on_tick(move || {
            r.fetch_add(1, Ordering::Relaxed);
            if let Some(clock) = c.upgrade() {
                clock.delay_ms(1);
            }
        });
        clock.delay_ms(1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(clock.now_ms(), 2);
    }
}
