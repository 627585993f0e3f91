use crate::error::ChubError;
use chub_core::delay::{Delay, poll_until};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Delivers wake requests to the device.
pub trait WakeSignal {
    /// Asks the device to stay awake.
    fn request_awake(&self) -> Result<(), ChubError>;
    /// Lets the device idle again.
    fn allow_idle(&self) -> Result<(), ChubError>;
}

pub struct WakeupArbiter {
    holders: AtomicU32,
    priority_holders: AtomicU32,
    awake: AtomicBool,
    timeout_ms: u32,
    poll_ms: u32,
}

fn saturating_dec(counter: &AtomicU32) -> Option<u32> {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        .ok()
        .map(|previous| previous - 1)
}

impl WakeupArbiter {
    pub fn new(timeout_ms: u32) -> Self {
        Self {
            holders: AtomicU32::new(0),
            priority_holders: AtomicU32::new(0),
            awake: AtomicBool::new(false),
            timeout_ms,
            poll_ms: 1,
        }
    }

    pub fn holders(&self) -> u32 {
        self.holders.load(Ordering::Acquire)
    }

    pub fn priority_holders(&self) -> u32 {
        self.priority_holders.load(Ordering::Acquire)
    }

    /// Whether the device last reported its wake line asserted.
    pub fn is_awake(&self) -> bool {
        self.awake.load(Ordering::Acquire)
    }

    /// Records the device's wake line.
    pub fn notify_awake(&self, awake: bool) {
        self.awake.store(awake, Ordering::Release);
    }

    /// Takes a hold on the device.
    ///
    /// A priority hold never signals and never waits. The first normal hold
    /// asks the device to stay awake and waits for the acknowledgment.
    /// On error the hold is still counted; callers release it regardless.
    pub fn acquire(
        &self,
        priority: bool,
        signal: &dyn WakeSignal,
        delay: &dyn Delay,
    ) -> Result<(), ChubError> {
        if priority {
            self.priority_holders.fetch_add(1, Ordering::AcqRel);
        }
        let holders = self.holders.fetch_add(1, Ordering::AcqRel) + 1;
        if priority {
            return Ok(());
        }

        if holders == 1 && self.priority_holders() == 0 {
            debug!("wakeup: requesting awake");
            signal.request_awake()?;
        }

        let tries = self.timeout_ms / self.poll_ms;
        if poll_until(delay, tries, self.poll_ms, || {
            self.is_awake() || self.priority_holders() > 0
        }) {
            Ok(())
        } else {
            warn!("wakeup: no acknowledgment (holders {holders})");
            Err(ChubError::WakeupTimeout(self.timeout_ms))
        }
    }

    /// Drops a hold taken with the same `priority`.
    ///
    /// Releasing the last normal hold lets the device idle unless a
    /// priority hold remains. Releasing a priority hold while normal holds
    /// remain asks the device to stay awake again.
    pub fn release(&self, priority: bool, signal: &dyn WakeSignal) {
        if priority && saturating_dec(&self.priority_holders).is_none() {
            warn!("wakeup: unbalanced priority release");
        }
        let Some(holders) = saturating_dec(&self.holders) else {
            warn!("wakeup: unbalanced release");
            return;
        };
        if self.priority_holders() > 0 {
            return;
        }

        let result = if holders == 0 {
            debug!("wakeup: allowing idle");
            signal.allow_idle()
        } else if priority {
            debug!("wakeup: restoring awake request for {holders} holder(s)");
            signal.request_awake()
        } else {
            Ok(())
        };
        if let Err(err) = result {
            warn!("wakeup: {err}");
        }
    }
}
