use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChubStatus {
    /// Power is off and no firmware is resident.
    NoPower = 0,
    /// Power is on, firmware has not yet answered an alive ping.
    PoweredOn,
    /// Firmware answered and the data path is open.
    Running,
    /// The last reset attempt did not bring the firmware back.
    NotResponding,
    /// A critical fault was seen; a reset is pending.
    ErrorLatched,
    /// The host gave up on the device until a forced reset.
    Hung,
    /// A shutdown is in progress.
    ShuttingDown,
}

impl ChubStatus {
    pub const fn name(self) -> &'static str {
        match self {
            ChubStatus::NoPower => "no power",
            ChubStatus::PoweredOn => "powered on",
            ChubStatus::Running => "running",
            ChubStatus::NotResponding => "not responding",
            ChubStatus::ErrorLatched => "error latched",
            ChubStatus::Hung => "hung",
            ChubStatus::ShuttingDown => "shutting down",
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ChubStatus::NoPower,
            1 => ChubStatus::PoweredOn,
            2 => ChubStatus::Running,
            3 => ChubStatus::NotResponding,
            4 => ChubStatus::ErrorLatched,
            5 => ChubStatus::Hung,
            _ => ChubStatus::ShuttingDown,
        }
    }

    /// States in which the device may raise interrupts the host acts on.
    pub fn accepts_interrupts(self) -> bool {
        matches!(
            self,
            ChubStatus::PoweredOn | ChubStatus::Running | ChubStatus::ShuttingDown
        )
    }
}

impl fmt::Display for ChubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Lock-free status cell, readable from interrupt context.
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: ChubStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> ChubStatus {
        ChubStatus::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Stores `status` and returns the previous value.
    pub(crate) fn swap(&self, status: ChubStatus) -> ChubStatus {
        ChubStatus::from_raw(self.0.swap(status as u8, Ordering::AcqRel))
    }

    /// Moves to `to` only if the current state is one of `from`.
    pub(crate) fn transition_from(&self, from: &[ChubStatus], to: ChubStatus) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                from.contains(&ChubStatus::from_raw(raw))
                    .then_some(to as u8)
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_transition() {
        let status = AtomicStatus::new(ChubStatus::Running);
        assert!(!status.transition_from(&[ChubStatus::PoweredOn], ChubStatus::ErrorLatched));
        assert_eq!(status.load(), ChubStatus::Running);
        assert!(status.transition_from(
            &[ChubStatus::PoweredOn, ChubStatus::Running],
            ChubStatus::ErrorLatched
        ));
        assert_eq!(status.swap(ChubStatus::Hung), ChubStatus::ErrorLatched);
        assert_eq!(status.load(), ChubStatus::Hung);
    }

    #[test]
    fn interrupt_gate() {
        assert!(ChubStatus::Running.accepts_interrupts());
        assert!(ChubStatus::ShuttingDown.accepts_interrupts());
        assert!(!ChubStatus::NoPower.accepts_interrupts());
        assert!(!ChubStatus::ErrorLatched.accepts_interrupts());
        assert!(!ChubStatus::Hung.accepts_interrupts());
        assert_eq!(format!("{:>8}", ChubStatus::Hung), "    hung");
    }
}
