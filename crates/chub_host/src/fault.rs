use bitvec::prelude::*;
use chub_core::IpcError;
use core::fmt;
use chub_core::sync::SpinLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FaultKind {
    HardwareFault = 0,
    FirmwareFault,
    Watchdog,
    BusError,
    StalePendingIrq,
    EventQueueEmpty,
    EventQueueMismatch,
    IndexCorruption,
    FirmwareAssert,
    NoResponse,
    ReadFail,
    WriteFail,
    EventAddFail,
    CommsNack,
    CommsBusy,
    CommsUnknown,
    CommsTimeout,
    WakeupTimeout,
}

impl FaultKind {
    pub const COUNT: usize = 18;

    pub const ALL: [FaultKind; Self::COUNT] = [
        FaultKind::HardwareFault,
        FaultKind::FirmwareFault,
        FaultKind::Watchdog,
        FaultKind::BusError,
        FaultKind::StalePendingIrq,
        FaultKind::EventQueueEmpty,
        FaultKind::EventQueueMismatch,
        FaultKind::IndexCorruption,
        FaultKind::FirmwareAssert,
        FaultKind::NoResponse,
        FaultKind::ReadFail,
        FaultKind::WriteFail,
        FaultKind::EventAddFail,
        FaultKind::CommsNack,
        FaultKind::CommsBusy,
        FaultKind::CommsUnknown,
        FaultKind::CommsTimeout,
        FaultKind::WakeupTimeout,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            FaultKind::HardwareFault => "hw fault",
            FaultKind::FirmwareFault => "fw fault",
            FaultKind::Watchdog => "watchdog",
            FaultKind::BusError => "bus error",
            FaultKind::StalePendingIrq => "stale irq",
            FaultKind::EventQueueEmpty => "event empty",
            FaultKind::EventQueueMismatch => "event mismatch",
            FaultKind::IndexCorruption => "index corrupted",
            FaultKind::FirmwareAssert => "fw assert",
            FaultKind::NoResponse => "no response",
            FaultKind::ReadFail => "read fail",
            FaultKind::WriteFail => "write fail",
            FaultKind::EventAddFail => "event add fail",
            FaultKind::CommsNack => "comms nack",
            FaultKind::CommsBusy => "comms busy",
            FaultKind::CommsUnknown => "comms unknown",
            FaultKind::CommsTimeout => "comms timeout",
            FaultKind::WakeupTimeout => "wakeup timeout",
        }
    }

    /// Critical faults escalate on the first occurrence.
    pub const fn is_critical(self) -> bool {
        (self as u8) <= FaultKind::NoResponse as u8
    }

    /// Maps a transport error to the fault it represents, if any.
    ///
    /// `write` tells a failed send apart from a failed receive. Oversized
    /// payloads are the caller's mistake and never count as a fault.
    pub fn from_ipc(err: &IpcError, write: bool) -> Option<Self> {
        Some(match err {
            IpcError::PayloadTooLarge { .. } => return None,
            IpcError::MapInvalid(_) => FaultKind::HardwareFault,
            IpcError::QueueFull { .. } if write => FaultKind::WriteFail,
            IpcError::QueueFull { .. } => FaultKind::ReadFail,
            IpcError::EventQueueFull { .. } => FaultKind::EventAddFail,
            IpcError::IndexCorruption { .. } | IpcError::SlotCorrupted { .. } => {
                FaultKind::IndexCorruption
            }
            IpcError::StalePendingIrq { .. } => FaultKind::StalePendingIrq,
            IpcError::EventQueueEmpty { .. } => FaultKind::EventQueueEmpty,
            IpcError::EventQueueMismatch { .. } => FaultKind::EventQueueMismatch,
            IpcError::LogRingCorrupted { .. } => FaultKind::ReadFail,
        })
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Where a fault was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultContext {
    /// A caller's thread, allowed to block for a reset.
    Task,
    /// Interrupt dispatch, which must never block.
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Recorded; `count` occurrences inside the current window.
    Counted(u32),
    Escalate,
}

/// Per-kind fault counters, the reset counter and the set of faults
/// waiting for the worker thread.
///
/// Each kind keeps the times of its most recent occurrences, at most
/// `threshold + 1` of them. The counters sit behind a spin lock held only
/// for the update, so interrupt dispatch can record faults too.
pub struct FaultClassifier {
    threshold: u32,
    window_ms: u64,
    seen: SpinLock<Vec<VecDeque<u64>>>,
    resets: AtomicU32,
    deferred: AtomicU32,
}

impl FaultClassifier {
    pub fn new(threshold: u32, window_ms: u64) -> Self {
        let depth = threshold as usize + 1;
        Self {
            threshold,
            window_ms,
            seen: SpinLock::new(
                (0..FaultKind::COUNT)
                    .map(|_| VecDeque::with_capacity(depth))
                    .collect(),
            ),
            resets: AtomicU32::new(0),
            deferred: AtomicU32::new(0),
        }
    }

    /// Records one occurrence of `kind` at `now_ms`.
    ///
    /// # Returns
    ///
    /// [`Verdict::Escalate`] for critical kinds, and for other kinds once
    /// more than `threshold` occurrences fall within the last `window_ms`.
    /// Escalation forgets the occurrences counted so far. Otherwise the
    /// number of occurrences still inside the window.
    pub fn record(&self, kind: FaultKind, now_ms: u64) -> Verdict {
        if kind.is_critical() {
            return Verdict::Escalate;
        }
        let mut seen = self.seen.lock();
        let times = &mut seen[kind as usize];
        while times
            .front()
            .is_some_and(|&t| now_ms.saturating_sub(t) > self.window_ms)
        {
            times.pop_front();
        }
        times.push_back(now_ms);

        let count = times.len() as u32;
        if count > self.threshold {
            times.clear();
            Verdict::Escalate
        } else {
            Verdict::Counted(count)
        }
    }

    /// Occurrences of `kind` recorded since the last escalation or clear.
    pub fn count(&self, kind: FaultKind) -> u32 {
        self.seen.lock()[kind as usize].len() as u32
    }

    pub fn clear(&self, kind: FaultKind) {
        self.seen.lock()[kind as usize].clear();
    }

    pub fn clear_all(&self) {
        for times in self.seen.lock().iter_mut() {
            times.clear();
        }
    }

    /// Kinds with a non-zero count, with their counts.
    pub fn active(&self) -> Vec<(FaultKind, u32)> {
        FaultKind::ALL
            .iter()
            .map(|&kind| (kind, self.count(kind)))
            .filter(|&(_, count)| count > 0)
            .collect()
    }

    /// Counts a completed reset and returns the new total.
    pub fn note_reset(&self) -> u32 {
        self.resets.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::Acquire)
    }

    /// Queues `kind` for the worker thread.
    pub fn defer(&self, kind: FaultKind) {
        self.deferred.fetch_or(1 << kind as u32, Ordering::AcqRel);
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire) != 0
    }

    /// Takes every queued kind, lowest first.
    pub fn take_deferred(&self) -> Vec<FaultKind> {
        let bits = self.deferred.swap(0, Ordering::AcqRel);
        bits.view_bits::<Lsb0>()
            .iter_ones()
            .filter_map(FaultKind::from_index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chub_core::ChannelId;

    #[test]
    fn critical_kinds_escalate_at_once() {
        let faults = FaultClassifier::new(5, 1000);
        for kind in FaultKind::ALL.iter().filter(|k| k.is_critical()) {
            assert_eq!(faults.record(*kind, 0), Verdict::Escalate);
        }
        assert!(FaultKind::IndexCorruption.is_critical());
        assert!(FaultKind::NoResponse.is_critical());
        assert!(!FaultKind::ReadFail.is_critical());
        assert!(!FaultKind::WakeupTimeout.is_critical());
    }

    #[test]
    fn threshold_escalates_once_then_restarts() {
        let faults = FaultClassifier::new(5, 1000);
        for n in 1..=5 {
            assert_eq!(faults.record(FaultKind::WriteFail, n), Verdict::Counted(n as u32));
        }
        assert_eq!(faults.record(FaultKind::WriteFail, 6), Verdict::Escalate);
        assert_eq!(faults.count(FaultKind::WriteFail), 0);
        assert_eq!(faults.record(FaultKind::WriteFail, 7), Verdict::Counted(1));
    }

    #[test]
    fn kinds_are_counted_separately() {
        let faults = FaultClassifier::new(2, 1000);
        faults.record(FaultKind::ReadFail, 0);
        faults.record(FaultKind::ReadFail, 0);
        assert_eq!(faults.record(FaultKind::CommsBusy, 0), Verdict::Counted(1));
        assert_eq!(faults.record(FaultKind::ReadFail, 0), Verdict::Escalate);
        assert_eq!(faults.active(), vec![(FaultKind::CommsBusy, 1)]);
    }

    #[test]
    fn old_occurrences_fall_out_of_the_window() {
        let faults = FaultClassifier::new(2, 100);
        faults.record(FaultKind::CommsTimeout, 0);
        faults.record(FaultKind::CommsTimeout, 50);
        assert_eq!(faults.record(FaultKind::CommsTimeout, 500), Verdict::Counted(1));
        assert_eq!(faults.record(FaultKind::CommsTimeout, 550), Verdict::Counted(2));
        assert_eq!(faults.record(FaultKind::CommsTimeout, 560), Verdict::Escalate);
    }

    #[test]
    fn window_slides_with_each_occurrence() {
        let faults = FaultClassifier::new(2, 100);
        assert_eq!(faults.record(FaultKind::CommsNack, 0), Verdict::Counted(1));
        assert_eq!(faults.record(FaultKind::CommsNack, 80), Verdict::Counted(2));
        assert_eq!(faults.record(FaultKind::CommsNack, 101), Verdict::Counted(2));
        assert_eq!(faults.record(FaultKind::CommsNack, 120), Verdict::Escalate);
        assert_eq!(faults.count(FaultKind::CommsNack), 0);
    }

    #[test]
    fn occurrence_on_the_window_edge_still_counts() {
        let faults = FaultClassifier::new(1, 100);
        faults.record(FaultKind::ReadFail, 0);
        assert_eq!(faults.record(FaultKind::ReadFail, 100), Verdict::Escalate);
        faults.record(FaultKind::ReadFail, 200);
        assert_eq!(faults.record(FaultKind::ReadFail, 301), Verdict::Counted(1));
    }

    #[test]
    fn deferred_kinds_drain_in_order() {
        let faults = FaultClassifier::new(5, 1000);
        faults.defer(FaultKind::WakeupTimeout);
        faults.defer(FaultKind::FirmwareAssert);
        faults.defer(FaultKind::FirmwareAssert);
        assert!(faults.has_deferred());
        assert_eq!(
            faults.take_deferred(),
            vec![FaultKind::FirmwareAssert, FaultKind::WakeupTimeout]
        );
        assert!(!faults.has_deferred());
        assert!(faults.take_deferred().is_empty());
    }

    #[test]
    fn transport_errors_map_to_kinds() {
        let full = IpcError::QueueFull {
            channel: ChannelId::DataToDevice,
        };
        assert_eq!(FaultKind::from_ipc(&full, true), Some(FaultKind::WriteFail));
        assert_eq!(FaultKind::from_ipc(&full, false), Some(FaultKind::ReadFail));
        let big = IpcError::PayloadTooLarge { len: 900, max: 769 };
        assert_eq!(FaultKind::from_ipc(&big, true), None);
        let stale = IpcError::StalePendingIrq { line: 3 };
        assert_eq!(FaultKind::from_ipc(&stale, true), Some(FaultKind::StalePendingIrq));
    }
}
