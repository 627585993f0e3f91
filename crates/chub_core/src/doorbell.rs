//! Doorbell register access.
//!
//! The mailbox block has one register group per direction. Lines raised by
//! the host towards the device live in the low half of group 1; lines raised
//! by the device towards the host live in the high half of group 0. This
//! module hides that split behind a [`Direction`] and a line number.

use crate::sync::SpinLock;
use crate::window::SharedWindow;
use alloc::sync::Arc;
use chub_common::mmio;
use chub_common::scratch;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 32-bit register access to the mailbox block.
pub trait RegisterBank: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// Memory-mapped mailbox registers.
impl RegisterBank for SharedWindow {
    fn read32(&self, offset: usize) -> u32 {
        self.read_u32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write_u32(offset, value)
    }
}

/// Which way an interrupt travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    ToHost,
}

/// Register offsets of one direction's group.
struct Group {
    generate: usize,
    clear: usize,
    mask: usize,
    status: usize,
    masked_status: usize,
    shift: u32,
}

const LINE_MASK: u32 = (1 << mmio::LINES_PER_DIRECTION) - 1;

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::ToDevice => Self::ToHost,
            Self::ToHost => Self::ToDevice,
        }
    }

    fn group(self) -> Group {
        match self {
            Self::ToHost => Group {
                generate: mmio::INTGR0,
                clear: mmio::INTCR0,
                mask: mmio::INTMR0,
                status: mmio::INTSR0,
                masked_status: mmio::INTMSR0,
                shift: mmio::TO_HOST_SHIFT,
            },
            Self::ToDevice => Group {
                generate: mmio::INTGR1,
                clear: mmio::INTCR1,
                mask: mmio::INTMR1,
                status: mmio::INTSR1,
                masked_status: mmio::INTMSR1,
                shift: 0,
            },
        }
    }
}

/// Register values captured for post-mortem analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxSnapshot {
    pub registers: [(&'static str, u32); 15],
}

/// Doorbell over a register bank.
#[derive(Clone)]
pub struct Doorbell {
    bank: Arc<dyn RegisterBank>,
}

impl Doorbell {
    pub fn new(bank: Arc<dyn RegisterBank>) -> Self {
        Self { bank }
    }

    #[inline]
    fn bit(group: &Group, line: u32) -> u32 {
        debug_assert!(line < mmio::LINES_PER_DIRECTION);
        1 << (line + group.shift)
    }

    /// Raises `line` towards the peer in `dir`.
    pub fn raise(&self, dir: Direction, line: u32) {
        let g = dir.group();
        self.bank.write32(g.generate, Self::bit(&g, line));
    }

    /// Clears the pending bit of `line`.
    pub fn ack(&self, dir: Direction, line: u32) {
        let g = dir.group();
        self.bank.write32(g.clear, Self::bit(&g, line));
    }

    pub fn mask(&self, dir: Direction, line: u32) {
        let g = dir.group();
        let current = self.bank.read32(g.mask);
        self.bank.write32(g.mask, current | Self::bit(&g, line));
    }

    pub fn unmask(&self, dir: Direction, line: u32) {
        let g = dir.group();
        let current = self.bank.read32(g.mask);
        self.bank.write32(g.mask, current & !Self::bit(&g, line));
    }

    /// Clears every pending bit in `dir` without touching the mask.
    pub fn clear_all(&self, dir: Direction) {
        let g = dir.group();
        self.bank.write32(g.clear, LINE_MASK << g.shift);
    }

    /// Clears all pending bits, then masks every line in `dir`.
    pub fn mask_all(&self, dir: Direction) {
        let g = dir.group();
        self.clear_all(dir);
        self.bank.write32(g.mask, LINE_MASK << g.shift);
    }

    /// Clears all pending bits, then unmasks every line in `dir`.
    pub fn unmask_all(&self, dir: Direction) {
        let g = dir.group();
        self.clear_all(dir);
        self.bank.write32(g.mask, 0);
    }

    /// Deliverable lines in `dir`: pending and not masked, as a line bitmask.
    pub fn status(&self, dir: Direction) -> u32 {
        let g = dir.group();
        (self.bank.read32(g.masked_status) >> g.shift) & LINE_MASK
    }

    /// Pending lines in `dir` regardless of the mask.
    pub fn raw_status(&self, dir: Direction) -> u32 {
        let g = dir.group();
        (self.bank.read32(g.status) >> g.shift) & LINE_MASK
    }

    pub fn is_pending(&self, dir: Direction, line: u32) -> bool {
        self.raw_status(dir) & (1 << line) != 0
    }

    pub fn read_scratch(&self, slot: usize) -> u32 {
        debug_assert!(slot < scratch::SLOT_COUNT);
        self.bank.read32(mmio::ISSR0 + slot * 4)
    }

    pub fn write_scratch(&self, slot: usize, value: u32) {
        debug_assert!(slot < scratch::SLOT_COUNT);
        self.bank.write32(mmio::ISSR0 + slot * 4, value);
    }

    /// Writes the 64-bit debug value split over two scratch slots.
    pub fn write_debug_value(&self, value: u64) {
        self.write_scratch(scratch::DEBUG_LOW, value as u32);
        self.write_scratch(scratch::DEBUG_HIGH, (value >> 32) as u32);
    }

    pub fn read_debug_value(&self) -> u64 {
        let low = self.read_scratch(scratch::DEBUG_LOW) as u64;
        let high = self.read_scratch(scratch::DEBUG_HIGH) as u64;
        (high << 32) | low
    }

    pub fn snapshot(&self) -> MailboxSnapshot {
        let names: [(&'static str, usize); 15] = [
            ("MCUCTL", mmio::MCUCTL),
            ("INTGR0", mmio::INTGR0),
            ("INTCR0", mmio::INTCR0),
            ("INTMR0", mmio::INTMR0),
            ("INTSR0", mmio::INTSR0),
            ("INTMSR0", mmio::INTMSR0),
            ("INTGR1", mmio::INTGR1),
            ("INTCR1", mmio::INTCR1),
            ("INTMR1", mmio::INTMR1),
            ("INTSR1", mmio::INTSR1),
            ("INTMSR1", mmio::INTMSR1),
            ("ISSR0", mmio::ISSR0),
            ("ISSR1", mmio::ISSR0 + 4),
            ("ISSR2", mmio::ISSR0 + 8),
            ("ISSR3", mmio::ISSR0 + 12),
        ];
        MailboxSnapshot {
            registers: names.map(|(name, offset)| (name, self.bank.read32(offset))),
        }
    }
}

#[derive(Default)]
struct LoopbackRegs {
    mcuctl: u32,
    /// Raw pending bits, group 0 then group 1.
    pending: [u32; 2],
    mask: [u32; 2],
    scratch: [u32; scratch::SLOT_COUNT],
}

/// Software mailbox with the same register semantics as the hardware block.
///
/// Generate registers set pending bits, clear registers clear them, and the
/// masked status reads pending bits with masked lines removed. Every access
/// is counted so callers can assert that a path touched no registers.
#[derive(Default)]
pub struct LoopbackBank {
    regs: SpinLock<LoopbackRegs>,
    accesses: AtomicUsize,
}

impl LoopbackBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register reads and writes performed so far.
    pub fn accesses(&self) -> usize {
        self.accesses.load(Ordering::Relaxed)
    }
}

impl RegisterBank for LoopbackBank {
    fn read32(&self, offset: usize) -> u32 {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let regs = self.regs.lock();
        match offset {
            mmio::MCUCTL => regs.mcuctl,
            mmio::INTMR0 => regs.mask[0],
            mmio::INTSR0 => regs.pending[0],
            mmio::INTMSR0 => regs.pending[0] & !regs.mask[0],
            mmio::INTMR1 => regs.mask[1],
            mmio::INTSR1 => regs.pending[1],
            mmio::INTMSR1 => regs.pending[1] & !regs.mask[1],
            o if (mmio::ISSR0..mmio::ISSR0 + 4 * scratch::SLOT_COUNT).contains(&o) => {
                regs.scratch[(o - mmio::ISSR0) / 4]
            }
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let mut regs = self.regs.lock();
        match offset {
            mmio::MCUCTL => regs.mcuctl = value,
            mmio::INTGR0 => regs.pending[0] |= value,
            mmio::INTCR0 => regs.pending[0] &= !value,
            mmio::INTMR0 => regs.mask[0] = value,
            mmio::INTGR1 => regs.pending[1] |= value,
            mmio::INTCR1 => regs.pending[1] &= !value,
            mmio::INTMR1 => regs.mask[1] = value,
            o if (mmio::ISSR0..mmio::ISSR0 + 4 * scratch::SLOT_COUNT).contains(&o) => {
                regs.scratch[(o - mmio::ISSR0) / 4] = value
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doorbell() -> (Arc<LoopbackBank>, Doorbell) {
        let bank = Arc::new(LoopbackBank::new());
        (bank.clone(), Doorbell::new(bank))
    }

    #[test]
    fn directions_use_separate_halves() {
        let (bank, db) = doorbell();
        db.raise(Direction::ToDevice, 3);
        db.raise(Direction::ToHost, 5);
        assert_eq!(bank.read32(mmio::INTSR1), 1 << 3);
        assert_eq!(bank.read32(mmio::INTSR0), 1 << (5 + 16));
        assert_eq!(db.status(Direction::ToDevice), 1 << 3);
        assert_eq!(db.status(Direction::ToHost), 1 << 5);

        db.ack(Direction::ToHost, 5);
        assert_eq!(db.status(Direction::ToHost), 0);
        assert!(db.is_pending(Direction::ToDevice, 3));
    }

    #[test]
    fn masked_lines_stay_pending_but_undeliverable() {
        let (_, db) = doorbell();
        db.mask(Direction::ToHost, 2);
        db.raise(Direction::ToHost, 2);
        assert_eq!(db.status(Direction::ToHost), 0);
        assert!(db.is_pending(Direction::ToHost, 2));
        db.unmask(Direction::ToHost, 2);
        assert_eq!(db.status(Direction::ToHost), 1 << 2);
    }

    #[test]
    fn mask_all_and_unmask_all_clear_pending() {
        let (_, db) = doorbell();
        db.raise(Direction::ToHost, 1);
        db.raise(Direction::ToHost, 15);
        db.mask_all(Direction::ToHost);
        assert_eq!(db.raw_status(Direction::ToHost), 0);
        db.raise(Direction::ToHost, 4);
        assert_eq!(db.status(Direction::ToHost), 0);
        db.unmask_all(Direction::ToHost);
        assert_eq!(db.raw_status(Direction::ToHost), 0);
        db.raise(Direction::ToHost, 4);
        assert_eq!(db.status(Direction::ToHost), 1 << 4);
    }

    #[test]
    fn debug_value_spans_two_slots() {
        let (_, db) = doorbell();
        db.write_debug_value(0x1234_5678_9abc_def0);
        assert_eq!(db.read_scratch(scratch::DEBUG_LOW), 0x9abc_def0);
        assert_eq!(db.read_scratch(scratch::DEBUG_HIGH), 0x1234_5678);
        assert_eq!(db.read_debug_value(), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn snapshot_reports_scratch() {
        let (_, db) = doorbell();
        db.write_scratch(scratch::ALIVE, scratch::ALIVE_OK);
        let snap = db.snapshot();
        assert_eq!(snap.registers[14], ("ISSR3", scratch::ALIVE_OK));
    }
}
