//! Fixed-capacity slot queues over shared memory.
//!
//! A ring is a block of control words (`eq`, `dq`, `full`, `empty`, ...)
//! plus an array of fixed-stride slots. One side only ever advances `eq`,
//! the other only `dq`. Both indices are read back from shared memory on
//! every call and rejected when they are out of range, so a corrupted
//! peer can never steer a copy outside the channel.

use crate::sync::SpinLock;
use crate::window::SharedWindow;
use crate::{ChannelId, IpcError};
use alloc::vec;
use alloc::vec::Vec;
use chub_common::ipc;
use core::marker::PhantomData;
use core::sync::atomic::{Ordering, fence};

/// Control word offsets, relative to the control block.
pub mod ctrl {
    pub const EQ: usize = 0;
    pub const DQ: usize = 4;
    pub const FULL: usize = 8;
    pub const EMPTY: usize = 12;
    /// Event channels only: next doorbell line to use.
    pub const LINE: usize = 16;
}

/// How a ring tells "full" apart from "empty" when `eq == dq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// One slot stays unused; `(eq + 1) % capacity == dq` means full.
    ReserveSlot,
    /// All slots are usable; the `full` word disambiguates `eq == dq`.
    FullFlag,
}

/// A slot format stored in a ring.
pub trait Slot {
    /// What a producer hands in.
    type Value: ?Sized;
    /// What a consumer gets back.
    type Owned;

    /// Bytes between consecutive slots.
    const STRIDE: usize;

    /// Validates a value before anything is written.
    fn check(_value: &Self::Value) -> Result<(), IpcError> {
        Ok(())
    }

    fn store(window: &SharedWindow, offset: usize, value: &Self::Value);

    fn load(channel: ChannelId, window: &SharedWindow, offset: usize)
    -> Result<Self::Owned, IpcError>;

    /// Marks a slot consumed after `load`.
    fn release(_window: &SharedWindow, _offset: usize) {}
}

/// Data slot: a length word followed by up to [`ipc::PACKET_SIZE_MAX`] bytes.
pub struct DataSlot;

impl Slot for DataSlot {
    type Value = [u8];
    type Owned = Vec<u8>;

    const STRIDE: usize = ipc::DATA_SLOT_STRIDE;

    fn check(value: &[u8]) -> Result<(), IpcError> {
        if value.len() > ipc::PACKET_SIZE_MAX {
            return Err(IpcError::PayloadTooLarge {
                len: value.len(),
                max: ipc::PACKET_SIZE_MAX,
            });
        }
        Ok(())
    }

    fn store(window: &SharedWindow, offset: usize, value: &[u8]) {
        window.write_u32(offset, value.len() as u32);
        window.write_bytes(offset + 4, value);
    }

    fn load(channel: ChannelId, window: &SharedWindow, offset: usize) -> Result<Vec<u8>, IpcError> {
        let len = window.read_u32(offset);
        if len as usize > ipc::PACKET_SIZE_MAX {
            return Err(IpcError::SlotCorrupted { channel, len });
        }
        let mut payload = vec![0u8; len as usize];
        window.read_bytes(offset + 4, &mut payload);
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Dequeued,
    Enqueued,
}

/// Event descriptor: a code and the doorbell line raised for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSlot {
    pub code: u32,
    pub line: u32,
    pub state: SlotState,
}

impl Slot for EventSlot {
    type Value = EventSlot;
    type Owned = EventSlot;

    const STRIDE: usize = ipc::EVENT_SLOT_STRIDE;

    fn store(window: &SharedWindow, offset: usize, value: &EventSlot) {
        window.write_u32(offset, value.code);
        window.write_u32(offset + 4, value.line);
        let state = match value.state {
            SlotState::Enqueued => ipc::SLOT_ENQUEUED,
            SlotState::Dequeued => ipc::SLOT_DEQUEUED,
        };
        window.write_u32(offset + 8, state);
    }

    fn load(_channel: ChannelId, window: &SharedWindow, offset: usize) -> Result<EventSlot, IpcError> {
        let state = if window.read_u32(offset + 8) == ipc::SLOT_ENQUEUED {
            SlotState::Enqueued
        } else {
            SlotState::Dequeued
        };
        Ok(EventSlot {
            code: window.read_u32(offset),
            line: window.read_u32(offset + 4),
            state,
        })
    }

    fn release(window: &SharedWindow, offset: usize) {
        window.write_u32(offset + 8, ipc::SLOT_DEQUEUED);
    }
}

/// Where a ring's control block and slot array sit inside its window.
#[derive(Debug, Clone, Copy)]
pub struct RingLayout {
    pub ctrl: usize,
    pub slots: usize,
    pub capacity: u32,
    pub discipline: Discipline,
}

impl RingLayout {
    /// Control block first, then the slots.
    pub const fn data() -> Self {
        Self {
            ctrl: 0,
            slots: ipc::DATA_CTRL_BYTES,
            capacity: ipc::DATA_SLOTS,
            discipline: Discipline::ReserveSlot,
        }
    }

    /// Slots first, then the control block.
    pub const fn event() -> Self {
        Self {
            ctrl: ipc::EVENT_SLOTS as usize * ipc::EVENT_SLOT_STRIDE,
            slots: 0,
            capacity: ipc::EVENT_SLOTS,
            discipline: Discipline::FullFlag,
        }
    }
}

/// Single-producer single-consumer ring in shared memory.
///
/// The control words and the slots live in the peer-visible window; the
/// local lock only orders producers or consumers on this side.
pub struct RingChannel<S: Slot> {
    id: ChannelId,
    window: SharedWindow,
    layout: RingLayout,
    lock: SpinLock<()>,
    _slot: PhantomData<fn() -> S>,
}

impl<S: Slot> RingChannel<S> {
    /// Wraps an existing ring. Nothing in shared memory is modified.
    ///
    /// # Arguments
    ///
    /// * `id` - channel reported in errors.
    /// * `window` - window the offsets in `layout` are relative to.
    /// * `layout` - where the control words and slots sit, and how many.
    pub fn new(id: ChannelId, window: SharedWindow, layout: RingLayout) -> Self {
        let needed = (layout.ctrl + ctrl::LINE + 4)
            .max(layout.slots + layout.capacity as usize * S::STRIDE);
        assert!(window.len() >= needed, "{id} window too small");
        Self {
            id,
            window,
            layout,
            lock: SpinLock::new(()),
            _slot: PhantomData,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn read_ctrl(&self, word: usize) -> u32 {
        self.window.read_u32(self.layout.ctrl + word)
    }

    pub fn write_ctrl(&self, word: usize, value: u32) {
        self.window.write_u32(self.layout.ctrl + word, value)
    }

    /// Reads both indices and validates them against the capacity.
    pub fn indices(&self) -> Result<(u32, u32), IpcError> {
        let eq = self.read_ctrl(ctrl::EQ);
        let dq = self.read_ctrl(ctrl::DQ);
        let capacity = self.layout.capacity;
        if eq >= capacity || dq >= capacity {
            log::error!("{}: index corrupted eq {} dq {}", self.id, eq, dq);
            return Err(IpcError::IndexCorruption {
                channel: self.id,
                eq,
                dq,
                capacity,
            });
        }
        Ok((eq, dq))
    }

    fn full_at(&self, eq: u32, dq: u32) -> bool {
        match self.layout.discipline {
            Discipline::ReserveSlot => (eq + 1) % self.layout.capacity == dq,
            Discipline::FullFlag => self.read_ctrl(ctrl::FULL) != 0,
        }
    }

    fn empty_at(&self, eq: u32, dq: u32) -> bool {
        match self.layout.discipline {
            Discipline::ReserveSlot => eq == dq,
            Discipline::FullFlag => eq == dq && self.read_ctrl(ctrl::FULL) == 0,
        }
    }

    pub fn is_full(&self) -> Result<bool, IpcError> {
        let (eq, dq) = self.indices()?;
        Ok(self.full_at(eq, dq))
    }

    pub fn is_empty(&self) -> Result<bool, IpcError> {
        let (eq, dq) = self.indices()?;
        Ok(self.empty_at(eq, dq))
    }

    /// Items currently in flight.
    pub fn len(&self) -> Result<u32, IpcError> {
        let (eq, dq) = self.indices()?;
        if self.layout.discipline == Discipline::FullFlag && self.full_at(eq, dq) {
            return Ok(self.layout.capacity);
        }
        Ok((eq + self.layout.capacity - dq) % self.layout.capacity)
    }

    fn slot_offset(&self, index: u32) -> usize {
        self.layout.slots + index as usize * S::STRIDE
    }

    /// Copies `value` into the next free slot and publishes it.
    ///
    /// # Returns
    ///
    /// [`IpcError::QueueFull`] when no slot is free, or the validation error
    /// of the slot type or of the indices. The ring is untouched on error.
    pub fn enqueue(&self, value: &S::Value) -> Result<(), IpcError> {
        S::check(value)?;
        self.indices()?;

        let _guard = self.lock.lock();
        let (eq, dq) = self.indices()?;
        if self.full_at(eq, dq) {
            return Err(IpcError::QueueFull { channel: self.id });
        }

        S::store(&self.window, self.slot_offset(eq), value);
        fence(Ordering::Release);

        let next = (eq + 1) % self.layout.capacity;
        self.write_ctrl(ctrl::EQ, next);
        self.write_ctrl(ctrl::EMPTY, 0);
        let full = match self.layout.discipline {
            Discipline::ReserveSlot => (next + 1) % self.layout.capacity == dq,
            Discipline::FullFlag => next == dq,
        };
        self.write_ctrl(ctrl::FULL, full as u32);
        Ok(())
    }

    /// Pops the oldest slot, or `None` when the ring is empty.
    pub fn dequeue(&self) -> Result<Option<S::Owned>, IpcError> {
        self.indices()?;

        let _guard = self.lock.lock();
        let (eq, dq) = self.indices()?;
        if self.empty_at(eq, dq) {
            return Ok(None);
        }
        fence(Ordering::Acquire);

        let offset = self.slot_offset(dq);
        let item = S::load(self.id, &self.window, offset);
        S::release(&self.window, offset);

        let next = (dq + 1) % self.layout.capacity;
        self.write_ctrl(ctrl::DQ, next);
        self.write_ctrl(ctrl::FULL, 0);
        self.write_ctrl(ctrl::EMPTY, (next == eq) as u32);
        item.map(Some)
    }

    /// Zeroes the indices and marks the ring empty.
    pub fn reset(&self) {
        let _guard = self.lock.lock();
        self.write_ctrl(ctrl::EQ, 0);
        self.write_ctrl(ctrl::DQ, 0);
        self.write_ctrl(ctrl::FULL, 0);
        self.write_ctrl(ctrl::EMPTY, 1);
    }

    /// Whether the control words describe a freshly initialised ring.
    pub fn is_pristine(&self) -> bool {
        self.read_ctrl(ctrl::EQ) == 0
            && self.read_ctrl(ctrl::DQ) == 0
            && self.read_ctrl(ctrl::FULL) == 0
            && self.read_ctrl(ctrl::EMPTY) == 1
    }

    pub fn window(&self) -> &SharedWindow {
        &self.window
    }
}

/// A data channel.
pub type DataChannel = RingChannel<DataSlot>;
