//! Transport layer between the host and the context hub co-processor.
//!
//! This crate provides the pieces that live in the shared memory window and
//! the mailbox register bank: the memory map resolved from the boot
//! descriptor, doorbell register access, the producer/consumer ring channels
//! for data and events, and the device log ring. It is `no_std` so the same
//! code can drive real mapped memory, an in-process allocation, or the
//! simulated device.

#![no_std]

extern crate alloc;

use core::fmt;
use thiserror::Error;

/// Injectable time source for bounded waits.
///
/// Every poll in the transport and the controller goes through a [`delay::Delay`]
/// so tests can drive the device model deterministically instead of sleeping.
pub mod delay;

/// Mailbox register access for raising, masking and acknowledging doorbell lines.
///
/// Wraps a [`doorbell::RegisterBank`] and translates per-direction line numbers
/// into the group 0 / group 1 register layout. Also provides a software
/// loopback bank with the same semantics as the hardware block.
pub mod doorbell;

/// Event channels and the paired doorbell signalling.
///
/// Adds descriptors to the outgoing event ring with bounded backoff and a
/// stale-line check, and pops descriptors from the incoming ring during
/// interrupt dispatch.
pub mod event;

/// The IPC map: every channel inside the IPC region wired to one doorbell.
///
/// Handles initialisation of the map, the data write path, interrupt
/// dispatch, and the shared debug words.
pub mod ipc;

/// Circular byte log written by the device and drained by the host.
pub mod log_ring;

/// Boot descriptor parsing and region lookup.
///
/// Reads the versioned descriptor at a fixed offset of the shared window and
/// resolves the bootloader, firmware, IPC, RAM, shared and dump regions.
pub mod memmap;

/// Collaborator interfaces for power sequencing and firmware images.
pub mod platform;

/// Fixed-capacity slot queue over shared memory.
///
/// Generic over the slot format so the same index discipline and corruption
/// checks serve both the data channels and the event channels.
pub mod ring;

/// Spinlock used for the short host-local critical sections.
pub mod sync;

/// Volatile accessors over a shared memory window.
pub mod window;

/// Identifies one of the four rings of the IPC map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    DataToHost,
    DataToDevice,
    EventToHost,
    EventToDevice,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DataToHost => "data c2a",
            Self::DataToDevice => "data a2c",
            Self::EventToHost => "event c2a",
            Self::EventToDevice => "event a2c",
        };
        f.pad(name)
    }
}

/// Why the boot descriptor was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapFault {
    #[error("window too small for the boot descriptor")]
    Truncated,

    #[error("magic mismatch")]
    BadMagic,

    #[error("protocol version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("{region} range {start:#x}..{end:#x} is outside the window")]
    Range {
        region: &'static str,
        start: u32,
        end: u32,
    },

    #[error("ipc region of {size} bytes cannot hold the ipc map")]
    IpcTooSmall { size: usize },

    #[error("descriptor could not be decoded")]
    Malformed,
}

/// Error types returned by the transport layer.
///
/// Queue-full conditions are transient and the caller may retry. Index
/// corruption is terminal for the channel until a reset re-zeroes the map.
/// Stale doorbell lines and empty or mismatched event queues mean the two
/// sides disagree and are escalated by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    /// The boot descriptor is missing, of the wrong version, or inconsistent.
    #[error("memory map invalid: {0}")]
    MapInvalid(MapFault),

    /// The payload does not fit in a data slot.
    #[error("payload of {len} bytes exceeds the {max} byte slot")]
    PayloadTooLarge { len: usize, max: usize },

    /// The data channel has no free slot.
    #[error("{channel} queue full")]
    QueueFull { channel: ChannelId },

    /// The event channel stayed full through the bounded backoff.
    #[error("{channel} queue full after backoff")]
    EventQueueFull { channel: ChannelId },

    /// An index read from shared memory is outside the channel.
    #[error("{channel} index corrupted (eq {eq}, dq {dq}, capacity {capacity})")]
    IndexCorruption {
        channel: ChannelId,
        eq: u32,
        dq: u32,
        capacity: u32,
    },

    /// The target doorbell line was still pending from an earlier event.
    #[error("doorbell line {line} still pending")]
    StalePendingIrq { line: u32 },

    /// Doorbell bits were pending but the event channel was empty.
    #[error("event queue empty with pending lines {pending:#06x}")]
    EventQueueEmpty { pending: u32 },

    /// The oldest event names a line that was not raised.
    #[error("event on line {line} does not match pending lines {pending:#06x}")]
    EventQueueMismatch { line: u32, pending: u32 },

    /// A stored slot carries an impossible length.
    #[error("{channel} slot carries {len} bytes")]
    SlotCorrupted { channel: ChannelId, len: u32 },

    /// Log ring indices are outside the ring.
    #[error("log ring corrupted (write {write}, read {read}, size {size})")]
    LogRingCorrupted { write: u32, read: u32, size: u32 },
}
