//! Common definitions and constants shared across the context hub stack.
//!
//! This crate provides the mailbox register layout, the shared-memory IPC
//! map geometry, doorbell line assignments, event codes and the debug
//! command set. The values are shared between the host transport, the
//! simulated device and the command-line tools, and must match what the
//! context hub firmware expects.

#![no_std]

// Mailbox register bank layout for the host/context-hub doorbell.
//
// The bank is split in two halves: group 0 carries interrupts raised by the
// device towards the host (upper 16 bits), group 1 carries interrupts raised
// by the host towards the device (lower 16 bits). Four scratch registers
// follow at 0x80.
pub mod mmio {
    /// Mailbox control register.
    pub const MCUCTL: usize = 0x00;

    /// Interrupt generation register, device-to-host group.
    ///
    /// Writing a one to bit `n + 16` raises line `n` towards the host.
    pub const INTGR0: usize = 0x08;
    /// Interrupt clear register, device-to-host group.
    pub const INTCR0: usize = 0x0C;
    /// Interrupt mask register, device-to-host group.
    pub const INTMR0: usize = 0x10;
    /// Raw interrupt status register, device-to-host group.
    pub const INTSR0: usize = 0x14;
    /// Masked interrupt status register, device-to-host group.
    pub const INTMSR0: usize = 0x18;

    /// Interrupt generation register, host-to-device group.
    ///
    /// Writing a one to bit `n` raises line `n` towards the device.
    pub const INTGR1: usize = 0x1C;
    /// Interrupt clear register, host-to-device group.
    pub const INTCR1: usize = 0x20;
    /// Interrupt mask register, host-to-device group.
    pub const INTMR1: usize = 0x24;
    /// Raw interrupt status register, host-to-device group.
    pub const INTSR1: usize = 0x28;
    /// Masked interrupt status register, host-to-device group.
    pub const INTMSR1: usize = 0x2C;

    /// First shared scratch register. Scratch registers are 4 bytes apart.
    pub const ISSR0: usize = 0x80;

    /// Size of the register bank in bytes.
    pub const BANK_SIZE: usize = 0x90;

    /// Number of doorbell lines per direction.
    pub const LINES_PER_DIRECTION: u32 = 16;

    /// Bit offset of the device-to-host lines inside group 0 registers.
    pub const TO_HOST_SHIFT: u32 = 16;

    /// Number of general purpose registers captured by a GPR dump.
    ///
    /// The last entry holds the program counter.
    pub const GPR_COUNT: usize = 17;

    /// Index of the program counter inside a GPR dump.
    pub const GPR_PC_INDEX: usize = 16;
}

/// Shared scratch register slots and the tokens exchanged through them.
pub mod scratch {
    /// Slot holding the boot mode (non-zero once firmware is resident).
    pub const BOOT_MODE: usize = 0;
    /// Slot holding the low word of the 64-bit debug value.
    pub const DEBUG_LOW: usize = 1;
    /// Slot holding the high word of the 64-bit debug value.
    pub const DEBUG_HIGH: usize = 2;
    /// Slot holding the alive token and the host power state.
    pub const ALIVE: usize = 3;

    /// Number of scratch slots.
    pub const SLOT_COUNT: usize = 4;

    /// Token the host writes before pinging the device.
    pub const ALIVE_HELLO: u32 = 0xab;
    /// Token the device writes when it answers a ping.
    pub const ALIVE_OK: u32 = 0xcd;

    /// Host state values written into [`ALIVE`] alongside alive pings.
    pub const KERNEL_LOG_ON: u32 = 1 << 0;
    pub const KERNEL_LOG_OFF: u32 = 1 << 1;
    pub const HOST_PREPARE_SLEEP: u32 = 1 << 2;
    pub const HOST_COMPLETE_WAKE: u32 = 1 << 3;
}

/// Doorbell line assignments and event codes.
///
/// Event descriptors carry a numeric code. The codes for the two directions
/// overlap numerically, so each direction gets its own enumeration.
pub mod irq {
    /// Line reserved for the out-of-band alive handshake.
    pub const ALIVE_LINE: u32 = 15;

    /// Number of lines the event channel rotates over (all but the alive line).
    pub const EVENT_LINES: u32 = 15;

    /// Data-ready codes shared by both directions, one per data channel.
    pub const DATA_CHANNELS: u32 = 3;

    /// Events raised by the host towards the device.
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum HostEvent {
        /// Data is ready on host-to-device data channel 0.
        Channel0 = 0,
        Channel1 = 1,
        Channel2 = 2,
        /// The host finished a hard reset and expects the device to announce itself.
        ResetComplete = 3,
        /// Keep the device awake.
        Wakeup = 4,
        /// The device may idle again.
        WakeupClear = 5,
        /// The device is about to be powered down.
        Shutdown = 6,
        /// Flush the device log ring now.
        Log = 7,
        /// A debug command is waiting in the shared debug word.
        Debug = 8,
    }

    impl HostEvent {
        pub fn from_code(code: u32) -> Option<Self> {
            Some(match code {
                0 => Self::Channel0,
                1 => Self::Channel1,
                2 => Self::Channel2,
                3 => Self::ResetComplete,
                4 => Self::Wakeup,
                5 => Self::WakeupClear,
                6 => Self::Shutdown,
                7 => Self::Log,
                8 => Self::Debug,
                _ => return None,
            })
        }
    }

    /// Events raised by the device towards the host.
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DeviceEvent {
        /// Data is ready on device-to-host data channel 0.
        Channel0 = 0,
        Channel1 = 1,
        Channel2 = 2,
        /// The device posted a request in the shared debug word.
        Debug = 3,
        /// The firmware hit an assertion.
        Assert = 4,
        /// The device asserted its wake line towards the host.
        WakeAssert = 5,
        /// The device released its wake line.
        WakeDeassert = 6,
    }

    impl DeviceEvent {
        pub fn from_code(code: u32) -> Option<Self> {
            Some(match code {
                0 => Self::Channel0,
                1 => Self::Channel1,
                2 => Self::Channel2,
                3 => Self::Debug,
                4 => Self::Assert,
                5 => Self::WakeAssert,
                6 => Self::WakeDeassert,
                _ => return None,
            })
        }
    }
}

// Geometry of the boot descriptor and of the IPC map area.
//
// Every structure here is laid out with 32-bit little-endian words and the
// natural C alignment the firmware uses, so offsets are computed rather than
// declared as Rust structs over shared memory.
pub mod ipc {
    /// Magic string at the head of the boot descriptor, NUL padded to 16 bytes.
    pub const MAGIC: &[u8] = b"Nanohub OS";

    /// Width of the magic field.
    pub const MAGIC_LEN: usize = 16;

    /// Protocol version the host understands.
    pub const IPC_VERSION: u32 = 181024;

    /// Byte offset of the boot descriptor from the start of the shared window.
    pub const MAP_INFO_OFFSET: usize = 256;

    /// Upper bound on the descriptor size.
    pub const MAP_INFO_MAX_SIZE: usize = 128;

    /// Offsets of the boot descriptor fields.
    pub mod bootargs {
        pub const MAGIC: usize = 0;
        pub const VERSION: usize = 16;
        pub const BL_START: usize = 20;
        pub const BL_END: usize = 24;
        pub const CODE_START: usize = 28;
        pub const CODE_END: usize = 32;
        pub const IPC_START: usize = 36;
        pub const IPC_END: usize = 40;
        pub const RAM_START: usize = 44;
        pub const RAM_END: usize = 48;
        pub const SHARED_START: usize = 52;
        pub const SHARED_END: usize = 56;
        pub const DUMP_START: usize = 60;
        pub const DUMP_END: usize = 64;
        pub const CLOCK_HZ: usize = 68;
        /// 16-bit field.
        pub const BOOT_MODE: usize = 72;
        /// 16-bit field.
        pub const KERNEL_LOG: usize = 74;
        /// Total descriptor size.
        pub const SIZE: usize = 76;
    }

    /// Boot mode for a cold boot.
    pub const BOOTMODE_COLD: u16 = 0x7733;
    /// Boot mode for a resume from power gating.
    pub const BOOTMODE_PWRGATING: u16 = 0x1188;

    /// Largest payload a data slot can carry.
    pub const PACKET_SIZE_MAX: usize = 769;

    /// Slots per data channel.
    pub const DATA_SLOTS: u32 = 16;

    /// Slots per event channel.
    pub const EVENT_SLOTS: u32 = 30;

    /// Bytes in the persist buffer at the tail of the IPC region.
    pub const PERSIST_BUF_SIZE: usize = 96;

    const fn align4(n: usize) -> usize {
        (n + 3) & !3
    }

    /// Data channel control words: `eq`, `dq`, `full`, `empty`.
    pub const DATA_CTRL_BYTES: usize = 16;
    /// One data slot: a length word followed by the payload, word aligned.
    pub const DATA_SLOT_STRIDE: usize = align4(4 + PACKET_SIZE_MAX);
    /// One complete data channel.
    pub const DATA_CHANNEL_BYTES: usize = DATA_CTRL_BYTES + DATA_SLOTS as usize * DATA_SLOT_STRIDE;

    /// One event slot: `code`, `line`, `state`.
    pub const EVENT_SLOT_STRIDE: usize = 12;
    /// Event channel control words: `eq`, `dq`, `full`, `empty`, `line`.
    pub const EVENT_CTRL_BYTES: usize = 20;
    /// One complete event channel. Slots come first, then the control words.
    pub const EVENT_CHANNEL_BYTES: usize = EVENT_SLOTS as usize * EVENT_SLOT_STRIDE + EVENT_CTRL_BYTES;

    /// Debug words: command/event word followed by one value per direction.
    pub const DEBUG_BYTES: usize = 12;

    /// Log ring header: `write`, `read`, `size`, `token`, `full`.
    pub const LOG_HEADER_BYTES: usize = 20;

    /// Offsets inside the IPC region.
    pub mod area {
        use super::*;

        pub const DATA_TO_HOST: usize = 0;
        pub const DATA_TO_DEVICE: usize = DATA_TO_HOST + DATA_CHANNEL_BYTES;
        pub const EVENT_TO_HOST: usize = DATA_TO_DEVICE + DATA_CHANNEL_BYTES;
        pub const EVENT_TO_DEVICE: usize = EVENT_TO_HOST + EVENT_CHANNEL_BYTES;
        pub const DEBUG: usize = EVENT_TO_DEVICE + EVENT_CHANNEL_BYTES;
        pub const LOG: usize = DEBUG + DEBUG_BYTES;
        pub const LOG_DATA: usize = LOG + LOG_HEADER_BYTES;

        /// Size of the fixed part of the IPC map. The log bytes and the
        /// persist buffer share what remains of the region.
        pub const MAP_BYTES: usize = LOG_DATA;
    }

    /// Event slot state values.
    pub const SLOT_DEQUEUED: u32 = 0;
    pub const SLOT_ENQUEUED: u32 = 1;
}

/// Timing and retry constants used by the transport and the controller.
pub mod timing {
    /// Backoff between attempts to add an event to a full channel.
    pub const EVENT_WAIT_MS: u32 = 5;
    /// Attempts made against a full event channel or a stale doorbell line.
    pub const EVENT_MAX_TRIES: u32 = 5;
    /// Poll interval while draining in-flight IPC before a reset.
    pub const DRAIN_POLL_MS: u32 = 100;
    /// Polls made while draining in-flight IPC.
    pub const DRAIN_TRIES: u32 = 10;
    /// Grace period after signalling shutdown.
    pub const SHUTDOWN_GRACE_MS: u32 = 100;
    /// Poll interval of the alive handshake.
    pub const ALIVE_POLL_MS: u32 = 50;
    /// Time given to a single alive ping.
    pub const ALIVE_PING_MS: u32 = 200;
    /// Retries of the alive handshake after power on or reset.
    pub const ALIVE_RETRIES: u32 = 3;
    /// Reset attempts before giving up.
    pub const RESET_ATTEMPTS: u32 = 5;
    /// Backoff between failed reset attempts.
    pub const RESET_BACKOFF_MS: u32 = 2000;
    /// Occurrences of a non-critical fault tolerated before escalation.
    pub const FAULT_THRESHOLD: u32 = 5;
    /// Default log flush period.
    pub const LOG_FLUSH_MS: u32 = 1000;
    /// Time allowed for the device to acknowledge a wake request.
    pub const WAKEUP_TIMEOUT_MS: u32 = 200;
}

/// Debug and test commands understood by the firmware.
///
/// The host writes the command into the shared debug word and raises a
/// debug event. The device answers through [`DeviceRequest`] values in the
/// same word.
pub mod debug {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DebugCommand {
        Stop = 0,
        Aging,
        Wdt,
        Rtc,
        Mem,
        Timer,
        Gpio,
        Spi,
        Cmu,
        TimeSync,
        Assert,
        Fault,
        CheckStatus,
        CpuUtil,
        Heap,
        Hang,
        HangItmon,
        SensorChipId,
        IpcTestStart,
        IpcTestEnd,
        DumpStatus,
    }

    impl DebugCommand {
        /// All commands in wire order.
        pub const ALL: [DebugCommand; 21] = [
            Self::Stop,
            Self::Aging,
            Self::Wdt,
            Self::Rtc,
            Self::Mem,
            Self::Timer,
            Self::Gpio,
            Self::Spi,
            Self::Cmu,
            Self::TimeSync,
            Self::Assert,
            Self::Fault,
            Self::CheckStatus,
            Self::CpuUtil,
            Self::Heap,
            Self::Hang,
            Self::HangItmon,
            Self::SensorChipId,
            Self::IpcTestStart,
            Self::IpcTestEnd,
            Self::DumpStatus,
        ];

        /// Name used by the command surface.
        pub const fn name(self) -> &'static str {
            match self {
                Self::Stop => "stop",
                Self::Aging => "aging",
                Self::Wdt => "wdt",
                Self::Rtc => "rtc",
                Self::Mem => "mem",
                Self::Timer => "timer",
                Self::Gpio => "gpio",
                Self::Spi => "spi",
                Self::Cmu => "cmu",
                Self::TimeSync => "time_sync",
                Self::Assert => "assert",
                Self::Fault => "fault",
                Self::CheckStatus => "stack",
                Self::CpuUtil => "utilization",
                Self::Heap => "heap",
                Self::Hang => "hang",
                Self::HangItmon => "itmon",
                Self::SensorChipId => "sensor_chipid",
                Self::IpcTestStart => "ipc_test_start",
                Self::IpcTestEnd => "ipc_test_end",
                Self::DumpStatus => "dump_status",
            }
        }

        pub fn from_code(code: u32) -> Option<Self> {
            Self::ALL.get(code as usize).copied()
        }

        pub fn from_name(name: &str) -> Option<Self> {
            Self::ALL.iter().copied().find(|cmd| cmd.name() == name)
        }
    }

    /// Requests the device posts in the debug word alongside a debug event.
    ///
    /// They start above the command range so the two never collide.
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DeviceRequest {
        PrintLog = 0x100,
        FullLog,
        Fault,
        Assert,
        Error,
    }

    impl DeviceRequest {
        pub fn from_code(code: u32) -> Option<Self> {
            Some(match code {
                0x100 => Self::PrintLog,
                0x101 => Self::FullLog,
                0x102 => Self::Fault,
                0x103 => Self::Assert,
                0x104 => Self::Error,
                _ => return None,
            })
        }
    }
}

/// Bus monitor reporting.
pub mod itmon {
    /// Bus masters that belong to the context hub. Errors reported for any
    /// other master are not ours to handle.
    pub const HUB_MASTERS: [&str; 3] = ["CM4_SHUB_CD", "CM4_SHUB_P", "PDMA_SHUB"];

    pub fn is_hub_master(master: &str) -> bool {
        HUB_MASTERS.iter().any(|prefix| master.starts_with(prefix))
    }
}
