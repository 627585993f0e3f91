//! Collaborators the controller drives but does not implement.
//!
//! Power sequencing is platform specific and firmware images come from
//! wherever the integrator keeps them. Both sit behind traits so the
//! simulator, file loaders and real hardware can be swapped freely.

use alloc::string::String;
use alloc::vec::Vec;
use chub_common::mmio::GPR_COUNT;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("power sequence failed at {stage} (code {code})")]
    Sequence { stage: &'static str, code: i32 },

    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FirmwareError {
    #[error("{0} image not found")]
    Missing(&'static str),

    #[error("{image} image of {len} bytes does not fit the {capacity} byte region")]
    TooLarge {
        image: &'static str,
        len: usize,
        capacity: usize,
    },

    #[error("reading {image} image failed: {reason}")]
    Io { image: &'static str, reason: String },
}

/// Power and reset sequencing of the co-processor.
pub trait Platform: Send + Sync {
    /// Powers the co-processor up from cold.
    fn power_on(&self) -> Result<(), PlatformError>;

    /// Holds the co-processor in reset and releases it again.
    fn reset_cycle(&self) -> Result<(), PlatformError>;

    /// Removes power.
    fn power_off(&self) -> Result<(), PlatformError>;

    /// Raw general purpose registers; the program counter is last.
    fn read_gpr(&self) -> [u32; GPR_COUNT] {
        [0; GPR_COUNT]
    }

    /// Power management registers worth keeping after a failed reset.
    fn diagnostic_registers(&self) -> Vec<(&'static str, u32)> {
        Vec::new()
    }
}

/// Source of the bootloader and firmware images.
pub trait FirmwareSource: Send + Sync {
    fn bootloader(&self) -> Result<Vec<u8>, FirmwareError>;
    fn os_image(&self) -> Result<Vec<u8>, FirmwareError>;
}
