use crate::status::ChubStatus;
use chub_core::IpcError;
use chub_core::platform::{FirmwareError, PlatformError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChubError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error("context hub is {0}")]
    NotRunning(ChubStatus),
    #[error("cannot {op} while {status}")]
    InvalidState {
        op: &'static str,
        status: ChubStatus,
    },
    #[error("reset in progress")]
    ResetInProgress,
    #[error("{in_use} ipc operation(s) still in flight")]
    DrainTimeout { in_use: u32 },
    #[error("{region} readback differs at byte {offset:#x}")]
    FirmwareVerifyMismatch { region: &'static str, offset: usize },
    #[error("no alive answer after {attempts} ping(s)")]
    AliveHandshakeTimeout { attempts: u32 },
    #[error("wakeup not acknowledged within {0} ms")]
    WakeupTimeout(u32),
    #[error("no data within {0} ms")]
    ReadTimeout(u32),
    #[error("context hub is hung, forced reset required")]
    Hung,
}
