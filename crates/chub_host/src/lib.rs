//! Host side of the context hub link.
//!
//! The [`controller::Controller`] owns everything the host knows about one
//! co-processor: the resolved memory map, the host view of the IPC rings,
//! the lifecycle state machine and the recovery machinery. Interrupt
//! delivery, the deferred fault worker and the periodic log flusher are
//! driven from outside through [`controller::Controller::handle_interrupt`]
//! and the threads in [`worker`].

/// Tunables for timeouts, retry counts and recovery policy.
///
/// Defaults come from `chub_common::timing` and match what the firmware
/// expects; tests shrink or stretch them as needed.
pub mod config;

/// The controller: data path, interrupt dispatch and debug surface.
///
/// All public operations take `&self` so one controller can be shared
/// between request threads, the interrupt pump and the workers.
pub mod controller;

/// Post-mortem records taken before a reset destroys device state.
pub mod diag;

/// Error type returned by every controller operation.
pub mod error;

/// Fault classification and escalation.
///
/// Critical faults escalate at once. Recoverable ones are counted per kind
/// inside a sliding window and escalate when the count passes the
/// threshold, after which the count starts over.
pub mod fault;

/// Power, reset and recovery sequencing.
mod lifecycle;

/// Host copy of the firmware log.
pub mod log_sink;

/// Lifecycle states of the co-processor.
pub mod status;

/// Reference counted "keep the device awake" votes.
///
/// The first normal holder asks the device to stay awake and waits for the
/// acknowledgment. The last one lets it idle again. A priority holder, used
/// by recovery, suppresses both signals while it is held.
pub mod wakeup;

/// Background threads and the wall clock used outside of tests.
pub mod worker;

pub use config::{ChubConfig, ResetPolicy};
pub use controller::Controller;
pub use error::ChubError;
pub use status::ChubStatus;
