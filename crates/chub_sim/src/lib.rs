//! Simulated context hub for host-side testing.
//!
//! Provides a software model of the co-processor that speaks the real IPC
//! protocol over an in-process shared window and a loopback mailbox. The
//! model answers alive pings, acknowledges wake requests, echoes data,
//! honours shutdown, and writes boot messages into the log ring. Time is
//! virtual: the device only runs when the host waits on the [`clock::SimClock`].

/// Virtual clock that runs registered hooks whenever someone waits.
///
/// Drives the device model and host interrupt dispatch from inside the
/// host's bounded polls, which makes every test deterministic.
pub mod clock;

/// The device model.
///
/// Consumes host events, reacts to them, and produces events and data of
/// its own. Behaviour switches let tests simulate a hung or unresponsive
/// co-processor.
pub mod device;

/// Board assembly: window layout, firmware images, power sequencing.
///
/// Wires a window, a loopback mailbox, the device and the clock together,
/// and implements the platform and firmware collaborator traits over them.
pub mod board;

pub use board::{SimBoard, SimFirmware, SimPlatform};
pub use clock::SimClock;
pub use device::{DeviceBehaviour, SimDevice};
