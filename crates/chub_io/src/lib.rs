//! I/O utilities for the context hub tools.
//!
//! Provides loading of bootloader and firmware images from disk and text
//! parsers for the debug command surface and for hex payloads typed on the
//! command line.

/// Firmware image loading from files.
///
/// Reads bootloader and firmware images, checks them against the region
/// they will be copied into, and exposes them through the
/// [`chub_core::platform::FirmwareSource`] interface.
pub mod loader;

/// Parsers for debug commands and hex payloads.
///
/// Accepts the forms written to the debug command surface: a command name
/// or its numeric code, optionally followed by a newline.
pub mod parser;
