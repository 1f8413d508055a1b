/// Protocol module - hardware-independent SD/MMC SPI protocol implementation
///
/// This module defines the protocol structures and register parsing without
/// depending on any specific hardware backend (FTDI, embedded-hal, etc.)

pub mod commands;
pub mod registers;
pub mod transaction;
