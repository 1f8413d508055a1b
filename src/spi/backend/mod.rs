/// Backend abstraction module - hardware-specific implementations
///
/// This module defines the byte transport and line-control traits the card
/// protocol is built on, and provides implementations for both FTDI and
/// embedded-hal.

use crate::error::Error;
use super::protocol::commands::FILLER;

#[cfg(feature = "ftdi")]
pub mod ftdi;

pub mod eh1;

#[cfg(test)]
pub(crate) mod mock;

/// SPI clock rate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSpeed {
    /// Identification mode, at most 400 kHz
    Slow,
    /// Data transfer mode
    Fast,
}

impl ClockSpeed {
    /// Target SCK frequency
    pub fn hz(self) -> u32 {
        match self {
            Self::Slow => 400_000,
            Self::Fast => 20_000_000,
        }
    }
}

/// Common SPI backend trait
///
/// This trait abstracts the full-duplex byte exchange the SD protocol needs.
/// It allows the same protocol logic to work with different hardware backends.
pub trait SpiBackend {
    /// Clock one byte out and return the byte clocked in at the same time
    fn exchange(&mut self, byte: u8) -> Result<u8, Error>;

    /// Send a run of bytes, discarding what comes back
    fn send_many(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &byte in bytes {
            self.exchange(byte)?;
        }
        Ok(())
    }

    /// Fill `buffer` with received bytes, clocking out `0xFF` filler
    fn receive_many(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for byte in buffer.iter_mut() {
            *byte = self.exchange(FILLER)?;
        }
        Ok(())
    }
}

/// Card interface lines (used by the select and initialization layers)
pub trait InterfaceControl {
    /// Set chip select state
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error>;

    /// Switch the card supply (or level shifter) on or off
    fn set_power(&mut self, on: bool) -> Result<(), Error>;

    /// Change the SPI clock rate
    fn set_clock(&mut self, speed: ClockSpeed) -> Result<(), Error>;
}

/// Socket sense lines, sampled by the periodic tick
pub trait Socket {
    /// A card sits in the socket
    fn card_present(&mut self) -> bool;

    /// The card's write-protect tab is set
    fn write_protected(&mut self) -> bool;
}

/// Socket without sense lines: reports a fixed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticSocket {
    present: bool,
    protected: bool,
}

impl StaticSocket {
    pub fn new(present: bool, protected: bool) -> Self {
        Self { present, protected }
    }

    /// Card always present and writable
    pub fn inserted() -> Self {
        Self::new(true, false)
    }
}

impl Socket for StaticSocket {
    fn card_present(&mut self) -> bool {
        self.present
    }

    fn write_protected(&mut self) -> bool {
        self.protected
    }
}
