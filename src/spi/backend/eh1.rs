//! embedded-hal 1.0 SPI backend
//!
//! This backend drives an `embedded_hal::spi::SpiBus` with a separate
//! chip-select pin (the card protocol needs CS held across several bus
//! transactions, so `SpiDevice` does not fit), an optional active-low power
//! enable pin and a delay provider.

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
    spi::SpiBus,
};

use crate::error::Error;
use crate::spi::protocol::commands::FILLER;
use super::{ClockSpeed, InterfaceControl, Socket, SpiBackend};

/// Settling time after switching the card supply on
const POWER_UP_DELAY_MS: u32 = 10;

/// Bus-specific clock switch, supplied by the board
pub type ClockSwitch<SPI> = fn(&mut SPI, ClockSpeed) -> Result<(), Error>;

/// embedded-hal 1.0 SPI Backend
///
/// * `SPI`  – SPI bus (mode 0, MSB first)
/// * `CS`   – Chip select pin (active low)
/// * `EN`   – Optional power enable pin (active low)
/// * `D`    – Delay provider
pub struct Eh1SpiBackend<SPI, CS, EN, D> {
    spi: SPI,
    cs: CS,
    enable: Option<EN>,
    delay: D,
    clock: Option<ClockSwitch<SPI>>,
}

impl<SPI, CS, EN, D> Eh1SpiBackend<SPI, CS, EN, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    EN: OutputPin,
    D: DelayNs,
{
    /// Create a new eh1 SPI backend
    pub fn new(
        spi: SPI,
        cs: CS,
        enable: Option<EN>,
        delay: D,
    ) -> Self {
        Self {
            spi,
            cs,
            enable,
            delay,
            clock: None,
        }
    }

    /// Install a function that reprograms the bus clock
    pub fn with_clock_switch(mut self, clock: ClockSwitch<SPI>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Give the bus and pins back
    pub fn release(self) -> (SPI, CS, Option<EN>, D) {
        (self.spi, self.cs, self.enable, self.delay)
    }
}

impl<SPI, CS, EN, D> SpiBackend for Eh1SpiBackend<SPI, CS, EN, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    EN: OutputPin,
    D: DelayNs,
{
    fn exchange(&mut self, byte: u8) -> Result<u8, Error> {
        let mut word = [byte];
        self.spi
            .transfer_in_place(&mut word)
            .map_err(|_| Error::Spi)?;
        Ok(word[0])
    }

    fn send_many(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.spi
            .write(bytes)
            .map_err(|_| Error::Spi)
    }

    fn receive_many(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        buffer.fill(FILLER);
        self.spi
            .transfer_in_place(buffer)
            .map_err(|_| Error::Spi)
    }
}

impl<SPI, CS, EN, D> InterfaceControl for Eh1SpiBackend<SPI, CS, EN, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    EN: OutputPin,
    D: DelayNs,
{
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error> {
        // Pending writes must be on the wire before CS moves
        self.spi.flush().map_err(|_| Error::Spi)?;
        if asserted {
            self.cs.set_low().map_err(|_| Error::Gpio)
        } else {
            self.cs.set_high().map_err(|_| Error::Gpio)
        }
    }

    fn set_power(&mut self, on: bool) -> Result<(), Error> {
        if let Some(pin) = self.enable.as_mut() {
            if on {
                pin.set_low().map_err(|_| Error::Gpio)?;
                self.delay.delay_ms(POWER_UP_DELAY_MS);
            } else {
                pin.set_high().map_err(|_| Error::Gpio)?;
            }
        }
        Ok(())
    }

    fn set_clock(&mut self, speed: ClockSpeed) -> Result<(), Error> {
        match self.clock {
            Some(switch) => switch(&mut self.spi, speed),
            None => Ok(()),
        }
    }
}

/// Socket sense pins: card detect (low when a card is inserted) and write
/// protect (high when the tab is set)
pub struct SocketPins<CD, WP> {
    detect: CD,
    protect: Option<WP>,
}

impl<CD, WP> SocketPins<CD, WP>
where
    CD: InputPin,
    WP: InputPin,
{
    pub fn new(detect: CD, protect: Option<WP>) -> Self {
        Self { detect, protect }
    }
}

impl<CD, WP> Socket for SocketPins<CD, WP>
where
    CD: InputPin,
    WP: InputPin,
{
    fn card_present(&mut self) -> bool {
        // An unreadable detect line counts as an empty socket
        self.detect.is_low().unwrap_or(false)
    }

    fn write_protected(&mut self) -> bool {
        match self.protect.as_mut() {
            Some(pin) => pin.is_high().unwrap_or(true),
            None => false,
        }
    }
}
