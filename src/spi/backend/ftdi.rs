/// FTDI backend implementation using libftd2xx
///
/// This backend drives the card through the FT4232H MPSSE engine in SPI
/// mode 0. Block transfers go out as a single MPSSE command.

use std::time::Duration;
use libftd2xx::{ClockData, Ft4232h, FtdiCommon, FtdiMpsse, MpsseCmdBuilder, MpsseCmdExecutor};
use bitflags::bitflags;

use crate::error::Error;
use crate::spi::protocol::commands::FILLER;
use super::{ClockSpeed, InterfaceControl, SpiBackend};

/*
Pin assignments on FTDI FT4232H:
SPI_CLK:   AD0
SPI_MOSI:  AD1 (card DI)
SPI_MISO:  AD2 (card DO)
SPI_SS_N:  AD3
SPI_EN_N:  AD5 (card supply / level shifter)
*/

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SpiPin: u8 {
        const CLK =        1;          // Mask 0x01, AD0
        const MOSI =       1 << 1;     // Mask 0x02, AD1
        const MISO =       1 << 2;     // Mask 0x04, AD2
        const SS_N =       1 << 3;     // Mask 0x08, AD3
        const EN_N =       1 << 5;     // Mask 0x20, AD5
    }
}

/// FTDI SPI Backend
pub struct FtdiBackend {
    dev: Ft4232h,
}

impl FtdiBackend {
    /// Create a new FTDI backend with the specified device
    pub fn new(dev: Ft4232h) -> Self {
        Self { dev }
    }

    /// Open FTDI device by description
    pub fn open(description: &str) -> Result<Self, Error> {
        let dev = Ft4232h::with_description(description)?;
        Ok(Self::new(dev))
    }

    /// Put the device in MPSSE mode with the card deselected and unpowered
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.dev.set_bit_mode(0x0, libftd2xx::BitMode::Mpsse)?;
        self.dev.set_latency_timer(Duration::from_millis(2))?;

        // Idle state: SS_N=HIGH, EN_N=HIGH, MOSI=HIGH
        self.set_data_bits_absolute(SpiPin::SS_N | SpiPin::EN_N | SpiPin::MOSI)?;
        self.dev.set_clock(ClockSpeed::Slow.hz())?;
        Ok(())
    }

    /// Get pin direction configuration (which pins are outputs)
    fn pin_directions() -> SpiPin {
        SpiPin::CLK | SpiPin::MOSI | SpiPin::SS_N | SpiPin::EN_N
    }

    /// Read current GPIO state
    fn get_data_bits(&mut self) -> Result<SpiPin, Error> {
        let bits = self.dev.gpio_lower()?;
        Ok(SpiPin::from_bits_truncate(bits))
    }

    /// Set GPIO pins to specific absolute state
    fn set_data_bits_absolute(&mut self, state: SpiPin) -> Result<(), Error> {
        self.dev.set_gpio_lower(state.bits(), Self::pin_directions().bits())?;
        Ok(())
    }

    /// Helper to set/clear specific bits
    fn set_data_bits_single(current_bits: SpiPin, target_bits: SpiPin, high: bool) -> Result<SpiPin, Error> {
        if target_bits.bits().count_ones() != 1 {
            return Err(Error::InvalidPinMask);
        }

        let bits_set = if high {
            current_bits | target_bits
        } else {
            current_bits & !target_bits
        };

        Ok(bits_set)
    }

    /// Set a single pin high or low
    fn set_single_pin(&mut self, target_pin: SpiPin, high: bool) -> Result<(), Error> {
        let current = self.get_data_bits()?;
        let updated = Self::set_data_bits_single(current, target_pin, high)?;
        self.set_data_bits_absolute(updated)
    }

    /// Clock `buffer` out MSB first and replace it with what came back
    fn transfer(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let builder = MpsseCmdBuilder::new()
            .clock_data(ClockData::MsbPosIn, buffer)
            .send_immediate();

        self.dev.send(builder.as_slice())?;
        self.dev.recv(buffer)?;
        Ok(())
    }
}

impl InterfaceControl for FtdiBackend {
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error> {
        // SS_N is active low, so asserted=true means pin=low
        self.set_single_pin(SpiPin::SS_N, !asserted)
    }

    fn set_power(&mut self, on: bool) -> Result<(), Error> {
        // EN_N is active low, so on=true means pin=low
        self.set_single_pin(SpiPin::EN_N, !on)?;
        if on {
            // Supply ramp-up
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn set_clock(&mut self, speed: ClockSpeed) -> Result<(), Error> {
        self.dev.set_clock(speed.hz())?;
        Ok(())
    }
}

impl SpiBackend for FtdiBackend {
    fn exchange(&mut self, byte: u8) -> Result<u8, Error> {
        let mut buffer = [byte];
        self.transfer(&mut buffer)?;
        Ok(buffer[0])
    }

    fn send_many(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut buffer = bytes.to_vec();
        self.transfer(&mut buffer)
    }

    fn receive_many(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        buffer.fill(FILLER);
        self.transfer(buffer)
    }
}
