use thiserror::Error as DeriveError;
#[cfg(feature = "ftdi")]
use libftd2xx::{TimeoutError as FtdiTimeout, FtStatus, DeviceTypeError};

/// Bus and protocol failures raised below the public disk boundary
#[derive(DeriveError, Debug)]
pub enum Error {
    #[cfg(feature = "ftdi")]
    #[error("FTDI Timeout")]
    DeviceTimeout(#[from] FtdiTimeout),

    #[cfg(feature = "ftdi")]
    #[error("FTDI Status: {0}")]
    FtStatus(#[from] FtStatus),

    #[cfg(feature = "ftdi")]
    #[error("FTDI Device Type Error: {0}")]
    DeviceTypeError(#[from] DeviceTypeError),

    #[error("SPI bus transfer failed")]
    Spi,

    #[error("GPIO access failed")]
    Gpio,

    #[error("Invalid pin mask (must be single bit)")]
    InvalidPinMask,

    #[error("Card did not release the bus within the ready timeout")]
    BusyTimeout,

    #[error("Command {command} rejected with response {response:#04X}")]
    CommandRejected { command: u8, response: u8 },

    #[error("No data token before timeout")]
    DataTimeout,

    #[error("Unexpected data token {0:#04X}")]
    BadToken(u8),

    #[error("Data block rejected with response {0:#04X}")]
    DataRejected(u8),

    #[error("Operation not supported by this card type")]
    Unsupported,
}

/// Result of a public disk operation, as seen by a filesystem client
#[derive(DeriveError, Debug)]
pub enum DiskError {
    #[error("Invalid parameter")]
    Param,

    #[error("Drive not ready")]
    NotReady,

    #[error("Medium is write protected")]
    WriteProtected,

    #[error("Disk I/O error: {0}")]
    Io(#[from] Error),
}
