#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod diskio;
pub mod error;
pub mod spi;
pub mod status;

pub use embedded_hal::spi as eh_spi;
pub use diskio::{current_timestamp, DResult, DiskIo, FatTimestamp};
pub use error::{DiskError, Error};
pub use spi::backend::eh1::{Eh1SpiBackend, SocketPins};
pub use spi::backend::{ClockSpeed, InterfaceControl, Socket, SpiBackend, StaticSocket};
pub use spi::protocol::commands::{CardType, SECTOR_SIZE};
pub use spi::sd_disk::{ControlCode, ControlData, SdDisk};
pub use status::{DriveState, DriveStatus, Timer};

#[cfg(feature = "ftdi")]
pub use spi::backend::ftdi::FtdiBackend;
#[cfg(feature = "ftdi")]
pub use libftd2xx::{Ft4232h, FtdiCommon};
