/// Command, token and register definitions for the SD/MMC SPI protocol

/// Bytes in one sector / data block
pub const SECTOR_SIZE: usize = 512;

/// Filler clocked out whenever the host has nothing to send
pub const FILLER: u8 = 0xFF;

/// Dummy bytes (80 clocks) sent with chip-select deasserted at power-up
pub const POWER_UP_CLOCKS: usize = 10;

/// Response polls after a command frame before giving up
pub const RESPONSE_ATTEMPTS: usize = 10;

/// Ready wait after select / before a data block (ms)
pub const READY_TIMEOUT_MS: u32 = 500;

/// Wait for a data start token (ms)
pub const TOKEN_TIMEOUT_MS: u32 = 100;

/// Whole operating-condition negotiation (ms)
pub const INIT_TIMEOUT_MS: u32 = 1000;

/// Argument for CMD8: 2.7-3.6V supply plus the 0xAA check pattern
pub const IF_COND_ARG: u32 = 0x1AA;

/// ACMD41 argument with the host-capacity-support bit set
pub const HCS_ARG: u32 = 1 << 30;

/// SD/MMC command indices used in SPI mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// GO_IDLE_STATE, software reset
    GoIdleState = 0,
    /// SEND_OP_COND (MMC)
    SendOpCond = 1,
    /// SEND_IF_COND
    SendIfCond = 8,
    /// SEND_CSD
    SendCsd = 9,
    /// SEND_CID
    SendCid = 10,
    /// STOP_TRANSMISSION
    StopTransmission = 12,
    /// SD_STATUS (application command)
    SdStatus = 13,
    /// SET_BLOCKLEN
    SetBlockLen = 16,
    /// READ_SINGLE_BLOCK
    ReadSingleBlock = 17,
    /// READ_MULTIPLE_BLOCK
    ReadMultipleBlock = 18,
    /// SET_WR_BLK_ERASE_COUNT (application command)
    SetWrBlkEraseCount = 23,
    /// WRITE_BLOCK
    WriteBlock = 24,
    /// WRITE_MULTIPLE_BLOCK
    WriteMultipleBlock = 25,
    /// SD_SEND_OP_COND (application command)
    SdSendOpCond = 41,
    /// APP_CMD, prefix for application commands
    AppCmd = 55,
    /// READ_OCR
    ReadOcr = 58,
}

impl Command {
    /// Get the 6-bit command index
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Create from a raw 6-bit command index
    pub fn from_index(index: u8) -> Option<Self> {
        match index & 0x3F {
            0 => Some(Self::GoIdleState),
            1 => Some(Self::SendOpCond),
            8 => Some(Self::SendIfCond),
            9 => Some(Self::SendCsd),
            10 => Some(Self::SendCid),
            12 => Some(Self::StopTransmission),
            13 => Some(Self::SdStatus),
            16 => Some(Self::SetBlockLen),
            17 => Some(Self::ReadSingleBlock),
            18 => Some(Self::ReadMultipleBlock),
            23 => Some(Self::SetWrBlkEraseCount),
            24 => Some(Self::WriteBlock),
            25 => Some(Self::WriteMultipleBlock),
            41 => Some(Self::SdSendOpCond),
            55 => Some(Self::AppCmd),
            58 => Some(Self::ReadOcr),
            _ => None,
        }
    }
}

/// A command as issued by the driver: plain `CMDn`, or `ACMDn` which goes
/// out as `CMD55` followed by `CMDn`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardCommand {
    Plain(Command),
    App(Command),
}

impl CardCommand {
    /// The command that carries the argument
    pub fn command(self) -> Command {
        match self {
            Self::Plain(cmd) | Self::App(cmd) => cmd,
        }
    }

    pub fn is_app(self) -> bool {
        matches!(self, Self::App(_))
    }
}

/// Data tokens framing a block transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataToken {
    /// Start of a single block (read, or single-block write)
    StartBlock = 0xFE,
    /// Start of each block in a multi-block write
    MultiWrite = 0xFC,
    /// End of a multi-block write
    StopTran = 0xFD,
}

impl DataToken {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Mask for the data response byte returned after a written block
pub const DATA_RESPONSE_MASK: u8 = 0x1F;

/// Data response value for an accepted block
pub const DATA_ACCEPTED: u8 = 0x05;

/// R1 response bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct R1(u8);

bitflags::bitflags! {
    impl R1: u8 {
        const IDLE            = 1 << 0;
        const ERASE_RESET     = 1 << 1;
        const ILLEGAL_COMMAND = 1 << 2;
        const CRC_ERROR       = 1 << 3;
        const ERASE_SEQ_ERROR = 1 << 4;
        const ADDRESS_ERROR   = 1 << 5;
        const PARAMETER_ERROR = 1 << 6;
    }
}

impl R1 {
    /// Value returned while the card is in the idle state and nothing failed
    pub const IN_IDLE: u8 = 0x01;

    /// Value returned when the card is ready and nothing failed
    pub const READY: u8 = 0x00;
}

/// Card family and addressing mode, committed at the end of initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardType(u8);

bitflags::bitflags! {
    impl CardType: u8 {
        /// MMC version 3
        const MMC   = 0x01;
        /// SD version 1
        const SD1   = 0x02;
        /// SD version 2 or later
        const SD2   = 0x04;
        /// Any SD card
        const SDC   = Self::SD1.bits() | Self::SD2.bits();
        /// Sector addressing instead of byte addressing
        const BLOCK = 0x08;
    }
}

impl CardType {
    /// Check if a card has been identified
    pub fn is_known(&self) -> bool {
        self.intersects(Self::MMC | Self::SDC)
    }

    /// Convert a sector number to the address a read/write command expects
    pub fn address(&self, sector: u32) -> u32 {
        if self.contains(Self::BLOCK) {
            sector
        } else {
            sector.wrapping_mul(SECTOR_SIZE as u32)
        }
    }
}
