/// Command packet framing for the SD/MMC SPI protocol

use super::commands::Command;

/// Valid CRC7 + stop bit for `CMD0(0)`
pub const CRC_GO_IDLE: u8 = 0x95;

/// Valid CRC7 + stop bit for `CMD8(0x1AA)`
pub const CRC_IF_COND: u8 = 0x87;

/// Placeholder CRC + stop bit, accepted while CRC checking is off
pub const CRC_DUMMY: u8 = 0x01;

/// A single 6-byte command frame (hardware-independent representation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    command: Command,
    argument: u32,
}

impl CommandPacket {
    pub fn new(command: Command, argument: u32) -> Self {
        Self { command, argument }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn argument(&self) -> u32 {
        self.argument
    }

    /// CRC byte sent with this command. Only the two commands checked in
    /// every mode get a real CRC.
    pub fn crc(&self) -> u8 {
        match self.command {
            Command::GoIdleState => CRC_GO_IDLE,
            Command::SendIfCond => CRC_IF_COND,
            _ => CRC_DUMMY,
        }
    }

    /// Whether a stuff byte follows the frame before the response
    pub fn has_stuff_byte(&self) -> bool {
        self.command == Command::StopTransmission
    }

    /// Start bit + index, big-endian argument, CRC + stop bit
    pub fn frame(&self) -> [u8; 6] {
        let mut frame = [0u8; 6];
        frame[0] = 0x40 | self.command.index();
        frame[1..5].copy_from_slice(&self.argument.to_be_bytes());
        frame[5] = self.crc();
        frame
    }
}
