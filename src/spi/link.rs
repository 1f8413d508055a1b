/// Card link: chip-select handling, command framing and data blocks
///
/// Every wait here is a busy-poll against one of the shared millisecond
/// timers, so these calls only terminate while the periodic tick runs.

use log::{trace, warn};

use crate::error::Error;
use crate::status::Timer;
use super::backend::{InterfaceControl, SpiBackend};
use super::protocol::commands::{
    CardCommand, Command, DataToken, R1, DATA_ACCEPTED, DATA_RESPONSE_MASK, FILLER,
    READY_TIMEOUT_MS, RESPONSE_ATTEMPTS, TOKEN_TIMEOUT_MS,
};
use super::protocol::transaction::CommandPacket;
use super::sd_disk::SdDisk;

/// Response byte reported when the card never answered
pub(crate) const NO_RESPONSE: u8 = 0xFF;

impl<B> SdDisk<'_, B>
where
    B: SpiBackend + InterfaceControl,
{
    /// Release chip select and clock one byte so the card lets go of DO
    pub(crate) fn deselect(&mut self) -> Result<(), Error> {
        self.backend.set_chip_select(false)?;
        self.backend.exchange(FILLER)?;
        Ok(())
    }

    /// Assert chip select and wait for the card to be ready.
    ///
    /// On timeout the card is deselected again and `BusyTimeout` returned.
    pub(crate) fn select(&mut self) -> Result<(), Error> {
        self.backend.set_chip_select(true)?;
        self.backend.exchange(FILLER)?;

        if self.wait_ready()? {
            return Ok(());
        }

        self.deselect()?;
        Err(Error::BusyTimeout)
    }

    /// Poll until the card stops holding DO low, for up to 500 ms
    pub(crate) fn wait_ready(&mut self) -> Result<bool, Error> {
        self.state.arm(Timer::Ready, READY_TIMEOUT_MS);
        loop {
            let byte = self.backend.exchange(FILLER)?;
            if byte == FILLER {
                return Ok(true);
            }
            if self.state.expired(Timer::Ready) {
                warn!("Card busy after {READY_TIMEOUT_MS} ms, last byte {byte:#04X}");
                return Ok(false);
            }
        }
    }

    /// Send a command and return its R1 response byte.
    ///
    /// Application commands go out as `CMD55` first; a `CMD55` response
    /// above "idle" is returned as-is and the command itself is not sent.
    pub(crate) fn send_command(&mut self, command: CardCommand, argument: u32) -> Result<u8, Error> {
        if command.is_app() {
            let response = self.transmit(CommandPacket::new(Command::AppCmd, 0))?;
            if response > R1::IN_IDLE {
                return Ok(response);
            }
        }

        self.transmit(CommandPacket::new(command.command(), argument))
    }

    /// Send a command and require an R1 of zero
    pub(crate) fn expect_ready(&mut self, command: CardCommand, argument: u32) -> Result<(), Error> {
        let response = self.send_command(command, argument)?;
        if response == R1::READY {
            return Ok(());
        }

        warn!(
            "{:?} rejected: {:#04X} ({:?})",
            command,
            response,
            R1::from_bits_truncate(response)
        );
        Err(Error::CommandRejected {
            command: command.command().index(),
            response,
        })
    }

    fn transmit(&mut self, packet: CommandPacket) -> Result<u8, Error> {
        // STOP_TRANSMISSION goes out in the middle of a read, keep CS as is
        if packet.command() != Command::StopTransmission {
            self.deselect()?;
            match self.select() {
                Ok(()) => {}
                Err(Error::BusyTimeout) => return Ok(NO_RESPONSE),
                Err(e) => return Err(e),
            }
        }

        self.backend.send_many(&packet.frame())?;
        if packet.has_stuff_byte() {
            self.backend.exchange(FILLER)?;
        }

        let mut response = NO_RESPONSE;
        for _ in 0..RESPONSE_ATTEMPTS {
            response = self.backend.exchange(FILLER)?;
            if response & 0x80 == 0 {
                break;
            }
        }

        trace!(
            "CMD{}({:#010X}) -> {:#04X}",
            packet.command().index(),
            packet.argument(),
            response
        );
        Ok(response)
    }

    /// Receive one data block into `buffer`, waiting up to 100 ms for the
    /// start token. The two CRC bytes are read and dropped.
    pub(crate) fn receive_block(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.state.arm(Timer::Transfer, TOKEN_TIMEOUT_MS);
        let token = loop {
            let byte = self.backend.exchange(FILLER)?;
            if byte != FILLER || self.state.expired(Timer::Transfer) {
                break byte;
            }
        };

        if token == FILLER {
            warn!("No data token within {TOKEN_TIMEOUT_MS} ms");
            return Err(Error::DataTimeout);
        }
        if token != DataToken::StartBlock.byte() {
            warn!("Bad data token {token:#04X}");
            return Err(Error::BadToken(token));
        }

        self.backend.receive_many(buffer)?;
        let mut crc = [0u8; 2];
        self.backend.receive_many(&mut crc)?;
        Ok(())
    }

    /// Send one 512-byte block, framed for a single-block write or as part of
    /// a multi-block write
    pub(crate) fn send_block(&mut self, block: &[u8], multi: bool) -> Result<(), Error> {
        let token = if multi { DataToken::MultiWrite } else { DataToken::StartBlock };
        self.send_token(token)?;

        self.backend.send_many(block)?;
        self.backend.send_many(&[FILLER, FILLER])?;

        let response = self.backend.exchange(FILLER)?;
        if response & DATA_RESPONSE_MASK != DATA_ACCEPTED {
            warn!("Data block rejected: {response:#04X}");
            return Err(Error::DataRejected(response));
        }

        Ok(())
    }

    /// End a multi-block write
    pub(crate) fn send_stop_token(&mut self) -> Result<(), Error> {
        self.send_token(DataToken::StopTran)
    }

    fn send_token(&mut self, token: DataToken) -> Result<(), Error> {
        if !self.wait_ready()? {
            return Err(Error::BusyTimeout);
        }
        self.backend.exchange(token.byte())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::backend::mock::{CardKind, MockCard};
    use crate::spi::protocol::commands::SECTOR_SIZE;
    use crate::status::DriveState;

    fn disk(state: &DriveState, kind: CardKind) -> SdDisk<'_, MockCard<'_>> {
        SdDisk::new(MockCard::new(state, kind), state)
    }

    #[test]
    fn test_command_frame_on_wire() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Sd2 { block: true });
        assert_eq!(disk.send_command(CardCommand::Plain(Command::GoIdleState), 0).unwrap(), 0x01);

        let card = disk.backend();
        assert_eq!(card.frames(), [[0x40, 0x00, 0x00, 0x00, 0x00, 0x95]]);
        assert!(card.selected);
    }

    #[test]
    fn test_app_command_prefix() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Sd2 { block: true });
        disk.send_command(CardCommand::Plain(Command::GoIdleState), 0).unwrap();
        disk.send_command(CardCommand::App(Command::SdSendOpCond), 0x4000_0000).unwrap();

        let log = &disk.backend().commands;
        assert_eq!(log[1].command, 55);
        assert_eq!(log[2].command, 41);
        assert!(log[2].app);
        assert_eq!(log[2].argument, 0x4000_0000);
    }

    #[test]
    fn test_app_command_stops_on_prefix_error() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Mmc);
        let response = disk
            .send_command(CardCommand::App(Command::SdSendOpCond), 0)
            .unwrap();
        assert_eq!(response, 0x05);

        let log = &disk.backend().commands;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].command, 55);
    }

    #[test]
    fn test_no_response_after_ten_polls() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Unresponsive);
        let response = disk.send_command(CardCommand::Plain(Command::GoIdleState), 0).unwrap();
        assert_eq!(response, NO_RESPONSE);
    }

    #[test]
    fn test_select_times_out_on_busy_card() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Sd2 { block: true });
        disk.backend_mut().busy = true;

        assert!(matches!(disk.select(), Err(Error::BusyTimeout)));
        assert!(!disk.backend().selected);
        assert!(state.expired(Timer::Ready));
    }

    #[test]
    fn test_busy_card_gives_no_response() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Sd2 { block: true });
        disk.backend_mut().busy = true;

        let response = disk.send_command(CardCommand::Plain(Command::GoIdleState), 0).unwrap();
        assert_eq!(response, NO_RESPONSE);
        assert!(disk.backend().commands.is_empty());
    }

    #[test]
    fn test_receive_block_times_out() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Sd2 { block: true });
        disk.select().unwrap();

        let mut buf = [0u8; SECTOR_SIZE];
        assert!(matches!(disk.receive_block(&mut buf), Err(Error::DataTimeout)));
        assert!(state.expired(Timer::Transfer));
    }

    #[test]
    fn test_stop_token_sends_no_payload() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Sd2 { block: true });
        disk.select().unwrap();
        let before = disk.backend().exchanges;

        disk.send_stop_token().unwrap();

        // one ready poll, one token
        assert_eq!(disk.backend().exchanges - before, 2);
    }

    #[test]
    fn test_data_tokens_always_carry_a_block() {
        let state = DriveState::new();
        let mut disk = disk(&state, CardKind::Sd2 { block: true });
        disk.expect_ready(CardCommand::Plain(Command::WriteMultipleBlock), 3).unwrap();

        let before = disk.backend().exchanges;
        disk.send_block(&[0x3C; SECTOR_SIZE], true).unwrap();
        // ready poll, token, payload, CRC, data response
        assert_eq!(disk.backend().exchanges - before, 1 + 1 + SECTOR_SIZE + 2 + 1);

        disk.send_stop_token().unwrap();
        let card = disk.backend();
        assert_eq!(card.written_blocks, 1);
        assert_eq!(card.sectors.get(&3).map(|s| s[0]), Some(0x3C));
        assert!(card.stop_token_seen);
    }
}
