/// Card identification: negotiates the card family and addressing mode

use log::{debug, info, warn};

use crate::error::Error;
use crate::status::{DriveStatus, Timer};
use super::backend::{ClockSpeed, InterfaceControl, SpiBackend};
use super::protocol::commands::{
    CardCommand, CardType, Command, R1, FILLER, HCS_ARG, IF_COND_ARG, INIT_TIMEOUT_MS,
    POWER_UP_CLOCKS, SECTOR_SIZE,
};
use super::protocol::registers::{Ocr, OCR_LEN};
use super::sd_disk::SdDisk;

/// Steps of the identification sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitState {
    /// CMD0, enter SPI mode and the idle state
    Reset,
    /// CMD8, probe for a v2 card
    InterfaceCheck,
    /// ACMD41 with HCS until the card leaves idle
    V2Negotiate,
    /// CMD58, read CCS from the OCR
    CapacityCheck,
    /// ACMD41 probe to tell SD v1 from MMC
    V1MmcNegotiate,
    /// Repeat the family's init command until the card leaves idle
    LeaveIdle { card_type: CardType, repeat: CardCommand },
    /// CMD16, force 512-byte blocks on byte-addressed cards
    BlockLengthSet(CardType),
    Done(CardType),
    Failed,
}

impl<B> SdDisk<'_, B>
where
    B: SpiBackend + InterfaceControl,
{
    /// Initialize the card and return the resulting drive status.
    ///
    /// Does nothing while the socket is empty. On failure the card type is
    /// cleared, the interface powered down and `NOT_INITIALIZED` stays set.
    pub fn initialize(&mut self) -> DriveStatus {
        let status = self.state.status();
        if status.contains(DriveStatus::NO_CARD) {
            return status;
        }

        let card_type = self.negotiate().unwrap_or_else(|e| {
            warn!("Card initialization aborted: {e}");
            CardType::empty()
        });
        self.card_type = card_type;

        if let Err(e) = self.deselect() {
            warn!("Deselect after initialization failed: {e}");
        }

        if card_type.is_known() {
            self.state.clear(DriveStatus::NOT_INITIALIZED);
            if let Err(e) = self.backend.set_clock(ClockSpeed::Fast) {
                warn!("Switching to fast clock failed: {e}");
            }
            info!("Card initialized: {card_type:?}");
        } else {
            self.state.set(DriveStatus::NOT_INITIALIZED);
            if let Err(e) = self.backend.set_power(false) {
                warn!("Powering down the card interface failed: {e}");
            }
            warn!("No usable card found");
        }

        self.state.status()
    }

    /// Power up and run the state machine to completion
    fn negotiate(&mut self) -> Result<CardType, Error> {
        self.backend.set_power(true)?;
        self.backend.set_clock(ClockSpeed::Slow)?;
        self.backend.set_chip_select(false)?;
        for _ in 0..POWER_UP_CLOCKS {
            self.backend.exchange(FILLER)?;
        }

        let mut state = InitState::Reset;
        loop {
            state = match state {
                InitState::Done(card_type) => return Ok(card_type),
                InitState::Failed => return Ok(CardType::empty()),
                current => {
                    let next = self.init_step(current)?;
                    debug!("Init {current:?} -> {next:?}");
                    next
                }
            };
        }
    }

    pub(crate) fn init_step(&mut self, state: InitState) -> Result<InitState, Error> {
        let next = match state {
            InitState::Reset => {
                if self.send_command(CardCommand::Plain(Command::GoIdleState), 0)? == R1::IN_IDLE {
                    self.state.arm(Timer::Transfer, INIT_TIMEOUT_MS);
                    InitState::InterfaceCheck
                } else {
                    InitState::Failed
                }
            }

            InitState::InterfaceCheck => {
                if self.send_command(CardCommand::Plain(Command::SendIfCond), IF_COND_ARG)? == R1::IN_IDLE {
                    let mut r7 = [0u8; OCR_LEN];
                    self.backend.receive_many(&mut r7)?;
                    if r7[2..] == [0x01, 0xAA] {
                        InitState::V2Negotiate
                    } else {
                        // Voltage range not supported
                        InitState::Failed
                    }
                } else {
                    InitState::V1MmcNegotiate
                }
            }

            InitState::V2Negotiate => {
                if self.poll_idle_exit(CardCommand::App(Command::SdSendOpCond), HCS_ARG)? {
                    InitState::CapacityCheck
                } else {
                    InitState::Failed
                }
            }

            InitState::CapacityCheck => {
                if !self.state.expired(Timer::Transfer)
                    && self.send_command(CardCommand::Plain(Command::ReadOcr), 0)? == R1::READY
                {
                    let mut ocr = Ocr([0u8; OCR_LEN]);
                    self.backend.receive_many(&mut ocr.0)?;
                    if ocr.is_block_addressed() {
                        InitState::Done(CardType::SD2 | CardType::BLOCK)
                    } else {
                        InitState::Done(CardType::SD2)
                    }
                } else {
                    InitState::Failed
                }
            }

            InitState::V1MmcNegotiate => {
                let acmd41 = CardCommand::App(Command::SdSendOpCond);
                if self.send_command(acmd41, 0)? <= R1::IN_IDLE {
                    InitState::LeaveIdle { card_type: CardType::SD1, repeat: acmd41 }
                } else {
                    InitState::LeaveIdle {
                        card_type: CardType::MMC,
                        repeat: CardCommand::Plain(Command::SendOpCond),
                    }
                }
            }

            InitState::LeaveIdle { card_type, repeat } => {
                if self.poll_idle_exit(repeat, 0)? {
                    InitState::BlockLengthSet(card_type)
                } else {
                    InitState::Failed
                }
            }

            InitState::BlockLengthSet(card_type) => {
                if !self.state.expired(Timer::Transfer)
                    && self.send_command(CardCommand::Plain(Command::SetBlockLen), SECTOR_SIZE as u32)? == R1::READY
                {
                    InitState::Done(card_type)
                } else {
                    InitState::Failed
                }
            }

            terminal @ (InitState::Done(_) | InitState::Failed) => terminal,
        };

        Ok(next)
    }

    /// Repeat `command` until it answers ready or the negotiation timer runs out
    fn poll_idle_exit(&mut self, command: CardCommand, argument: u32) -> Result<bool, Error> {
        while !self.state.expired(Timer::Transfer) {
            if self.send_command(command, argument)? == R1::READY {
                return Ok(true);
            }
        }

        warn!("{command:?} did not leave idle within {INIT_TIMEOUT_MS} ms");
        Ok(false)
    }
}
