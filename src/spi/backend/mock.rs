//! Simulated SD/MMC card for driver tests.
//!
//! The card parses command frames as they are clocked in, queues its
//! answers on DO, and ticks the shared `DriveState` once per exchanged byte,
//! so one byte on the bus stands for one millisecond.

use std::collections::{BTreeMap, VecDeque};

use crate::error::Error;
use crate::spi::protocol::commands::{Command, DataToken, FILLER, R1, SECTOR_SIZE};
use crate::spi::protocol::registers::{CID_LEN, CSD_LEN, SD_STATUS_LEN};
use crate::status::DriveState;
use super::{ClockSpeed, InterfaceControl, SpiBackend, StaticSocket};

/// Card family to simulate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    Sd2 { block: bool },
    Sd1,
    Mmc,
    /// Never answers anything
    Unresponsive,
}

/// A command frame as the card saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub command: u8,
    pub argument: u32,
    /// Preceded by an accepted CMD55
    pub app: bool,
    frame: [u8; 6],
}

enum Mode {
    Command,
    /// READ_MULTIPLE_BLOCK in progress
    Streaming { sector: u32 },
    /// Waiting for write data blocks
    Receiving { multi: bool, block: Option<Vec<u8>> },
}

/// Default contents of an unwritten sector
pub fn sector_pattern(sector: u32) -> Vec<u8> {
    (0..SECTOR_SIZE)
        .map(|i| (sector as usize).wrapping_mul(7).wrapping_add(i) as u8)
        .collect()
}

pub struct MockCard<'s> {
    state: &'s DriveState,
    pub socket: StaticSocket,
    pub kind: CardKind,
    /// ACMD41 / CMD1 answers still reporting idle
    pub idle_polls: u32,
    /// Last two R7 bytes returned for CMD8
    pub if_cond_echo: [u8; 2],
    pub csd: [u8; CSD_LEN],
    pub cid: [u8; CID_LEN],
    pub sd_status: [u8; SD_STATUS_LEN],
    pub sectors: BTreeMap<u32, Vec<u8>>,
    /// Token in front of read data; `None` never sends one
    pub read_token: Option<u8>,
    /// Streamed block (0-based) that gets an error token instead of data
    pub bad_read_block: Option<usize>,
    /// Written block (0-based, per command) answered with a CRC error
    pub reject_write_block: Option<usize>,
    /// Hold DO low whenever selected
    pub busy: bool,
    /// Go busy for good once this many write blocks have been answered
    pub busy_after_blocks: Option<usize>,
    /// Command index answered with "illegal command"
    pub reject: Option<u8>,

    pub commands: Vec<Received>,
    pub blocks_received: usize,
    pub written_blocks: usize,
    pub stop_token_seen: bool,
    pub selected: bool,
    pub powered: bool,
    pub clock: ClockSpeed,
    pub exchanges: usize,
    /// Exchanges clocked with chip select released
    pub idle_exchanges: usize,
    /// Exchanges clocked while the supply is off
    pub unpowered_exchanges: usize,

    idle: bool,
    app_pending: bool,
    frame: Vec<u8>,
    outgoing: VecDeque<u8>,
    mode: Mode,
    streamed: usize,
    write_sector: u32,
    write_index: usize,
}

impl<'s> MockCard<'s> {
    pub fn new(state: &'s DriveState, kind: CardKind) -> Self {
        let mut sd_status = [0u8; SD_STATUS_LEN];
        for (i, byte) in sd_status.iter_mut().enumerate() {
            *byte = i as u8;
        }

        Self {
            state,
            socket: StaticSocket::inserted(),
            kind,
            idle_polls: 3,
            if_cond_echo: [0x01, 0xAA],
            csd: [
                0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00,
                0x3B, 0x37, 0x7F, 0x80, 0x0A, 0x40, 0x40, 0xAF,
            ],
            cid: [
                0x03, 0x53, 0x44, 0x53, 0x44, 0x30, 0x38, 0x47,
                0x80, 0x12, 0x34, 0x56, 0x78, 0x00, 0xC2, 0x01,
            ],
            sd_status,
            sectors: BTreeMap::new(),
            read_token: Some(DataToken::StartBlock.byte()),
            bad_read_block: None,
            reject_write_block: None,
            busy: false,
            busy_after_blocks: None,
            reject: None,
            commands: Vec::new(),
            blocks_received: 0,
            written_blocks: 0,
            stop_token_seen: false,
            selected: false,
            powered: false,
            clock: ClockSpeed::Slow,
            exchanges: 0,
            idle_exchanges: 0,
            unpowered_exchanges: 0,
            idle: true,
            app_pending: false,
            frame: Vec::new(),
            outgoing: VecDeque::new(),
            mode: Mode::Command,
            streamed: 0,
            write_sector: 0,
            write_index: 0,
        }
    }

    /// Raw frames of every command received
    pub fn frames(&self) -> Vec<[u8; 6]> {
        self.commands.iter().map(|c| c.frame).collect()
    }

    fn sector(&self, sector: u32) -> Vec<u8> {
        self.sectors
            .get(&sector)
            .cloned()
            .unwrap_or_else(|| sector_pattern(sector))
    }

    fn to_sector(&self, argument: u32) -> u32 {
        match self.kind {
            CardKind::Sd2 { block: true } => argument,
            _ => argument / SECTOR_SIZE as u32,
        }
    }

    fn r1(&self) -> u8 {
        if self.idle { 0x01 } else { 0x00 }
    }

    fn push_block(&mut self, data: &[u8]) {
        self.outgoing.push_back(FILLER);
        self.outgoing.push_back(DataToken::StartBlock.byte());
        self.outgoing.extend(data.iter().copied());
        self.outgoing.extend([0xA5, 0x5A]);
    }

    fn is_busy(&self) -> bool {
        // the pending data response still goes out first
        let programming = self
            .busy_after_blocks
            .is_some_and(|n| self.blocks_received >= n && self.outgoing.is_empty());
        self.busy || programming
    }

    fn leave_idle(&mut self) -> u8 {
        if self.idle_polls > 0 {
            self.idle_polls -= 1;
            0x01
        } else {
            self.idle = false;
            0x00
        }
    }

    fn handle_command(&mut self) {
        let frame: [u8; 6] = [
            self.frame[0], self.frame[1], self.frame[2],
            self.frame[3], self.frame[4], self.frame[5],
        ];
        self.frame.clear();

        let command = frame[0] & 0x3F;
        let argument = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = std::mem::take(&mut self.app_pending);
        self.commands.push(Received { command, argument, app, frame });

        if self.kind == CardKind::Unresponsive {
            return;
        }

        // NCR: one byte before the response
        self.outgoing.push_back(FILLER);

        if self.reject == Some(command) {
            self.outgoing.push_back(R1::ILLEGAL_COMMAND.bits() | self.r1());
            return;
        }

        match (Command::from_index(command), app) {
            (Some(Command::GoIdleState), _) => {
                self.idle = true;
                self.outgoing.push_back(0x01);
            }
            (Some(Command::SendIfCond), _) => match self.kind {
                CardKind::Sd2 { .. } => {
                    let echo = self.if_cond_echo;
                    self.outgoing.extend([self.r1(), 0x00, 0x00, echo[0], echo[1]]);
                }
                _ => self.outgoing.push_back(0x05),
            },
            (Some(Command::AppCmd), _) => {
                if self.kind == CardKind::Mmc {
                    self.outgoing.push_back(0x05);
                } else {
                    self.app_pending = true;
                    self.outgoing.push_back(self.r1());
                }
            }
            (Some(Command::SdSendOpCond), true) | (Some(Command::SendOpCond), false) => {
                let response = self.leave_idle();
                self.outgoing.push_back(response);
            }
            (Some(Command::ReadOcr), _) => {
                let ccs = if self.kind == (CardKind::Sd2 { block: true }) { 0xC0 } else { 0x80 };
                self.outgoing.extend([self.r1(), ccs, 0xFF, 0x80, 0x00]);
            }
            (Some(Command::SetBlockLen), _) | (Some(Command::SetWrBlkEraseCount), true) => {
                self.outgoing.push_back(self.r1())
            }
            (Some(Command::SendCsd), _) => {
                self.outgoing.push_back(0x00);
                let csd = self.csd;
                self.push_block(&csd);
            }
            (Some(Command::SendCid), _) => {
                self.outgoing.push_back(0x00);
                let cid = self.cid;
                self.push_block(&cid);
            }
            (Some(Command::SdStatus), true) => {
                self.outgoing.extend([0x00, 0x00]);
                let status = self.sd_status;
                self.push_block(&status);
            }
            (Some(Command::ReadSingleBlock), _) => {
                self.outgoing.push_back(0x00);
                let data = self.sector(self.to_sector(argument));
                if let Some(token) = self.read_token {
                    self.outgoing.push_back(FILLER);
                    self.outgoing.push_back(token);
                    self.outgoing.extend(data);
                    self.outgoing.extend([0xA5, 0x5A]);
                }
            }
            (Some(Command::ReadMultipleBlock), _) => {
                self.outgoing.push_back(0x00);
                self.streamed = 0;
                self.mode = Mode::Streaming { sector: self.to_sector(argument) };
            }
            (Some(cmd @ (Command::WriteBlock | Command::WriteMultipleBlock)), _) => {
                self.outgoing.push_back(0x00);
                self.write_sector = self.to_sector(argument);
                self.write_index = 0;
                self.mode = Mode::Receiving { multi: cmd == Command::WriteMultipleBlock, block: None };
            }
            (Some(Command::StopTransmission), _) => {
                self.mode = Mode::Command;
                self.outgoing.push_back(0x00);
            }
            _ => self.outgoing.push_back(R1::ILLEGAL_COMMAND.bits() | self.r1()),
        }
    }

    /// Feed one byte clocked in on DI
    fn absorb(&mut self, byte: u8) {
        match &mut self.mode {
            Mode::Command => {}
            Mode::Streaming { sector } => {
                if byte & 0xC0 != 0x40 {
                    if byte == FILLER && self.outgoing.is_empty() {
                        let current = *sector;
                        *sector += 1;
                        if self.bad_read_block == Some(self.streamed) {
                            self.outgoing.push_back(0x01);
                        } else {
                            let data = self.sector(current);
                            self.push_block(&data);
                        }
                        self.streamed += 1;
                    }
                    return;
                }
                // a command interrupts the stream
                self.mode = Mode::Command;
                self.outgoing.clear();
            }
            Mode::Receiving { multi, block } => {
                let multi = *multi;
                match block {
                    None => {
                        if byte == DataToken::StartBlock.byte() && !multi
                            || byte == DataToken::MultiWrite.byte() && multi
                        {
                            *block = Some(Vec::with_capacity(SECTOR_SIZE + 2));
                        } else if byte == DataToken::StopTran.byte() && multi {
                            self.stop_token_seen = true;
                            self.mode = Mode::Command;
                        }
                        return;
                    }
                    Some(data) => {
                        data.push(byte);
                        if data.len() < SECTOR_SIZE + 2 {
                            return;
                        }
                        data.truncate(SECTOR_SIZE);
                        let data = std::mem::take(data);
                        *block = None;
                        self.finish_write_block(data, multi);
                        return;
                    }
                }
            }
        }

        if self.frame.is_empty() && byte & 0xC0 != 0x40 {
            return;
        }
        self.frame.push(byte);
        if self.frame.len() == 6 {
            self.handle_command();
        }
    }

    fn finish_write_block(&mut self, data: Vec<u8>, multi: bool) {
        self.blocks_received += 1;
        if self.reject_write_block == Some(self.write_index) {
            // CRC error data response
            self.outgoing.push_back(0x0B);
        } else {
            self.sectors.insert(self.write_sector, data);
            self.written_blocks += 1;
            self.outgoing.push_back(0xE5);
        }
        self.write_sector += 1;
        self.write_index += 1;
        if !multi {
            self.mode = Mode::Command;
        }
    }
}

impl SpiBackend for MockCard<'_> {
    fn exchange(&mut self, byte: u8) -> Result<u8, Error> {
        self.exchanges += 1;
        if !self.powered {
            self.unpowered_exchanges += 1;
        }
        self.state.tick(&mut self.socket);

        if !self.selected {
            self.idle_exchanges += 1;
            return Ok(FILLER);
        }
        if self.is_busy() {
            return Ok(0x00);
        }

        let out = self.outgoing.pop_front().unwrap_or(FILLER);
        self.absorb(byte);
        Ok(out)
    }
}

impl InterfaceControl for MockCard<'_> {
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error> {
        self.selected = asserted;
        if !asserted {
            self.outgoing.clear();
            self.frame.clear();
            self.mode = Mode::Command;
        }
        Ok(())
    }

    fn set_power(&mut self, on: bool) -> Result<(), Error> {
        self.powered = on;
        Ok(())
    }

    fn set_clock(&mut self, speed: ClockSpeed) -> Result<(), Error> {
        self.clock = speed;
        Ok(())
    }
}
