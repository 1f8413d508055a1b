/// High-level SD/MMC disk
///
/// This module provides the sector-granular API a filesystem sits on,
/// using the backend abstraction to work with any SPI implementation.

use log::{debug, warn};

use crate::error::{DiskError, Error};
use crate::status::{DriveState, DriveStatus};
use super::backend::{InterfaceControl, SpiBackend};
use super::protocol::commands::{CardCommand, CardType, Command, FILLER, SECTOR_SIZE};
use super::protocol::registers::{
    sd_status_erase_block_size, Csd, Ocr, CID_LEN, CSD_LEN, OCR_LEN, SD_STATUS_LEN,
    SD_STATUS_PARTIAL_LEN,
};

/// Control and query requests (FatFs `ioctl` codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    /// Wait for the card to finish internal work
    Sync = 0,
    /// Capacity in sectors
    GetSectorCount = 1,
    /// Sector size in bytes
    GetSectorSize = 2,
    /// Erase block size in sectors
    GetBlockSize = 3,
    /// Power the interface down
    PowerOff = 5,
    GetCardType = 10,
    GetCsd = 11,
    GetCid = 12,
    GetOcr = 13,
    /// 64-byte SD status (SD v2 only)
    GetExtendedStatus = 14,
}

impl TryFrom<u8> for ControlCode {
    type Error = DiskError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Sync),
            1 => Ok(Self::GetSectorCount),
            2 => Ok(Self::GetSectorSize),
            3 => Ok(Self::GetBlockSize),
            5 => Ok(Self::PowerOff),
            10 => Ok(Self::GetCardType),
            11 => Ok(Self::GetCsd),
            12 => Ok(Self::GetCid),
            13 => Ok(Self::GetOcr),
            14 => Ok(Self::GetExtendedStatus),
            _ => Err(DiskError::Param),
        }
    }
}

/// Answer to a [`ControlCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlData {
    Done,
    SectorCount(u32),
    SectorSize(u16),
    BlockSize(u32),
    CardType(CardType),
    Csd(Csd),
    Cid([u8; CID_LEN]),
    Ocr(Ocr),
    SdStatus([u8; SD_STATUS_LEN]),
}

/// SD/MMC card on an SPI bus - works with any backend
pub struct SdDisk<'s, B> {
    pub(crate) backend: B,
    pub(crate) state: &'s DriveState,
    pub(crate) card_type: CardType,
}

impl<'s, B> SdDisk<'s, B>
where
    B: SpiBackend + InterfaceControl,
{
    /// Create a disk on `backend`. `state` must be ticked every millisecond
    /// for the protocol timeouts to run.
    pub fn new(backend: B, state: &'s DriveState) -> Self {
        Self {
            backend,
            state,
            card_type: CardType::empty(),
        }
    }

    pub fn status(&self) -> DriveStatus {
        self.state.status()
    }

    /// Card type found by the last [`initialize`](Self::initialize)
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Give the backend back
    pub fn release(self) -> B {
        self.backend
    }

    /// Read `buffer.len() / 512` sectors starting at `sector`
    pub fn read(&mut self, sector: u32, buffer: &mut [u8]) -> Result<(), DiskError> {
        let count = block_count(buffer.len())?;
        self.check_ready()?;

        let address = self.card_type.address(sector);
        let result = self.read_blocks(address, count, buffer);
        self.finish(result)
    }

    /// Write `buffer.len() / 512` sectors starting at `sector`
    pub fn write(&mut self, sector: u32, buffer: &[u8]) -> Result<(), DiskError> {
        let count = block_count(buffer.len())?;
        self.check_ready()?;
        if self.state.status().contains(DriveStatus::WRITE_PROTECTED) {
            return Err(DiskError::WriteProtected);
        }

        let address = self.card_type.address(sector);
        let result = self.write_blocks(address, count, buffer);
        self.finish(result)
    }

    /// Run a control or query request
    pub fn control(&mut self, code: ControlCode) -> Result<ControlData, DiskError> {
        self.check_ready()?;

        let result = match code {
            ControlCode::Sync => self.select().map(|_| ControlData::Done),
            ControlCode::GetSectorCount => self
                .read_csd()
                .map(|csd| ControlData::SectorCount(csd.sector_count())),
            ControlCode::GetSectorSize => Ok(ControlData::SectorSize(SECTOR_SIZE as u16)),
            ControlCode::GetBlockSize => self.erase_block_size().map(ControlData::BlockSize),
            // The bus is unpowered afterwards, so no trailing deselect
            ControlCode::PowerOff => return self.power_off(),
            ControlCode::GetCardType => Ok(ControlData::CardType(self.card_type)),
            ControlCode::GetCsd => self.read_csd().map(ControlData::Csd),
            ControlCode::GetCid => self.read_cid().map(ControlData::Cid),
            ControlCode::GetOcr => self.read_ocr().map(ControlData::Ocr),
            ControlCode::GetExtendedStatus => self.read_sd_status().map(ControlData::SdStatus),
        };

        debug!("{code:?} -> {result:?}");
        self.finish(result)
    }

    /// Release the card, then cut its supply
    fn power_off(&mut self) -> Result<ControlData, DiskError> {
        self.state.set(DriveStatus::NOT_INITIALIZED);
        self.deselect()?;
        self.backend.set_power(false)?;
        debug!("Card powered off");
        Ok(ControlData::Done)
    }

    fn check_ready(&self) -> Result<(), DiskError> {
        if self.state.status().contains(DriveStatus::NOT_INITIALIZED) {
            return Err(DiskError::NotReady);
        }
        Ok(())
    }

    /// Deselect on every exit path, keeping the operation's own error
    fn finish<T>(&mut self, result: Result<T, Error>) -> Result<T, DiskError> {
        if let Err(e) = self.deselect() {
            warn!("Deselect failed: {e}");
        }
        result.map_err(DiskError::from)
    }

    fn read_blocks(&mut self, address: u32, count: usize, buffer: &mut [u8]) -> Result<(), Error> {
        if count == 1 {
            self.expect_ready(CardCommand::Plain(Command::ReadSingleBlock), address)?;
            return self.receive_block(buffer);
        }

        self.expect_ready(CardCommand::Plain(Command::ReadMultipleBlock), address)?;
        let mut outcome = Ok(());
        for block in buffer.chunks_exact_mut(SECTOR_SIZE) {
            if let Err(e) = self.receive_block(block) {
                outcome = Err(e);
                break;
            }
        }

        let stop = self.send_command(CardCommand::Plain(Command::StopTransmission), 0);
        outcome?;
        stop.map(|_| ())
    }

    fn write_blocks(&mut self, address: u32, count: usize, buffer: &[u8]) -> Result<(), Error> {
        if count == 1 {
            self.expect_ready(CardCommand::Plain(Command::WriteBlock), address)?;
            return self.send_block(buffer, false);
        }

        if self.card_type.intersects(CardType::SDC) {
            // Pre-erase hint; the answer does not matter
            self.send_command(CardCommand::App(Command::SetWrBlkEraseCount), count as u32)?;
        }

        self.expect_ready(CardCommand::Plain(Command::WriteMultipleBlock), address)?;
        let mut outcome = Ok(());
        for block in buffer.chunks_exact(SECTOR_SIZE) {
            if let Err(e) = self.send_block(block, true) {
                outcome = Err(e);
                break;
            }
        }

        let stop = self.send_stop_token();
        outcome?;
        stop
    }

    fn read_csd(&mut self) -> Result<Csd, Error> {
        let mut csd = Csd([0u8; CSD_LEN]);
        self.expect_ready(CardCommand::Plain(Command::SendCsd), 0)?;
        self.receive_block(&mut csd.0)?;
        Ok(csd)
    }

    fn read_cid(&mut self) -> Result<[u8; CID_LEN], Error> {
        let mut cid = [0u8; CID_LEN];
        self.expect_ready(CardCommand::Plain(Command::SendCid), 0)?;
        self.receive_block(&mut cid)?;
        Ok(cid)
    }

    fn read_ocr(&mut self) -> Result<Ocr, Error> {
        let mut ocr = Ocr([0u8; OCR_LEN]);
        self.expect_ready(CardCommand::Plain(Command::ReadOcr), 0)?;
        self.backend.receive_many(&mut ocr.0)?;
        Ok(ocr)
    }

    fn read_sd_status(&mut self) -> Result<[u8; SD_STATUS_LEN], Error> {
        if !self.card_type.contains(CardType::SD2) {
            return Err(Error::Unsupported);
        }

        let mut status = [0u8; SD_STATUS_LEN];
        self.expect_ready(CardCommand::App(Command::SdStatus), 0)?;
        // Second byte of the R2 response
        self.backend.exchange(FILLER)?;
        self.receive_block(&mut status)?;
        Ok(status)
    }

    fn erase_block_size(&mut self) -> Result<u32, Error> {
        if !self.card_type.contains(CardType::SD2) {
            let csd = self.read_csd()?;
            return Ok(csd.erase_block_size(self.card_type));
        }

        self.expect_ready(CardCommand::App(Command::SdStatus), 0)?;
        self.backend.exchange(FILLER)?;

        let mut partial = [0u8; SD_STATUS_PARTIAL_LEN];
        self.receive_block(&mut partial)?;

        // Purge the rest of the status block
        let mut rest = [0u8; SD_STATUS_LEN - SD_STATUS_PARTIAL_LEN];
        self.backend.receive_many(&mut rest)?;

        Ok(sd_status_erase_block_size(&partial))
    }
}

/// Sectors covered by a buffer; it must hold at least one whole sector and
/// nothing else
fn block_count(len: usize) -> Result<usize, DiskError> {
    if len == 0 || len % SECTOR_SIZE != 0 {
        return Err(DiskError::Param);
    }
    Ok(len / SECTOR_SIZE)
}
