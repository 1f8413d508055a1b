//! FatFs-shaped entry points.
//!
//! A FAT filesystem calls its disk layer with a physical drive number, raw
//! control codes and untyped buffers. [`DiskIo`] adapts an [`SdDisk`] to
//! that surface: only drive 0 exists, results are plain [`DResult`] codes
//! and query answers are written little-endian into the caller's buffer.

use log::debug;

use crate::error::DiskError;
use crate::spi::backend::{InterfaceControl, SpiBackend};
use crate::spi::protocol::commands::SECTOR_SIZE;
use crate::spi::protocol::registers::{CID_LEN, CSD_LEN, OCR_LEN, SD_STATUS_LEN};
use crate::spi::sd_disk::{ControlCode, ControlData, SdDisk};
use crate::status::DriveStatus;

/// Result code of a disk function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DResult {
    Ok = 0,
    /// R/W or protocol error
    Error = 1,
    WriteProtected = 2,
    NotReady = 3,
    ParamError = 4,
}

impl From<Result<(), DiskError>> for DResult {
    fn from(result: Result<(), DiskError>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(DiskError::Param) => Self::ParamError,
            Err(DiskError::NotReady) => Self::NotReady,
            Err(DiskError::WriteProtected) => Self::WriteProtected,
            Err(DiskError::Io(e)) => {
                debug!("Disk I/O failed: {e}");
                Self::Error
            }
        }
    }
}

/// Disk functions as a FAT filesystem calls them
pub trait DiskIo {
    fn disk_status(&self, pdrv: u8) -> DriveStatus;

    fn disk_initialize(&mut self, pdrv: u8) -> DriveStatus;

    /// Read `count` sectors into the front of `buffer`
    fn disk_read(&mut self, pdrv: u8, buffer: &mut [u8], sector: u32, count: usize) -> DResult;

    /// Write `count` sectors from the front of `buffer`
    fn disk_write(&mut self, pdrv: u8, buffer: &[u8], sector: u32, count: usize) -> DResult;

    /// Run control code `code`, storing any answer in `buffer`
    fn disk_ioctl(&mut self, pdrv: u8, code: u8, buffer: &mut [u8]) -> DResult;
}

/// Byte range of a `count`-sector transfer, checked against the buffer
fn transfer_len(buffer_len: usize, count: usize) -> Result<usize, DiskError> {
    let len = count.checked_mul(SECTOR_SIZE).ok_or(DiskError::Param)?;
    if count == 0 || len > buffer_len {
        return Err(DiskError::Param);
    }
    Ok(len)
}

/// Bytes `encode` writes for the answer to `code`
fn answer_len(code: ControlCode) -> usize {
    match code {
        ControlCode::Sync | ControlCode::PowerOff => 0,
        ControlCode::GetSectorCount | ControlCode::GetBlockSize => 4,
        ControlCode::GetSectorSize => 2,
        ControlCode::GetCardType => 1,
        ControlCode::GetCsd => CSD_LEN,
        ControlCode::GetCid => CID_LEN,
        ControlCode::GetOcr => OCR_LEN,
        ControlCode::GetExtendedStatus => SD_STATUS_LEN,
    }
}

/// Copy a query answer into the caller's buffer
fn encode(data: ControlData, buffer: &mut [u8]) -> Result<(), DiskError> {
    let mut scalar = [0u8; 4];
    let bytes: &[u8] = match &data {
        ControlData::Done => &[],
        ControlData::SectorCount(n) | ControlData::BlockSize(n) => {
            scalar = n.to_le_bytes();
            &scalar
        }
        ControlData::SectorSize(n) => {
            scalar[..2].copy_from_slice(&n.to_le_bytes());
            &scalar[..2]
        }
        ControlData::CardType(t) => {
            scalar[0] = t.bits();
            &scalar[..1]
        }
        ControlData::Csd(csd) => &csd.0,
        ControlData::Cid(cid) => cid,
        ControlData::Ocr(ocr) => &ocr.0,
        ControlData::SdStatus(status) => status,
    };

    buffer
        .get_mut(..bytes.len())
        .ok_or(DiskError::Param)?
        .copy_from_slice(bytes);
    Ok(())
}

impl<B> DiskIo for SdDisk<'_, B>
where
    B: SpiBackend + InterfaceControl,
{
    fn disk_status(&self, pdrv: u8) -> DriveStatus {
        if pdrv != 0 {
            return DriveStatus::NOT_INITIALIZED;
        }
        self.status()
    }

    fn disk_initialize(&mut self, pdrv: u8) -> DriveStatus {
        if pdrv != 0 {
            return DriveStatus::NOT_INITIALIZED;
        }
        self.initialize()
    }

    fn disk_read(&mut self, pdrv: u8, buffer: &mut [u8], sector: u32, count: usize) -> DResult {
        if pdrv != 0 {
            return DResult::ParamError;
        }
        transfer_len(buffer.len(), count)
            .and_then(|len| self.read(sector, &mut buffer[..len]))
            .into()
    }

    fn disk_write(&mut self, pdrv: u8, buffer: &[u8], sector: u32, count: usize) -> DResult {
        if pdrv != 0 {
            return DResult::ParamError;
        }
        transfer_len(buffer.len(), count)
            .and_then(|len| self.write(sector, &buffer[..len]))
            .into()
    }

    fn disk_ioctl(&mut self, pdrv: u8, code: u8, buffer: &mut [u8]) -> DResult {
        if pdrv != 0 {
            return DResult::ParamError;
        }
        ControlCode::try_from(code)
            .and_then(|code| {
                // Refuse before the card is asked anything
                if answer_len(code) > buffer.len() {
                    return Err(DiskError::Param);
                }
                self.control(code)
            })
            .and_then(|data| encode(data, buffer))
            .into()
    }
}

/// Packed FAT date and time: year since 1980 in bits 31:25, month 24:21,
/// day 20:16, hours 15:11, minutes 10:5, seconds / 2 in 4:0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatTimestamp(pub u32);

impl FatTimestamp {
    /// Pack a calendar time. Fields are masked to their bit widths.
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        let year = year.saturating_sub(1980) as u32 & 0x7F;
        Self(
            year << 25
                | (month as u32 & 0x0F) << 21
                | (day as u32 & 0x1F) << 16
                | (hour as u32 & 0x1F) << 11
                | (minute as u32 & 0x3F) << 5
                | (second as u32 / 2) & 0x1F,
        )
    }

    pub const fn year(self) -> u16 {
        (self.0 >> 25) as u16 + 1980
    }

    pub const fn month(self) -> u8 {
        (self.0 >> 21) as u8 & 0x0F
    }

    pub const fn day(self) -> u8 {
        (self.0 >> 16) as u8 & 0x1F
    }
}

/// Timestamp for new and modified files. There is no clock source, so every
/// file gets 2025-01-01 00:00:00.
pub fn current_timestamp() -> FatTimestamp {
    FatTimestamp::new(2025, 1, 1, 0, 0, 0)
}
