/// Card register snapshots and the values derived from them

use super::commands::CardType;

/// Length of the CSD and CID registers
pub const CSD_LEN: usize = 16;
pub const CID_LEN: usize = 16;

/// Length of the OCR carried by an R3/R7 response
pub const OCR_LEN: usize = 4;

/// Length of the SD status block returned by ACMD13
pub const SD_STATUS_LEN: usize = 64;

/// Part of the SD status holding the allocation unit size
pub const SD_STATUS_PARTIAL_LEN: usize = 16;

/// Card Specific Data, raw as read from the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csd(pub [u8; CSD_LEN]);

impl Csd {
    /// CSD_STRUCTURE field (top 2 bits of byte 0)
    pub fn version(&self) -> u8 {
        self.0[0] >> 6
    }

    /// Capacity in 512-byte sectors
    pub fn sector_count(&self) -> u32 {
        let csd = &self.0;
        if self.version() >= 1 {
            let c_size = ((csd[7] as u32 & 63) << 16) | ((csd[8] as u32) << 8) | csd[9] as u32;
            (c_size + 1) << 10
        } else {
            // READ_BL_LEN + C_SIZE_MULT + 2
            let n = (csd[5] & 15) + ((csd[10] & 128) >> 7) + ((csd[9] & 3) << 1) + 2;
            let c_size = (csd[8] as u32 >> 6) + ((csd[7] as u32) << 2) + ((csd[6] as u32 & 3) << 10) + 1;
            if n >= 9 {
                c_size << (n - 9)
            } else {
                c_size >> (9 - n)
            }
        }
    }

    /// Erase block size in sectors, for cards without an SD status register
    pub fn erase_block_size(&self, card_type: CardType) -> u32 {
        let csd = &self.0;
        if card_type.contains(CardType::SD1) {
            let sector_size = ((csd[10] as u32 & 63) << 1) + ((csd[11] as u32 & 128) >> 7) + 1;
            sector_size << (csd[13] >> 6).saturating_sub(1)
        } else {
            let grp_size = ((csd[10] as u32 & 124) >> 2) + 1;
            let grp_mult = ((csd[11] as u32 & 3) << 3) + ((csd[11] as u32 & 224) >> 5) + 1;
            grp_size * grp_mult
        }
    }
}

/// Operation Conditions Register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ocr(pub [u8; OCR_LEN]);

impl Ocr {
    /// Card Capacity Status: the card takes sector numbers as addresses
    pub fn is_block_addressed(&self) -> bool {
        self.0[0] & 0x40 != 0
    }
}

/// Erase block size in sectors from the leading part of the SD status
pub fn sd_status_erase_block_size(status: &[u8; SD_STATUS_PARTIAL_LEN]) -> u32 {
    16u32 << (status[10] >> 4)
}
