//! sdspi-core - Constants and wire structures for the SPI-mode SD protocol.
//!
//! Based on SdFat, under the following terms:
//!
//! > Copyright (c) 2011-2018 Bill Greiman
//! > This file is part of the SdFat library for SD memory cards.
//! >
//! > MIT License
//! >
//! > Permission is hereby granted, free of charge, to any person obtaining a
//! > copy of this software and associated documentation files (the "Software"),
//! > to deal in the Software without restriction, including without limitation
//! > the rights to use, copy, modify, merge, publish, distribute, sublicense,
//! > and/or sell copies of the Software, and to permit persons to whom the
//! > Software is furnished to do so, subject to the following conditions:
//! >
//! > The above copyright notice and this permission notice shall be included
//! > in all copies or substantial portions of the Software.
//! >
//! > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//! > OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! > FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//! > AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//! > LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//! > FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//! > DEALINGS IN THE SOFTWARE.

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - reset card, enter SPI mode if CS is low.
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - MMC v3's continuation command during capacity negotiation.
pub const CMD1: u8 = 0x01;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register).
pub const CMD9: u8 = 0x09;
/// STOP_TRANSMISSION - end multiple block read sequence.
pub const CMD12: u8 = 0x0C;
/// SET_BLOCKLEN - set the block length used by READ_SINGLE_BLOCK et al.
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card.
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read multiple data blocks from the card.
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card.
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
pub const CMD25: u8 = 0x19;
/// ERASE_WR_BLK_START - set the first block of an erase range.
pub const CMD32: u8 = 0x20;
/// ERASE_WR_BLK_END - set the last block of an erase range.
pub const CMD33: u8 = 0x21;
/// ERASE - erase the previously selected block range.
pub const CMD38: u8 = 0x26;
/// APP_CMD - escape for an application-specific command.
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card.
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COND - sends host capacity support information and activates
/// the card's initialization process.
pub const ACMD41: u8 = 0x29;
/// SET_WR_BLK_ERASE_COUNT - pre-erases blocks ahead of a multi-block write.
pub const ACMD23: u8 = 0x17;

//==============================================================================

/// Fixed CRC byte for CMD0 (the 7-bit CRC7 of the zero-argument frame, plus
/// stop bit). CRC checking is always off by the time any later command runs,
/// but CMD0 and CMD8 are sent before that's guaranteed.
pub const CRC_CMD0: u8 = 0x95;
/// Fixed CRC byte for CMD8 with argument `0x0000_01AA`.
pub const CRC_CMD8: u8 = 0x87;
/// CRC byte used for every other command once CRC checking is disabled.
pub const CRC_DISABLED: u8 = 0x01;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;
/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;
/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;
/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;
/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;
/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// Number of blocking attempts made at any bounded retry/poll loop in the
/// command framer (10 reads, or 10 retries 10ms apart, per the SD protocol).
pub const MAX_RETRIES: u32 = 10;
/// Delay between command retries during the init and block-op retry loops.
pub const RETRY_DELAY_MS: u32 = 10;
/// Upper bound on the ACMD41/CMD1 capacity-negotiation poll, in milliseconds.
pub const INIT_POLL_TIMEOUT_MS: u32 = 1000;
/// Delay between ACMD41/CMD1 polls during capacity negotiation.
pub const INIT_POLL_DELAY_MS: u32 = 100;
/// Upper bound on waiting for a data-start token, in milliseconds.
pub const READ_TOKEN_TIMEOUT_MS: u32 = 200;
/// Upper bound on waiting for the card to release busy after a block write.
pub const WRITE_BUSY_TIMEOUT_MS: u32 = 500;
/// Upper bound on waiting for the card to release busy after an erase.
pub const ERASE_BUSY_TIMEOUT_MS: u32 = 30_000;

/// Card Specific Data, version 1.0 (byte-addressed SD v1/v2 and MMC cards).
#[derive(Debug, Clone, Copy, Default)]
pub struct CsdV1 {
    /// The 16 raw bytes of the Card Specific Data register.
    pub data: [u8; 16],
}

/// Card Specific Data, version 2.0 (SDHC/SDXC cards).
#[derive(Debug, Clone, Copy, Default)]
pub struct CsdV2 {
    /// The 16 raw bytes of the Card Specific Data register.
    pub data: [u8; 16],
}

/// Either flavour of Card Specific Data, tagged by the structure version
/// found in the top two bits of byte 0.
#[derive(Debug, Clone, Copy)]
pub enum Csd {
    /// CSD structure version 1.0.
    V1(CsdV1),
    /// CSD structure version 2.0.
    V2(CsdV2),
}

impl CsdV1 {
    /// Create a zeroed CSD, ready to be filled in by a CMD9 data read.
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);

    /// Number of 512-byte sectors on the card.
    pub fn sector_count(&self) -> u32 {
        let c_size_mult = self.device_size_multiplier();
        let read_bl_len = self.read_block_length();
        let c_size = self.device_size();
        (c_size + 1) * (1u32 << (c_size_mult as u32 + 2)) * (1u32 << (read_bl_len as u32 - 9))
    }

    /// Usable card capacity in bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        u64::from(self.sector_count()) * 512
    }
}

impl CsdV2 {
    /// Create a zeroed CSD, ready to be filled in by a CMD9 data read.
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(c_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);

    /// Number of 512-byte sectors on the card.
    pub fn sector_count(&self) -> u32 {
        (self.c_size() + 1) << 10
    }

    /// Usable card capacity in bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        u64::from(self.sector_count()) * 512
    }
}

impl Csd {
    /// Number of 512-byte sectors on the card, regardless of CSD version.
    pub fn sector_count(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.sector_count(),
            Csd::V2(csd) => csd.sector_count(),
        }
    }

    /// Usable card capacity in bytes, regardless of CSD version.
    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }

    /// Whether the card supports erasing a single block at a time.
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }

    /// Parse a CSD from 16 raw register bytes, dispatching on the structure
    /// version in the top two bits of byte 0.
    pub fn parse(raw: [u8; 16]) -> Csd {
        if (raw[0] >> 6) == 0b01 {
            Csd::V2(CsdV2 { data: raw })
        } else {
            Csd::V1(CsdV1 { data: raw })
        }
    }
}

/// Perform the 7-bit CRC used by the SD protocol. Only CMD0 and CMD8 rely on
/// a correct value; every later command sends the fixed [`CRC_DISABLED`]
/// byte because SPI-mode CRC checking is off by then.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Perform the X25 CRC calculation used on SD data blocks. Unused by the
/// block-transfer paths themselves: CRC checking is off by the time any
/// data phase runs, so reads discard the two trailing bytes unchecked and
/// writes send two dummy `0xFF` bytes in their place, trusting the card's
/// own response token instead. Kept for callers that need the real value.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
