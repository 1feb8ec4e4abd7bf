//! Wire-level constants and register layouts for SD/MMC cards in SPI mode.
//!
//! Everything a card and host exchange is either a 6-byte command frame, a
//! single-byte R1-style response, or a token-framed data packet. The
//! constants here are the vocabulary for all three.

// ============================================================================
// Command indices (the frame opcode is the index OR'd with 0x40)
// ============================================================================

/// GO_IDLE_STATE - reset the card and enter SPI mode if CS is low
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - start the initialization process (MMC)
pub const CMD1: u8 = 0x01;
/// SEND_IF_COND - verify the card can operate at the host's voltage
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data register
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the Card Identification register
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end a multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SET_BLOCKLEN - select the read/write block length
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read one data block
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read data blocks until STOP_TRANSMISSION
pub const CMD18: u8 = 0x12;
/// SET_BLOCK_COUNT - pre-erase hint before a multiple block write (ACMD)
pub const ACMD23: u8 = 0x17;
/// WRITE_BLOCK - write one data block
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write data blocks until the stop token
pub const CMD25: u8 = 0x19;
/// SD_SEND_OP_COND - start the initialization process (SDC, via APP_CMD)
pub const ACMD41: u8 = 0x29;
/// APP_CMD - escape prefix for application specific commands
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the Operating Conditions Register
pub const CMD58: u8 = 0x3A;

// ============================================================================
// Responses and framing
// ============================================================================

/// R1 status for a card in the ready state
pub const R1_READY_STATE: u8 = 0x00;
/// R1 status for a card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// Valid checksum for CMD0 with a zero argument
pub const CMD0_CHECKSUM: u8 = 0x95;
/// Valid checksum for CMD8 with the 0x1AA voltage-check argument
pub const CMD8_CHECKSUM: u8 = 0x87;
/// Filler checksum; cards in SPI mode accept it for every other command
pub const DUMMY_CHECKSUM: u8 = 0xFF;

/// Start token for a single-block read or write
pub const DATA_START_BLOCK: u8 = 0xFE;
/// Start token for each block of a multiple block write
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// Stop token ending a multiple block write
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// Mask for the data response token after a write
pub const DATA_RES_MASK: u8 = 0x1F;
/// Data response token value meaning the block was accepted
pub const DATA_RES_ACCEPTED: u8 = 0x05;

// ============================================================================
// Card Specific Data
// ============================================================================

/// Card Specific Data, layout version 1 (MMC and SDC v1)
#[derive(Default)]
pub struct CsdV1 {
    /// The 16 bytes of the register, as clocked off the card
    pub data: [u8; 16],
}

/// Card Specific Data, layout version 2 (SDC v2)
#[derive(Default)]
pub struct CsdV2 {
    /// The 16 bytes of the register, as clocked off the card
    pub data: [u8; 16],
}

/// Card Specific Data, in whichever of the two layouts the register itself
/// declares.
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl Csd {
    /// Interpret a raw register dump, selecting the layout from the
    /// register's own version field.
    pub fn parse(data: [u8; 16]) -> Csd {
        if (data[0] >> 6) == 1 {
            Csd::V2(CsdV2 { data })
        } else {
            Csd::V1(CsdV1 { data })
        }
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }
}

impl CsdV1 {
    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() - 7;
        (self.device_size() + 1) << multiplier
    }
}

impl CsdV2 {
    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
