/// Size of a sector (block) in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Value the bus idles at, also clocked out while receiving.
pub const IDLE_BYTE: u8 = 0xFF;

/// Size of a command frame in bytes.
pub const COMMAND_SIZE: usize = 6;

pub mod commands {
    /// Start and transmission bits of the first command byte.
    pub const CMD_BASE: u8 = 0x40;
    /// Mask of the command index within the first command byte.
    pub const CMD_INDEX_MASK: u8 = 0x3F;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = 0;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = 8;
    /// STOP_TRANSMISSION - end multiple block read sequence.
    pub const CMD12: u8 = 12;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = 17;
    /// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card.
    pub const CMD18: u8 = 18;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
    pub const CMD25: u8 = 25;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = 58;
    /// SET_WR_BLK_ERASE_COUNT - number of blocks to pre-erase before a
    /// multiple block write.
    pub const ACMD23: u8 = 23;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = 41;
}

pub mod arguments {
    /// CMD8 argument: 2.7-3.6V supply and the `0xAA` check pattern.
    pub const IF_COND: u32 = 0x0000_01AA;
    /// Expected CMD8 echo. Voltage accepted nibble plus the check pattern.
    pub const IF_COND_ECHO: u32 = 426;
    /// ACMD41 argument with the host capacity support bit.
    pub const HOST_CAPACITY_SUPPORT: u32 = 0x4000_0000;
}

pub mod tokens {
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x0F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
    /// Card isn't busy anymore.
    pub const AVAILABLE: u8 = 0xFF;
}
