use crate::{
    consts::{commands, COMMAND_SIZE},
    crc::crc7,
};

/// CRC byte placed in a frame when no meaningful CRC is sent.
pub const FILLER_CRC: u8 = 0xFF;

/// A 6 byte SPI mode command frame.
///
/// Byte 0 carries the start bits and the command index, bytes 1-4 the big-endian
/// argument and byte 5 the CRC-7 with the end bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct CommandFrame([u8; COMMAND_SIZE]);

impl CommandFrame {
    /// Assembles a frame with a valid CRC-7.
    pub fn new(index: u8, arg: u32) -> Self {
        let mut frame = Self::header(index, arg);
        let crc_index = COMMAND_SIZE - 1;

        frame[crc_index] = (crc7(&frame[..crc_index]) << 1) | 0x01;

        CommandFrame(frame)
    }

    /// Assembles a frame whose CRC byte is the `0xFF` filler.
    ///
    /// Cards in SPI mode ignore the command CRC unless CRC checking was turned
    /// on, except for CMD0 and CMD8 which are always checked.
    pub fn with_filler_crc(index: u8, arg: u32) -> Self {
        let mut frame = Self::header(index, arg);
        frame[COMMAND_SIZE - 1] = FILLER_CRC;

        CommandFrame(frame)
    }

    fn header(index: u8, arg: u32) -> [u8; COMMAND_SIZE] {
        let arg = arg.to_be_bytes();
        [
            commands::CMD_BASE | (index & commands::CMD_INDEX_MASK),
            arg[0],
            arg[1],
            arg[2],
            arg[3],
            0,
        ]
    }

    /// Command index carried by the frame.
    pub fn index(&self) -> u8 {
        self.0[0] & commands::CMD_INDEX_MASK
    }

    /// Argument carried by the frame.
    pub fn argument(&self) -> u32 {
        u32::from_be_bytes([self.0[1], self.0[2], self.0[3], self.0[4]])
    }

    /// Raw frame bytes, ready for the wire.
    pub fn as_bytes(&self) -> &[u8; COMMAND_SIZE] {
        &self.0
    }
}

/// Assembles the frame for `index` with `arg`.
pub fn assemble(index: u8, arg: u32) -> [u8; COMMAND_SIZE] {
    *CommandFrame::new(index, arg).as_bytes()
}
