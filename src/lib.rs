//! Raw SD card block storage over SPI for the WaterWatcher monitoring station.
//!
//! This crate turns a byte oriented SPI bus plus a chip select line into a
//! sector addressable storage device, speaking the SPI mode command, response
//! and data token protocol of SD version 2.0 cards. A [`CardSession`] owns the
//! protocol state; [`SdCardDisk`] exposes it through the [`DiskioDevice`]
//! contract a FAT filesystem layer consumes, together with the packed
//! directory entry timestamp from a [`TimeSource`].
//!
//! ## Features
//!
//! * `log` (default): log through the `log` facade.
//! * `defmt-log`: log through `defmt` instead. Turn off the default features
//! when enabling it.

#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "log", feature = "defmt-log"))]
compile_error!("features `log` and `defmt-log` are mutually exclusive");

#[cfg(not(any(feature = "log", feature = "defmt-log")))]
compile_error!("enable either the `log` or the `defmt-log` feature");


mod card;
mod command;
mod config;
mod consts;
mod crc;
mod disk;
mod response;
mod timestamp;
mod transport;

pub use crate::card::{CardSession, CardType, SessionState};
pub use crate::command::{assemble, CommandFrame};
pub use crate::config::{DefaultSdCardConfig, SdCardConfig};
pub use crate::consts::BLOCK_SIZE;
pub use crate::disk::SdCardDisk;
pub use crate::timestamp::{TimeSource, Timestamp};
pub use crate::transport::{ChipSelect, SpiClock, Transport, UnsupportedRate};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// [`CardSession`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// The bus can't run at this clock rate, in Hz.
    UnsupportedClock(u32),
    /// The sector can't be addressed on this card.
    AddressOutOfRange(u32),
    /// Buffer length isn't usable for the transfer.
    InvalidBuffer(usize),
    /// No response when executing this command.
    TimeoutCommand(u8),
    /// Command answered with an unexpected R1 (command, response).
    ErrorCommand(u8, u8),
    /// CMD8 didn't echo the voltage and check pattern.
    IfCondMismatch(u32),
    /// The card can't run at 3.3V (OCR).
    VoltageNotSupported(u32),
    /// The card rejected APP_CMD.
    AppCommandNotSupported,
    /// The card didn't finish powering up (OCR).
    PowerUpIncomplete(u32),
    /// No response when reading data from the card.
    TimeoutReadBuffer,
    /// The card sent this token instead of a data block.
    ReadError(u8),
    /// The card didn't accept written data (data response token).
    WriteError(u8),
    /// No response when waiting for the card to not be busy.
    TimeoutWaitAvailable,
}

impl<T, S> Error<T, S> {
    /// The bus or the chip select failed, rather than the card misbehaving.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::SelectError(_))
    }

    /// The request was refused before anything went over the bus.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedClock(_) | Error::AddressOutOfRange(_) | Error::InvalidBuffer(_)
        )
    }
}

/// Error type alias.
pub(crate) type ErrorFor<Spi, Cs> =
    Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;
