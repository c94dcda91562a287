//! Adapts the SPI bus and the chip select line to the byte level operations
//! the card protocol is built from.
//!
//! Nothing here retries. A failing bus or chip select aborts the running
//! operation and the error is handed upwards unchanged.

use crate::{
    consts::{BLOCK_SIZE, IDLE_BYTE},
    Error, ErrorFor,
};

use embedded_hal::blocking::spi::Transfer;
use fugit::HertzU32;
use switch_hal::OutputSwitch;

/// Chip select discipline applied around one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum ChipSelect {
    /// Leave the line as it is.
    Keep,
    /// Assert the line, then transfer.
    Assert,
    /// Transfer, then deassert the line.
    Deassert,
}

/// The bus can't be clocked at the requested rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedRate(pub HertzU32);

/// Clock rate selection of the SPI bus the card is attached to.
pub trait SpiClock {
    /// Reconfigures the bus clock for every following transfer.
    fn set_clock_rate(&mut self, rate: HertzU32) -> Result<(), UnsupportedRate>;
}

/// Result type alias.
type TransportResult<T, Spi, Cs> = Result<T, ErrorFor<Spi, Cs>>;

/// Byte level access to the card.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch, `on` selects the card.
pub struct Transport<Spi: Transfer<u8> + SpiClock, Cs: OutputSwitch> {
    spi: Spi,
    cs: Cs,
    scratch: [u8; BLOCK_SIZE],
}

impl<Spi: Transfer<u8> + SpiClock, Cs: OutputSwitch> Transport<Spi, Cs> {
    /// Creates a new [`Transport<Spi, Cs>`].
    pub fn new(spi: Spi, cs: Cs) -> Self {
        Transport {
            spi,
            cs,
            scratch: [0; BLOCK_SIZE],
        }
    }

    /// Gives back the bus and the chip select.
    pub fn release(self) -> (Spi, Cs) {
        (self.spi, self.cs)
    }

    /// Activate chip select.
    fn select(&mut self) -> TransportResult<(), Spi, Cs> {
        self.cs.on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    fn unselect(&mut self) -> TransportResult<(), Spi, Cs> {
        self.cs.off().map_err(Error::SelectError)
    }

    /// Runs `f` under the chip select discipline `cs`.
    fn with_chip_select<F, T>(&mut self, cs: ChipSelect, f: F) -> TransportResult<T, Spi, Cs>
    where
        F: FnOnce(&mut Self) -> TransportResult<T, Spi, Cs>,
    {
        if cs == ChipSelect::Assert {
            self.select()?;
        }

        let value = f(self)?;

        if cs == ChipSelect::Deassert {
            self.unselect()?;
        }

        Ok(value)
    }

    /// Clocks `words` through the bus in place.
    fn transfer_in_place(spi: &mut Spi, words: &mut [u8]) -> TransportResult<(), Spi, Cs> {
        spi.transfer(words).map(|_| ()).map_err(Error::Transport)
    }

    /// Writes `bytes`, discarding what the card sends back.
    pub fn write(&mut self, bytes: &[u8], cs: ChipSelect) -> TransportResult<(), Spi, Cs> {
        self.with_chip_select(cs, |s| {
            for chunk in bytes.chunks(BLOCK_SIZE) {
                let staged = &mut s.scratch[..chunk.len()];
                staged.copy_from_slice(chunk);
                Self::transfer_in_place(&mut s.spi, staged)?;
            }

            Ok(())
        })
    }

    /// Reads `bytes.len()` bytes while clocking out the idle byte.
    pub fn read(&mut self, bytes: &mut [u8], cs: ChipSelect) -> TransportResult<(), Spi, Cs> {
        self.with_chip_select(cs, |s| {
            bytes.fill(IDLE_BYTE);
            Self::transfer_in_place(&mut s.spi, bytes)
        })
    }

    /// Writes `output` and captures the simultaneously received bytes into `input`.
    pub fn read_write(
        &mut self,
        input: &mut [u8],
        output: &[u8],
        cs: ChipSelect,
    ) -> TransportResult<(), Spi, Cs> {
        if input.len() != output.len() {
            return Err(Error::InvalidBuffer(output.len()));
        }

        self.with_chip_select(cs, |s| {
            input.copy_from_slice(output);
            Self::transfer_in_place(&mut s.spi, input)
        })
    }

    /// Selects the bus clock rate.
    pub fn set_clock(&mut self, rate: HertzU32) -> TransportResult<(), Spi, Cs> {
        self.spi
            .set_clock_rate(rate)
            .map_err(|UnsupportedRate(rate)| Error::UnsupportedClock(rate.raw()))
    }

    /// Send one byte and receive one byte.
    pub fn exchange(&mut self, out: u8, cs: ChipSelect) -> TransportResult<u8, Spi, Cs> {
        let mut input = [0];
        self.read_write(&mut input, &[out], cs)?;

        Ok(input[0])
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> TransportResult<u8, Spi, Cs> {
        self.exchange(IDLE_BYTE, ChipSelect::Keep)
    }

    /// Clocks `count` idle bytes with chip select deasserted.
    pub fn idle_clocks(&mut self, count: usize) -> TransportResult<(), Spi, Cs> {
        self.unselect()?;

        let idle = [IDLE_BYTE; 16];
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(idle.len());
            self.write(&idle[..n], ChipSelect::Keep)?;
            remaining -= n;
        }

        Ok(())
    }

    /// Leaves the bus idle: one `0xFF` byte, then chip select deasserted.
    pub fn cleanup(&mut self) -> TransportResult<(), Spi, Cs> {
        self.exchange(IDLE_BYTE, ChipSelect::Deassert).map(|_| ())
    }
}
