//! SD card protocol session.
//!
//! Owns the transport and the card state. Initialization walks the version
//! 2.0 identification sequence; reads and writes frame one command per
//! operation and move the data blocks under a single chip select assertion.
//! Every failing operation leaves the bus idle with chip select deasserted.

use crate::{
    command::CommandFrame,
    config::{DefaultSdCardConfig, SdCardConfig},
    consts::{arguments, commands, tokens, BLOCK_SIZE, IDLE_BYTE},
    response::{if_cond_echo, Ocr, R1Response, R3OcrPayload},
    transport::{ChipSelect, SpiClock, Transport},
    Error, ErrorFor,
};

use core::marker::PhantomData;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, warn};
#[cfg(feature = "log")]
use log::{debug, error, info, warn};

/// Card type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardType {
    /// Standard capacity, addressed by byte offset.
    SD2,
    /// High capacity, addressed by sector.
    SDHC,
}

impl CardType {
    /// Maps a sector to the address argument of a read or write command.
    ///
    /// Returns `None` when a byte addressed card can't reach the sector.
    pub fn address_for(self, sector: u32) -> Option<u32> {
        match self {
            CardType::SD2 => sector.checked_mul(BLOCK_SIZE as u32),
            CardType::SDHC => Some(sector),
        }
    }

    /// Sector addressing.
    pub fn is_high_capacity(self) -> bool {
        self == CardType::SDHC
    }
}

/// Lifecycle of a [`CardSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum SessionState {
    /// The card must be initialized before any I/O.
    NotInitialized,
    /// Identification sequence running.
    Initializing,
    /// The card accepts reads and writes.
    Ready,
}

/// SD Card SPI session.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Config` - Config implementation of driver config trait.
pub struct CardSession<
    Spi: Transfer<u8> + SpiClock,
    Cs: OutputSwitch,
    Config: SdCardConfig = DefaultSdCardConfig,
> {
    transport: Transport<Spi, Cs>,
    state: SessionState,
    card_type: CardType,
    last_outcome: Option<bool>,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Config> CardSession<Spi, Cs, Config>
where
    Spi: Transfer<u8> + SpiClock,
    Cs: OutputSwitch,
    Config: SdCardConfig,
{
    /// Creates a new [`CardSession<Spi, Cs, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    pub fn new(spi: Spi, cs: Cs) -> Self {
        CardSession {
            transport: Transport::new(spi, cs),
            state: SessionState::NotInitialized,
            card_type: CardType::SD2,
            last_outcome: None,
            config: PhantomData::<Config>,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The card went through initialization and accepts I/O.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Type of the initialized card.
    pub fn card_type(&self) -> Option<CardType> {
        self.is_ready().then(|| self.card_type)
    }

    /// Outcome of the last initialization, read or write.
    pub fn last_operation_succeeded(&self) -> bool {
        self.last_outcome == Some(true)
    }

    /// Outcome of the last initialization, read or write, `None` before the
    /// first one.
    pub fn last_outcome(&self) -> Option<bool> {
        self.last_outcome
    }

    /// Keep the outcome of a public operation.
    fn record<T>(
        &mut self,
        result: Result<T, ErrorFor<Spi, Cs>>,
    ) -> Result<T, ErrorFor<Spi, Cs>> {
        self.last_outcome = Some(result.is_ok());
        result
    }

    /// Forces the next operation to initialize the card again.
    pub fn invalidate(&mut self) {
        info!("SD session invalidated");
        self.state = SessionState::NotInitialized;
    }

    /// Gives back the bus and the chip select.
    pub fn release(self) -> (Spi, Cs) {
        self.transport.release()
    }

    /// Address argument for `sector` on the initialized card.
    pub fn address_for(&self, sector: u32) -> Option<u32> {
        self.card_type.address_for(sector)
    }

    /// Delay.
    fn delay() {
        for i in 0..Config::OP_COND_DELAY_CYCLES {
            unsafe { core::ptr::read_volatile(&i) };
        }
    }

    /// Runs `f` and puts the bus back to idle if it fails.
    fn transaction<F, T>(&mut self, f: F) -> Result<T, ErrorFor<Spi, Cs>>
    where
        F: FnOnce(&mut Self) -> Result<T, ErrorFor<Spi, Cs>>,
    {
        let result = f(self);

        if result.is_err() {
            // Cleanup errors are dropped, the first failure is reported.
            let _ = self.transport.cleanup();
        }

        result
    }

    /// Wait for token.
    fn wait_for_token<F: Fn(u8) -> bool>(
        &mut self,
        attempts: usize,
        token_validator: F,
        error: ErrorFor<Spi, Cs>,
    ) -> Result<u8, ErrorFor<Spi, Cs>> {
        for _ in 0..attempts {
            let token = self.transport.receive()?;

            if token_validator(token) {
                return Ok(token);
            }
        }

        Err(error)
    }

    /// Wait available state of card.
    fn wait_available_state(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.wait_for_token(
            Config::BUSY_ATTEMPTS,
            |token| token == tokens::AVAILABLE,
            Error::TimeoutWaitAvailable,
        )
        .map(|_| ())
    }

    /// Poll for the R1 of `cmd`.
    fn read_r1(&mut self, cmd: u8) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        self.wait_for_token(
            Config::RESPONSE_ATTEMPTS,
            |token| R1Response::from_byte(token).is_valid(),
            Error::TimeoutCommand(cmd),
        )
        .map(R1Response::from_byte)
    }

    /// Frame and send a command, then poll for its R1.
    fn send_command(
        &mut self,
        cmd: u8,
        arg: u32,
        cs: ChipSelect,
    ) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        let frame = CommandFrame::new(cmd, arg);
        self.transport.write(frame.as_bytes(), cs)?;

        self.read_r1(cmd)
    }

    /// Send a command in a transaction of its own: chip select is asserted for
    /// the frame, the response payload fills `payload` and one trailing byte
    /// deasserts chip select again.
    fn exchange_command(
        &mut self,
        cmd: u8,
        arg: u32,
        payload: &mut [u8],
    ) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        let r1 = self.send_command(cmd, arg, ChipSelect::Assert)?;

        if !payload.is_empty() {
            self.transport.read(payload, ChipSelect::Keep)?;
        }

        self.finish()?;

        Ok(r1)
    }

    /// Clock a last byte and deassert chip select.
    fn finish(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transport
            .exchange(IDLE_BYTE, ChipSelect::Deassert)
            .map(|_| ())
    }

    /// Require the card to be ready after `cmd`.
    fn expect_ready(cmd: u8, r1: R1Response) -> Result<(), ErrorFor<Spi, Cs>> {
        if r1 == R1Response::READY_STATE {
            Ok(())
        } else {
            warn!("Wrong response from CMD{}: {:#x}", cmd, r1.byte());
            Err(Error::ErrorCommand(cmd, r1.byte()))
        }
    }

    /// Bring the card into SPI mode and idle state.
    fn go_idle(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transport.idle_clocks(Config::WAKE_UP_BYTES)?;

        let r1 = self.exchange_command(commands::CMD0, 0x0000_0000, &mut [])?;
        if r1 != R1Response::IN_IDLE_STATE {
            warn!("Card didn't enter idle state: {:#x}", r1.byte());
            return Err(Error::ErrorCommand(commands::CMD0, r1.byte()));
        }

        Ok(())
    }

    /// Verify SD Memory Card interface operating condition.
    fn send_if_cond(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("Verifying SD Memory Card interface operating condition");

        let mut payload: R3OcrPayload = Default::default();
        let r1 = self.exchange_command(commands::CMD8, arguments::IF_COND, &mut payload)?;
        if r1 != R1Response::IN_IDLE_STATE {
            return Err(Error::ErrorCommand(commands::CMD8, r1.byte()));
        }

        let echo = if_cond_echo(payload);
        if echo != arguments::IF_COND_ECHO {
            warn!("CMD8 echo mismatch: {:#x}", echo);
            return Err(Error::IfCondMismatch(echo));
        }

        Ok(())
    }

    /// Read the OCR register.
    fn read_ocr(&mut self) -> Result<(R1Response, Ocr), ErrorFor<Spi, Cs>> {
        let mut payload: R3OcrPayload = Default::default();
        let r1 = self.exchange_command(commands::CMD58, 0x0000_0000, &mut payload)?;

        Ok((r1, Ocr::from_payload(payload)))
    }

    /// Check the card runs at 3.3V.
    fn check_voltage(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        let (r1, ocr) = self.read_ocr()?;
        if r1 != R1Response::IN_IDLE_STATE {
            return Err(Error::ErrorCommand(commands::CMD58, r1.byte()));
        }

        if !ocr.voltage_3v2_3v3() {
            warn!("Card can't be used at 3.3V, OCR: {:#x}", ocr.bits());
            return Err(Error::VoltageNotSupported(ocr.bits()));
        }

        Ok(())
    }

    /// Sends host capacity support information and activates.
    fn send_op_cond(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("Sending host capacity support information and activates");

        for _ in 0..Config::OP_COND_ATTEMPTS {
            Self::delay();

            let r1 = self.exchange_command(commands::CMD55, 0x0000_0000, &mut [])?;
            if r1.illigal_command() {
                warn!("Card doesn't support APP_CMD: {:#x}", r1.byte());
                return Err(Error::AppCommandNotSupported);
            }

            let r1 = self.exchange_command(
                commands::ACMD41,
                arguments::HOST_CAPACITY_SUPPORT,
                &mut [],
            )?;
            if r1 == R1Response::READY_STATE {
                return Ok(());
            }
        }

        Err(Error::TimeoutCommand(commands::ACMD41))
    }

    /// Check the power up finished and read the addressing mode.
    fn check_type(&mut self) -> Result<CardType, ErrorFor<Spi, Cs>> {
        let (_, ocr) = self.read_ocr()?;
        if !ocr.power_up_complete() {
            warn!("Card power up not complete, OCR: {:#x}", ocr.bits());
            return Err(Error::PowerUpIncomplete(ocr.bits()));
        }

        Ok(if ocr.card_capacity_status() {
            CardType::SDHC
        } else {
            CardType::SD2
        })
    }

    /// Initialization sequence, from power up to the operating clock.
    fn init_sequence(&mut self) -> Result<CardType, ErrorFor<Spi, Cs>> {
        self.go_idle()?;
        self.send_if_cond()?;
        self.check_voltage()?;
        self.send_op_cond()?;

        let card_type = self.check_type()?;

        self.transport.set_clock(Config::NOMINAL_CLOCK)?;
        info!("SD clock set to {} Hz", Config::NOMINAL_CLOCK.raw());

        Ok(card_type)
    }

    /// Initialize SD.
    ///
    /// Runs the whole identification sequence, whatever the current state.
    pub fn initialize(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("SD initialize started");

        self.state = SessionState::Initializing;
        // An unusable clock is refused before anything is clocked out.
        let result = self
            .transport
            .set_clock(Config::SLOW_CLOCK)
            .and_then(|_| self.transaction(|s| s.init_sequence()));

        let result = self.record(result);
        match result {
            Ok(card_type) => {
                self.card_type = card_type;
                self.state = SessionState::Ready;
                info!("SD successfully initialized, type: {:?}", card_type);
                Ok(())
            }
            Err(err) => {
                error!("Failed to initialize SD");
                self.state = SessionState::NotInitialized;
                Err(err)
            }
        }
    }

    /// Initialize again if a previous failure invalidated the session.
    fn ensure_ready(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        if self.is_ready() {
            Ok(())
        } else {
            self.initialize()
        }
    }

    /// Validate buffer for read/write.
    fn block_count(buf_len: usize) -> Result<u32, ErrorFor<Spi, Cs>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            warn!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            return Err(Error::InvalidBuffer(buf_len));
        }

        u32::try_from(buf_len / BLOCK_SIZE).map_err(|_| Error::InvalidBuffer(buf_len))
    }

    /// Address of the first sector, once every sector of the range is known to
    /// be reachable.
    fn range_address(&self, start: u32, count: u32) -> Result<u32, ErrorFor<Spi, Cs>> {
        let last = start
            .checked_add(count - 1)
            .ok_or(Error::AddressOutOfRange(start))?;
        self.address_for(last)
            .ok_or(Error::AddressOutOfRange(last))?;

        self.address_for(start)
            .ok_or(Error::AddressOutOfRange(start))
    }

    /// Checks a request and readies the card for it, returning the address of
    /// the first sector and the sector count.
    fn prepare(&mut self, start: u32, buf_len: usize) -> Result<(u32, u32), ErrorFor<Spi, Cs>> {
        let count = Self::block_count(buf_len)?;
        self.ensure_ready()?;
        let address = self.range_address(start, count)?;

        Ok((address, count))
    }

    /// Runs a read or write on a ready card. Transport failures invalidate the
    /// session, protocol failures are only reported.
    fn io<F>(&mut self, f: F) -> Result<(), ErrorFor<Spi, Cs>>
    where
        F: FnOnce(&mut Self) -> Result<(), ErrorFor<Spi, Cs>>,
    {
        let result = self.transaction(f);

        if let Err(err) = &result {
            if err.is_transport() {
                warn!("SD transport failure, session invalidated");
                self.state = SessionState::NotInitialized;
            }
        }

        result
    }

    /// Read data.
    fn read_data(&mut self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let token = self.wait_for_token(
            Config::RESPONSE_ATTEMPTS,
            |token| token != tokens::AVAILABLE,
            Error::TimeoutReadBuffer,
        )?;
        if token != tokens::DATA_START_BLOCK {
            warn!("Unexpected data token: {:#x}", token);
            return Err(Error::ReadError(token));
        }

        self.transport.read(data, ChipSelect::Keep)?;

        // Data CRC is clocked in but not checked.
        let mut crc = [0u8; 2];
        self.transport.read(&mut crc, ChipSelect::Keep)
    }

    /// Write data.
    fn write_data(&mut self, token: u8, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transport.write(&[token], ChipSelect::Keep)?;
        self.transport.write(data, ChipSelect::Keep)?;
        self.transport.write(&[IDLE_BYTE, IDLE_BYTE], ChipSelect::Keep)?;

        let response = self.transport.receive()?;
        if (response & tokens::DATA_RES_MASK) != tokens::DATA_RES_ACCEPTED {
            warn!("Card rejected data: {:#x}", response);
            return Err(Error::WriteError(response));
        }

        Ok(())
    }

    fn read_single(&mut self, address: u32, buf: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let r1 = self.send_command(commands::CMD17, address, ChipSelect::Assert)?;
        Self::expect_ready(commands::CMD17, r1)?;

        self.read_data(buf)?;
        self.finish()
    }

    fn read_multiple(&mut self, address: u32, buf: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let r1 = self.send_command(commands::CMD18, address, ChipSelect::Assert)?;
        Self::expect_ready(commands::CMD18, r1)?;

        for chunk in buf.chunks_mut(BLOCK_SIZE) {
            self.read_data(chunk)?;
        }

        let frame = CommandFrame::new(commands::CMD12, 0x0000_0000);
        self.transport.write(frame.as_bytes(), ChipSelect::Keep)?;
        // Stuff byte following STOP_TRANSMISSION.
        self.transport.receive()?;
        let r1 = self.read_r1(commands::CMD12)?;
        Self::expect_ready(commands::CMD12, r1)?;

        self.wait_available_state()?;
        self.finish()
    }

    fn write_single(&mut self, address: u32, buf: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let r1 = self.send_command(commands::CMD24, address, ChipSelect::Assert)?;
        Self::expect_ready(commands::CMD24, r1)?;

        self.write_data(tokens::DATA_START_BLOCK, buf)?;
        self.wait_available_state()?;
        self.finish()
    }

    fn write_multiple(
        &mut self,
        address: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        // Pre-erase the blocks about to be written.
        let r1 = self.send_command(commands::CMD55, 0x0000_0000, ChipSelect::Assert)?;
        Self::expect_ready(commands::CMD55, r1)?;
        let r1 = self.send_command(commands::ACMD23, count, ChipSelect::Keep)?;
        Self::expect_ready(commands::ACMD23, r1)?;

        let r1 = self.send_command(commands::CMD25, address, ChipSelect::Keep)?;
        Self::expect_ready(commands::CMD25, r1)?;

        for block in buf.chunks(BLOCK_SIZE) {
            self.wait_available_state()?;
            self.write_data(tokens::WRITE_MULTIPLE, block)?;
        }

        self.wait_available_state()?;
        self.transport.write(&[tokens::STOP_TRAN], ChipSelect::Keep)?;
        // Busy starts one byte after the stop token.
        self.transport.receive()?;
        self.wait_available_state()?;
        self.finish()
    }

    /// Read one sector into `buf`.
    pub fn read_sector(
        &mut self,
        sector: u32,
        buf: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        self.read_sectors(sector, buf)
    }

    /// Read `buf.len() / BLOCK_SIZE` consecutive sectors starting at `start`.
    pub fn read_sectors(&mut self, start: u32, buf: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let result = self.prepare(start, buf.len()).and_then(|(address, count)| {
            debug!("Reading {} sector(s) from {}", count, start);

            self.io(|s| {
                if count == 1 {
                    s.read_single(address, buf)
                } else {
                    s.read_multiple(address, buf)
                }
            })
        });

        self.record(result)
    }

    /// Write one sector from `buf`.
    pub fn write_sector(
        &mut self,
        sector: u32,
        buf: &[u8; BLOCK_SIZE],
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        self.write_sectors(sector, buf)
    }

    /// Write `buf.len() / BLOCK_SIZE` consecutive sectors starting at `start`.
    pub fn write_sectors(&mut self, start: u32, buf: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let result = self.prepare(start, buf.len()).and_then(|(address, count)| {
            debug!("Writing {} sector(s) to {}", count, start);

            self.io(|s| {
                if count == 1 {
                    s.write_single(address, buf)
                } else {
                    s.write_multiple(address, count, buf)
                }
            })
        });

        self.record(result)
    }
}
