use crate::{
    card::CardSession,
    config::{DefaultSdCardConfig, SdCardConfig},
    consts::BLOCK_SIZE,
    timestamp::TimeSource,
    transport::SpiClock,
    Error, ErrorFor,
};

use core::cell::RefCell;
use diskio::{DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{error, info, warn};
#[cfg(feature = "log")]
use log::{error, info, warn};

/// SD card drive of the filesystem.
///
/// Wraps a [`CardSession`] behind the [`DiskioDevice`] contract and provides
/// the directory entry timestamp from a [`TimeSource`].
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Time` - Source of the current time.
/// `Config` - Config implementation of driver config trait.
pub struct SdCardDisk<
    Spi: Transfer<u8> + SpiClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdCardConfig = DefaultSdCardConfig,
> {
    session: RefCell<CardSession<Spi, Cs, Config>>,
    time: Time,
}

impl<Spi, Cs, Time, Config> SdCardDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + SpiClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdCardConfig,
{
    /// Creates a new [`SdCardDisk<Spi, Cs, Time, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `time` - clock for file timestamps.
    pub fn new(spi: Spi, cs: Cs, time: Time) -> Self {
        SdCardDisk {
            session: RefCell::new(CardSession::new(spi, cs)),
            time,
        }
    }

    /// Current time packed for a FAT directory entry.
    pub fn current_timestamp(&self) -> u32 {
        self.time.get_timestamp().to_fat()
    }

    /// Takes the drive apart.
    pub fn into_inner(self) -> (CardSession<Spi, Cs, Config>, Time) {
        (self.session.into_inner(), self.time)
    }

    /// Initialize the card, trying up to `INIT_ATTEMPTS` times.
    fn init_with_retries(
        session: &mut CardSession<Spi, Cs, Config>,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let mut attempt = 1;

        loop {
            match session.initialize() {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= Config::INIT_ATTEMPTS => {
                    error!("SD not mounted after {} attempt(s)", attempt);
                    return Err(err);
                }
                Err(_) => {
                    warn!("SD mount attempt {} failed, retrying", attempt);
                    attempt += 1;
                }
            }
        }
    }

    /// Validate buffer for read/write.
    fn validate_buffer_len(buf_len: usize) -> Result<(), DiskioError<ErrorFor<Spi, Cs>>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            warn!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Sector number of `lba`.
    fn convert_lba(lba: Lba) -> Result<u32, DiskioError<ErrorFor<Spi, Cs>>> {
        u32::try_from(lba).map_err(|_| {
            warn!("SD sector out of range");
            DiskioError::InvalidArgument
        })
    }

    /// Run `f` on a ready session, mounting the card first if needed.
    fn with_ready_session<F>(&self, f: F) -> Result<(), DiskioError<ErrorFor<Spi, Cs>>>
    where
        F: FnOnce(&mut CardSession<Spi, Cs, Config>) -> Result<(), ErrorFor<Spi, Cs>>,
    {
        let mut session = self.session.borrow_mut();

        if !session.is_ready() {
            Self::init_with_retries(&mut session).map_err(|_| DiskioError::NotInitialized)?;
        }

        f(&mut session).map_err(DiskioError::Hardware)
    }
}

impl<Spi, Cs, Time, Config> DiskioDevice for SdCardDisk<Spi, Cs, Time, Config>
where
    Spi: Transfer<u8> + SpiClock,
    Cs: OutputSwitch,
    Time: TimeSource,
    Config: SdCardConfig,
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = Error<Spi::Error, Cs::Error>;

    fn status(&self) -> Status {
        let session = self.session.borrow();

        if session.is_ready() {
            Status::default()
        } else if session.last_outcome() == Some(false) {
            StatusFlag::ErrorOccured | StatusFlag::NotInitialized
        } else {
            StatusFlag::NotInitialized.into()
        }
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.session.get_mut().invalidate();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::init_with_retries(self.session.get_mut()).map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        let sector = Self::convert_lba(lba)?;

        self.with_ready_session(|session| session.read_sectors(sector, buf))
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        Self::validate_buffer_len(buf.len())?;
        let sector = Self::convert_lba(lba)?;

        self.with_ready_session(|session| session.write_sectors(sector, buf))
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            // Writes complete before `write` returns.
            IoctlCmd::CtrlSync => Ok(()),
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{SimCard, SimCs, SimSpi, TestConfig};
    use crate::{consts::commands, Timestamp};

    struct FixedClock(Timestamp);

    impl TimeSource for FixedClock {
        fn get_timestamp(&self) -> Timestamp {
            self.0
        }
    }

    type Disk = SdCardDisk<SimSpi, SimCs, FixedClock, TestConfig>;

    fn disk(sim: &SimCard) -> Disk {
        let (spi, cs) = sim.split();
        SdCardDisk::new(spi, cs, FixedClock(Timestamp::new(2024, 3, 15, 13, 45, 30)))
    }

    fn resets(sim: &SimCard) -> usize {
        sim.commands()
            .iter()
            .filter(|c| c.index == commands::CMD0)
            .count()
    }

    #[test]
    fn status_follows_initialization() {
        let sim = SimCard::new();
        let mut disk = disk(&sim);

        assert!(disk.status().contains(StatusFlag::NotInitialized));
        assert!(!disk.status().contains(StatusFlag::ErrorOccured));
        disk.initialize().unwrap();
        assert!(!disk.status().contains(StatusFlag::NotInitialized));
        assert!(!disk.status().contains(StatusFlag::ErrorOccured));

        disk.reset();
        assert!(disk.status().contains(StatusFlag::NotInitialized));
    }

    #[test]
    fn initialize_retries_before_failing() {
        let sim = SimCard::new();
        sim.set_present(false);
        let mut disk = disk(&sim);

        assert!(matches!(
            disk.initialize(),
            Err(DiskioError::Hardware(Error::TimeoutCommand(commands::CMD0)))
        ));
        assert_eq!(resets(&sim), TestConfig::INIT_ATTEMPTS);
        assert!(disk.status().contains(StatusFlag::ErrorOccured));
        assert!(disk.status().contains(StatusFlag::NotInitialized));
    }

    #[test]
    fn initialize_runs_again_when_ready() {
        let sim = SimCard::new();
        let mut disk = disk(&sim);

        disk.initialize().unwrap();
        disk.initialize().unwrap();

        assert_eq!(resets(&sim), 2);
    }

    #[test]
    fn read_mounts_card_on_demand() {
        let sim = SimCard::new();
        sim.set_sector(3, &[0x3C; BLOCK_SIZE]);
        let disk = disk(&sim);

        let mut buf = [0u8; BLOCK_SIZE];
        disk.read(&mut buf, 3).unwrap();

        assert_eq!(buf, [0x3C; BLOCK_SIZE]);
        assert_eq!(resets(&sim), 1);
    }

    #[test]
    fn io_on_missing_card_is_not_initialized() {
        let sim = SimCard::new();
        sim.set_present(false);
        let disk = disk(&sim);

        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            disk.read(&mut buf, 0),
            Err(DiskioError::NotInitialized)
        ));
        assert_eq!(resets(&sim), TestConfig::INIT_ATTEMPTS);
    }

    #[test]
    fn multi_sector_round_trip() {
        let sim = SimCard::new();
        let mut disk = disk(&sim);
        disk.initialize().unwrap();

        let data: std::vec::Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i / 7) as u8).collect();
        disk.write(&data, 40).unwrap();

        let mut read = [0u8; 2 * BLOCK_SIZE];
        disk.read(&mut read, 40).unwrap();

        assert_eq!(read[..], data[..]);
        assert_eq!(sim.sector(41)[..], data[BLOCK_SIZE..]);
    }

    #[test]
    fn invalid_buffers_are_rejected() {
        let sim = SimCard::new();
        let disk = disk(&sim);

        let mut short = [0u8; 511];
        assert!(matches!(
            disk.read(&mut short, 0),
            Err(DiskioError::InvalidArgument)
        ));
        assert!(matches!(
            disk.write(&[], 0),
            Err(DiskioError::InvalidArgument)
        ));
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn sector_beyond_u32_is_rejected() {
        let sim = SimCard::new();
        let disk = disk(&sim);

        let lba = u32::MAX as Lba + 1;
        assert!(matches!(
            disk.write(&[0u8; BLOCK_SIZE], lba),
            Err(DiskioError::InvalidArgument)
        ));
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn rejected_write_is_hardware_error() {
        let sim = SimCard::new();
        let mut disk = disk(&sim);
        disk.initialize().unwrap();
        sim.set_data_response(0x0D);

        assert!(matches!(
            disk.write(&[1u8; BLOCK_SIZE], 0),
            Err(DiskioError::Hardware(Error::WriteError(0x0D)))
        ));
        assert!(!disk.status().contains(StatusFlag::NotInitialized));
    }

    #[test]
    fn ioctl_sync_and_block_size() {
        let sim = SimCard::new();
        let disk = disk(&sim);

        assert!(disk.ioctl(IoctlCmd::CtrlSync).is_ok());

        let mut block_size = 0;
        assert!(disk.ioctl(IoctlCmd::GetBlockSize(&mut block_size)).is_ok());
        assert_eq!(block_size, BLOCK_SIZE);
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn timestamp_comes_from_time_source() {
        let sim = SimCard::new();
        let disk = disk(&sim);

        assert_eq!(disk.current_timestamp(), 0x586F_6DAF);
    }

    #[test]
    fn into_inner_gives_back_session() {
        let sim = SimCard::new();
        let mut disk = disk(&sim);
        disk.initialize().unwrap();

        let (session, clock) = disk.into_inner();
        assert!(session.is_ready());
        assert_eq!(clock.0.year, 2024);
    }
}
