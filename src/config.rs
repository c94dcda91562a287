use fugit::HertzU32;

/// Represents config for [`CardSession`](crate::CardSession) and
/// [`SdCardDisk`](crate::SdCardDisk).
///
/// Every wait is a bounded number of bus polls, so the real duration of a
/// timeout scales with the clock rate.
pub trait SdCardConfig {
    /// Count of `0xFF` bytes clocked with chip select deasserted to wake the card
    /// into SPI mode.
    const WAKE_UP_BYTES: usize;
    /// Max polls for a command response or a data start token.
    const RESPONSE_ATTEMPTS: usize;
    /// Max polls for the card to release the busy signal.
    const BUSY_ATTEMPTS: usize;
    /// Max CMD55/ACMD41 rounds while the card leaves the idle state.
    const OP_COND_ATTEMPTS: usize;
    /// Count of dummy cycles between two ACMD41 rounds.
    const OP_COND_DELAY_CYCLES: usize;
    /// Max full initialization attempts before a failure is reported.
    const INIT_ATTEMPTS: usize;
    /// Clock used during card identification.
    const SLOW_CLOCK: HertzU32;
    /// Clock used once the card is ready.
    const NOMINAL_CLOCK: HertzU32;
}

/// Default implementation of [`SdCardConfig`](crate::SdCardConfig).
#[derive(Debug)]
pub struct DefaultSdCardConfig;

impl SdCardConfig for DefaultSdCardConfig {
    const WAKE_UP_BYTES: usize = 100;
    const RESPONSE_ATTEMPTS: usize = 1600;
    const BUSY_ATTEMPTS: usize = 1600;
    const OP_COND_ATTEMPTS: usize = 1600;
    const OP_COND_DELAY_CYCLES: usize = 10_000;
    const INIT_ATTEMPTS: usize = 100;
    const SLOW_CLOCK: HertzU32 = HertzU32::from_raw(400_000);
    const NOMINAL_CLOCK: HertzU32 = HertzU32::from_raw(1_000_000);
}
