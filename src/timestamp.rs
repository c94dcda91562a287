//! FAT directory entry timestamps.

/// Calendar time as kept by the station clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Timestamp {
    /// Full year, e.g. 2024.
    pub year: u16,
    /// 1-12.
    pub month: u8,
    /// 1-31.
    pub day: u8,
    /// 0-23.
    pub hours: u8,
    /// 0-59.
    pub minutes: u8,
    /// 0-59.
    pub seconds: u8,
}

impl Timestamp {
    /// First year a FAT timestamp can hold.
    pub const FAT_EPOCH_YEAR: u16 = 1980;
    /// Last year a FAT timestamp can hold.
    pub const FAT_LAST_YEAR: u16 = Self::FAT_EPOCH_YEAR + 0x7F;

    /// Creates a new [`Timestamp`] from calendar fields.
    pub fn new(year: u16, month: u8, day: u8, hours: u8, minutes: u8, seconds: u8) -> Self {
        Timestamp {
            year,
            month,
            day,
            hours,
            minutes,
            seconds,
        }
    }

    /// Packs the time into the 32 bit FAT layout:
    ///
    /// ```text
    /// 31..25 year - 1980 | 24..21 month | 20..16 day
    /// 15..11 hours | 10..5 minutes | 4..0 seconds / 2
    /// ```
    ///
    /// Years outside 1980-2107 are clamped, out of range fields are masked to
    /// their width.
    pub fn to_fat(&self) -> u32 {
        let year = self
            .year
            .clamp(Self::FAT_EPOCH_YEAR, Self::FAT_LAST_YEAR)
            - Self::FAT_EPOCH_YEAR;

        (u32::from(year) << 25)
            | (u32::from(self.month & 0x0F) << 21)
            | (u32::from(self.day & 0x1F) << 16)
            | (u32::from(self.hours & 0x1F) << 11)
            | (u32::from(self.minutes & 0x3F) << 5)
            | u32::from((self.seconds >> 1) & 0x1F)
    }

    /// Unpacks a FAT timestamp. Seconds come back rounded down to even.
    pub fn from_fat(packed: u32) -> Self {
        Timestamp {
            year: Self::FAT_EPOCH_YEAR + (packed >> 25) as u16,
            month: ((packed >> 21) & 0x0F) as u8,
            day: ((packed >> 16) & 0x1F) as u8,
            hours: ((packed >> 11) & 0x1F) as u8,
            minutes: ((packed >> 5) & 0x3F) as u8,
            seconds: ((packed & 0x1F) << 1) as u8,
        }
    }
}

/// Source of the current time for file timestamps.
pub trait TimeSource {
    /// Current local time.
    fn get_timestamp(&self) -> Timestamp;
}
