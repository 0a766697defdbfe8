//! Timestamp conversion between the three clocks ZIP carries.
//!
//! Every entry has an MS-DOS date/time (local wall clock, two-second
//! resolution). Entries may additionally carry NTFS FILETIME values (100ns
//! ticks since 1601-01-01 UTC) or Unix seconds in vendor extra fields.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

/// 100ns ticks between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: i64 = 116_444_736_000_000_000;

/// Ticks per second in a FILETIME.
const FILETIME_TICKS_PER_SECOND: i64 = 10_000_000;

/// Packed MS-DOS date and time, exactly as stored in the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DosDateTime {
    /// Bits 15-9 year since 1980, 8-5 month, 4-0 day.
    pub date: u16,
    /// Bits 15-11 hour, 10-5 minute, 4-0 seconds / 2.
    pub time: u16,
}

impl Default for DosDateTime {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl DosDateTime {
    /// 1980-01-01 00:00:00, the earliest representable value.
    pub const EPOCH: DosDateTime = DosDateTime {
        date: (1 << 5) | 1,
        time: 0,
    };

    /// 2107-12-31 23:59:58, the latest representable value.
    pub const MAX: DosDateTime = DosDateTime {
        date: (127 << 9) | (12 << 5) | 31,
        time: (23 << 11) | (59 << 5) | 29,
    };

    /// Wrap raw header fields.
    pub fn new(date: u16, time: u16) -> Self {
        Self { date, time }
    }

    /// Convert a wall-clock value, clamping to the representable range.
    pub fn from_naive(dt: &NaiveDateTime) -> Self {
        let year = dt.year();
        if year < 1980 {
            return Self::EPOCH;
        }
        if year > 2107 {
            return Self::MAX;
        }
        let date = (((year - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
        let time = ((dt.hour() as u16) << 11)
            | ((dt.minute() as u16) << 5)
            | ((dt.second() as u16) / 2);
        Self { date, time }
    }

    /// Wall-clock value. Invalid fields decode as the epoch.
    pub fn to_naive(self) -> NaiveDateTime {
        let year = 1980 + i32::from(self.date >> 9);
        let month = u32::from((self.date >> 5) & 0x0F);
        let day = u32::from(self.date & 0x1F);
        let hour = u32::from(self.time >> 11);
        let minute = u32::from((self.time >> 5) & 0x3F);
        let second = u32::from(self.time & 0x1F) * 2;

        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, second))
            .unwrap_or_else(dos_epoch)
    }

    /// Convert an absolute time through the host's local time zone.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self::from_naive(&dt.with_timezone(&Local).naive_local())
    }

    /// Interpret as host-local wall clock and convert to UTC.
    pub fn to_datetime(self) -> DateTime<Utc> {
        let naive = self.to_naive();
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }

    /// The time now, in DOS form.
    pub fn now() -> Self {
        Self::from_naive(&Local::now().naive_local())
    }
}

fn dos_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// High-precision times from NTFS or Unix extra fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTimes {
    /// Last modification.
    pub modified: DateTime<Utc>,
    /// Last access.
    pub accessed: DateTime<Utc>,
    /// Creation.
    pub created: DateTime<Utc>,
}

impl EntryTimes {
    /// All three times set to the same instant.
    pub fn uniform(at: DateTime<Utc>) -> Self {
        Self {
            modified: at,
            accessed: at,
            created: at,
        }
    }
}

/// Which high-precision time blocks to emit when writing an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeFormats {
    /// NTFS FILETIME block (0x000A).
    pub ntfs: bool,
    /// Unix extended timestamp block (0x5455).
    pub unix: bool,
}

impl Default for TimeFormats {
    fn default() -> Self {
        Self {
            ntfs: true,
            unix: false,
        }
    }
}

impl TimeFormats {
    /// Emit no high-precision blocks.
    pub const NONE: TimeFormats = TimeFormats {
        ntfs: false,
        unix: false,
    };
}

/// FILETIME ticks to UTC. `None` if out of chrono's range.
pub fn filetime_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    let rel = i64::try_from(ticks).ok()? - FILETIME_UNIX_EPOCH;
    let secs = rel.div_euclid(FILETIME_TICKS_PER_SECOND);
    let nanos = (rel.rem_euclid(FILETIME_TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// UTC to FILETIME ticks, saturating at zero for dates before 1601.
pub fn datetime_to_filetime(dt: DateTime<Utc>) -> u64 {
    let ticks = dt
        .timestamp()
        .saturating_mul(FILETIME_TICKS_PER_SECOND)
        .saturating_add(i64::from(dt.timestamp_subsec_nanos() / 100))
        .saturating_add(FILETIME_UNIX_EPOCH);
    ticks.max(0) as u64
}

/// Unix seconds (signed 32-bit, as stored in 0x5455) to UTC.
pub fn unix_to_datetime(secs: i32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::from(secs), 0)
}

/// UTC to Unix seconds, clamped to the signed 32-bit range.
pub fn datetime_to_unix(dt: DateTime<Utc>) -> i32 {
    dt.timestamp().clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
