//! DOS/FAT timestamps: two-second resolution, 1980 epoch
//!
//! Encoded in UTC so archives are byte-identical regardless of the writer's
//! timezone.

use chrono::{DateTime, Datelike, NaiveDate, Timelike};

/// 1980-01-01T00:00:00Z as a UNIX timestamp
pub const DOS_EPOCH: u64 = 315_532_800;

/// Date word for 1980-01-01
const EPOCH_DATE: u16 = (1 << 5) | 1;

/// Encode a UNIX timestamp as `(time, date)` words
pub fn to_dos(timestamp: u64) -> (u16, u16) {
    if timestamp <= DOS_EPOCH {
        return (0, EPOCH_DATE);
    }
    let Some(moment) = DateTime::from_timestamp(timestamp.min(i64::MAX as u64) as i64, 0) else {
        return (0, EPOCH_DATE);
    };
    let year = moment.year();
    if year > 1980 + 127 {
        // Last representable instant: 2107-12-31 23:59:58
        return ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);
    }

    let time = ((moment.hour() << 11) | (moment.minute() << 5) | (moment.second() >> 1)) as u16;
    let date = (((year - 1980) as u32) << 9 | (moment.month() << 5) | moment.day()) as u16;
    (time, date)
}

/// Decode `(time, date)` words; impossible dates fall back to the DOS epoch
pub fn from_dos(time: u16, date: u16) -> u64 {
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = (time >> 11) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|dt| dt.and_utc().timestamp().max(0) as u64)
        .unwrap_or(DOS_EPOCH)
}
