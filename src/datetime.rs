//! Timestamp conversions shared by the RAR, ZIP and TAR parsers.
//!
//! All formats ultimately expose `entry.filetime()` as 100ns ticks since
//! 1601-01-01 00:00:00 UTC (the Windows `FILETIME` epoch), adapted here to
//! [`chrono::DateTime<Utc>`] following the teacher's `parse/date_time.rs`
//! conventions.

use chrono::{offset::LocalResult, DateTime, TimeZone, Timelike, Utc};

/// Number of 100ns ticks in one second.
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Offset in seconds between the 1601-01-01 FILETIME epoch and the 1970-01-01
/// Unix epoch.
const FILETIME_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// Convert a DOS date/time pair (as used by ZIP local/central headers and by
/// RAR's packed `dosdate` field) to a UTC timestamp.
///
/// `date` bits: `[0:5]=day, [5:9]=month, [9:16]=year-1980`.
/// `time` bits: `[0:5]=sec/2, [5:11]=min, [11:16]=hour`.
pub fn dos_datetime_to_utc(date: u16, time: u16) -> Option<DateTime<Utc>> {
    let d = (date & 0b1_1111) as u32;
    let m = ((date >> 5) & 0b1111) as u32;
    let y = ((date >> 9) + 1980) as i32;
    let base = match Utc.with_ymd_and_hms(y, m.max(1), d.max(1), 0, 0, 0) {
        LocalResult::Single(dt) => dt,
        _ => return None,
    };

    let s = (time & 0b1_1111) as u32 * 2;
    let mi = (time >> 5 & 0b11_1111) as u32;
    let h = (time >> 11) as u32;
    base.with_hour(h)?.with_minute(mi)?.with_second(s)
}

/// Convert a RAR entry's packed 32-bit `dosdate` field (high 16 bits = DOS
/// date, low 16 bits = DOS time — the same layout `DosDateTimeToFileTime`
/// expects) to a UTC timestamp.
pub fn rar_dosdate_to_utc(dosdate: u32) -> Option<DateTime<Utc>> {
    let time = (dosdate & 0xFFFF) as u16;
    let date = (dosdate >> 16) as u16;
    dos_datetime_to_utc(date, time)
}

/// Convert a count of 100ns ticks since the FILETIME epoch (1601-01-01 UTC)
/// to a UTC timestamp. This is the representation `entry.filetime()` uses
/// across all four formats.
pub fn filetime_ticks_to_utc(ticks: i64) -> Option<DateTime<Utc>> {
    let secs_since_epoch = ticks.div_euclid(TICKS_PER_SECOND) - FILETIME_EPOCH_OFFSET_SECS;
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    match Utc.timestamp_opt(secs_since_epoch, nanos) {
        LocalResult::Single(dt) => Some(dt),
        _ => None,
    }
}

/// Convert a UTC timestamp to FILETIME ticks, the inverse of
/// [`filetime_ticks_to_utc`].
pub fn utc_to_filetime_ticks(dt: DateTime<Utc>) -> i64 {
    (dt.timestamp() + FILETIME_EPOCH_OFFSET_SECS) * TICKS_PER_SECOND
        + dt.timestamp_subsec_nanos() as i64 / 100
}

/// Convert a TAR `mtime` (decimal seconds since the Unix epoch, as found in
/// both the classic octal field and PAX `mtime` records) to FILETIME ticks,
/// matching `(seconds + 11644473600) * 10^7` from the reference parser.
pub fn tar_mtime_secs_to_filetime_ticks(seconds: f64) -> i64 {
    ((seconds + FILETIME_EPOCH_OFFSET_SECS as f64) * TICKS_PER_SECOND as f64) as i64
}

/// A timestamp in NTFS/ZIP-extra-field format: 100ns ticks since
/// 1601-01-01 00:00:00 UTC, stored directly as a `u64`.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct NtfsTimestamp {
    /// Raw tick count.
    pub ticks: u64,
}

impl NtfsTimestamp {
    /// Convert to a UTC timestamp.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        filetime_ticks_to_utc(self.ticks as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_datetime_roundtrip() {
        // 2023-06-15 13:42:10 (odd second truncates to even on encode, so
        // pick an even second to keep this a clean round-trip).
        let date = ((2023 - 1980) << 9) | (6 << 5) | 15;
        let time = (13 << 11) | (42 << 5) | (10 / 2);
        let dt = dos_datetime_to_utc(date as u16, time as u16).unwrap();
        assert_eq!(dt.to_string(), "2023-06-15 13:42:10 UTC");
    }

    #[test]
    fn filetime_roundtrip_is_idempotent_within_resolution() {
        let original = Utc.with_ymd_and_hms(2001, 9, 9, 1, 46, 40).unwrap();
        let ticks = utc_to_filetime_ticks(original);
        let back = filetime_ticks_to_utc(ticks).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn tar_mtime_matches_filetime_formula() {
        // 2000-01-01 00:00:00 UTC = 946684800 unix seconds
        let ticks = tar_mtime_secs_to_filetime_ticks(946_684_800.0);
        let dt = filetime_ticks_to_utc(ticks).unwrap();
        assert_eq!(dt.to_string(), "2000-01-01 00:00:00 UTC");
    }
}
