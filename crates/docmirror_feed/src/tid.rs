//! Conversion between tids and wall-clock time.
//!
//! A tid is a 64-bit timestamp. The high 32 bits count minutes since
//! 1900-01-01T00:00Z in a calendar where every month has 31 days:
//! `((((year - 1900) * 12 + month - 1) * 31 + day - 1) * 24 + hour) * 60 + minute`.
//! The low 32 bits hold the seconds within that minute, scaled by
//! `2^32 / 60`.

use crate::record::Tid;
use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};

/// Seconds represented by one unit of the low word.
const SECONDS_PER_UNIT: f64 = 60.0 / 4_294_967_296.0;

/// Splits a tid into calendar fields and fractional seconds.
fn fields(tid: Tid) -> Option<(i32, u32, u32, u32, u32, f64)> {
    let tid = u64::try_from(tid).ok()?;
    let mut v = tid >> 32;
    let low = tid & 0xffff_ffff;
    let minute = (v % 60) as u32;
    v /= 60;
    let hour = (v % 24) as u32;
    v /= 24;
    let day = (v % 31) as u32 + 1;
    v /= 31;
    let month = (v % 12) as u32 + 1;
    v /= 12;
    let year = i32::try_from(v).ok()? + 1900;
    Some((year, month, day, hour, minute, low as f64 * SECONDS_PER_UNIT))
}

/// The commit time embedded in a tid, or `None` for negative tids and
/// impossible dates.
pub fn tid_to_datetime(tid: Tid) -> Option<DateTime<Utc>> {
    let (year, month, day, hour, minute, seconds) = fields(tid)?;
    let base = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, 0)?
        .and_utc();
    let micros = (seconds * 1_000_000.0) as i64;
    Some(base + TimeDelta::microseconds(micros))
}

/// Seconds since the Unix epoch, with sub-second precision.
pub fn tid_to_seconds(tid: Tid) -> Option<f64> {
    let (year, month, day, hour, minute, seconds) = fields(tid)?;
    let whole = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, 0)?
        .and_utc()
        .timestamp();
    Some(whole as f64 + seconds)
}

/// The tid a transaction committed at `at` would get.
pub fn timestamp_to_tid(at: DateTime<Utc>) -> Tid {
    let minutes = ((((i64::from(at.year()) - 1900) * 12 + i64::from(at.month0())) * 31
        + i64::from(at.day0()))
        * 24
        + i64::from(at.hour()))
        * 60
        + i64::from(at.minute());
    let seconds = f64::from(at.second()) + f64::from(at.nanosecond() % 1_000_000_000) / 1e9;
    let low = ((seconds / SECONDS_PER_UNIT) as u64).min(0xffff_ffff);
    (minutes << 32) | low as i64
}

/// Seconds between the commits of two tids (`later - earlier`).
pub fn lag_seconds(earlier: Tid, later: Tid) -> Option<f64> {
    Some(tid_to_seconds(later)? - tid_to_seconds(earlier)?)
}
