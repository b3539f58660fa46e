//! Unit conversion and time-window helpers
//!
//! Pure functions shared by the planner, merger and reconciler. Every window
//! is anchored on the rolling cutoff: UTC midnight of the current day, minus
//! two days. Verified hourly data lives strictly before it, interval data
//! lives in `[cutoff, now)`.

use crate::error::{GridstatError, Result};
use crate::model::{FuelType, TimeRange};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};

/// Width of the near-real-time interval window in days
pub const INTERVAL_WINDOW_DAYS: i64 = 2;

/// CCF per therm
pub const CCF_PER_THERM: f64 = 1.038;

/// Units the account API reports quantities in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorUnit {
    Kwh,
    Therms,
    Ccf,
}

impl VendorUnit {
    /// Parse the unit string the API sends; case-insensitive
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "KWH" => Some(Self::Kwh),
            "THERM" | "THERMS" => Some(Self::Therms),
            "CCF" => Some(Self::Ccf),
            _ => None,
        }
    }
}

pub fn therms_to_ccf(therms: f64) -> f64 {
    therms * CCF_PER_THERM
}

/// Convert a vendor quantity into the canonical unit of `fuel`
///
/// Electric is kWh, gas is CCF. A unit that does not belong to the fuel is an
/// anomaly; the caller drops the reading.
pub fn normalize_quantity(fuel: FuelType, unit: VendorUnit, quantity: f64) -> Result<f64> {
    if !quantity.is_finite() {
        return Err(GridstatError::anomaly(format!(
            "non-finite quantity {} for {} meter",
            quantity,
            fuel.as_str()
        )));
    }
    match (fuel, unit) {
        (FuelType::Electric, VendorUnit::Kwh) => Ok(quantity),
        (FuelType::Gas, VendorUnit::Ccf) => Ok(quantity),
        (FuelType::Gas, VendorUnit::Therms) => Ok(therms_to_ccf(quantity)),
        (fuel, unit) => Err(GridstatError::anomaly(format!(
            "unit {:?} does not match {} meter",
            unit,
            fuel.as_str()
        ))),
    }
}

/// Start of the UTC day containing `t`
pub fn floor_to_midnight_utc(t: DateTime<Utc>) -> DateTime<Utc> {
    let date = t.date_naive();
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Truncate to the top of the hour
pub fn floor_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// `floor_to_midnight_utc(now) - 2 days`
pub fn cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = floor_to_midnight_utc(now);
    midnight
        .checked_sub_signed(Duration::days(INTERVAL_WINDOW_DAYS))
        .unwrap_or(midnight)
}

/// `[cutoff, now)`
pub fn interval_window(now: DateTime<Utc>) -> TimeRange {
    TimeRange::new(cutoff(now), now)
}

/// `[cutoff - lookback_days, cutoff)`
pub fn hourly_window(now: DateTime<Utc>, lookback_days: u32) -> TimeRange {
    let end = cutoff(now);
    TimeRange::new(days_before(end, lookback_days), end)
}

/// `[now - days, now)`
pub fn trailing_window(now: DateTime<Utc>, days: u32) -> TimeRange {
    TimeRange::new(days_before(now, days), now)
}

fn days_before(t: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    t.checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Parse a vendor timestamp
///
/// Accepts RFC 3339 (`2024-03-01T13:15:00Z`, with or without fractional
/// seconds or an explicit offset) and the naive `2024-03-01 13:15:00` form,
/// which is taken as UTC.
pub fn parse_reading_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(GridstatError::validation(
        "timestamp".to_string(),
        format!("unrecognized timestamp '{}'", raw),
    ))
}

/// Parse a calendar date (`YYYY-MM-DD`) as UTC midnight
pub fn parse_reading_date(raw: &str) -> Result<DateTime<Utc>> {
    let date = chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")?;
    Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
}
