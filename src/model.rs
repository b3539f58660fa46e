//! Domain types shared across the refresh pipeline

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuelType {
    Electric,
    Gas,
}

impl FuelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Electric => "electric",
            Self::Gas => "gas",
        }
    }

    /// Canonical unit statistics for this fuel are stored in
    pub fn canonical_unit(&self) -> &'static str {
        match self {
            Self::Electric => "kWh",
            Self::Gas => "CCF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Consumption,
    Return,
}

/// Which raw feed a series is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// Verified, delayed hourly readings
    Hourly,
    /// Unverified 15-minute readings for the last two days
    Interval,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Interval => "interval",
        }
    }
}

/// Data sets a cycle can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSet {
    Billing,
    UsageCost,
    HourlyAmi,
    Interval,
}

impl DataSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Billing => "billing",
            Self::UsageCost => "usage_cost",
            Self::HourlyAmi => "hourly_ami",
            Self::Interval => "interval",
        }
    }
}

impl fmt::Display for DataSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A remote billing account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Operating company / region code, when the API reports one
    pub region: Option<String>,
    pub meters: Vec<Meter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    /// Stable service-point number; the meter's identity
    pub service_point: String,
    pub fuel: FuelType,
    /// Has an AMI smart meter and therefore hourly / interval feeds
    pub ami: bool,
    /// Net-metered with solar return
    pub solar: bool,
    pub account_id: String,
    pub meter_number: Option<String>,
    pub premise_number: Option<String>,
}

impl Meter {
    pub fn wants_hourly(&self) -> bool {
        self.ami
    }

    pub fn wants_interval(&self) -> bool {
        self.ami && self.fuel == FuelType::Electric
    }
}

/// Usage and cost for one meter over one billing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub service_point: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Total usage in the canonical unit
    pub usage: f64,
    pub cost: f64,
}

/// Monthly usage and cost for one fuel on one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCost {
    pub account_id: String,
    pub fuel: FuelType,
    pub month_start: DateTime<Utc>,
    pub usage: f64,
    pub cost: f64,
}

/// One normalized reading from either raw feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReading {
    pub service_point: String,
    pub start: DateTime<Utc>,
    /// Quantity in the canonical unit; negative means return
    pub quantity: f64,
    /// Vendor marked the reading as returned to the grid
    pub flagged_return: bool,
}

/// Identity of one statistic series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub integration_id: String,
    pub service_point: String,
    pub fuel: FuelType,
    pub feed: FeedKind,
    pub direction: Direction,
}

impl SeriesKey {
    pub fn new(
        integration_id: &str,
        service_point: &str,
        fuel: FuelType,
        feed: FeedKind,
        direction: Direction,
    ) -> Self {
        Self {
            integration_id: integration_id.to_string(),
            service_point: service_point.to_string(),
            fuel,
            feed,
            direction,
        }
    }

    /// The same meter and direction on the other feed
    pub fn sibling(&self) -> Self {
        let feed = match self.feed {
            FeedKind::Hourly => FeedKind::Interval,
            FeedKind::Interval => FeedKind::Hourly,
        };
        Self {
            feed,
            ..self.clone()
        }
    }

    /// Stable statistic id used by the store
    pub fn statistic_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Consumption => write!(
                f,
                "{}:{}_{}_{}_usage",
                self.integration_id,
                self.service_point,
                self.fuel.as_str(),
                self.feed.as_str()
            ),
            Direction::Return => write!(
                f,
                "{}:{}_{}_return_{}_usage",
                self.integration_id,
                self.service_point,
                self.fuel.as_str(),
                self.feed.as_str()
            ),
        }
    }
}

/// A persisted statistic point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticPoint {
    pub start: DateTime<Utc>,
    /// Quantity consumed (or returned) in this hour
    pub state: f64,
    /// Cumulative quantity since the series began
    pub sum: f64,
}

/// A merged hourly quantity awaiting reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidatePoint {
    pub start: DateTime<Utc>,
    pub state: f64,
}

/// Merger output for one series key
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSeries {
    pub key: SeriesKey,
    pub unit: &'static str,
    /// Sorted by start, no duplicates
    pub points: Vec<CandidatePoint>,
}

/// Latest known values for one meter
#[derive(Debug, Clone, Serialize)]
pub struct MeterView {
    pub account_id: String,
    pub meter: Meter,
    pub billing: Option<BillingRecord>,
    pub usage_cost: Option<UsageCost>,
    pub last_hourly: Option<StatisticPoint>,
    pub last_interval: Option<StatisticPoint>,
}

/// Read-only view published after every cycle, keyed by service point
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub meters: BTreeMap<String, MeterView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Full,
    Lightweight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Success,
    Degraded,
    ReauthRequired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesStatus {
    /// New points were committed
    Written,
    /// Nothing new to write
    Unchanged,
    /// Write refused to protect ordering or disjointness
    Skipped,
    /// Store error or timeout
    Failed,
    Cancelled,
}

/// What happened to one series in a cycle
#[derive(Debug, Clone, Serialize)]
pub struct SeriesOutcome {
    pub key: String,
    pub feed: FeedKind,
    pub written: usize,
    /// Hourly candidates at or after the cutoff, left for a later cycle
    pub deferred: usize,
    pub status: SeriesStatus,
    /// Set when the write was skipped or failed
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
}

/// A structured failure recorded during a cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleFailure {
    pub account_id: Option<String>,
    pub data_set: Option<DataSet>,
    pub service_point: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one orchestrator run
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub forced: bool,
    pub plans: BTreeMap<String, PlanKind>,
    pub status: CycleStatus,
    pub series: Vec<SeriesOutcome>,
    pub failures: Vec<CycleFailure>,
    pub anomalies: usize,
}

impl CycleResult {
    pub fn written_points(&self) -> usize {
        self.series.iter().map(|s| s.written).sum()
    }

    pub fn outcome(&self, key: &SeriesKey) -> Option<&SeriesOutcome> {
        self.outcome_for(&key.statistic_id())
    }

    /// Outcome by statistic id
    pub fn outcome_for(&self, id: &str) -> Option<&SeriesOutcome> {
        self.series.iter().find(|s| s.key == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key_format() {
        let key = SeriesKey::new(
            "gridstat",
            "1234",
            FuelType::Electric,
            FeedKind::Hourly,
            Direction::Consumption,
        );
        assert_eq!(key.statistic_id(), "gridstat:1234_electric_hourly_usage");

        let ret = SeriesKey {
            direction: Direction::Return,
            ..key.clone()
        };
        assert_eq!(ret.to_string(), "gridstat:1234_electric_return_hourly_usage");
        assert_eq!(
            ret.sibling().to_string(),
            "gridstat:1234_electric_return_interval_usage"
        );
    }

    #[test]
    fn test_meter_feed_capabilities() {
        let mut meter = Meter {
            service_point: "1".into(),
            fuel: FuelType::Gas,
            ami: true,
            solar: false,
            account_id: "a".into(),
            meter_number: None,
            premise_number: None,
        };
        assert!(meter.wants_hourly());
        assert!(!meter.wants_interval());
        meter.fuel = FuelType::Electric;
        assert!(meter.wants_interval());
        meter.ami = false;
        assert!(!meter.wants_hourly());
    }
}
