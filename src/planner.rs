//! Fetch planning
//!
//! Decides, per account and cycle, which data sets to request and over which
//! windows. The nightly run (local hour 0 at the trigger minute) and forced
//! refreshes get the full plan; every other hour refreshes the interval feed
//! only.

use crate::config::{Config, FetchConfig};
use crate::model::{DataSet, PlanKind, TimeRange};
use crate::units;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// How fetched readings for a data set are written to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Kept for the snapshot only, never imported as a series
    ViewOnly,
    /// Append strictly newer points onto the stored sum
    Continue,
    /// Recompute the stored window from the earliest candidate
    Rebuild,
    /// Clear the window and write it again
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedFetch {
    pub set: DataSet,
    pub window: TimeRange,
    pub mode: WriteMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchPlan {
    pub kind: PlanKind,
    pub forced: bool,
    pub now: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub sets: Vec<PlannedFetch>,
}

impl FetchPlan {
    pub fn includes(&self, set: DataSet) -> bool {
        self.sets.iter().any(|p| p.set == set)
    }

    pub fn get(&self, set: DataSet) -> Option<&PlannedFetch> {
        self.sets.iter().find(|p| p.set == set)
    }

    pub fn is_full(&self) -> bool {
        self.kind == PlanKind::Full
    }
}

/// Per-account inputs carried across cycles
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanInput {
    pub force_full: bool,
    pub last_full_success: Option<DateTime<Utc>>,
}

/// Timezone-aware planner settings
#[derive(Debug, Clone)]
pub struct Planner {
    tz: Tz,
    trigger_minute: u32,
    fetch: FetchConfig,
}

impl Planner {
    pub fn new(tz: Tz, trigger_minute: u32, fetch: FetchConfig) -> Self {
        Self {
            tz,
            trigger_minute,
            fetch,
        }
    }

    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        Ok(Self::new(
            config.tz()?,
            config.schedule.trigger_minute,
            config.fetch.clone(),
        ))
    }

    /// Build the plan for one account at `now`
    pub fn plan(&self, now: DateTime<Utc>, input: &PlanInput) -> FetchPlan {
        let cutoff = units::cutoff(now);
        let interval = PlannedFetch {
            set: DataSet::Interval,
            window: units::interval_window(now),
            mode: WriteMode::Replace,
        };

        if !(input.force_full || self.is_nightly(now) || self.needs_catch_up(now, input)) {
            return FetchPlan {
                kind: PlanKind::Lightweight,
                forced: false,
                now,
                cutoff,
                sets: vec![interval],
            };
        }

        let (lookback, hourly_mode) = if input.force_full {
            (self.fetch.history_lookback_days, WriteMode::Rebuild)
        } else {
            (self.fetch.hourly_lookback_days, WriteMode::Continue)
        };

        FetchPlan {
            kind: PlanKind::Full,
            forced: input.force_full,
            now,
            cutoff,
            sets: vec![
                PlannedFetch {
                    set: DataSet::Billing,
                    window: units::trailing_window(now, self.fetch.billing_lookback_days),
                    mode: WriteMode::ViewOnly,
                },
                PlannedFetch {
                    set: DataSet::UsageCost,
                    window: units::trailing_window(now, self.fetch.usage_cost_lookback_days),
                    mode: WriteMode::ViewOnly,
                },
                PlannedFetch {
                    set: DataSet::HourlyAmi,
                    window: units::hourly_window(now, lookback),
                    mode: hourly_mode,
                },
                interval,
            ],
        }
    }

    fn is_nightly(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        local.hour() == 0 && local.minute() == self.trigger_minute
    }

    /// Never completed a full cycle, or the last one predates local midnight
    fn needs_catch_up(&self, now: DateTime<Utc>, input: &PlanInput) -> bool {
        match input.last_full_success {
            None => true,
            Some(last) => last < self.latest_local_midnight(now),
        }
    }

    /// Most recent local midnight at or before `now`, in UTC
    pub fn latest_local_midnight(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = now.with_timezone(&self.tz).date_naive();
        let naive = local_date.and_time(NaiveTime::MIN);
        match self.tz.from_local_datetime(&naive).earliest() {
            Some(dt) => dt.with_timezone(&Utc),
            // Midnight skipped by a DST jump; the first valid instant is an hour later
            None => self
                .tz
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| units::floor_to_midnight_utc(now)),
        }
    }
}
