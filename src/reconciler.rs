//! Statistics reconciler
//!
//! Writes candidate series into the store. Hourly series are continued (or,
//! on a forced refresh, rebuilt) strictly before the cutoff; interval series
//! are cleared and rewritten inside `[cutoff, now)`. Before any hourly write
//! the sibling interval series is checked so the two never share a timestamp.

use crate::error::{FailureKind, GridstatError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::model::{
    CandidatePoint, CandidateSeries, FeedKind, SeriesKey, SeriesOutcome, SeriesStatus,
    StatisticPoint, TimeRange,
};
use crate::planner::WriteMode;
use crate::store::StatisticsStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub struct Reconciler {
    store: Arc<dyn StatisticsStore>,
    store_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: watch::Receiver<bool>,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StatisticsStore>,
        store_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            store_timeout,
            locks: Mutex::new(HashMap::new()),
            shutdown,
            logger: get_logger("reconciler"),
        }
    }

    /// Write one candidate series and report what happened
    pub async fn reconcile(
        &self,
        series: &CandidateSeries,
        mode: WriteMode,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SeriesOutcome {
        let id = series.key.statistic_id();
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        let result = match mode {
            WriteMode::Continue => self.continue_series(series, cutoff).await,
            WriteMode::Rebuild => self.rebuild_series(series, cutoff).await,
            WriteMode::Replace => self.replace_series(series, cutoff, now).await,
            WriteMode::ViewOnly => Ok((0, 0)),
        };

        let logger = self.logger.for_service_point(&series.key.service_point);
        match result {
            Ok((written, deferred)) => {
                if deferred > 0 {
                    logger.debug(&format!(
                        "{}: {} points at or after cutoff {} deferred",
                        id, deferred, cutoff
                    ));
                }
                SeriesOutcome {
                    key: id,
                    feed: series.key.feed,
                    written,
                    deferred,
                    status: if written > 0 {
                        SeriesStatus::Written
                    } else {
                        SeriesStatus::Unchanged
                    },
                    failure: None,
                    message: None,
                }
            }
            Err(e) => {
                let status = match &e {
                    GridstatError::Cancelled { .. } => SeriesStatus::Cancelled,
                    e if e.kind() == FailureKind::InvariantViolation => SeriesStatus::Skipped,
                    _ => SeriesStatus::Failed,
                };
                logger.warn(&format!("{} not written: {}", id, e));
                SeriesOutcome {
                    key: id,
                    feed: series.key.feed,
                    written: 0,
                    deferred: 0,
                    status,
                    failure: (status != SeriesStatus::Cancelled).then(|| e.kind()),
                    message: Some(e.to_string()),
                }
            }
        }
    }

    /// Remove interval points that fell behind the cutoff
    pub async fn prune_interval(&self, key: &SeriesKey, cutoff: DateTime<Utc>) -> Result<usize> {
        let id = key.statistic_id();
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        self.check_cancelled()?;
        let removed = self
            .bounded(self.store.delete_points(&id, TimeRange::new(DateTime::<Utc>::MIN_UTC, cutoff)))
            .await?;
        if removed > 0 {
            self.logger
                .debug(&format!("{}: pruned {} points before {}", id, removed, cutoff));
        }
        Ok(removed)
    }

    pub async fn last_point(&self, key: &SeriesKey) -> Result<Option<StatisticPoint>> {
        self.bounded(self.store.get_last_point(&key.statistic_id()))
            .await
    }

    /// Append candidates strictly newer than the last stored point
    async fn continue_series(
        &self,
        series: &CandidateSeries,
        cutoff: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let id = series.key.statistic_id();
        let (eligible, deferred) = split_at_cutoff(&series.points, cutoff);

        let last = self.bounded(self.store.get_last_point(&id)).await?;
        let fresh: Vec<CandidatePoint> = eligible
            .into_iter()
            .filter(|p| last.is_none_or(|l| p.start > l.start))
            .collect();
        let (Some(first), Some(end)) = (fresh.first(), fresh.last()) else {
            return Ok((0, deferred));
        };

        self.check_disjoint(
            &series.key,
            TimeRange::new(first.start, end.start + ChronoDuration::hours(1)),
        )
        .await?;

        let points = accumulate(&id, last, &fresh)?;
        self.check_cancelled()?;
        self.bounded(self.store.append_points(&id, &points)).await?;
        Ok((points.len(), deferred))
    }

    /// Recompute `[earliest candidate, cutoff)` from the sum just before it
    async fn rebuild_series(
        &self,
        series: &CandidateSeries,
        cutoff: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let id = series.key.statistic_id();
        let (eligible, deferred) = split_at_cutoff(&series.points, cutoff);
        let Some(earliest) = eligible.first().map(|p| p.start) else {
            return Ok((0, deferred));
        };
        let window = TimeRange::new(earliest, cutoff);

        self.check_disjoint(&series.key, window).await?;

        let seed = self
            .bounded(self.store.get_last_point_before(&id, earliest))
            .await?;
        let points = accumulate(&id, seed, &eligible)?;
        self.check_cancelled()?;
        let removed = self
            .bounded(self.store.replace_points(&id, window, &points))
            .await?;
        self.logger.debug(&format!(
            "{}: rebuilt {}..{} ({} replaced by {})",
            id,
            window.start,
            window.end,
            removed,
            points.len()
        ));
        Ok((points.len(), deferred))
    }

    /// Clear everything before `now` and write the `[cutoff, now)` candidates
    async fn replace_series(
        &self,
        series: &CandidateSeries,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let id = series.key.statistic_id();
        let window = TimeRange::new(cutoff, now);
        let in_window: Vec<CandidatePoint> = series
            .points
            .iter()
            .filter(|p| window.contains(p.start))
            .copied()
            .collect();
        let dropped = series.points.len() - in_window.len();
        if dropped > 0 {
            self.logger.debug(&format!(
                "{}: {} interval points outside {}..{} ignored",
                id, dropped, window.start, window.end
            ));
        }

        self.check_disjoint(&series.key, window).await?;

        let points = accumulate(&id, None, &in_window)?;
        self.check_cancelled()?;
        self.bounded(self.store.replace_points(
            &id,
            TimeRange::new(DateTime::<Utc>::MIN_UTC, now),
            &points,
        ))
        .await?;
        Ok((points.len(), 0))
    }

    /// Fail if the other feed of the same meter and direction has points in `range`
    async fn check_disjoint(&self, key: &SeriesKey, range: TimeRange) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let sibling = key.sibling().statistic_id();
        let clash = self.bounded(self.store.get_points(&sibling, range)).await?;
        match clash.first() {
            Some(p) => Err(GridstatError::invariant(
                key.statistic_id(),
                format!(
                    "{} series already holds {} point(s) from {}",
                    match key.feed {
                        FeedKind::Hourly => "interval",
                        FeedKind::Interval => "hourly",
                    },
                    clash.len(),
                    p.start
                ),
            )),
            None => Ok(()),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            Err(GridstatError::cancelled("shutdown requested before write"))
        } else {
            Ok(())
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(GridstatError::timeout(format!(
                "store operation exceeded {:?}",
                self.store_timeout
            ))),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(id.to_string()).or_default().clone()
    }
}

/// Candidates strictly before the cutoff, and how many were held back
fn split_at_cutoff(points: &[CandidatePoint], cutoff: DateTime<Utc>) -> (Vec<CandidatePoint>, usize) {
    let eligible: Vec<CandidatePoint> = points.iter().filter(|p| p.start < cutoff).copied().collect();
    let deferred = points.len() - eligible.len();
    (eligible, deferred)
}

/// Turn states into cumulative points on top of `seed`
fn accumulate(
    id: &str,
    seed: Option<StatisticPoint>,
    candidates: &[CandidatePoint],
) -> Result<Vec<StatisticPoint>> {
    let mut sum = seed.map(|p| p.sum).unwrap_or(0.0);
    let mut prev_start = seed.map(|p| p.start);
    let mut out = Vec::with_capacity(candidates.len());
    for c in candidates {
        if prev_start.is_some_and(|prev| c.start <= prev) {
            return Err(GridstatError::invariant(
                id,
                format!("timestamp {} does not advance the series", c.start),
            ));
        }
        if !c.state.is_finite() || c.state < 0.0 {
            return Err(GridstatError::invariant(
                id,
                format!("state {} at {} would decrease the sum", c.state, c.start),
            ));
        }
        sum += c.state;
        prev_start = Some(c.start);
        out.push(StatisticPoint {
            start: c.start,
            state: c.state,
            sum,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::parse_reading_timestamp as ts;

    fn cand(t: &str, state: f64) -> CandidatePoint {
        CandidatePoint {
            start: ts(t).unwrap(),
            state,
        }
    }

    #[test]
    fn test_accumulate_from_seed() {
        let seed = StatisticPoint {
            start: ts("2024-03-01T00:00:00Z").unwrap(),
            state: 1.0,
            sum: 10.0,
        };
        let pts = accumulate(
            "k",
            Some(seed),
            &[
                cand("2024-03-01T01:00:00Z", 1.0),
                cand("2024-03-01T02:00:00Z", 2.0),
                cand("2024-03-01T03:00:00Z", 3.0),
            ],
        )
        .unwrap();
        let sums: Vec<f64> = pts.iter().map(|p| p.sum).collect();
        assert_eq!(sums, vec![11.0, 13.0, 16.0]);
    }

    #[test]
    fn test_accumulate_rejects_regression() {
        let err = accumulate(
            "k",
            None,
            &[
                cand("2024-03-01T02:00:00Z", 1.0),
                cand("2024-03-01T01:00:00Z", 1.0),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvariantViolation);
        assert!(accumulate("k", None, &[cand("2024-03-01T01:00:00Z", -1.0)]).is_err());
    }

    #[test]
    fn test_split_at_cutoff() {
        let (eligible, deferred) = split_at_cutoff(
            &[
                cand("2024-03-07T23:00:00Z", 1.0),
                cand("2024-03-08T00:00:00Z", 1.0),
            ],
            ts("2024-03-08T00:00:00Z").unwrap(),
        );
        assert_eq!(eligible.len(), 1);
        assert_eq!(deferred, 1);
    }
}
