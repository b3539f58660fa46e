//! Statistics store capability
//!
//! Series are addressed by their statistic id and hold hour-grained points in
//! strictly increasing start order. Two adapters ship with the crate: an
//! in-memory store and a JSON file store.

pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use crate::error::{GridstatError, Result};
use crate::model::{StatisticPoint, TimeRange};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Persistent long-term statistics
#[async_trait::async_trait]
pub trait StatisticsStore: Send + Sync {
    /// Last point of the series, if any
    async fn get_last_point(&self, key: &str) -> Result<Option<StatisticPoint>>;

    /// Last point strictly before `before`
    async fn get_last_point_before(
        &self,
        key: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<StatisticPoint>>;

    /// Points with start inside `range`, in order
    async fn get_points(&self, key: &str, range: TimeRange) -> Result<Vec<StatisticPoint>>;

    /// Append after the last point; rejects any non-increasing start
    async fn append_points(&self, key: &str, points: &[StatisticPoint]) -> Result<()>;

    /// Delete points with start inside `range`, returning how many were removed
    async fn delete_points(&self, key: &str, range: TimeRange) -> Result<usize>;

    /// Insert points anywhere in the series; rejects duplicate starts
    async fn insert_points(&self, key: &str, points: &[StatisticPoint]) -> Result<()>;

    /// Replace everything inside `range` with `points`
    ///
    /// The default composes delete and insert; adapters that can do better
    /// override it to commit both halves at once.
    async fn replace_points(
        &self,
        key: &str,
        range: TimeRange,
        points: &[StatisticPoint],
    ) -> Result<usize> {
        check_in_range(key, range, points)?;
        let removed = self.delete_points(key, range).await?;
        self.insert_points(key, points).await?;
        Ok(removed)
    }

    /// Every series id the store holds
    async fn series_keys(&self) -> Result<Vec<String>>;
}

/// In-memory series table shared by the adapters
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub(crate) struct SeriesTable {
    pub(crate) series: BTreeMap<String, Vec<StatisticPoint>>,
}

impl SeriesTable {
    pub(crate) fn last(&self, key: &str) -> Option<StatisticPoint> {
        self.series.get(key).and_then(|v| v.last().copied())
    }

    pub(crate) fn last_before(&self, key: &str, before: DateTime<Utc>) -> Option<StatisticPoint> {
        let points = self.series.get(key)?;
        let idx = points.partition_point(|p| p.start < before);
        idx.checked_sub(1).map(|i| points[i])
    }

    pub(crate) fn range(&self, key: &str, range: TimeRange) -> Vec<StatisticPoint> {
        self.series
            .get(key)
            .map(|v| v.iter().filter(|p| range.contains(p.start)).copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn append(&mut self, key: &str, points: &[StatisticPoint]) -> Result<()> {
        let mut prev = self.last(key);
        for p in points {
            check_finite(key, p)?;
            if let Some(prev) = prev {
                if p.start <= prev.start {
                    return Err(GridstatError::invariant(
                        key,
                        format!(
                            "append at {} does not follow last point {}",
                            p.start, prev.start
                        ),
                    ));
                }
                if p.sum < prev.sum {
                    return Err(GridstatError::invariant(
                        key,
                        format!("sum decreases at {} ({} < {})", p.start, p.sum, prev.sum),
                    ));
                }
            }
            prev = Some(*p);
        }
        self.series
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(points);
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: &str, range: TimeRange) -> usize {
        let Some(points) = self.series.get_mut(key) else {
            return 0;
        };
        let before = points.len();
        points.retain(|p| !range.contains(p.start));
        let removed = before - points.len();
        if points.is_empty() {
            self.series.remove(key);
        }
        removed
    }

    pub(crate) fn insert(&mut self, key: &str, points: &[StatisticPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let existing = self.series.get(key).map(Vec::as_slice).unwrap_or(&[]);
        let mut merged: Vec<StatisticPoint> = Vec::with_capacity(existing.len() + points.len());
        merged.extend_from_slice(existing);
        for p in points {
            check_finite(key, p)?;
            merged.push(*p);
        }
        merged.sort_by_key(|p| p.start);
        if merged.windows(2).any(|w| w[0].start == w[1].start) {
            return Err(GridstatError::invariant(
                key,
                "insert would duplicate an existing start",
            ));
        }
        self.series.insert(key.to_string(), merged);
        Ok(())
    }

    pub(crate) fn replace(
        &mut self,
        key: &str,
        range: TimeRange,
        points: &[StatisticPoint],
    ) -> Result<usize> {
        check_in_range(key, range, points)?;
        // Work on a copy so a rejected insert leaves the series untouched
        let mut scratch = SeriesTable::default();
        if let Some(existing) = self.series.get(key) {
            scratch.series.insert(key.to_string(), existing.clone());
        }
        let removed = scratch.delete(key, range);
        scratch.insert(key, points)?;
        match scratch.series.remove(key) {
            Some(v) => {
                self.series.insert(key.to_string(), v);
            }
            None => {
                self.series.remove(key);
            }
        }
        Ok(removed)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }
}

fn check_finite(key: &str, p: &StatisticPoint) -> Result<()> {
    if p.state.is_finite() && p.sum.is_finite() {
        Ok(())
    } else {
        Err(GridstatError::invariant(
            key,
            format!("non-finite value at {}", p.start),
        ))
    }
}

fn check_in_range(key: &str, range: TimeRange, points: &[StatisticPoint]) -> Result<()> {
    match points.iter().find(|p| !range.contains(p.start)) {
        Some(p) => Err(GridstatError::invariant(
            key,
            format!("replacement point {} outside {}..{}", p.start, range.start, range.end),
        )),
        None => Ok(()),
    }
}
