use super::{SeriesTable, StatisticsStore};
use crate::error::Result;
use crate::model::{StatisticPoint, TimeRange};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Volatile store, used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<SeriesTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full copy of one series
    pub async fn series(&self, key: &str) -> Vec<StatisticPoint> {
        self.table
            .read()
            .await
            .series
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl StatisticsStore for MemoryStore {
    async fn get_last_point(&self, key: &str) -> Result<Option<StatisticPoint>> {
        Ok(self.table.read().await.last(key))
    }

    async fn get_last_point_before(
        &self,
        key: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<StatisticPoint>> {
        Ok(self.table.read().await.last_before(key, before))
    }

    async fn get_points(&self, key: &str, range: TimeRange) -> Result<Vec<StatisticPoint>> {
        Ok(self.table.read().await.range(key, range))
    }

    async fn append_points(&self, key: &str, points: &[StatisticPoint]) -> Result<()> {
        self.table.write().await.append(key, points)
    }

    async fn delete_points(&self, key: &str, range: TimeRange) -> Result<usize> {
        Ok(self.table.write().await.delete(key, range))
    }

    async fn insert_points(&self, key: &str, points: &[StatisticPoint]) -> Result<()> {
        self.table.write().await.insert(key, points)
    }

    async fn replace_points(
        &self,
        key: &str,
        range: TimeRange,
        points: &[StatisticPoint],
    ) -> Result<usize> {
        self.table.write().await.replace(key, range, points)
    }

    async fn series_keys(&self) -> Result<Vec<String>> {
        Ok(self.table.read().await.keys())
    }
}
