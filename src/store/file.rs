//! JSON file backed statistics store
//!
//! The whole table is held in memory and rewritten after every mutation via a
//! temporary file and rename, so a crash leaves either the old or the new file
//! on disk. The save and the in-memory swap run in their own task: a caller
//! that stops waiting (a timeout, a dropped future) cannot leave the file and
//! the table disagreeing.

use super::{SeriesTable, StatisticsStore};
use crate::error::{GridstatError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::model::{StatisticPoint, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(flatten)]
    table: SeriesTable,
}

pub struct JsonFileStore {
    path: PathBuf,
    table: Arc<RwLock<SeriesTable>>,
    logger: StructuredLogger,
}

impl JsonFileStore {
    /// Open the store, loading existing contents if the file is present
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let logger = get_logger("store");

        let table = if tokio::fs::try_exists(&path).await? {
            let contents = tokio::fs::read_to_string(&path).await?;
            let file: StoreFile = serde_json::from_str(&contents)?;
            if file.version != FORMAT_VERSION {
                return Err(GridstatError::store(format!(
                    "unsupported statistics file version {}",
                    file.version
                )));
            }
            logger.info(&format!(
                "Loaded {} series from {}",
                file.table.series.len(),
                path.display()
            ));
            file.table
        } else {
            logger.info("No statistics file found, starting empty");
            SeriesTable::default()
        };

        Ok(Self {
            path,
            table: Arc::new(RwLock::new(table)),
            logger,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a mutation to a scratch copy and commit it only if saving succeeds
    async fn mutate<T>(&self, f: impl FnOnce(&mut SeriesTable) -> Result<T>) -> Result<T> {
        let mut guard = self.table.clone().write_owned().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if next == *guard {
            return Ok(out);
        }

        let path = self.path.clone();
        let logger = self.logger.clone();
        let commit = tokio::spawn(async move {
            persist(&path, &next).await?;
            *guard = next;
            logger.trace("Saved statistics to disk");
            Ok::<(), GridstatError>(())
        });
        commit
            .await
            .map_err(|e| GridstatError::store(format!("statistics commit task failed: {}", e)))??;
        Ok(out)
    }
}

async fn persist(path: &Path, table: &SeriesTable) -> Result<()> {
    let file = StoreFile {
        version: FORMAT_VERSION,
        table: table.clone(),
    };
    let contents = serde_json::to_vec(&file)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl StatisticsStore for JsonFileStore {
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
        self.mutate(|t| t.append(key, points)).await
    }

    async fn delete_points(&self, key: &str, range: TimeRange) -> Result<usize> {
        self.mutate(|t| Ok(t.delete(key, range))).await
    }

    async fn insert_points(&self, key: &str, points: &[StatisticPoint]) -> Result<()> {
        self.mutate(|t| t.insert(key, points)).await
    }

    async fn replace_points(
        &self,
        key: &str,
        range: TimeRange,
        points: &[StatisticPoint],
    ) -> Result<usize> {
        self.mutate(|t| t.replace(key, range, points)).await
    }

    async fn series_keys(&self) -> Result<Vec<String>> {
        Ok(self.table.read().await.keys())
    }
}
