//! Remote fetcher
//!
//! Runs the planned data sets against the [`UtilityApi`]: one request per
//! meter (per account for usage-cost), concurrently and bounded by a
//! semaphore. Each request gets a timeout and, for communication failures, a
//! capped exponential backoff. Authentication and rate-limit failures halt the
//! whole data set. Vendor errors are turned into [`GridstatError`] here and
//! raw records are normalized before they leave this module.

use crate::api::{
    ApiResult, RawAccount, RawBilling, RawMeter, RawReading, RawUsageCost, UtilityApi,
    types::parse_fuel,
};
use crate::config::{Config, RetryConfig};
use crate::error::{FailureKind, GridstatError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::model::{
    Account, BillingRecord, CycleFailure, DataSet, Meter, TimeRange, UsageCost, UsageReading,
};
use crate::planner::PlannedFetch;
use crate::units::{self, VendorUnit};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{self, JoinSet};

/// Exponential backoff policy for retryable failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// How a data set fetch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSetStatus {
    /// Every request succeeded
    Complete,
    /// Some requests exhausted their retries
    Partial,
    /// An authentication or rate-limit failure stopped the data set
    Halted(FailureKind),
    Cancelled,
}

/// Normalized records of one data set, keyed by service point (account id for
/// usage-cost)
#[derive(Debug, Clone)]
pub struct DataSetResult<T> {
    pub set: DataSet,
    pub status: DataSetStatus,
    pub records: BTreeMap<String, Vec<T>>,
    /// Targets whose request failed or never ran
    pub failed: BTreeSet<String>,
    pub failures: Vec<CycleFailure>,
    pub anomalies: usize,
}

impl<T> DataSetResult<T> {
    fn new(set: DataSet) -> Self {
        Self {
            set,
            status: DataSetStatus::Complete,
            records: BTreeMap::new(),
            failed: BTreeSet::new(),
            failures: Vec::new(),
            anomalies: 0,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.status == DataSetStatus::Halted(FailureKind::Authentication)
    }
}

/// A single logical request
#[derive(Debug, Clone)]
enum Request {
    Accounts,
    Meters(String),
    Billing(Meter, TimeRange),
    UsageCost(String, TimeRange),
    Hourly(Meter, TimeRange),
    Interval(Meter, TimeRange),
}

impl Request {
    fn target(&self) -> &str {
        match self {
            Self::Accounts => "accounts",
            Self::Meters(id) | Self::UsageCost(id, _) => id,
            Self::Billing(m, _) | Self::Hourly(m, _) | Self::Interval(m, _) => &m.service_point,
        }
    }
}

#[derive(Debug)]
enum Payload {
    Accounts(Vec<RawAccount>),
    Meters(Vec<RawMeter>),
    Billing(Vec<RawBilling>),
    UsageCost(Vec<RawUsageCost>),
    Readings(Vec<RawReading>),
}

/// Request runner shared by the per-target tasks
#[derive(Clone)]
struct Caller {
    api: Arc<dyn UtilityApi>,
    retry: RetryPolicy,
    timeout: Duration,
    logger: StructuredLogger,
}

impl Caller {
    async fn send(&self, req: &Request) -> ApiResult<Payload> {
        match req {
            Request::Accounts => self.api.list_accounts().await.map(Payload::Accounts),
            Request::Meters(id) => self.api.list_meters(id).await.map(Payload::Meters),
            Request::Billing(m, range) => self
                .api
                .get_billing(m, *range)
                .await
                .map(Payload::Billing),
            Request::UsageCost(id, range) => self
                .api
                .get_usage_costs(id, *range)
                .await
                .map(Payload::UsageCost),
            Request::Hourly(m, range) => self
                .api
                .get_hourly_readings(m, *range)
                .await
                .map(Payload::Readings),
            Request::Interval(m, range) => self
                .api
                .get_interval_readings(m, *range)
                .await
                .map(Payload::Readings),
        }
    }

    /// Send with timeout and retry; stops retrying once `halt` is raised
    async fn call(&self, req: &Request, halt: Option<&watch::Receiver<bool>>) -> Result<Payload> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match tokio::time::timeout(self.timeout, self.send(req)).await {
                Ok(Ok(payload)) => return Ok(payload),
                Ok(Err(e)) => GridstatError::from(e),
                Err(_) => GridstatError::timeout(format!(
                    "request for {} exceeded {:?}",
                    req.target(),
                    self.timeout
                )),
            };

            if !err.is_retryable() || attempts >= self.retry.max_attempts {
                return Err(err);
            }
            if halt.is_some_and(|h| *h.borrow()) {
                return Err(err);
            }

            let delay = self.retry.backoff(attempts);
            self.logger.warn(&format!(
                "Attempt {} for {} failed: {}; retrying in {:?}",
                attempts,
                req.target(),
                err,
                delay
            ));
            tokio::time::sleep(delay).await;
        }
    }
}

/// Outcome of one per-target task
enum TaskOutcome {
    Done(Result<Payload>),
    /// Skipped because the data set was already halted
    Skipped,
}

pub struct Fetcher {
    caller: Caller,
    max_concurrent: usize,
    shutdown: watch::Receiver<bool>,
    logger: StructuredLogger,
}

impl Fetcher {
    pub fn new(
        api: Arc<dyn UtilityApi>,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let logger = get_logger("fetcher");
        Self {
            caller: Caller {
                api,
                retry: RetryPolicy::from_config(&config.retry),
                timeout: Duration::from_secs(config.api.request_timeout_secs),
                logger: logger.clone(),
            },
            max_concurrent: config.fetch.max_concurrent_requests.max(1),
            shutdown,
            logger,
        }
    }

    /// List accounts (optionally filtered) and their meters
    ///
    /// Any failure here aborts the cycle: without meters there is nothing to
    /// plan.
    pub async fn discover(&self, only: &[String]) -> Result<(Vec<Account>, usize)> {
        let raw_accounts = match self.caller.call(&Request::Accounts, None).await? {
            Payload::Accounts(a) => a,
            _ => return Err(GridstatError::api("unexpected payload for account list")),
        };

        let mut accounts = Vec::new();
        let mut anomalies = 0;
        for raw in raw_accounts {
            if !only.is_empty() && !only.contains(&raw.account_number) {
                continue;
            }
            let req = Request::Meters(raw.account_number.clone());
            let raw_meters = match self.caller.call(&req, None).await? {
                Payload::Meters(m) => m,
                _ => return Err(GridstatError::api("unexpected payload for meter list")),
            };
            let mut meters = Vec::with_capacity(raw_meters.len());
            for rm in raw_meters {
                match parse_fuel(&rm.fuel_type) {
                    Some(fuel) => meters.push(Meter {
                        service_point: rm.service_point_number,
                        fuel,
                        ami: rm.has_ami_smart_meter,
                        solar: rm.has_solar,
                        account_id: raw.account_number.clone(),
                        meter_number: rm.meter_number,
                        premise_number: rm.premise_number,
                    }),
                    None => {
                        anomalies += 1;
                        self.logger.warn(&format!(
                            "Skipping meter {} with unknown fuel type '{}'",
                            rm.service_point_number, rm.fuel_type
                        ));
                    }
                }
            }
            accounts.push(Account {
                id: raw.account_number,
                region: raw.company_code,
                meters,
            });
        }
        Ok((accounts, anomalies))
    }

    pub async fn fetch_billing(
        &self,
        account: &Account,
        planned: &PlannedFetch,
    ) -> DataSetResult<BillingRecord> {
        let requests = account
            .meters
            .iter()
            .map(|m| Request::Billing(m.clone(), planned.window))
            .collect();
        let meters = meters_by_sp(account);
        let logger = &self.logger;
        self.run(account, planned, requests, |sp, payload, anomalies| {
            let (Payload::Billing(rows), Some(meter)) = (payload, meters.get(sp)) else {
                return Vec::new();
            };
            rows.into_iter()
                .filter_map(|row| match normalize_billing(meter, &row) {
                    Ok(rec) => Some(rec),
                    Err(e) => {
                        *anomalies += 1;
                        logger
                            .for_service_point(sp)
                            .warn(&format!("Dropping billing record: {}", e));
                        None
                    }
                })
                .collect()
        })
        .await
    }

    pub async fn fetch_usage_costs(
        &self,
        account: &Account,
        planned: &PlannedFetch,
    ) -> DataSetResult<UsageCost> {
        let requests = vec![Request::UsageCost(account.id.clone(), planned.window)];
        let logger = &self.logger;
        self.run(account, planned, requests, |id, payload, anomalies| {
            let Payload::UsageCost(rows) = payload else {
                return Vec::new();
            };
            rows.into_iter()
                .filter_map(|row| match normalize_usage_cost(id, &row) {
                    Ok(rec) => Some(rec),
                    Err(e) => {
                        *anomalies += 1;
                        logger.warn(&format!("Dropping usage-cost record: {}", e));
                        None
                    }
                })
                .collect()
        })
        .await
    }

    /// Hourly (AMI meters) or interval (AMI electric meters) readings
    pub async fn fetch_readings(
        &self,
        account: &Account,
        planned: &PlannedFetch,
    ) -> DataSetResult<UsageReading> {
        self.fetch_readings_from(account, planned, &BTreeMap::new())
            .await
    }

    /// Like [`Fetcher::fetch_readings`], but a meter listed in `starts` has its
    /// window widened back to that instant when it lies before the planned start
    pub async fn fetch_readings_from(
        &self,
        account: &Account,
        planned: &PlannedFetch,
        starts: &BTreeMap<String, DateTime<Utc>>,
    ) -> DataSetResult<UsageReading> {
        let window_for = |m: &Meter| match starts.get(&m.service_point) {
            Some(start) if *start < planned.window.start => {
                TimeRange::new(*start, planned.window.end)
            }
            _ => planned.window,
        };
        let requests: Vec<Request> = match planned.set {
            DataSet::HourlyAmi => account
                .meters
                .iter()
                .filter(|m| m.wants_hourly())
                .map(|m| Request::Hourly(m.clone(), window_for(m)))
                .collect(),
            DataSet::Interval => account
                .meters
                .iter()
                .filter(|m| m.wants_interval())
                .map(|m| Request::Interval(m.clone(), window_for(m)))
                .collect(),
            _ => Vec::new(),
        };
        let meters = meters_by_sp(account);
        let logger = &self.logger;
        self.run(account, planned, requests, |sp, payload, anomalies| {
            let (Payload::Readings(rows), Some(meter)) = (payload, meters.get(sp)) else {
                return Vec::new();
            };
            rows.into_iter()
                .filter_map(|row| match normalize_reading(meter, &row) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        *anomalies += 1;
                        logger
                            .for_service_point(sp)
                            .warn(&format!("Dropping reading: {}", e));
                        None
                    }
                })
                .collect()
        })
        .await
    }

    /// Fan requests out over a bounded `JoinSet` and collect normalized records
    async fn run<T, F>(
        &self,
        account: &Account,
        planned: &PlannedFetch,
        requests: Vec<Request>,
        mut normalize: F,
    ) -> DataSetResult<T>
    where
        F: FnMut(&str, Payload, &mut usize) -> Vec<T>,
    {
        let mut result = DataSetResult::new(planned.set);
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            result.status = DataSetStatus::Cancelled;
            return result;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let (halt_tx, halt_rx) = watch::channel(false);
        let halt_tx = Arc::new(halt_tx);
        let halted_by: Arc<Mutex<Option<FailureKind>>> = Arc::new(Mutex::new(None));
        let mut tasks = JoinSet::new();
        let mut targets: HashMap<task::Id, String> = HashMap::new();

        for req in requests {
            let target = req.target().to_string();
            let caller = self.caller.clone();
            let semaphore = semaphore.clone();
            let halt_rx = halt_rx.clone();
            let halt_tx = halt_tx.clone();
            let halted_by = halted_by.clone();
            let handle = tasks.spawn(async move {
                let target = req.target().to_string();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (target, TaskOutcome::Skipped);
                };
                if *halt_rx.borrow() {
                    return (target, TaskOutcome::Skipped);
                }
                let res = caller.call(&req, Some(&halt_rx)).await;
                if let Err(e) = &res {
                    let kind = e.kind();
                    if matches!(kind, FailureKind::Authentication | FailureKind::RateLimit) {
                        if let Ok(mut slot) = halted_by.lock() {
                            slot.get_or_insert(kind);
                        }
                        let _ = halt_tx.send(true);
                    }
                }
                (target, TaskOutcome::Done(res))
            });
            targets.insert(handle.id(), target);
        }

        let mut skipped = BTreeSet::new();
        let mut watching = true;
        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let (target, outcome) = match joined {
                        Ok((_, v)) => v,
                        Err(e) => {
                            // A task that panicked still counts against its target
                            let target = targets
                                .remove(&e.id())
                                .unwrap_or_else(|| "unknown".to_string());
                            let err = GridstatError::api(format!(
                                "{} task for {} failed: {}",
                                planned.set, target, e
                            ));
                            self.logger.for_service_point(&target).error(&err.to_string());
                            (target, TaskOutcome::Done(Err(err)))
                        }
                    };
                    match outcome {
                        TaskOutcome::Done(Ok(payload)) => {
                            let records = normalize(&target, payload, &mut result.anomalies);
                            result.records.insert(target, records);
                        }
                        TaskOutcome::Done(Err(e)) => {
                            self.logger.for_service_point(&target).warn(&format!(
                                "{} request failed: {}", planned.set, e
                            ));
                            result.failures.push(CycleFailure {
                                account_id: Some(account.id.clone()),
                                data_set: Some(planned.set),
                                service_point: Some(target.clone()),
                                kind: e.kind(),
                                message: e.to_string(),
                            });
                            result.failed.insert(target);
                        }
                        TaskOutcome::Skipped => {
                            skipped.insert(target);
                        }
                    }
                }
                changed = shutdown.changed(), if watching => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            tasks.abort_all();
                            result.status = DataSetStatus::Cancelled;
                            self.logger.info(&format!("{} fetch cancelled", planned.set));
                            return result;
                        }
                        Ok(()) => {}
                        // Sender gone; no shutdown can arrive any more
                        Err(_) => watching = false,
                    }
                }
            }
        }

        result.failed.extend(skipped);
        let halted = halted_by.lock().ok().and_then(|slot| *slot);
        result.status = match halted {
            Some(kind) => DataSetStatus::Halted(kind),
            None if result.failed.is_empty() => DataSetStatus::Complete,
            None => DataSetStatus::Partial,
        };
        if let DataSetStatus::Halted(kind) = result.status {
            self.logger.warn(&format!(
                "{} halted for account {} ({})",
                planned.set,
                account.id,
                kind.as_str()
            ));
        }
        result
    }
}

fn meters_by_sp(account: &Account) -> BTreeMap<String, Meter> {
    account
        .meters
        .iter()
        .map(|m| (m.service_point.clone(), m.clone()))
        .collect()
}

fn parse_unit(raw: &str) -> Result<VendorUnit> {
    VendorUnit::parse(raw).ok_or_else(|| GridstatError::anomaly(format!("unknown unit '{}'", raw)))
}

pub fn normalize_reading(meter: &Meter, raw: &RawReading) -> Result<UsageReading> {
    let start = units::parse_reading_timestamp(&raw.start_time)
        .map_err(|e| GridstatError::anomaly(e.to_string()))?;
    let quantity = units::normalize_quantity(meter.fuel, parse_unit(&raw.units)?, raw.value)?;
    Ok(UsageReading {
        service_point: meter.service_point.clone(),
        start,
        quantity,
        flagged_return: raw.is_return,
    })
}

pub fn normalize_billing(meter: &Meter, raw: &RawBilling) -> Result<BillingRecord> {
    let period_start = units::parse_reading_date(&raw.start_date)
        .map_err(|e| GridstatError::anomaly(e.to_string()))?;
    let period_end = units::parse_reading_date(&raw.end_date)
        .map_err(|e| GridstatError::anomaly(e.to_string()))?;
    let usage = units::normalize_quantity(meter.fuel, parse_unit(&raw.units)?, raw.usage)?;
    Ok(BillingRecord {
        service_point: meter.service_point.clone(),
        period_start,
        period_end,
        usage,
        cost: raw.cost,
    })
}

pub fn normalize_usage_cost(account_id: &str, raw: &RawUsageCost) -> Result<UsageCost> {
    let fuel = parse_fuel(&raw.fuel_type)
        .ok_or_else(|| GridstatError::anomaly(format!("unknown fuel '{}'", raw.fuel_type)))?;
    let month_start =
        units::parse_reading_date(&raw.date).map_err(|e| GridstatError::anomaly(e.to_string()))?;
    let usage = units::normalize_quantity(fuel, parse_unit(&raw.units)?, raw.quantity)?;
    Ok(UsageCost {
        account_id: account_id.to_string(),
        fuel,
        month_start,
        usage,
        cost: raw.cost,
    })
}
