#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use gridstat::api::{
    ApiError, ApiResult, RawAccount, RawBilling, RawMeter, RawReading, RawUsageCost, UtilityApi,
};
use gridstat::config::Config;
use gridstat::model::{DataSet, Meter, TimeRange};
use gridstat::orchestrator::{CycleContext, RefreshOrchestrator};
use gridstat::store::MemoryStore;
use gridstat::units::parse_reading_timestamp;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Scripted failure for one data set
#[derive(Debug, Clone)]
struct Failure {
    error: ApiError,
    /// `None` fails forever
    remaining: Option<usize>,
}

/// In-process account API with scripted data, failures and latency
#[derive(Default)]
pub struct FakeApi {
    accounts: Vec<RawAccount>,
    meters: HashMap<String, Vec<RawMeter>>,
    billing: HashMap<String, Vec<RawBilling>>,
    usage_costs: HashMap<String, Vec<RawUsageCost>>,
    hourly: Mutex<HashMap<String, Vec<RawReading>>>,
    interval: Mutex<HashMap<String, Vec<RawReading>>>,
    failures: Mutex<HashMap<DataSet, Failure>>,
    discovery_failure: Mutex<Option<ApiError>>,
    calls: Mutex<HashMap<DataSet, usize>>,
    delay: Mutex<std::time::Duration>,
    panics: Mutex<HashSet<DataSet>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, id: &str, meters: Vec<RawMeter>) -> Self {
        self.accounts.push(RawAccount {
            account_number: id.to_string(),
            company_code: Some("GA".to_string()),
        });
        self.meters.insert(id.to_string(), meters);
        self
    }

    pub fn with_billing(mut self, sp: &str, rows: Vec<RawBilling>) -> Self {
        self.billing.insert(sp.to_string(), rows);
        self
    }

    pub fn with_usage_costs(mut self, account: &str, rows: Vec<RawUsageCost>) -> Self {
        self.usage_costs.insert(account.to_string(), rows);
        self
    }

    pub fn with_hourly(self, sp: &str, rows: Vec<RawReading>) -> Self {
        self.set_hourly(sp, rows);
        self
    }

    pub fn with_interval(self, sp: &str, rows: Vec<RawReading>) -> Self {
        self.set_interval(sp, rows);
        self
    }

    pub fn set_hourly(&self, sp: &str, rows: Vec<RawReading>) {
        self.hourly.lock().unwrap().insert(sp.to_string(), rows);
    }

    pub fn set_interval(&self, sp: &str, rows: Vec<RawReading>) {
        self.interval.lock().unwrap().insert(sp.to_string(), rows);
    }

    pub fn fail(&self, set: DataSet, error: ApiError) {
        self.failures.lock().unwrap().insert(
            set,
            Failure {
                error,
                remaining: None,
            },
        );
    }

    pub fn fail_times(&self, set: DataSet, error: ApiError, times: usize) {
        self.failures.lock().unwrap().insert(
            set,
            Failure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn heal(&self, set: DataSet) {
        self.failures.lock().unwrap().remove(&set);
    }

    /// Make every request for `set` panic inside its task
    pub fn panic_on(&self, set: DataSet) {
        self.panics.lock().unwrap().insert(set);
    }

    pub fn fail_discovery(&self, error: ApiError) {
        *self.discovery_failure.lock().unwrap() = Some(error);
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, set: DataSet) -> usize {
        self.calls.lock().unwrap().get(&set).copied().unwrap_or(0)
    }

    async fn enter(&self, set: DataSet) -> ApiResult<()> {
        *self.calls.lock().unwrap().entry(set).or_insert(0) += 1;
        let panics = self.panics.lock().unwrap().contains(&set);
        if panics {
            panic!("scripted panic for {:?}", set);
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut failures = self.failures.lock().unwrap();
        let Some(failure) = failures.get_mut(&set) else {
            return Ok(());
        };
        let error = failure.error.clone();
        match &mut failure.remaining {
            None => Err(error),
            Some(0) => {
                failures.remove(&set);
                Ok(())
            }
            Some(n) => {
                *n -= 1;
                Err(error)
            }
        }
    }
}

fn in_range(rows: Option<&Vec<RawReading>>, range: TimeRange) -> Vec<RawReading> {
    rows.map(|rows| {
        rows.iter()
            .filter(|r| {
                parse_reading_timestamp(&r.start_time)
                    .map(|t| range.contains(t))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    })
    .unwrap_or_default()
}

#[async_trait::async_trait]
impl UtilityApi for FakeApi {
    async fn list_accounts(&self) -> ApiResult<Vec<RawAccount>> {
        if let Some(e) = self.discovery_failure.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.accounts.clone())
    }

    async fn list_meters(&self, account_id: &str) -> ApiResult<Vec<RawMeter>> {
        Ok(self.meters.get(account_id).cloned().unwrap_or_default())
    }

    async fn get_billing(&self, meter: &Meter, _range: TimeRange) -> ApiResult<Vec<RawBilling>> {
        self.enter(DataSet::Billing).await?;
        Ok(self
            .billing
            .get(&meter.service_point)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_usage_costs(
        &self,
        account_id: &str,
        _range: TimeRange,
    ) -> ApiResult<Vec<RawUsageCost>> {
        self.enter(DataSet::UsageCost).await?;
        Ok(self.usage_costs.get(account_id).cloned().unwrap_or_default())
    }

    async fn get_hourly_readings(
        &self,
        meter: &Meter,
        range: TimeRange,
    ) -> ApiResult<Vec<RawReading>> {
        self.enter(DataSet::HourlyAmi).await?;
        Ok(in_range(
            self.hourly.lock().unwrap().get(&meter.service_point),
            range,
        ))
    }

    async fn get_interval_readings(
        &self,
        meter: &Meter,
        range: TimeRange,
    ) -> ApiResult<Vec<RawReading>> {
        self.enter(DataSet::Interval).await?;
        Ok(in_range(
            self.interval.lock().unwrap().get(&meter.service_point),
            range,
        ))
    }
}

pub fn ts(s: &str) -> DateTime<Utc> {
    parse_reading_timestamp(s).unwrap()
}

pub fn electric_meter(sp: &str, solar: bool) -> RawMeter {
    RawMeter {
        service_point_number: sp.to_string(),
        fuel_type: "Electric".to_string(),
        has_ami_smart_meter: true,
        has_solar: solar,
        meter_number: Some(format!("M-{}", sp)),
        premise_number: None,
    }
}

pub fn gas_meter(sp: &str) -> RawMeter {
    RawMeter {
        service_point_number: sp.to_string(),
        fuel_type: "Gas".to_string(),
        has_ami_smart_meter: true,
        has_solar: false,
        meter_number: None,
        premise_number: None,
    }
}

pub fn reading(start: DateTime<Utc>, value: f64, units: &str) -> RawReading {
    RawReading {
        start_time: start.format("%Y-%m-%d %H:%M:%S").to_string(),
        value,
        units: units.to_string(),
        is_return: false,
    }
}

/// `count` consecutive readings of `value` spaced `step_minutes` apart
pub fn readings(
    from: DateTime<Utc>,
    count: i64,
    step_minutes: i64,
    value: f64,
    units: &str,
) -> Vec<RawReading> {
    (0..count)
        .map(|i| reading(from + Duration::minutes(i * step_minutes), value, units))
        .collect()
}

/// Defaults with fast retries and no start-up history import
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.fetch.import_history_on_start = false;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.api.request_timeout_secs = 5;
    config.store.timeout_secs = 5;
    config
}

/// An orchestrator wired to a fake API and an in-memory store
pub struct Harness {
    pub api: Arc<FakeApi>,
    pub store: Arc<MemoryStore>,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub shutdown: watch::Sender<bool>,
}

pub fn harness(api: FakeApi, config: Config) -> Harness {
    let api = Arc::new(api);
    let store = Arc::new(MemoryStore::new());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let ctx = CycleContext {
        api: api.clone(),
        store: store.clone(),
        config: Arc::new(config),
    };
    let orchestrator = Arc::new(RefreshOrchestrator::new(ctx, shutdown_rx).unwrap());
    Harness {
        api,
        store,
        orchestrator,
        shutdown,
    }
}
