//! Refresh orchestrator
//!
//! Drives one refresh cycle at a time through planning, fetching, merging and
//! reconciling, and keeps the little state that survives between cycles: the
//! in-flight guard, any pending force-full upgrade, the last successful full
//! cycle per account and the re-authentication flag.

use crate::api::UtilityApi;
use crate::config::Config;
use crate::error::{FailureKind, GridstatError, Result};
use crate::fetcher::{DataSetResult, DataSetStatus, Fetcher};
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use crate::merger::Merger;
use crate::model::{
    Account, BillingRecord, CandidateSeries, CycleFailure, CycleResult, CycleStatus, DataSet,
    Direction, FeedKind, Meter, MeterView, SeriesKey, SeriesOutcome, SeriesStatus,
    UsageCost, UsageReading, UsageSnapshot,
};
use crate::planner::{FetchPlan, PlanInput, Planner, WriteMode};
use crate::reconciler::Reconciler;
use crate::store::StatisticsStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Everything a cycle needs from the outside world
#[derive(Clone)]
pub struct CycleContext {
    pub api: Arc<dyn UtilityApi>,
    pub store: Arc<dyn StatisticsStore>,
    pub config: Arc<Config>,
}

/// Orchestrator state, published on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Planning,
    Fetching,
    Merging,
    Reconciling,
    /// Credentials rejected; waiting for the operator
    Failed,
}

/// Which accounts the next cycle must fully refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "accounts")]
pub enum ForceScope {
    #[default]
    None,
    All,
    Accounts(BTreeSet<String>),
}

impl ForceScope {
    fn add(&mut self, account: Option<String>) {
        match (account, &mut *self) {
            (_, ForceScope::All) => {}
            (None, _) => *self = ForceScope::All,
            (Some(id), ForceScope::Accounts(set)) => {
                set.insert(id);
            }
            (Some(id), ForceScope::None) => {
                *self = ForceScope::Accounts(BTreeSet::from([id]));
            }
        }
    }

    fn covers(&self, account_id: &str) -> bool {
        match self {
            ForceScope::None => false,
            ForceScope::All => true,
            ForceScope::Accounts(set) => set.contains(account_id),
        }
    }

    pub fn is_none(&self) -> bool {
        *self == ForceScope::None
    }
}

/// What happened to a trigger
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(Box<CycleResult>),
    /// Scheduled trigger dropped because a cycle is running
    Rejected,
    /// Force-full folded into the next cycle because one is running
    Absorbed,
    /// Scheduled trigger ignored until credentials are fixed
    Suspended,
}

impl TriggerOutcome {
    pub fn result(&self) -> Option<&CycleResult> {
        match self {
            TriggerOutcome::Completed(r) => Some(r),
            _ => None,
        }
    }
}

/// Serializable status for the web surface
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub state: CycleState,
    pub cycle_running: bool,
    pub reauth_required: bool,
    pub pending_force: ForceScope,
    pub last_full_success: BTreeMap<String, DateTime<Utc>>,
    pub last_result: Option<CycleResult>,
}

/// Fetched data sets of one account
struct AccountFetch {
    account_id: String,
    billing: Option<DataSetResult<BillingRecord>>,
    usage_cost: Option<DataSetResult<UsageCost>>,
    hourly: Option<DataSetResult<UsageReading>>,
    interval: Option<DataSetResult<UsageReading>>,
}

impl AccountFetch {
    fn statuses(&self) -> Vec<(DataSet, DataSetStatus)> {
        let mut out = Vec::new();
        if let Some(r) = &self.billing {
            out.push((r.set, r.status));
        }
        if let Some(r) = &self.usage_cost {
            out.push((r.set, r.status));
        }
        if let Some(r) = &self.hourly {
            out.push((r.set, r.status));
        }
        if let Some(r) = &self.interval {
            out.push((r.set, r.status));
        }
        out
    }

    fn drain_failures(&mut self, failures: &mut Vec<CycleFailure>) -> usize {
        let mut anomalies = 0;
        if let Some(r) = &mut self.billing {
            failures.append(&mut r.failures);
            anomalies += r.anomalies;
        }
        if let Some(r) = &mut self.usage_cost {
            failures.append(&mut r.failures);
            anomalies += r.anomalies;
        }
        if let Some(r) = &mut self.hourly {
            failures.append(&mut r.failures);
            anomalies += r.anomalies;
        }
        if let Some(r) = &mut self.interval {
            failures.append(&mut r.failures);
            anomalies += r.anomalies;
        }
        anomalies
    }
}

/// Work handed to one per-meter reconcile task
struct MeterJob {
    meter: Meter,
    interval: Option<IntervalJob>,
    hourly: Vec<CandidateSeries>,
    hourly_mode: WriteMode,
}

enum IntervalJob {
    Replace(Vec<CandidateSeries>),
    /// Fetch failed; only drop points behind the cutoff
    Prune,
}

/// Clears the in-flight flag when a cycle ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RefreshOrchestrator {
    ctx: CycleContext,
    planner: Planner,
    fetcher: Fetcher,
    merger: Merger,
    reconciler: Arc<Reconciler>,
    running: AtomicBool,
    reauth_required: AtomicBool,
    pending: Mutex<ForceScope>,
    last_full_success: Mutex<HashMap<String, DateTime<Utc>>>,
    last_result: Mutex<Option<CycleResult>>,
    state_tx: watch::Sender<CycleState>,
    snapshot_tx: watch::Sender<UsageSnapshot>,
    shutdown: watch::Receiver<bool>,
    logger: StructuredLogger,
}

impl RefreshOrchestrator {
    pub fn new(ctx: CycleContext, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let planner = Planner::from_config(&ctx.config)?;
        let fetcher = Fetcher::new(ctx.api.clone(), &ctx.config, shutdown.clone());
        let merger = Merger::new(&ctx.config.integration_id);
        let reconciler = Arc::new(Reconciler::new(
            ctx.store.clone(),
            Duration::from_secs(ctx.config.store.timeout_secs),
            shutdown.clone(),
        ));
        let mut pending = ForceScope::None;
        if ctx.config.fetch.import_history_on_start {
            pending.add(None);
        }
        let (state_tx, _) = watch::channel(CycleState::Idle);
        let (snapshot_tx, _) = watch::channel(UsageSnapshot::default());

        Ok(Self {
            ctx,
            planner,
            fetcher,
            merger,
            reconciler,
            running: AtomicBool::new(false),
            reauth_required: AtomicBool::new(false),
            pending: Mutex::new(pending),
            last_full_success: Mutex::new(HashMap::new()),
            last_result: Mutex::new(None),
            state_tx,
            snapshot_tx,
            shutdown,
            logger: get_logger("orchestrator"),
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CycleState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<UsageSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> CycleState {
        *self.state_tx.borrow()
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn reauth_required(&self) -> bool {
        self.reauth_required.load(Ordering::SeqCst)
    }

    pub fn last_result(&self) -> Option<CycleResult> {
        lock(&self.last_result).clone()
    }

    pub fn pending_force(&self) -> ForceScope {
        lock(&self.pending).clone()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            state: self.state(),
            cycle_running: self.is_running(),
            reauth_required: self.reauth_required(),
            pending_force: self.pending_force(),
            last_full_success: lock(&self.last_full_success)
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            last_result: self.last_result(),
        }
    }

    /// Operator acknowledged new credentials; resume scheduled cycles
    pub fn clear_reauth(&self) {
        if self.reauth_required.swap(false, Ordering::SeqCst) {
            self.logger.info("Re-authentication flag cleared");
            self.set_state(CycleState::Idle);
        }
    }

    /// Hourly trigger; rejected while a cycle runs or credentials are bad
    pub async fn run_scheduled(&self, now: DateTime<Utc>) -> TriggerOutcome {
        if self.reauth_required() {
            self.logger
                .warn("Scheduled refresh suspended until re-authentication");
            return TriggerOutcome::Suspended;
        }
        let Some(guard) = self.try_begin() else {
            self.logger
                .warn("Scheduled refresh rejected: a cycle is already running");
            return TriggerOutcome::Rejected;
        };
        let result = self.run_cycle(now).await;
        drop(guard);
        TriggerOutcome::Completed(Box::new(result))
    }

    /// Manual full refresh for one account or all of them
    ///
    /// While a cycle runs the request is absorbed into the next one.
    pub async fn force_full_refresh(
        &self,
        now: DateTime<Utc>,
        account_id: Option<String>,
    ) -> TriggerOutcome {
        lock(&self.pending).add(account_id.clone());
        self.clear_reauth();

        let Some(guard) = self.try_begin() else {
            self.logger.info(&format!(
                "Force full refresh ({}) absorbed into the next cycle",
                account_id.as_deref().unwrap_or("all accounts")
            ));
            return TriggerOutcome::Absorbed;
        };
        let result = self.run_cycle(now).await;
        drop(guard);
        TriggerOutcome::Completed(Box::new(result))
    }

    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlight(&self.running))
    }

    fn set_state(&self, state: CycleState) {
        self.state_tx.send_replace(state);
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run_cycle(&self, now: DateTime<Utc>) -> CycleResult {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let logger = get_logger_with_context(
            LogContext::new("orchestrator").with_field("cycle", id.to_string()),
        );
        let scope = std::mem::take(&mut *lock(&self.pending));
        let mut result = CycleResult {
            id,
            started_at,
            finished_at: started_at,
            forced: !scope.is_none(),
            plans: BTreeMap::new(),
            status: CycleStatus::Success,
            series: Vec::new(),
            failures: Vec::new(),
            anomalies: 0,
        };

        self.set_state(CycleState::Planning);
        let accounts = match self.fetcher.discover(&self.ctx.config.accounts).await {
            Ok((accounts, anomalies)) => {
                result.anomalies += anomalies;
                accounts
            }
            Err(e) => {
                logger.error(&format!("Account discovery failed: {}", e));
                result.failures.push(CycleFailure {
                    account_id: None,
                    data_set: None,
                    service_point: None,
                    kind: e.kind(),
                    message: e.to_string(),
                });
                // Keep the forced upgrade for the next attempt
                if !scope.is_none() {
                    let mut pending = lock(&self.pending);
                    merge_scope(&mut pending, scope);
                }
                return self.finish(result, &[], &BTreeMap::new(), logger).await;
            }
        };

        let plans: Vec<(Account, FetchPlan)> = accounts
            .into_iter()
            .map(|account| {
                let input = PlanInput {
                    force_full: scope.covers(&account.id),
                    last_full_success: lock(&self.last_full_success).get(&account.id).copied(),
                };
                let plan = self.planner.plan(now, &input);
                (account, plan)
            })
            .collect();
        for (account, plan) in &plans {
            result.plans.insert(account.id.clone(), plan.kind);
            logger.info(&format!(
                "Account {}: {:?} plan{} ({} sets, cutoff {})",
                account.id,
                plan.kind,
                if plan.forced { ", forced" } else { "" },
                plan.sets.len(),
                plan.cutoff
            ));
        }

        self.set_state(CycleState::Fetching);
        let mut fetched: Vec<AccountFetch> = Vec::with_capacity(plans.len());
        for (account, plan) in &plans {
            fetched.push(self.fetch_account(account, plan).await);
        }

        let mut full_success: Vec<String> = Vec::new();
        for ((account, plan), fetch) in plans.iter().zip(fetched.iter_mut()) {
            let statuses = fetch.statuses();
            let healthy = statuses.iter().all(|(_, s)| {
                !matches!(s, DataSetStatus::Halted(_) | DataSetStatus::Cancelled)
            });
            if plan.is_full() && healthy {
                full_success.push(account.id.clone());
            }
            if plan.forced && !healthy {
                lock(&self.pending).add(Some(account.id.clone()));
            }
            result.anomalies += fetch.drain_failures(&mut result.failures);
        }

        if self.shutting_down() {
            logger.warn("Shutdown requested; skipping reconciliation");
            result.status = CycleStatus::Cancelled;
            return self.finish(result, &plans, &BTreeMap::new(), logger).await;
        }

        self.set_state(CycleState::Merging);
        let mut jobs: Vec<MeterJob> = Vec::new();
        for ((account, plan), fetch) in plans.iter().zip(fetched.iter()) {
            let (account_jobs, anomalies) = self.build_jobs(account, plan, fetch);
            result.anomalies += anomalies;
            jobs.extend(account_jobs);
        }

        self.set_state(CycleState::Reconciling);
        result.series = self.reconcile_all(jobs, now).await;
        for outcome in &result.series {
            let kind = match (outcome.status, outcome.failure) {
                (SeriesStatus::Skipped | SeriesStatus::Failed, Some(kind)) => kind,
                (SeriesStatus::Skipped, None) => FailureKind::InvariantViolation,
                (SeriesStatus::Failed, None) => FailureKind::Communication,
                _ => continue,
            };
            result.failures.push(CycleFailure {
                account_id: None,
                data_set: None,
                service_point: None,
                kind,
                message: format!(
                    "{}: {}",
                    outcome.key,
                    outcome.message.as_deref().unwrap_or("write failed")
                ),
            });
        }

        {
            let mut last = lock(&self.last_full_success);
            for account in full_success {
                last.insert(account, now);
            }
        }

        let fresh = collect_view_data(&fetched);
        self.finish(result, &plans, &fresh, logger).await
    }

    async fn fetch_account(&self, account: &Account, plan: &FetchPlan) -> AccountFetch {
        let billing = async {
            match plan.get(DataSet::Billing) {
                Some(p) => Some(self.fetcher.fetch_billing(account, p).await),
                None => None,
            }
        };
        let usage_cost = async {
            match plan.get(DataSet::UsageCost) {
                Some(p) => Some(self.fetcher.fetch_usage_costs(account, p).await),
                None => None,
            }
        };
        let hourly = async {
            match plan.get(DataSet::HourlyAmi) {
                Some(p) if p.mode == WriteMode::Continue => {
                    let starts = self.hourly_resume_points(account).await;
                    Some(self.fetcher.fetch_readings_from(account, p, &starts).await)
                }
                Some(p) => Some(self.fetcher.fetch_readings(account, p).await),
                None => None,
            }
        };
        let interval = async {
            match plan.get(DataSet::Interval) {
                Some(p) => Some(self.fetcher.fetch_readings(account, p).await),
                None => None,
            }
        };
        let (billing, usage_cost, hourly, interval) =
            tokio::join!(billing, usage_cost, hourly, interval);
        AccountFetch {
            account_id: account.id.clone(),
            billing,
            usage_cost,
            hourly,
            interval,
        }
    }

    /// Hour after the oldest last hourly point per meter
    ///
    /// Continuation resumes from the store, so a meter whose series stopped
    /// before the routine lookback (an outage, no history import) gets its
    /// window widened to cover the gap.
    async fn hourly_resume_points(&self, account: &Account) -> BTreeMap<String, DateTime<Utc>> {
        let integration_id = &self.ctx.config.integration_id;
        let mut starts = BTreeMap::new();
        for meter in account.meters.iter().filter(|m| m.wants_hourly()) {
            for direction in [Direction::Consumption, Direction::Return] {
                let key = SeriesKey::new(
                    integration_id,
                    &meter.service_point,
                    meter.fuel,
                    FeedKind::Hourly,
                    direction,
                );
                match self.reconciler.last_point(&key).await {
                    Ok(Some(last)) => {
                        let resume = last.start + chrono::Duration::hours(1);
                        starts
                            .entry(meter.service_point.clone())
                            .and_modify(|s: &mut DateTime<Utc>| *s = (*s).min(resume))
                            .or_insert(resume);
                    }
                    Ok(None) => {}
                    Err(e) => self
                        .logger
                        .for_service_point(&meter.service_point)
                        .warn(&format!("Cannot read last point of {}: {}", key, e)),
                }
            }
        }
        starts
    }

    /// Merge the account's readings into per-meter reconcile jobs
    fn build_jobs(
        &self,
        account: &Account,
        plan: &FetchPlan,
        fetch: &AccountFetch,
    ) -> (Vec<MeterJob>, usize) {
        let hourly_mode = plan
            .get(DataSet::HourlyAmi)
            .map(|p| p.mode)
            .unwrap_or(WriteMode::Continue);
        let integration_id = &self.ctx.config.integration_id;
        let mut anomalies = 0;
        let mut jobs = Vec::new();

        for meter in &account.meters {
            let mut job = MeterJob {
                meter: meter.clone(),
                interval: None,
                hourly: Vec::new(),
                hourly_mode,
            };

            if let Some(interval) = &fetch.interval {
                if meter.wants_interval() {
                    let failed = interval.failed.contains(&meter.service_point)
                        || !interval.records.contains_key(&meter.service_point);
                    job.interval = if failed {
                        Some(IntervalJob::Prune)
                    } else {
                        let readings = interval
                            .records
                            .get(&meter.service_point)
                            .map(Vec::as_slice)
                            .unwrap_or(&[]);
                        let (mut series, a) =
                            self.merger.merge_meter(FeedKind::Interval, meter, readings);
                        anomalies += a;
                        // Clear directions that received nothing this cycle
                        for direction in [Direction::Consumption, Direction::Return] {
                            if !series.iter().any(|s| s.key.direction == direction) {
                                series.push(CandidateSeries {
                                    key: SeriesKey::new(
                                        integration_id,
                                        &meter.service_point,
                                        meter.fuel,
                                        FeedKind::Interval,
                                        direction,
                                    ),
                                    unit: meter.fuel.canonical_unit(),
                                    points: Vec::new(),
                                });
                            }
                        }
                        Some(IntervalJob::Replace(series))
                    };
                }
            }

            if let Some(hourly) = &fetch.hourly {
                if let Some(readings) = hourly.records.get(&meter.service_point) {
                    let (series, a) = self.merger.merge_meter(FeedKind::Hourly, meter, readings);
                    anomalies += a;
                    job.hourly = series;
                }
            }

            if job.interval.is_some() || !job.hourly.is_empty() {
                jobs.push(job);
            }
        }
        (jobs, anomalies)
    }

    /// Reconcile meters concurrently; interval before hourly within a meter
    async fn reconcile_all(&self, jobs: Vec<MeterJob>, now: DateTime<Utc>) -> Vec<SeriesOutcome> {
        let cutoff = crate::units::cutoff(now);
        let mut tasks = JoinSet::new();
        for job in jobs {
            let reconciler = self.reconciler.clone();
            let integration_id = self.ctx.config.integration_id.clone();
            tasks.spawn(async move {
                let mut outcomes = Vec::new();
                match job.interval {
                    Some(IntervalJob::Replace(series)) => {
                        for s in &series {
                            let outcome = reconciler.reconcile(s, WriteMode::Replace, cutoff, now).await;
                            if !(s.points.is_empty() && outcome.status == SeriesStatus::Unchanged) {
                                outcomes.push(outcome);
                            }
                        }
                    }
                    Some(IntervalJob::Prune) => {
                        for direction in [Direction::Consumption, Direction::Return] {
                            let key = SeriesKey::new(
                                &integration_id,
                                &job.meter.service_point,
                                job.meter.fuel,
                                FeedKind::Interval,
                                direction,
                            );
                            if let Err(e) = reconciler.prune_interval(&key, cutoff).await {
                                let cancelled = matches!(e, GridstatError::Cancelled { .. });
                                outcomes.push(SeriesOutcome {
                                    key: key.statistic_id(),
                                    feed: FeedKind::Interval,
                                    written: 0,
                                    deferred: 0,
                                    status: if cancelled {
                                        SeriesStatus::Cancelled
                                    } else {
                                        SeriesStatus::Failed
                                    },
                                    failure: (!cancelled).then(|| e.kind()),
                                    message: Some(e.to_string()),
                                });
                            }
                        }
                    }
                    None => {}
                }
                for s in &job.hourly {
                    outcomes.push(reconciler.reconcile(s, job.hourly_mode, cutoff, now).await);
                }
                outcomes
            });
        }

        let mut all = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcomes) => all.extend(outcomes),
                Err(e) => self
                    .logger
                    .error(&format!("Reconcile task failed: {}", e)),
            }
        }
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Settle status, flags and snapshot, then publish the result
    async fn finish(
        &self,
        mut result: CycleResult,
        plans: &[(Account, FetchPlan)],
        fresh: &BTreeMap<String, FreshViewData>,
        logger: StructuredLogger,
    ) -> CycleResult {
        let auth_failed = result
            .failures
            .iter()
            .any(|f| f.kind == FailureKind::Authentication);
        let cancelled = result.status == CycleStatus::Cancelled
            || self.shutting_down()
            || result
                .series
                .iter()
                .any(|s| s.status == SeriesStatus::Cancelled);

        result.status = if cancelled {
            CycleStatus::Cancelled
        } else if auth_failed {
            CycleStatus::ReauthRequired
        } else if !result.failures.is_empty() {
            CycleStatus::Degraded
        } else {
            CycleStatus::Success
        };

        if auth_failed {
            self.reauth_required.store(true, Ordering::SeqCst);
            self.set_state(CycleState::Failed);
            logger.error("Authentication failed; scheduled refreshes suspended");
        } else {
            self.set_state(CycleState::Idle);
        }

        if !plans.is_empty() && result.status != CycleStatus::Cancelled {
            self.publish_snapshot(plans, fresh).await;
        }

        result.finished_at = Utc::now();
        logger.info(&format!(
            "Cycle finished: {:?}, {} series, {} points written, {} failures, {} anomalies",
            result.status,
            result.series.len(),
            result.written_points(),
            result.failures.len(),
            result.anomalies
        ));
        *lock(&self.last_result) = Some(result.clone());
        result
    }

    async fn publish_snapshot(
        &self,
        plans: &[(Account, FetchPlan)],
        fresh: &BTreeMap<String, FreshViewData>,
    ) {
        let previous = self.snapshot_tx.borrow().clone();
        let integration_id = &self.ctx.config.integration_id;
        let mut snapshot = UsageSnapshot {
            generated_at: Some(Utc::now()),
            meters: BTreeMap::new(),
        };

        for (account, _) in plans {
            let costs = fresh.get(&account.id).map(|f| &f.usage_costs);
            for meter in &account.meters {
                let prev = previous.meters.get(&meter.service_point);
                let billing = fresh
                    .get(&account.id)
                    .and_then(|f| f.billing.get(&meter.service_point).cloned())
                    .or_else(|| prev.and_then(|p| p.billing.clone()));
                let usage_cost = costs
                    .and_then(|c| {
                        c.iter()
                            .filter(|u| u.fuel == meter.fuel)
                            .max_by_key(|u| u.month_start)
                            .cloned()
                    })
                    .or_else(|| prev.and_then(|p| p.usage_cost.clone()));

                let hourly_key = SeriesKey::new(
                    integration_id,
                    &meter.service_point,
                    meter.fuel,
                    FeedKind::Hourly,
                    Direction::Consumption,
                );
                let last_hourly = self.reconciler.last_point(&hourly_key).await.ok().flatten();
                let last_interval = self
                    .reconciler
                    .last_point(&hourly_key.sibling())
                    .await
                    .ok()
                    .flatten();

                snapshot.meters.insert(
                    meter.service_point.clone(),
                    MeterView {
                        account_id: account.id.clone(),
                        meter: meter.clone(),
                        billing,
                        usage_cost,
                        last_hourly,
                        last_interval,
                    },
                );
            }
        }
        self.snapshot_tx.send_replace(snapshot);
    }
}

/// Billing and usage-cost records fetched this cycle for one account
#[derive(Debug, Default)]
struct FreshViewData {
    /// Latest billing period per service point
    billing: BTreeMap<String, BillingRecord>,
    usage_costs: Vec<UsageCost>,
}

fn collect_view_data(fetched: &[AccountFetch]) -> BTreeMap<String, FreshViewData> {
    let mut out: BTreeMap<String, FreshViewData> = BTreeMap::new();
    for fetch in fetched {
        if let Some(billing) = &fetch.billing {
            for (sp, records) in &billing.records {
                if let Some(latest) = records.iter().max_by_key(|r| r.period_end) {
                    out.entry(fetch.account_id.clone())
                        .or_default()
                        .billing
                        .insert(sp.clone(), latest.clone());
                }
            }
        }
        if let Some(costs) = &fetch.usage_cost {
            for (account_id, records) in &costs.records {
                out.entry(account_id.clone())
                    .or_default()
                    .usage_costs
                    .extend(records.iter().cloned());
            }
        }
    }
    out
}

fn merge_scope(target: &mut ForceScope, other: ForceScope) {
    match other {
        ForceScope::None => {}
        ForceScope::All => target.add(None),
        ForceScope::Accounts(ids) => {
            for id in ids {
                target.add(Some(id));
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
