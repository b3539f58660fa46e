mod common;

use common::*;
use gridstat::api::ApiError;
use gridstat::error::FailureKind;
use gridstat::fetcher::{DataSetStatus, Fetcher};
use gridstat::model::{DataSet, FuelType, TimeRange};
use gridstat::planner::{PlannedFetch, WriteMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn hourly_plan() -> PlannedFetch {
    PlannedFetch {
        set: DataSet::HourlyAmi,
        window: TimeRange::new(ts("2024-03-03T00:00:00Z"), ts("2024-03-08T00:00:00Z")),
        mode: WriteMode::Continue,
    }
}

fn interval_plan() -> PlannedFetch {
    PlannedFetch {
        set: DataSet::Interval,
        window: TimeRange::new(ts("2024-03-08T00:00:00Z"), ts("2024-03-10T13:05:00Z")),
        mode: WriteMode::Replace,
    }
}

fn two_meter_api() -> FakeApi {
    FakeApi::new()
        .with_account("A", vec![electric_meter("E1", false), gas_meter("G1")])
        .with_account("B", vec![electric_meter("E2", true)])
        .with_hourly("E1", readings(ts("2024-03-07T00:00:00Z"), 24, 60, 0.5, "KWH"))
        .with_hourly("G1", readings(ts("2024-03-07T00:00:00Z"), 24, 60, 2.0, "THERMS"))
}

fn fetcher(api: Arc<FakeApi>) -> (Fetcher, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    (Fetcher::new(api, &test_config(), rx), tx)
}

#[tokio::test]
async fn discovery_maps_meters_and_filters_accounts() {
    let api = Arc::new(two_meter_api());
    let (fetcher, _tx) = fetcher(api);

    let (accounts, anomalies) = fetcher.discover(&[]).await.unwrap();
    assert_eq!(anomalies, 0);
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0].region.as_deref(), Some("GA"));
    let gas = &accounts[0].meters[1];
    assert_eq!(gas.fuel, FuelType::Gas);
    assert!(gas.wants_hourly());
    assert!(!gas.wants_interval());

    let (only_b, _) = fetcher.discover(&["B".to_string()]).await.unwrap();
    assert_eq!(only_b.len(), 1);
    assert!(only_b[0].meters[0].solar);
}

#[tokio::test]
async fn discovery_skips_unknown_fuel() {
    let mut water = gas_meter("W1");
    water.fuel_type = "Water".into();
    let api = Arc::new(FakeApi::new().with_account("A", vec![water, gas_meter("G1")]));
    let (fetcher, _tx) = fetcher(api);

    let (accounts, anomalies) = fetcher.discover(&[]).await.unwrap();
    assert_eq!(anomalies, 1);
    assert_eq!(accounts[0].meters.len(), 1);
}

#[tokio::test]
async fn hourly_fetch_normalizes_per_meter() {
    let api = Arc::new(two_meter_api());
    let (fetcher, _tx) = fetcher(api.clone());
    let (accounts, _) = fetcher.discover(&[]).await.unwrap();

    let result = fetcher.fetch_readings(&accounts[0], &hourly_plan()).await;
    assert_eq!(result.status, DataSetStatus::Complete);
    assert_eq!(result.records["E1"].len(), 24);
    let gas = &result.records["G1"];
    assert!((gas[0].quantity - 2.076).abs() < 1e-9);
    assert_eq!(api.calls(DataSet::HourlyAmi), 2);

    // Gas meters have no interval feed
    let interval = fetcher.fetch_readings(&accounts[0], &interval_plan()).await;
    assert_eq!(api.calls(DataSet::Interval), 1);
    assert!(interval.records.contains_key("E1"));
    assert!(!interval.records.contains_key("G1"));
}

#[tokio::test]
async fn auth_failure_halts_the_data_set() {
    let api = Arc::new(two_meter_api());
    api.fail(DataSet::HourlyAmi, ApiError::InvalidAuth("expired".into()));
    let (fetcher, _tx) = fetcher(api.clone());
    let (accounts, _) = fetcher.discover(&[]).await.unwrap();

    let result = fetcher.fetch_readings(&accounts[0], &hourly_plan()).await;
    assert_eq!(
        result.status,
        DataSetStatus::Halted(FailureKind::Authentication)
    );
    assert!(result.is_fatal());
    assert!(result.records.is_empty());
    assert!(result.failed.contains("E1") && result.failed.contains("G1"));
    // Never retried
    assert!(api.calls(DataSet::HourlyAmi) <= 2);
}

#[tokio::test]
async fn throttling_halts_without_retry() {
    let api = Arc::new(two_meter_api());
    api.fail(
        DataSet::HourlyAmi,
        ApiError::Throttled {
            retry_after_secs: None,
        },
    );
    let (fetcher, _tx) = fetcher(api.clone());
    let (accounts, _) = fetcher.discover(&[]).await.unwrap();

    let result = fetcher.fetch_readings(&accounts[1], &hourly_plan()).await;
    assert_eq!(result.status, DataSetStatus::Halted(FailureKind::RateLimit));
    assert!(!result.is_fatal());
    assert_eq!(api.calls(DataSet::HourlyAmi), 1);
    assert_eq!(result.failures[0].kind, FailureKind::RateLimit);
}

#[tokio::test]
async fn exhausted_retries_leave_a_partial_result() {
    let api = Arc::new(two_meter_api());
    api.fail(DataSet::Interval, ApiError::CannotConnect("reset".into()));
    let (fetcher, _tx) = fetcher(api.clone());
    let (accounts, _) = fetcher.discover(&[]).await.unwrap();

    let result = fetcher.fetch_readings(&accounts[0], &interval_plan()).await;
    assert_eq!(result.status, DataSetStatus::Partial);
    assert_eq!(api.calls(DataSet::Interval), 3);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].service_point.as_deref(), Some("E1"));
}

#[tokio::test]
async fn panicking_request_marks_its_meter_failed() {
    let api = Arc::new(two_meter_api());
    api.panic_on(DataSet::HourlyAmi);
    let (fetcher, _tx) = fetcher(api.clone());
    let (accounts, _) = fetcher.discover(&[]).await.unwrap();

    let result = fetcher.fetch_readings(&accounts[0], &hourly_plan()).await;
    assert_eq!(result.status, DataSetStatus::Partial);
    assert!(result.records.is_empty());
    assert!(result.failed.contains("E1") && result.failed.contains("G1"));
    assert_eq!(result.failures.len(), 2);
    assert!(
        result
            .failures
            .iter()
            .all(|f| f.kind == FailureKind::Communication && f.data_set == Some(DataSet::HourlyAmi))
    );
}

#[tokio::test]
async fn shutdown_cancels_in_flight_requests() {
    let api = Arc::new(two_meter_api());
    api.set_delay(Duration::from_secs(5));
    let (fetcher, tx) = fetcher(api.clone());
    let (accounts, _) = fetcher.discover(&[]).await.unwrap();

    let plan = hourly_plan();
    let fetch = fetcher.fetch_readings(&accounts[0], &plan);
    let stop = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(fetch, stop);
    assert_eq!(result.status, DataSetStatus::Cancelled);
    assert!(result.records.is_empty());
}
