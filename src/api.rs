//! Remote account API capability
//!
//! The refresh core only sees the [`UtilityApi`] trait. Responses come back in
//! the vendor's shape (see [`types`]) and are normalized by the fetcher. The
//! HTTP implementation lives in [`client`] behind the `remote` feature.

#[cfg(feature = "remote")]
pub mod client;
pub mod types;

#[cfg(feature = "remote")]
pub use client::HttpUtilityApi;
pub use types::{RawAccount, RawBilling, RawMeter, RawReading, RawUsageCost};

use crate::error::GridstatError;
use crate::model::{Meter, TimeRange};
use thiserror::Error;

/// Errors a [`UtilityApi`] implementation reports
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("invalid credentials: {0}")]
    InvalidAuth(String),

    #[error("cannot connect: {0}")]
    CannotConnect(String),

    #[error("throttled (retry after {retry_after_secs:?}s)")]
    Throttled { retry_after_secs: Option<u64> },

    #[error("unexpected HTTP status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("undecodable response: {0}")]
    Decode(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<ApiError> for GridstatError {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        match err {
            ApiError::InvalidAuth(_) => GridstatError::auth(message),
            ApiError::CannotConnect(_) => GridstatError::communication(message),
            ApiError::Throttled { retry_after_secs } => {
                GridstatError::rate_limited(message, retry_after_secs)
            }
            ApiError::Http { .. } | ApiError::Decode(_) => GridstatError::api(message),
        }
    }
}

/// Operations the account API offers
#[async_trait::async_trait]
pub trait UtilityApi: Send + Sync {
    async fn list_accounts(&self) -> ApiResult<Vec<RawAccount>>;

    async fn list_meters(&self, account_id: &str) -> ApiResult<Vec<RawMeter>>;

    async fn get_billing(&self, meter: &Meter, range: TimeRange) -> ApiResult<Vec<RawBilling>>;

    async fn get_usage_costs(
        &self,
        account_id: &str,
        range: TimeRange,
    ) -> ApiResult<Vec<RawUsageCost>>;

    async fn get_hourly_readings(
        &self,
        meter: &Meter,
        range: TimeRange,
    ) -> ApiResult<Vec<RawReading>>;

    async fn get_interval_readings(
        &self,
        meter: &Meter,
        range: TimeRange,
    ) -> ApiResult<Vec<RawReading>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_api_error_mapping() {
        let auth: GridstatError = ApiError::InvalidAuth("expired".into()).into();
        assert_eq!(auth.kind(), FailureKind::Authentication);

        let throttled: GridstatError = ApiError::Throttled {
            retry_after_secs: Some(60),
        }
        .into();
        assert!(matches!(
            throttled,
            GridstatError::RateLimited {
                retry_after_secs: Some(60),
                ..
            }
        ));

        let conn: GridstatError = ApiError::CannotConnect("reset".into()).into();
        assert!(conn.is_retryable());

        let decode: GridstatError = ApiError::Decode("eof".into()).into();
        assert_eq!(decode.kind(), FailureKind::Communication);
        assert!(!decode.is_retryable());
    }
}
