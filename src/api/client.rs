use super::types::{RawAccount, RawBilling, RawMeter, RawReading, RawUsageCost};
use super::{ApiError, ApiResult, UtilityApi};
use crate::config::ApiConfig;
use crate::error::{GridstatError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::model::{Meter, TimeRange};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// REST/JSON implementation of [`UtilityApi`] with bearer authentication
pub struct HttpUtilityApi {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    logger: StructuredLogger,
}

impl HttpUtilityApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(GridstatError::validation(
                "api.base_url",
                "Base URL cannot be empty",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.trim().to_string(),
            logger: get_logger("api"),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        range: Option<TimeRange>,
    ) -> ApiResult<T> {
        let mut req = self
            .client
            .get(self.url(path))
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, concat!("gridstat/", env!("APP_VERSION")));
        if let Some(range) = range {
            req = req.query(&[
                ("from", range.start.to_rfc3339()),
                ("to", range.end.to_rfc3339()),
            ]);
        }

        self.logger.trace(&format!("GET {}", path));
        let resp = req.send().await.map_err(|e| {
            ApiError::CannotConnect(format!("{} {}", path, e))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after_secs = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after_secs, body));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ApiError::CannotConnect(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(format!("{}: {}", path, e)))
    }
}

/// Longest error body kept in an `ApiError::Http`
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Map a non-success status onto the API error taxonomy
pub fn map_status(status: StatusCode, retry_after_secs: Option<u64>, body: String) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::InvalidAuth(format!("HTTP {}", status.as_u16()))
        }
        StatusCode::TOO_MANY_REQUESTS => ApiError::Throttled { retry_after_secs },
        s if s.is_server_error() => ApiError::CannotConnect(format!("HTTP {}", s.as_u16())),
        s => ApiError::Http {
            status: s.as_u16(),
            message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        },
    }
}

#[async_trait::async_trait]
impl UtilityApi for HttpUtilityApi {
    async fn list_accounts(&self) -> ApiResult<Vec<RawAccount>> {
        self.get_json("/accounts", None).await
    }

    async fn list_meters(&self, account_id: &str) -> ApiResult<Vec<RawMeter>> {
        self.get_json(&format!("/accounts/{}/meters", account_id), None)
            .await
    }

    async fn get_billing(&self, meter: &Meter, range: TimeRange) -> ApiResult<Vec<RawBilling>> {
        self.get_json(
            &format!("/meters/{}/billing", meter.service_point),
            Some(range),
        )
        .await
    }

    async fn get_usage_costs(
        &self,
        account_id: &str,
        range: TimeRange,
    ) -> ApiResult<Vec<RawUsageCost>> {
        self.get_json(&format!("/accounts/{}/usage-costs", account_id), Some(range))
            .await
    }

    async fn get_hourly_readings(
        &self,
        meter: &Meter,
        range: TimeRange,
    ) -> ApiResult<Vec<RawReading>> {
        self.get_json(
            &format!("/meters/{}/usage/hourly", meter.service_point),
            Some(range),
        )
        .await
    }

    async fn get_interval_readings(
        &self,
        meter: &Meter,
        range: TimeRange,
    ) -> ApiResult<Vec<RawReading>> {
        self.get_json(
            &format!("/meters/{}/usage/interval", meter.service_point),
            Some(range),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, None, String::new()),
            ApiError::InvalidAuth(_)
        ));
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, None, String::new()),
            ApiError::InvalidAuth(_)
        ));
        assert_eq!(
            map_status(StatusCode::TOO_MANY_REQUESTS, Some(120), String::new()),
            ApiError::Throttled {
                retry_after_secs: Some(120)
            }
        );
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, None, String::new()),
            ApiError::CannotConnect(_)
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, None, "missing".into()),
            ApiError::Http { status: 404, .. }
        ));
    }

    #[test]
    fn test_error_body_truncated_on_char_boundary() {
        let body = format!("{}é{}", "a".repeat(199), "ü".repeat(50));
        let ApiError::Http { status, message } = map_status(StatusCode::BAD_REQUEST, None, body)
        else {
            panic!("expected an Http error");
        };
        assert_eq!(status, 400);
        assert_eq!(message.chars().count(), 200);
        assert!(message.ends_with('é'));
    }

    #[test]
    fn test_new_requires_base_url() {
        let cfg = ApiConfig::default();
        assert!(HttpUtilityApi::new(&cfg).is_err());

        let cfg = ApiConfig {
            base_url: "https://example.invalid/api/".into(),
            access_token: "t".into(),
            request_timeout_secs: 5,
        };
        let api = HttpUtilityApi::new(&cfg).unwrap();
        assert_eq!(api.url("/accounts"), "https://example.invalid/api/accounts");
    }
}
