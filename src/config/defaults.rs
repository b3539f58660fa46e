use super::*;

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            access_token: String::new(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { trigger_minute: 5 }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            hourly_lookback_days: 5,
            history_lookback_days: 1825,
            billing_lookback_days: 62,
            usage_cost_lookback_days: 465,
            max_concurrent_requests: 4,
            import_history_on_start: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2000,
            max_backoff_ms: 60_000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "/data/gridstat_statistics.json".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/gridstat.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8089,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            integration_id: "gridstat".to_string(),
            timezone: "UTC".to_string(),
            accounts: Vec::new(),
            api: ApiConfig::default(),
            schedule: ScheduleConfig::default(),
            fetch: FetchConfig::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
        }
    }
}
