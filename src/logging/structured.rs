use std::collections::BTreeMap;
use tracing::Level;

/// Who a log line is about: the emitting component plus the account and
/// service point being processed, when known
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "fetcher", "reconciler", "web")
    pub component: String,
    pub account_id: Option<String>,
    pub service_point: Option<String>,
    /// Free-form fields such as the cycle id
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            account_id: None,
            service_point: None,
            extra_fields: BTreeMap::new(),
        }
    }

    pub fn with_account(mut self, account_id: String) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_service_point(mut self, service_point: String) -> Self {
        self.service_point = Some(service_point);
        self
    }

    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }

    /// `key=value` pairs, component first, extras in key order
    fn render(&self) -> String {
        let fixed = [
            Some(("component", self.component.as_str())),
            self.account_id.as_deref().map(|v| ("account_id", v)),
            self.service_point.as_deref().map(|v| ("service_point", v)),
        ];
        fixed
            .into_iter()
            .flatten()
            .chain(
                self.extra_fields
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            )
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Logger that prefixes every event with its [`LogContext`]
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
    fields: String,
}

impl StructuredLogger {
    pub fn new(context: LogContext) -> Self {
        let fields = context.render();
        Self { context, fields }
    }

    /// Derive a logger for one service point
    pub fn for_service_point(&self, service_point: &str) -> Self {
        Self::new(
            self.context
                .clone()
                .with_service_point(service_point.to_string()),
        )
    }

    pub fn info(&self, message: &str) {
        self.emit(Level::INFO, message);
    }

    pub fn warn(&self, message: &str) {
        self.emit(Level::WARN, message);
    }

    pub fn error(&self, message: &str) {
        self.emit(Level::ERROR, message);
    }

    pub fn debug(&self, message: &str) {
        self.emit(Level::DEBUG, message);
    }

    pub fn trace(&self, message: &str) {
        self.emit(Level::TRACE, message);
    }

    // tracing needs the level at the callsite, hence one macro per arm
    fn emit(&self, level: Level, message: &str) {
        let fields = self.fields.as_str();
        match level {
            Level::ERROR => tracing::error!(fields, "{}", message),
            Level::WARN => tracing::warn!(fields, "{}", message),
            Level::INFO => tracing::info!(fields, "{}", message),
            Level::DEBUG => tracing::debug!(fields, "{}", message),
            _ => tracing::trace!(fields, "{}", message),
        }
    }
}

pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

pub fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}
