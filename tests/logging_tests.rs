use gridstat::logging::{LogContext, get_logger_with_context, parse_log_level};
use tracing::Level;

#[test]
fn parse_level_accepts_warning_alias() {
    assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
    assert_eq!(parse_log_level("Trace").unwrap(), Level::TRACE);
    assert!(parse_log_level("loud").is_err());
}

#[test]
fn context_logger_emits_without_subscriber() {
    let logger = get_logger_with_context(
        LogContext::new("integration")
            .with_account("A".to_string())
            .with_service_point("SP1".to_string())
            .with_field("cycle", "c1".to_string()),
    );
    // No global subscriber installed; must not panic
    logger.info("info line");
    logger.warn("warn line");
    logger.for_service_point("SP2").debug("debug line");
}
