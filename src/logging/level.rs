use crate::error::{GridstatError, Result};
use tracing::Level;

/// Parse a configured level name, case-insensitively
///
/// Accepts the tracing names plus the `WARNING` spelling.
pub fn parse_log_level(level_str: &str) -> Result<Level> {
    let name = level_str.trim();
    if name.eq_ignore_ascii_case("warning") {
        return Ok(Level::WARN);
    }
    name.parse::<Level>()
        .map_err(|_| GridstatError::config(format!("Invalid log level: {}", level_str)))
}

/// The more verbose of two levels
///
/// tracing orders levels by verbosity, so `TRACE` compares greatest.
pub(super) fn min_level(a: Level, b: Level) -> Level {
    a.max(b)
}
