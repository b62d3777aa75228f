use tracing::warn;
use super::Config;

/// Overrides the log level
pub const ENV_LOG_LEVEL: &str = "LLAMADISPATCH_LOG_LEVEL";
/// Overrides `dispatcher.max_failures`
pub const ENV_MAX_FAILURES: &str = "LLAMADISPATCH_MAX_FAILURES";
/// Overrides `delegation.reply_timeout_ms`
pub const ENV_REPLY_TIMEOUT_MS: &str = "LLAMADISPATCH_REPLY_TIMEOUT_MS";
/// Overrides `scaling.interval_secs`
pub const ENV_SCALING_INTERVAL_SECS: &str = "LLAMADISPATCH_SCALING_INTERVAL_SECS";

/// Applies `LLAMADISPATCH_*` environment variables on top of a loaded config
///
/// Values that fail to parse are logged and ignored.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(level) = get_env_value(ENV_LOG_LEVEL) {
        config.log_level = level;
    }
    if let Some(value) = parse_env::<u32>(ENV_MAX_FAILURES) {
        config.dispatcher.max_failures = value;
    }
    if let Some(value) = parse_env::<u64>(ENV_REPLY_TIMEOUT_MS) {
        config.delegation.reply_timeout_ms = value;
    }
    if let Some(value) = parse_env::<u64>(ENV_SCALING_INTERVAL_SECS) {
        config.scaling.interval_secs = value;
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env_value(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Reads an environment variable, treating empty values as unset
pub fn get_env_value(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
