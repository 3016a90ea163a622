// Engine configuration, read from TASKWEAVE_* environment variables.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max size in KB for long JSON fields (input, output, params, published,
    /// context). Negative means unlimited.
    pub execution_field_size_limit_kb: i64,
    /// Spacing between delayed-call sweeps
    pub scheduler_interval: Duration,
    /// Spacing between cron trigger sweeps
    pub cron_interval: Duration,
    /// A claimed delayed call older than this is considered abandoned and
    /// reclaimed by the next sweep
    pub stale_call_threshold: Duration,
    /// Bounded retries for transient database errors
    pub db_retry_count: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            execution_field_size_limit_kb: 1024,
            scheduler_interval: Duration::from_secs(1),
            cron_interval: Duration::from_secs(1),
            stale_call_threshold: Duration::from_secs(60),
            db_retry_count: 3,
        }
    }
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();

        EngineConfig {
            execution_field_size_limit_kb: env_i64(
                "TASKWEAVE_FIELD_SIZE_LIMIT_KB",
                defaults.execution_field_size_limit_kb,
            ),
            scheduler_interval: env_secs(
                "TASKWEAVE_SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval,
            ),
            cron_interval: env_secs("TASKWEAVE_CRON_INTERVAL_SECS", defaults.cron_interval),
            stale_call_threshold: env_secs(
                "TASKWEAVE_STALE_CALL_THRESHOLD_SECS",
                defaults.stale_call_threshold,
            ),
            db_retry_count: env_i64("TASKWEAVE_DB_RETRY_COUNT", defaults.db_retry_count as i64)
                .max(0) as u32,
        }
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.execution_field_size_limit_kb, 1024);
        assert_eq!(config.scheduler_interval, Duration::from_secs(1));
        assert_eq!(config.cron_interval, Duration::from_secs(1));
        assert_eq!(config.stale_call_threshold, Duration::from_secs(60));
        assert_eq!(config.db_retry_count, 3);
    }
}
