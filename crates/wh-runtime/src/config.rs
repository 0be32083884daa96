//! Worker loop configuration, read from the environment following the
//! teacher's `WorkerConfig::from_env`/`GovernorConfig::from_env`
//! env-var-or-default idiom.

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep between poll iterations when there is no
    /// claimed work to process (`spec.md` §5).
    pub polling_interval_ms: u64,
    pub lease_seconds: i64,
    pub stale_threshold_seconds: i64,
    pub partition_count: i32,
    pub max_partitions_per_instance: usize,
    /// Consecutive empty polls before the loop emits an idle transition
    /// on its broadcast channel.
    pub idle_threshold_polls: u32,
    pub debug_mode: bool,
    /// Free-form instance metadata recorded on each heartbeat.
    pub instance_metadata: serde_json::Value,
}

impl Default for WorkerConfig {
    /// Defaults per `spec.md` §6's options table.
    fn default() -> Self {
        Self {
            polling_interval_ms: 1000,
            lease_seconds: 300,
            stale_threshold_seconds: 600,
            partition_count: 10_000,
            max_partitions_per_instance: 100,
            idle_threshold_polls: 2,
            debug_mode: false,
            instance_metadata: serde_json::json!({}),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            polling_interval_ms: std::env::var("WH_POLLING_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.polling_interval_ms),
            lease_seconds: std::env::var("WH_LEASE_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lease_seconds),
            stale_threshold_seconds: std::env::var("WH_STALE_THRESHOLD_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.stale_threshold_seconds),
            partition_count: std::env::var("WH_PARTITION_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.partition_count),
            max_partitions_per_instance: std::env::var("WH_MAX_PARTITIONS_PER_INSTANCE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_partitions_per_instance),
            idle_threshold_polls: std::env::var("WH_IDLE_THRESHOLD_POLLS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.idle_threshold_polls),
            debug_mode: std::env::var("WH_DEBUG_MODE")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.debug_mode),
            instance_metadata: std::env::var("WH_INSTANCE_METADATA")
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(defaults.instance_metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_pipeline_ordering() {
        let config = WorkerConfig::default();
        assert!(config.lease_seconds < config.stale_threshold_seconds);
        assert!(config.polling_interval_ms > 0);
    }
}
