use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Tuning knobs for a single tenant's scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// How long a slot stays usable after it is created or extended.
    /// Tied to the worker heartbeat cadence; a slot that outlives its
    /// worker's heartbeat window is swept on the next replenish.
    #[serde(default = "default_slot_ttl_ms")]
    pub slot_ttl_ms: i64,
    /// Interval between background replenish passes.
    #[serde(default = "default_replenish_interval_ms")]
    pub replenish_interval_ms: u64,
    /// Maximum number of queue items assigned concurrently per action.
    #[serde(default = "default_assign_batch_size")]
    pub assign_batch_size: usize,
    /// Passes slower than this log a warning.
    #[serde(default = "default_slow_pass_warn_ms")]
    pub slow_pass_warn_ms: u64,
    /// Seed for the slot-shuffle RNG. Unset means seed from entropy;
    /// set it for reproducible shuffle order in tests.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn default_slot_ttl_ms() -> i64 {
    15_000
}

fn default_replenish_interval_ms() -> u64 {
    1_000
}

fn default_assign_batch_size() -> usize {
    50
}

fn default_slow_pass_warn_ms() -> u64 {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slot_ttl_ms: default_slot_ttl_ms(),
            replenish_interval_ms: default_replenish_interval_ms(),
            assign_batch_size: default_assign_batch_size(),
            slow_pass_warn_ms: default_slow_pass_warn_ms(),
            rng_seed: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Address for the `/metrics` endpoint. Unset disables the server.
    pub addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    /// Load configuration from an optional TOML file, falling back to
    /// defaults for anything not present.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: AppConfig = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self {
                scheduler: SchedulerConfig::default(),
                log_format: LogFormat::default(),
                metrics: MetricsConfig::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_omitted() {
        let cfg: AppConfig = toml::from_str("[scheduler]\nslot_ttl_ms = 5000\n").unwrap();
        assert_eq!(cfg.scheduler.slot_ttl_ms, 5000);
        assert_eq!(cfg.scheduler.replenish_interval_ms, 1_000);
        assert_eq!(cfg.scheduler.assign_batch_size, 50);
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert!(cfg.metrics.addr.is_none());
    }

    #[test]
    fn log_format_parses_lowercase() {
        let cfg: AppConfig = toml::from_str("log_format = \"json\"\n").unwrap();
        assert_eq!(cfg.log_format, LogFormat::Json);
    }
}
