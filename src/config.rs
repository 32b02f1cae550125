use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MAX_SCAN_BATCH;
use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Knobs the engine itself reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long after an activity's end its loans become overdue.
    pub overdue_grace_ms: Ms,
    pub cache_ttl: Duration,
    /// Activities fetched per scanner batch.
    pub scan_batch_size: usize,
    /// Deadline for one scan invocation. `None` scans to completion.
    pub scan_budget: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overdue_grace_ms: 0,
            cache_ttl: Duration::from_secs(30),
            scan_batch_size: 100,
            scan_budget: Some(Duration::from_millis(2000)),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends before compaction.
    pub compact_threshold: u64,
    pub scan_interval: Duration,
    pub reconcile_interval: Duration,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            scan_interval: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(3600),
            engine: EngineConfig::default(),
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("LOANLEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.metrics_port = parse("LOANLEDGER_METRICS_PORT", get("LOANLEDGER_METRICS_PORT"))?;
        if let Some(n) = parse("LOANLEDGER_COMPACT_THRESHOLD", get("LOANLEDGER_COMPACT_THRESHOLD"))? {
            config.compact_threshold = n;
        }
        if let Some(secs) = parse::<u64>(
            "LOANLEDGER_SCAN_INTERVAL_SECS",
            get("LOANLEDGER_SCAN_INTERVAL_SECS"),
        )? {
            config.scan_interval = positive_secs("LOANLEDGER_SCAN_INTERVAL_SECS", secs)?;
        }
        if let Some(secs) = parse::<u64>(
            "LOANLEDGER_RECONCILE_INTERVAL_SECS",
            get("LOANLEDGER_RECONCILE_INTERVAL_SECS"),
        )? {
            config.reconcile_interval = positive_secs("LOANLEDGER_RECONCILE_INTERVAL_SECS", secs)?;
        }

        let engine = &mut config.engine;
        if let Some(ms) = parse::<Ms>("LOANLEDGER_OVERDUE_GRACE_MS", get("LOANLEDGER_OVERDUE_GRACE_MS"))? {
            if ms < 0 {
                return Err(ConfigError::Invalid {
                    key: "LOANLEDGER_OVERDUE_GRACE_MS",
                    value: ms.to_string(),
                });
            }
            engine.overdue_grace_ms = ms;
        }
        if let Some(secs) = parse::<u64>("LOANLEDGER_CACHE_TTL_SECS", get("LOANLEDGER_CACHE_TTL_SECS"))? {
            engine.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<usize>("LOANLEDGER_SCAN_BATCH", get("LOANLEDGER_SCAN_BATCH"))? {
            if n == 0 || n > MAX_SCAN_BATCH {
                return Err(ConfigError::Invalid {
                    key: "LOANLEDGER_SCAN_BATCH",
                    value: n.to_string(),
                });
            }
            engine.scan_batch_size = n;
        }
        if let Some(ms) = parse::<u64>("LOANLEDGER_SCAN_BUDGET_MS", get("LOANLEDGER_SCAN_BUDGET_MS"))? {
            engine.scan_budget = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

fn positive_secs(key: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engine.overdue_grace_ms, 0);
        assert_eq!(config.wal_path(), PathBuf::from("./data/ledger.wal"));
    }

    #[test]
    fn reads_every_variable() {
        let config = from_pairs(&[
            ("LOANLEDGER_DATA_DIR", "/var/lib/loanledger"),
            ("LOANLEDGER_METRICS_PORT", "9100"),
            ("LOANLEDGER_COMPACT_THRESHOLD", "50"),
            ("LOANLEDGER_SCAN_INTERVAL_SECS", "60"),
            ("LOANLEDGER_RECONCILE_INTERVAL_SECS", "600"),
            ("LOANLEDGER_OVERDUE_GRACE_MS", "3600000"),
            ("LOANLEDGER_CACHE_TTL_SECS", "10"),
            ("LOANLEDGER_SCAN_BATCH", "25"),
            ("LOANLEDGER_SCAN_BUDGET_MS", "0"),
        ])
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/loanledger"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.scan_interval, Duration::from_secs(60));
        assert_eq!(config.reconcile_interval, Duration::from_secs(600));
        assert_eq!(config.engine.overdue_grace_ms, 3_600_000);
        assert_eq!(config.engine.cache_ttl, Duration::from_secs(10));
        assert_eq!(config.engine.scan_batch_size, 25);
        assert_eq!(config.engine.scan_budget, None);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = from_pairs(&[("LOANLEDGER_METRICS_PORT", "ninety")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "LOANLEDGER_METRICS_PORT",
                value: "ninety".into()
            }
        );
        assert!(from_pairs(&[("LOANLEDGER_OVERDUE_GRACE_MS", "-5")]).is_err());
        assert!(from_pairs(&[("LOANLEDGER_SCAN_BATCH", "0")]).is_err());
        assert!(from_pairs(&[("LOANLEDGER_SCAN_INTERVAL_SECS", "0")]).is_err());
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = from_pairs(&[("LOANLEDGER_COMPACT_THRESHOLD", "  ")]).unwrap();
        assert_eq!(config.compact_threshold, 1000);
    }
}
