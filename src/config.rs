//! Configuration module for uptimed.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptimed.db")
    pub db_path: String,
    /// Regions every target is probed from.
    pub regions: Vec<String>,
    /// Interval between probe starts per (target, region), clamped to 30s-3min.
    pub probe_interval: Duration,
    /// Hard per-probe timeout.
    pub probe_timeout: Duration,
    /// Consecutive down ticks required before an incident opens.
    pub debounce_ticks: u32,
    /// Cap on concurrent in-flight probes per region.
    pub max_probes_per_region: usize,
    /// Raw ticks older than this are pruned.
    pub retention_days: i64,
    /// Upper bound of the random per-dispatch jitter. Zero disables jitter.
    pub jitter_ms: u64,
    /// How often the scheduler re-reads the live target set.
    pub membership_refresh: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptimed.db".to_string(),
            regions: vec![
                "us-east-1".to_string(),
                "india-1".to_string(),
                "asia-1".to_string(),
            ],
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            debounce_ticks: 2,
            max_probes_per_region: 16,
            retention_days: 90,
            jitter_ms: 1000,
            membership_refresh: Duration::from_secs(15),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTIMED_HTTP_PORT`: HTTP port (default: 8080)
    /// - `UPTIMED_DB_PATH`: database file path (default: "uptimed.db")
    /// - `UPTIMED_REGIONS`: comma-separated region IDs
    /// - `UPTIMED_PROBE_INTERVAL_SECS`: probe cadence, clamped to 30-180
    /// - `UPTIMED_PROBE_TIMEOUT_SECS`: per-probe timeout
    /// - `UPTIMED_DEBOUNCE_TICKS`: consecutive failures before an incident
    /// - `UPTIMED_MAX_PROBES_PER_REGION`: concurrency cap per region
    /// - `UPTIMED_RETENTION_DAYS`: raw tick retention horizon
    /// - `UPTIMED_JITTER_MS`: dispatch jitter upper bound
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("UPTIMED_HTTP_PORT") {
            if let Ok(port) = v.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(v) = env::var("UPTIMED_DB_PATH") {
            cfg.db_path = v;
        }

        if let Ok(v) = env::var("UPTIMED_REGIONS") {
            let regions: Vec<String> = v
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
            if !regions.is_empty() {
                cfg.regions = regions;
            }
        }

        if let Ok(v) = env::var("UPTIMED_PROBE_INTERVAL_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.probe_interval = Duration::from_secs(secs.clamp(30, 180));
            }
        }

        if let Ok(v) = env::var("UPTIMED_PROBE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                if secs > 0 {
                    cfg.probe_timeout = Duration::from_secs(secs);
                }
            }
        }

        if let Ok(v) = env::var("UPTIMED_DEBOUNCE_TICKS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.debounce_ticks = n.max(1);
            }
        }

        if let Ok(v) = env::var("UPTIMED_MAX_PROBES_PER_REGION") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.max_probes_per_region = n;
                }
            }
        }

        if let Ok(v) = env::var("UPTIMED_RETENTION_DAYS") {
            if let Ok(days) = v.parse::<i64>() {
                if days > 0 {
                    cfg.retention_days = days;
                }
            }
        }

        if let Ok(v) = env::var("UPTIMED_JITTER_MS") {
            if let Ok(ms) = v.parse() {
                cfg.jitter_ms = ms;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "uptimed.db");
        assert_eq!(cfg.regions.len(), 3);
        assert_eq!(cfg.probe_interval, Duration::from_secs(30));
        assert!(cfg.debounce_ticks >= 1);
    }
}
