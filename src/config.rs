//! Configuration module.
//!
//! Loads configuration from environment variables (optionally seeded from a
//! `.env` file). Missing or malformed required settings are fatal.

use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::ops::RangeInclusive;
use std::time::Duration;
use thiserror::Error;

use crate::db::RetentionPolicy;

/// Allowed range for the per-target history window.
pub const HISTORY_SIZE_RANGE: RangeInclusive<usize> = 30..=60;

/// Longest retention horizon accepted, in days.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid target list: {0}")]
    Targets(String),
}

/// One monitored endpoint as written in configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Overrides the global probe timeout for this target.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 1025)
    pub http_port: u16,
    /// Path to the SQLite database file (required)
    pub db_path: String,
    /// Time between probe ticks (default: 15s)
    pub poll_interval: Duration,
    /// Default per-probe timeout (default: 10s)
    pub probe_timeout: Duration,
    /// Cap on probes in flight across all ticks (default: 16)
    pub max_concurrent_probes: usize,
    /// Events per target in the aggregated history (default: 60)
    pub history_size: usize,
    /// How long an aggregated answer is reused; zero disables caching (default: 1s)
    pub cache_ttl: Duration,
    /// Exact origins allowed by CORS (default: none)
    pub allowed_origins: Vec<String>,
    pub retention: RetentionPolicy,
    /// Time between expiry sweeps (default: 60s)
    pub retention_sweep: Duration,
    pub targets: Vec<TargetConfig>,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - `ISDOWN_DB_PATH`: database file path (required)
    /// - `ISDOWN_TARGETS` / `ISDOWN_TARGETS_FILE`: JSON target list (one required)
    /// - `ISDOWN_HTTP_PORT`, `ISDOWN_POLL_INTERVAL_SECS`, `ISDOWN_PROBE_TIMEOUT_SECS`,
    ///   `ISDOWN_MAX_CONCURRENT_PROBES`, `ISDOWN_HISTORY_SIZE`, `ISDOWN_CACHE_TTL_MS`,
    ///   `ISDOWN_ALLOWED_ORIGINS`, `ISDOWN_EVENT_RETENTION_DAYS`,
    ///   `ISDOWN_HEALTHY_RETENTION_DAYS`, `ISDOWN_RETENTION_SWEEP_SECS`
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("ISDOWN_DB_PATH")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("ISDOWN_DB_PATH"))?;

        let targets_json = match (lookup("ISDOWN_TARGETS"), lookup("ISDOWN_TARGETS_FILE")) {
            (Some(json), _) => json,
            (None, Some(path)) => std::fs::read_to_string(&path).map_err(|e| {
                ConfigError::Invalid {
                    key: "ISDOWN_TARGETS_FILE",
                    reason: format!("{}: {}", path, e),
                }
            })?,
            (None, None) => return Err(ConfigError::Missing("ISDOWN_TARGETS")),
        };
        let targets = parse_targets(&targets_json)?;

        let http_port = parse_or(&lookup, "ISDOWN_HTTP_PORT", 1025u16)?;
        let poll_interval = positive_secs(&lookup, "ISDOWN_POLL_INTERVAL_SECS", 15.0)?;
        let probe_timeout = positive_secs(&lookup, "ISDOWN_PROBE_TIMEOUT_SECS", 10.0)?;
        let retention_sweep = positive_secs(&lookup, "ISDOWN_RETENTION_SWEEP_SECS", 60.0)?;

        let max_concurrent_probes = parse_or(&lookup, "ISDOWN_MAX_CONCURRENT_PROBES", 16usize)?;
        if max_concurrent_probes == 0 {
            return Err(ConfigError::Invalid {
                key: "ISDOWN_MAX_CONCURRENT_PROBES",
                reason: "must be at least 1".to_string(),
            });
        }

        let history_size = parse_or(&lookup, "ISDOWN_HISTORY_SIZE", 60usize)?;
        if !HISTORY_SIZE_RANGE.contains(&history_size) {
            return Err(ConfigError::Invalid {
                key: "ISDOWN_HISTORY_SIZE",
                reason: format!(
                    "{} is outside {}..={}",
                    history_size,
                    HISTORY_SIZE_RANGE.start(),
                    HISTORY_SIZE_RANGE.end()
                ),
            });
        }

        let cache_ttl = Duration::from_millis(parse_or(&lookup, "ISDOWN_CACHE_TTL_MS", 1000u64)?);

        let allowed_origins = lookup("ISDOWN_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let event_horizon = retention_days(&lookup, "ISDOWN_EVENT_RETENTION_DAYS", 60)?;
        let healthy_horizon = retention_days(&lookup, "ISDOWN_HEALTHY_RETENTION_DAYS", 7)?;

        Ok(Self {
            http_port,
            db_path,
            poll_interval,
            probe_timeout,
            max_concurrent_probes,
            history_size,
            cache_ttl,
            allowed_origins,
            retention: RetentionPolicy {
                event_horizon,
                healthy_horizon,
            },
            retention_sweep,
            targets,
        })
    }
}

/// Parse and sanity-check the JSON target list.
pub fn parse_targets(json: &str) -> Result<Vec<TargetConfig>, ConfigError> {
    let targets: Vec<TargetConfig> =
        serde_json::from_str(json).map_err(|e| ConfigError::Targets(e.to_string()))?;

    if targets.is_empty() {
        return Err(ConfigError::Targets("no targets configured".to_string()));
    }

    let mut seen = std::collections::HashSet::new();
    for t in &targets {
        if t.name.trim().is_empty() {
            return Err(ConfigError::Targets("target name cannot be empty".to_string()));
        }
        if !seen.insert(t.name.as_str()) {
            return Err(ConfigError::Targets(format!("duplicate target name {}", t.name)));
        }
        if matches!(t.timeout_secs, Some(s) if secs_to_duration(s).is_none()) {
            return Err(ConfigError::Targets(format!(
                "timeoutSecs for {} must be positive",
                t.name
            )));
        }
    }

    Ok(targets)
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("{:?}: {}", raw, e),
        }),
    }
}

fn positive_secs<F>(lookup: &F, key: &'static str, default: f64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, key, default)?;
    secs_to_duration(secs).ok_or_else(|| ConfigError::Invalid {
        key,
        reason: format!("{} is not a usable positive number of seconds", secs),
    })
}

/// A non-zero duration, or `None` when `secs` is negative, not finite, too
/// large, or rounds down to zero.
pub fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
}

fn retention_days<F>(lookup: &F, key: &'static str, default: i64) -> Result<ChronoDuration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let days = parse_or(lookup, key, default)?;
    if !(1..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("{} is outside 1..={} days", days, MAX_RETENTION_DAYS),
        });
    }
    ChronoDuration::try_days(days).ok_or_else(|| ConfigError::Invalid {
        key,
        reason: format!("{} days is out of range", days),
    })
}
