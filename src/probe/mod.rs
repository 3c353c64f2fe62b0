//! Probe module for health checking HTTP endpoints.

mod http;

pub use http::*;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{secs_to_duration, TargetConfig};
use crate::db::{Event, ProbeOutcome};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A validated, ready-to-send target.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub name: String,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub timeout: Duration,
}

impl ProbeTarget {
    pub fn from_config(cfg: &TargetConfig, default_timeout: Duration) -> Result<Self, ProbeError> {
        let url = Url::parse(&cfg.url)
            .map_err(|e| ProbeError::Config(format!("{}: bad url {:?}: {}", cfg.name, cfg.url, e)))?;

        let method = Method::from_bytes(cfg.method.to_uppercase().as_bytes())
            .map_err(|_| ProbeError::Config(format!("{}: bad method {:?}", cfg.name, cfg.method)))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &cfg.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| ProbeError::Config(format!("{}: bad header name {:?}", cfg.name, key)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ProbeError::Config(format!("{}: bad value for header {}", cfg.name, key)))?;
            headers.insert(name, value);
        }

        let timeout = match cfg.timeout_secs {
            Some(secs) => secs_to_duration(secs).ok_or_else(|| {
                ProbeError::Config(format!("{}: bad timeoutSecs {}", cfg.name, secs))
            })?,
            None => default_timeout,
        };

        Ok(Self {
            name: cfg.name.clone(),
            url,
            method,
            headers,
            timeout,
        })
    }
}

/// Probe a target once and turn whatever happened into an [`Event`].
///
/// Never fails: errors before a status line become failed events.
pub async fn probe_target(client: &reqwest::Client, target: &ProbeTarget) -> Event {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let timestamp = Utc::now();
    let start = Instant::now();
    let result = run_http_probe(client, target).await;
    let response_time_ms = start.elapsed().as_millis() as i64;

    let outcome = match result {
        Ok(response) => ProbeOutcome::Response {
            status_code: response.status_code,
            preview: response.preview,
        },
        Err(e) => ProbeOutcome::Failed {
            error: e.to_string(),
        },
    };

    Event {
        target_name: target.name.clone(),
        target_url: target.url.to_string(),
        timestamp,
        response_time_ms,
        outcome,
    }
}
