use serde::{Deserialize, Deserializer};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::lease::LeaseConfig;
use crate::retry::Backoff;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub lease: LeaseConfig,
    pub populate: PopulateConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

/// How long to wait for the token controller to fill in a new secret.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PopulateConfig {
    #[serde(deserialize_with = "populate_backoff")]
    pub backoff: Backoff,
}

/// Fields left out of `[populate.backoff]` keep the population defaults
/// rather than the generic (lease) ones.
fn populate_backoff<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Backoff, D::Error> {
    let overrides = BackoffOverrides::deserialize(deserializer)?;
    Ok(overrides.apply(Backoff::populate()))
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BackoffOverrides {
    initial_delay_ms: Option<u64>,
    factor: Option<f64>,
    jitter: Option<f64>,
    steps: Option<u32>,
    cap_ms: Option<u64>,
}

impl BackoffOverrides {
    fn apply(self, base: Backoff) -> Backoff {
        Backoff {
            initial_delay_ms: self.initial_delay_ms.unwrap_or(base.initial_delay_ms),
            factor: self.factor.unwrap_or(base.factor),
            jitter: self.jitter.unwrap_or(base.jitter),
            steps: self.steps.unwrap_or(base.steps),
            cap_ms: self.cap_ms.or(base.cap_ms),
        }
    }
}

impl Default for PopulateConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::populate(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the `/metrics` endpoint; unset disables it.
    pub addr: Option<SocketAddr>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                Self::parse(&data)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(data: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(data)?;
        if cfg.lease.duration_secs <= 0 {
            anyhow::bail!("lease.duration_secs must be positive");
        }
        if cfg.lease.backoff.steps == 0 || cfg.populate.backoff.steps == 0 {
            anyhow::bail!("backoff steps must be at least 1");
        }
        // Held leases are never renewed, so with takeover on a lease must not
        // be able to expire while its holder is still waiting for a token.
        let lease_duration = Duration::from_secs(u64::from(cfg.lease.duration_secs.unsigned_abs()));
        if cfg.lease.reclaim_expired && lease_duration <= cfg.populate.backoff.max_total_delay() {
            anyhow::bail!(
                "lease.duration_secs ({}s) must exceed the longest population wait ({:?}) when lease.reclaim_expired is set",
                cfg.lease.duration_secs,
                cfg.populate.backoff.max_total_delay()
            );
        }
        Ok(cfg)
    }
}
