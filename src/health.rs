//! Fleet health probing and tile metric aggregation.
//!
//! Every running instance with an external address is probed concurrently and
//! the results are joined before anything is aggregated, so no probe touches
//! shared state. Probe and parse failures only downgrade the affected
//! instance; they never fail the whole report.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{Instance, InstanceStatus};

pub const VARS_PATH: &str = "/debug/vars";
pub const HEALTH_PATH: &str = "/health";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const METRICS_MARKER: &str = "memstats";
const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Which endpoint confirms that a running instance is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// `GET /debug/vars`, JSON carrying a `memstats` key plus tile metrics.
    #[default]
    Vars,
    /// `GET /health`, literal body `ok`.
    Health,
}

impl ProbeMode {
    pub fn path(&self) -> &'static str {
        match self {
            ProbeMode::Vars => VARS_PATH,
            ProbeMode::Health => HEALTH_PATH,
        }
    }
}

impl FromStr for ProbeMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "vars" | "debug-vars" => Ok(ProbeMode::Vars),
            "health" => Ok(ProbeMode::Health),
            other => Err(anyhow::anyhow!(
                "Invalid probe mode '{}' (expected vars or health)",
                other
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("unexpected content: {0}")]
    Content(String),
    #[error("metrics payload did not parse: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Serving,
    Staging,
    Provisioning,
    Stopping,
    Terminated,
    Other,
}

impl HealthStatus {
    /// Status for an instance given its API status and, for running
    /// instances, whether the probe confirmed it.
    pub fn classify(status: InstanceStatus, probe_ok: bool) -> Self {
        match status {
            InstanceStatus::Running if probe_ok => HealthStatus::Serving,
            InstanceStatus::Running | InstanceStatus::Staging => HealthStatus::Staging,
            InstanceStatus::Provisioning => HealthStatus::Provisioning,
            InstanceStatus::Stopping => HealthStatus::Stopping,
            InstanceStatus::Terminated => HealthStatus::Terminated,
            InstanceStatus::Other => HealthStatus::Other,
        }
    }
}

/// The slice of an instance's `/debug/vars` payload that gets aggregated.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TileMetrics {
    #[serde(rename = "tileCount", default)]
    pub tile_count: BTreeMap<String, u64>,
    /// Cumulative render time in nanoseconds, keyed by tile size.
    #[serde(rename = "tileTime", default)]
    pub tile_time: BTreeMap<String, u64>,
    /// Seconds since the tile server started.
    #[serde(default, deserialize_with = "number_or_string")]
    pub uptime: f64,
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl TileMetrics {
    pub fn from_vars(vars: &serde_json::Value) -> Result<Self, ProbeError> {
        serde_json::from_value(vars.clone()).map_err(|err| ProbeError::Parse(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    #[serde(rename = "externalIp", skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    /// Instance-reported vars with the bulky `memstats` section removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<serde_json::Value>,
    #[serde(skip)]
    pub metrics: Option<TileMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetAggregate {
    #[serde(rename = "tileCount")]
    pub tile_count: BTreeMap<String, u64>,
    #[serde(rename = "tileTime")]
    pub tile_time: BTreeMap<String, u64>,
    #[serde(rename = "tileTimeAvgMs")]
    pub tile_time_avg_ms: BTreeMap<String, f64>,
    #[serde(rename = "maxUptime")]
    pub max_uptime: u64,
}

/// Element-wise sum of tile counters plus the largest uptime.
pub fn aggregate<'a>(metrics: impl IntoIterator<Item = &'a TileMetrics>) -> FleetAggregate {
    let mut result = FleetAggregate::default();
    let mut max_uptime = 0.0_f64;
    for entry in metrics {
        for (size, count) in &entry.tile_count {
            let total = result.tile_count.entry(size.clone()).or_insert(0);
            *total = total.saturating_add(*count);
        }
        for (size, nanos) in &entry.tile_time {
            let total = result.tile_time.entry(size.clone()).or_insert(0);
            *total = total.saturating_add(*nanos);
        }
        max_uptime = max_uptime.max(entry.uptime);
    }
    for (size, count) in &result.tile_count {
        if *count == 0 {
            continue;
        }
        let nanos = result.tile_time.get(size).copied().unwrap_or(0);
        result
            .tile_time_avg_ms
            .insert(size.clone(), nanos as f64 / *count as f64 / NANOS_PER_MILLI);
    }
    result.max_uptime = max_uptime as u64;
    result
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetHealthReport {
    pub instances: BTreeMap<String, HealthRecord>,
    pub vars: FleetAggregate,
    pub loadbalancers: Vec<String>,
    pub loadbalancer_healthy: bool,
}

pub struct HealthChecker {
    http: reqwest::Client,
    timeout: Duration,
    mode: ProbeMode,
}

impl HealthChecker {
    pub fn new(timeout: Duration, mode: ProbeMode) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            timeout,
            mode,
        })
    }

    /// Probe the fleet and its load balancers concurrently and build the report.
    pub async fn check_fleet(
        &self,
        instances: &[Instance],
        load_balancers: &[String],
    ) -> FleetHealthReport {
        // A single instance is addressed directly; balancers only matter for more.
        let balancers: &[String] = if instances.len() > 1 {
            load_balancers
        } else {
            &[]
        };
        let probes = join_all(instances.iter().map(|instance| self.probe_instance(instance)));
        let (records, loadbalancer_healthy) =
            tokio::join!(probes, self.check_load_balancers(balancers));

        let instances: BTreeMap<String, HealthRecord> = instances
            .iter()
            .map(|instance| instance.name.clone())
            .zip(records)
            .collect();
        let vars = aggregate(
            instances
                .values()
                .filter(|record| record.status == HealthStatus::Serving)
                .filter_map(|record| record.metrics.as_ref()),
        );
        let serving = instances
            .values()
            .filter(|record| record.status == HealthStatus::Serving)
            .count();
        info!(
            total = instances.len(),
            serving,
            loadbalancer_healthy,
            "fleet health check complete"
        );

        FleetHealthReport {
            instances,
            vars,
            loadbalancers: load_balancers.to_vec(),
            loadbalancer_healthy,
        }
    }

    async fn probe_instance(&self, instance: &Instance) -> HealthRecord {
        let external_ip = instance.external_ip().map(str::to_string);
        let mut record = HealthRecord {
            status: HealthStatus::classify(instance.status, false),
            external_ip: external_ip.clone(),
            vars: None,
            metrics: None,
        };
        let (InstanceStatus::Running, Some(ip)) = (instance.status, external_ip.as_deref()) else {
            return record;
        };

        let url = format!("http://{}{}", ip, self.mode.path());
        let outcome = match self.fetch(&url).await {
            Ok(body) => self.read_body(&body),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(vars) => {
                record.status = HealthStatus::Serving;
                if let Some(vars) = vars {
                    match TileMetrics::from_vars(&vars) {
                        Ok(metrics) => record.metrics = Some(metrics),
                        Err(err) => {
                            warn!(instance = %instance.name, "excluding from aggregates: {}", err)
                        }
                    }
                    record.vars = Some(strip_memstats(vars));
                }
            }
            Err(err) => {
                warn!(instance = %instance.name, url = %url, "probe failed: {}", err);
            }
        }
        record
    }

    /// Validate a probe body for the configured mode; vars mode yields the payload.
    fn read_body(&self, body: &str) -> Result<Option<serde_json::Value>, ProbeError> {
        match self.mode {
            ProbeMode::Health => {
                if body.trim() == "ok" {
                    Ok(None)
                } else {
                    Err(ProbeError::Content(shorten(body)))
                }
            }
            ProbeMode::Vars => {
                let value: serde_json::Value = serde_json::from_str(body)
                    .map_err(|_| ProbeError::Content(shorten(body)))?;
                if value.get(METRICS_MARKER).is_none() {
                    return Err(ProbeError::Content(format!(
                        "missing '{}' key",
                        METRICS_MARKER
                    )));
                }
                Ok(Some(value))
            }
        }
    }

    /// Probe balancers in order and stop at the first failure.
    async fn check_load_balancers(&self, balancers: &[String]) -> bool {
        for balancer in balancers {
            let url = format!("{}{}", balancer_base(balancer), HEALTH_PATH);
            match self.fetch(&url).await {
                Ok(_) => debug!(balancer = %balancer, "load balancer healthy"),
                Err(err) => {
                    warn!(balancer = %balancer, "load balancer unhealthy: {}", err);
                    return false;
                }
            }
        }
        true
    }

    async fn fetch(&self, url: &str) -> Result<String, ProbeError> {
        tokio::time::timeout(self.timeout, self.get_text(url))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }

    async fn get_text(&self, url: &str) -> Result<String, ProbeError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ProbeError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|err| ProbeError::Transport(err.to_string()))
    }
}

fn balancer_base(balancer: &str) -> String {
    let trimmed = balancer.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

fn strip_memstats(mut vars: serde_json::Value) -> serde_json::Value {
    if let Some(map) = vars.as_object_mut() {
        map.remove(METRICS_MARKER);
    }
    vars
}

fn shorten(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(64) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
