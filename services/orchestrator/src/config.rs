//! Configuration for the reboot orchestrator.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fleetboot_id::NodeId;
use fleetboot_plan::BatchStrategy;

use crate::executor::ExecutorConfig;
use crate::health::DetectorConfig;
use crate::model::WorkerNode;
use crate::notify::NotifierConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::telemetry::TelemetryConfig;

/// Tunables for every engine component.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub executor: ExecutorConfig,
    pub detector: DetectorConfig,
    pub telemetry: TelemetryConfig,
    pub notifier: NotifierConfig,

    /// Used when node discovery fails. Empty means the built-in pair.
    pub fallback_nodes: Vec<WorkerNode>,
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane API URL.
    pub control_plane_url: String,

    /// Bearer token for the control plane.
    pub control_plane_token: String,

    /// Data directory for the state database.
    pub data_dir: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Endpoint returning the aggregate player count. Unset disables
    /// load-based triggering.
    pub load_url: Option<String>,

    pub staff_webhook: Option<String>,
    pub public_webhook: Option<String>,

    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let control_plane_url = std::env::var("FLEETBOOT_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        let control_plane_token =
            std::env::var("FLEETBOOT_CONTROL_PLANE_TOKEN").unwrap_or_default();
        let data_dir = std::env::var("FLEETBOOT_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/fleetboot".to_string());
        let log_level =
            std::env::var("FLEETBOOT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let mut engine = EngineConfig::default();

        let orchestrator = &mut engine.orchestrator;
        if let Some(v) = parse_var("FLEETBOOT_PLAYER_THRESHOLD")? {
            orchestrator.player_threshold = v;
        }
        if let Some(v) = secs_var("FLEETBOOT_CHECK_INTERVAL")? {
            orchestrator.check_interval = v;
        }
        if let Some(v) = optional_var("FLEETBOOT_BATCH_STRATEGY") {
            orchestrator.batch.strategy = parse_strategy(&v)?;
        }
        if let Some(v) = parse_var("FLEETBOOT_MAX_BATCH_SIZE")? {
            orchestrator.batch.max_batch_size = v;
        }
        if let Some(v) = parse_var("FLEETBOOT_MAX_CONCURRENT_PER_NODE")? {
            orchestrator.batch.max_concurrent_per_node = v;
        }
        if let Some(v) = secs_var("FLEETBOOT_BATCH_COOLDOWN")? {
            orchestrator.batch_cooldown = v;
        }
        if let Some(v) = optional_var("FLEETBOOT_EXCLUDED_TAGS") {
            orchestrator.excluded_tags = split_list(&v).map(str::to_string).collect();
        }
        orchestrator.min_uptime = secs_var("FLEETBOOT_MIN_UPTIME")?;

        if let Some(v) = parse_var("FLEETBOOT_RETRY_LIMIT")? {
            engine.executor.reboot_retry_limit = v;
        }
        if let Some(v) = secs_var("FLEETBOOT_STARTUP_TIMEOUT")? {
            engine.executor.server_startup_timeout = v;
        }
        if let Some(v) = optional_var("FLEETBOOT_FALLBACK_NODES") {
            engine.fallback_nodes = parse_fallback_nodes(&v)?;
        }

        Ok(Self {
            control_plane_url,
            control_plane_token,
            data_dir,
            log_level,
            load_url: optional_var("FLEETBOOT_LOAD_URL"),
            staff_webhook: optional_var("FLEETBOOT_STAFF_WEBHOOK"),
            public_webhook: optional_var("FLEETBOOT_PUBLIC_WEBHOOK"),
            engine,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    optional_var(name)
        .map(|v| v.parse::<T>().with_context(|| format!("invalid {name}: {v:?}")))
        .transpose()
}

fn secs_var(name: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_secs))
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_strategy(value: &str) -> Result<BatchStrategy> {
    match value.to_ascii_lowercase().as_str() {
        "auto" => Ok(BatchStrategy::Auto),
        "fixed" => Ok(BatchStrategy::Fixed),
        other => Err(anyhow!("invalid FLEETBOOT_BATCH_STRATEGY: {other:?}")),
    }
}

/// Parse `id:capacity` pairs. A missing capacity means zero, which discovery
/// replaces with the per-node default.
pub fn parse_fallback_nodes(value: &str) -> Result<Vec<WorkerNode>> {
    split_list(value)
        .map(|entry| {
            let (id, capacity) = match entry.split_once(':') {
                Some((id, cap)) => {
                    let cap = cap
                        .trim()
                        .parse::<u32>()
                        .with_context(|| format!("invalid capacity in fallback node {entry:?}"))?;
                    (id.trim(), cap)
                }
                None => (entry, 0),
            };
            let id = NodeId::parse(id).with_context(|| format!("invalid fallback node id {id:?}"))?;
            Ok(WorkerNode {
                name: id.to_string(),
                id,
                capacity,
                metrics: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fallback_nodes() {
        let nodes = parse_fallback_nodes("eu-1:4, eu-2 ,us-1:0").unwrap();
        let parsed: Vec<_> = nodes.iter().map(|n| (n.id.as_str(), n.capacity)).collect();
        assert_eq!(parsed, vec![("eu-1", 4), ("eu-2", 0), ("us-1", 0)]);
    }

    #[test]
    fn test_parse_fallback_nodes_rejects_bad_capacity() {
        assert!(parse_fallback_nodes("eu-1:many").is_err());
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(parse_strategy("FIXED").unwrap(), BatchStrategy::Fixed);
        assert_eq!(parse_strategy("auto").unwrap(), BatchStrategy::Auto);
        assert!(parse_strategy("random").is_err());
    }

    #[test]
    fn test_split_list() {
        let tags: Vec<_> = split_list(" event, ,Test ,").collect();
        assert_eq!(tags, vec!["event", "Test"]);
    }
}
