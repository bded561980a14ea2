//! Server Configuration
//!
//! A single JSON document configures the whole process. Every field has a
//! default so a missing document starts a self-contained instance; a
//! present but invalid document is a fatal startup error.

use std::time::Duration;

use mitigator_core::store::CatalogStore;
use mitigator_core::{DispatcherConfig, PlannerConfig, RiskConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API listen port
    pub http_port: u16,
    /// Inbound alert queue capacity
    pub queue_capacity: usize,
    /// Seconds to wait for in-flight work on shutdown
    pub shutdown_grace_secs: u64,
    pub bus: BusConfig,
    pub graph_db: Option<GraphDbConfig>,
    pub planner: PlannerSettings,
    pub dispatcher: DispatcherSettings,
    pub risk: RiskSettings,
    pub log: LogConfig,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8180,
            queue_capacity: 1024,
            shutdown_grace_secs: 10,
            bus: BusConfig::default(),
            graph_db: None,
            planner: PlannerSettings::default(),
            dispatcher: DispatcherSettings::default(),
            risk: RiskSettings::default(),
            log: LogConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Message-bus subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Subject the ingress subscribes to
    pub topic: String,
    /// Reconnect attempts before the connection loss is fatal
    pub max_reconnects: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".into(),
            port: 4222,
            tls: false,
            topic: "alerts".into(),
            max_reconnects: 10,
        }
    }
}

/// Situational-awareness graph database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDbConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "GraphDbConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl GraphDbConfig {
    fn default_timeout_secs() -> u64 {
        10
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    pub time_limit_ms: u64,
    pub mitigation_slots: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        let defaults = PlannerConfig::default();
        Self {
            time_limit_ms: defaults.time_limit.as_millis() as u64,
            mitigation_slots: defaults.mitigation_slots,
        }
    }
}

impl From<&PlannerSettings> for PlannerConfig {
    fn from(settings: &PlannerSettings) -> Self {
        Self {
            time_limit: Duration::from_millis(settings.time_limit_ms),
            mitigation_slots: settings.mitigation_slots,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub timeout_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DispatcherConfig::default().timeout.as_secs(),
        }
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

/// Node risk-scoring knobs (see the engine's probability model).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub graph_interest: f64,
    pub ease_impact: f64,
    pub max_conditions: usize,
    pub epsilon: f64,
    pub threshold: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        let defaults = RiskConfig::default();
        Self {
            graph_interest: defaults.graph_interest,
            ease_impact: defaults.ease_impact,
            max_conditions: defaults.max_conditions,
            epsilon: defaults.epsilon,
            threshold: defaults.threshold,
        }
    }
}

impl From<&RiskSettings> for RiskConfig {
    fn from(settings: &RiskSettings) -> Self {
        Self {
            graph_interest: settings.graph_interest,
            ease_impact: settings.ease_impact,
            max_conditions: settings.max_conditions,
            epsilon: settings.epsilon,
            threshold: settings.threshold,
            ..RiskConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Base level: trace, debug, info, warn, error
    pub level: String,
    /// Per-namespace directives, e.g. `mitigator_core::planner=debug`
    pub filters: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            filters: vec![],
        }
    }
}

impl LogConfig {
    /// Directive string for the tracing EnvFilter; `RUST_LOG` wins when set.
    pub fn directives(&self) -> String {
        match std::env::var("RUST_LOG") {
            Ok(custom) if !custom.is_empty() => custom,
            _ => std::iter::once(self.level.clone())
                .chain(self.filters.iter().cloned())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub conditions_path: String,
    pub graphs_path: String,
    pub workflows_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            conditions_path: "data/conditions.json".into(),
            graphs_path: "data/attack-graphs.json".into(),
            workflows_path: "data/workflows.json".into(),
        }
    }
}

impl StoreConfig {
    pub fn catalog_store(&self) -> CatalogStore {
        CatalogStore::new(
            &self.conditions_path,
            &self.graphs_path,
            &self.workflows_path,
        )
    }
}
