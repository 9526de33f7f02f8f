//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::task::{Command, NodeInfo, NodeRole};
use crate::task::model::DEFAULT_COMMANDS_ACCEPTED;

/// Reconnect schedule for the node → hub WebSocket.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts before the node gives up and stays disconnected.
    pub max_attempts: u32,
    /// Delay after a clean close; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Delay after a transport error.
    pub error_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, after_error: bool) -> Duration {
        let base = if after_error {
            self.error_delay
        } else {
            self.base_delay
        };
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(5));
        base.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            error_delay: Duration::from_millis(5002),
        }
    }
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique id of this node process.
    pub node_id: String,
    /// Hub, processor, coprocessor or consumer.
    pub role: NodeRole,
    /// Implementation family reported at registration (e.g. "rust", "hub").
    pub node_type: String,
    /// Environment name used by `environments` allow-lists.
    pub environment: String,
    /// Listen address for the hub.
    pub bind_addr: String,
    /// Hub WebSocket endpoint for nodes.
    pub hub_ws_url: String,
    /// Hub HTTP base URL for `/api/register`.
    pub hub_http_url: String,
    /// Commands this node wants to receive.
    pub commands_accepted: Vec<Command>,
    /// Secret used for `CEPSecret-` subscriptions.
    pub cep_secret: Option<SecretString>,
    /// CEP names that still run on a CEP-sourced sync.
    pub cep_sync_exempt: Vec<String>,
    /// libSQL file; memory store when unset.
    pub db_path: Option<PathBuf>,
    /// Liveness ping interval.
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// How long the hub waits for a coprocessor reply before dropping the lock.
    pub coprocess_timeout: Duration,
    /// Age after which a `meta.locked` soft lease is ignored.
    pub lease_expiry: Duration,
    /// Hub-wide error budget per minute.
    pub max_errors_per_minute: u32,
    /// Directory for rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            role: NodeRole::Processor,
            node_type: "rust".to_string(),
            environment: "rust".to_string(),
            bind_addr: "0.0.0.0:5001".to_string(),
            hub_ws_url: "ws://localhost:5001/hub/ws".to_string(),
            hub_http_url: "http://localhost:5001".to_string(),
            commands_accepted: DEFAULT_COMMANDS_ACCEPTED.to_vec(),
            cep_secret: None,
            cep_sync_exempt: vec![crate::cep::SYSTEM_LOGGER.to_string()],
            db_path: None,
            ping_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            coprocess_timeout: Duration::from_secs(60),
            lease_expiry: Duration::from_secs(300), // 5 minutes
            max_errors_per_minute: 20,
            log_dir: None,
        }
    }
}

impl NodeConfig {
    /// Convenience constructor for a given role.
    pub fn for_role(role: NodeRole) -> Self {
        let node_type = if role == NodeRole::Hub { "hub" } else { "rust" };
        Self {
            role,
            node_type: node_type.to_string(),
            ..Default::default()
        }
    }

    /// Read configuration from `TASKFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("TASKFLOW_NODE_ID") {
            config.node_id = id;
        }

        if let Ok(role) = std::env::var("TASKFLOW_ROLE") {
            config.role = role
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "TASKFLOW_ROLE".into(),
                    message,
                })?;
            if config.role == NodeRole::Hub {
                config.node_type = "hub".to_string();
            }
        }

        if let Ok(node_type) = std::env::var("TASKFLOW_NODE_TYPE") {
            config.node_type = node_type;
        }
        if let Ok(env) = std::env::var("TASKFLOW_ENVIRONMENT") {
            config.environment = env;
        }
        if let Ok(bind) = std::env::var("TASKFLOW_BIND") {
            config.bind_addr = bind;
        }
        if let Ok(url) = std::env::var("TASKFLOW_HUB_WS_URL") {
            config.hub_ws_url = url;
        }
        if let Ok(url) = std::env::var("TASKFLOW_HUB_URL") {
            config.hub_http_url = url;
        }

        if let Ok(list) = std::env::var("TASKFLOW_COMMANDS") {
            config.commands_accepted = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse().map_err(|e: crate::error::ProtocolError| {
                        ConfigError::InvalidValue {
                            key: "TASKFLOW_COMMANDS".into(),
                            message: e.to_string(),
                        }
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        config.cep_secret = std::env::var("TASKFLOW_CEP_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        config.db_path = std::env::var("TASKFLOW_DB_PATH").ok().map(PathBuf::from);
        config.log_dir = std::env::var("TASKFLOW_LOG_DIR").ok().map(PathBuf::from);

        config.reconnect.max_attempts = std::env::var("TASKFLOW_RECONNECT_MAX")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(config.reconnect.max_attempts);

        Ok(config)
    }

    /// The identity this node registers with.
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            role: self.role,
            node_type: self.node_type.clone(),
            environment: self.environment.clone(),
            commands_accepted: self.commands_accepted.clone(),
        }
    }
}
