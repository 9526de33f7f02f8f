//! Live session bookkeeping.
//!
//! [`ConnectionRegistry`] is the hub's view: which nodes are connected,
//! what they registered as, and which nodes take part in which task
//! instance. [`LinkState`] is a node's view of its single hub link.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::{ProtocolError, TransportError};
use crate::task::{NodeInfo, NodeMeta, NodeRole};

/// Outgoing frames for one WebSocket session.
pub type SessionSender = mpsc::UnboundedSender<String>;

struct Session {
    info: Option<NodeInfo>,
    tx: SessionSender,
}

#[derive(Default)]
struct Connections {
    sessions: HashMap<String, Session>,
    /// instance → node → the node's last hop metadata for that instance.
    task_nodes: HashMap<String, BTreeMap<String, NodeMeta>>,
    /// node → instances it is attached to.
    node_tasks: HashMap<String, HashSet<String>>,
}

/// Hub-side registry of node sessions and task membership.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Connections>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session to `node_id`. A reconnecting node replaces its old
    /// sender and must register again.
    pub async fn connect(&self, node_id: &str, tx: SessionSender) {
        let mut conns = self.inner.write().await;
        let replaced = conns
            .sessions
            .insert(node_id.to_string(), Session { info: None, tx })
            .is_some();
        info!(node_id = %node_id, replaced, "Node connected");
    }

    pub async fn is_connected(&self, node_id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(node_id)
    }

    /// Record what a node registered as. A second coprocessor is refused.
    pub async fn register(&self, info: NodeInfo) -> Result<(), ProtocolError> {
        let mut conns = self.inner.write().await;
        if info.role == NodeRole::Coprocessor {
            let others: Vec<String> = conns
                .sessions
                .iter()
                .filter(|(id, s)| {
                    **id != info.node_id
                        && s.info.as_ref().is_some_and(|i| i.role == NodeRole::Coprocessor)
                })
                .map(|(id, _)| id.clone())
                .collect();
            if !others.is_empty() {
                let mut ids = others;
                ids.push(info.node_id.clone());
                return Err(ProtocolError::MultipleCoprocessors { ids });
            }
        }
        let Some(session) = conns.sessions.get_mut(&info.node_id) else {
            return Err(ProtocolError::InvalidMessage(format!(
                "register from unconnected node {}",
                info.node_id
            )));
        };
        info!(
            node_id = %info.node_id,
            role = %info.role,
            environment = %info.environment,
            "Node registered"
        );
        session.info = Some(info);
        Ok(())
    }

    pub async fn info(&self, node_id: &str) -> Option<NodeInfo> {
        self.inner
            .read()
            .await
            .sessions
            .get(node_id)
            .and_then(|s| s.info.clone())
    }

    pub async fn is_registered(&self, node_id: &str) -> bool {
        self.info(node_id).await.is_some()
    }

    pub async fn coprocessor(&self) -> Option<NodeInfo> {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter_map(|s| s.info.as_ref())
            .find(|i| i.role == NodeRole::Coprocessor)
            .cloned()
    }

    /// Nodes that receive every task regardless of membership.
    pub async fn hub_consumers(&self) -> Vec<NodeInfo> {
        let mut consumers: Vec<NodeInfo> = self
            .inner
            .read()
            .await
            .sessions
            .values()
            .filter_map(|s| s.info.as_ref())
            .filter(|i| i.role == NodeRole::Consumer)
            .cloned()
            .collect();
        consumers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        consumers
    }

    pub async fn registered(&self) -> Vec<NodeInfo> {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter_map(|s| s.info.clone())
            .collect()
    }

    pub async fn send(&self, node_id: &str, frame: String) -> Result<(), TransportError> {
        let conns = self.inner.read().await;
        let session = conns
            .sessions
            .get(node_id)
            .ok_or_else(|| TransportError::NotConnected {
                node_id: node_id.to_string(),
            })?;
        session.tx.send(frame).map_err(|e| TransportError::SendFailed {
            node_id: node_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Add `node_id` to the nodes of `instance_id`, keeping its hop metadata.
    pub async fn attach(&self, instance_id: &str, node_id: &str, meta: NodeMeta) {
        let mut conns = self.inner.write().await;
        conns
            .task_nodes
            .entry(instance_id.to_string())
            .or_default()
            .insert(node_id.to_string(), meta);
        conns
            .node_tasks
            .entry(node_id.to_string())
            .or_default()
            .insert(instance_id.to_string());
        debug!(instance_id = %instance_id, node_id = %node_id, "Node attached to task");
    }

    pub async fn task_nodes(&self, instance_id: &str) -> Vec<(String, NodeMeta)> {
        self.inner
            .read()
            .await
            .task_nodes
            .get(instance_id)
            .map(|nodes| nodes.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn detach(&self, instance_id: &str, node_id: &str) {
        let mut conns = self.inner.write().await;
        if let Some(nodes) = conns.task_nodes.get_mut(instance_id) {
            nodes.remove(node_id);
            if nodes.is_empty() {
                conns.task_nodes.remove(instance_id);
            }
        }
        if let Some(tasks) = conns.node_tasks.get_mut(node_id) {
            tasks.remove(instance_id);
        }
        warn!(instance_id = %instance_id, node_id = %node_id, "Pruned node from task");
    }

    /// Forget `node_id` everywhere (socket closed).
    pub async fn remove(&self, node_id: &str) {
        let mut conns = self.inner.write().await;
        conns.sessions.remove(node_id);
        if let Some(tasks) = conns.node_tasks.remove(node_id) {
            for instance_id in tasks {
                if let Some(nodes) = conns.task_nodes.get_mut(&instance_id) {
                    nodes.remove(node_id);
                    if nodes.is_empty() {
                        conns.task_nodes.remove(&instance_id);
                    }
                }
            }
        }
        info!(node_id = %node_id, "Node removed");
    }

    pub async fn tasks_of(&self, node_id: &str) -> Vec<String> {
        let mut tasks: Vec<String> = self
            .inner
            .read()
            .await
            .node_tasks
            .get(node_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        tasks.sort();
        tasks
    }
}

/// A node's view of its hub connection.
#[derive(Debug)]
pub struct LinkState {
    policy: ReconnectPolicy,
    attempts: u32,
    last_pong: Option<Instant>,
}

impl LinkState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last_pong: None,
        }
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt, or an error once the budget is spent.
    pub fn on_disconnected(&mut self, after_error: bool) -> Result<Duration, TransportError> {
        if self.attempts >= self.policy.max_attempts {
            return Err(TransportError::AttemptsExhausted {
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        Ok(self.policy.delay_for(self.attempts, after_error))
    }

    pub fn record_pong(&mut self) {
        self.last_pong = Some(Instant::now());
    }

    pub fn since_last_pong(&self) -> Option<Duration> {
        self.last_pong.map(|t| t.elapsed())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::DEFAULT_COMMANDS_ACCEPTED;

    fn info(id: &str, role: NodeRole) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            role,
            node_type: "rust".into(),
            environment: "rust".into(),
            commands_accepted: DEFAULT_COMMANDS_ACCEPTED.to_vec(),
        }
    }

    #[tokio::test]
    async fn register_requires_connection() {
        let registry = ConnectionRegistry::new();
        assert!(registry.register(info("n1", NodeRole::Processor)).await.is_err());
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.connect("n1", tx).await;
        registry.register(info("n1", NodeRole::Processor)).await.unwrap();
        assert!(registry.is_registered("n1").await);
    }

    #[tokio::test]
    async fn only_one_coprocessor() {
        let registry = ConnectionRegistry::new();
        for id in ["c1", "c2"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.connect(id, tx).await;
        }
        registry.register(info("c1", NodeRole::Coprocessor)).await.unwrap();
        assert!(matches!(
            registry.register(info("c2", NodeRole::Coprocessor)).await,
            Err(ProtocolError::MultipleCoprocessors { .. })
        ));
        assert_eq!(registry.coprocessor().await.unwrap().node_id, "c1");
    }

    #[tokio::test]
    async fn remove_clears_task_membership() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.connect("n1", tx).await;
        registry.attach("i1", "n1", NodeMeta::default()).await;
        registry.attach("i2", "n1", NodeMeta::default()).await;
        assert_eq!(registry.tasks_of("n1").await, vec!["i1", "i2"]);

        registry.send("n1", "hello".into()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        registry.remove("n1").await;
        assert!(registry.task_nodes("i1").await.is_empty());
        assert!(matches!(
            registry.send("n1", "x".into()).await,
            Err(TransportError::NotConnected { .. })
        ));
    }

    #[test]
    fn link_gives_up_after_budget() {
        let mut link = LinkState::new(ReconnectPolicy {
            max_attempts: 2,
            ..Default::default()
        });
        assert_eq!(link.on_disconnected(false).unwrap(), Duration::from_secs(1));
        assert_eq!(link.on_disconnected(false).unwrap(), Duration::from_secs(2));
        assert!(matches!(
            link.on_disconnected(false),
            Err(TransportError::AttemptsExhausted { attempts: 2 })
        ));
        link.on_connected();
        assert_eq!(link.attempts(), 0);
        assert_eq!(link.on_disconnected(true).unwrap(), Duration::from_millis(5002));
    }
}
