//! Node → hub sender.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, ProtocolError, TransportError};
use crate::store::TaskStore;
use crate::sync::merge::outbound_diff;
use crate::task::model::new_message_id;
use crate::task::{Command, NodeInfo, NodeRole, Task, WireMessage};

/// Handle used by task functions, CEPs and the router to talk to the hub.
///
/// Cloning is cheap; all clones feed the same socket writer.
#[derive(Clone)]
pub struct Outbound {
    node_id: String,
    role: NodeRole,
    tx: mpsc::UnboundedSender<String>,
    store: Arc<dyn TaskStore>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("node_id", &self.node_id)
            .field("role", &self.role)
            .finish()
    }
}

impl Outbound {
    pub fn new(
        node_id: impl Into<String>,
        role: NodeRole,
        tx: mpsc::UnboundedSender<String>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            tx,
            store,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Send `task`, whose `command` says what to do with it.
    pub async fn send(&self, task: Task) -> Result<(), Error> {
        let frame = self.prepare(task, false).await?;
        self.send_value(frame)
    }

    /// Coprocessor reply: hand the mutated task back to the hub for commit.
    pub async fn reply_coprocessed(&self, task: Task) -> Result<(), Error> {
        let frame = self.prepare(task, true).await?;
        self.send_value(frame)
    }

    pub fn ping(&self) -> Result<(), Error> {
        self.send_value(json!({
            "node": {"command": "ping", "id": self.node_id},
            "meta": {"updatedAt": Utc::now()}
        }))
    }

    /// Answer the hub's `register` request.
    pub fn register(&self, info: &NodeInfo) -> Result<(), Error> {
        self.send_value(json!({
            "node": {
                "command": "register",
                "id": info.node_id,
                "role": info.role,
                "type": info.node_type,
                "environment": info.environment,
                "commandsAccepted": info.commands_accepted,
            }
        }))
    }

    fn send_value(&self, task: Value) -> Result<(), Error> {
        let frame = WireMessage::new(task).to_json()?;
        self.tx.send(frame).map_err(|e| {
            Error::from(TransportError::SendFailed {
                node_id: self.node_id.clone(),
                reason: e.to_string(),
            })
        })
    }

    /// Build the wire form of `task`: move the command into the hop
    /// metadata, roll the message id, and diff updates against the last
    /// committed copy.
    pub async fn prepare(&self, mut task: Task, coprocessed: bool) -> Result<Value, Error> {
        let inbound = task.node.take().unwrap_or_default();
        let command = task
            .command
            .take()
            .or(if coprocessed { inbound.command } else { None })
            .ok_or(ProtocolError::MissingCommand)?;
        let mut args = task
            .command_args
            .take()
            .or(if coprocessed { inbound.command_args.clone() } else { None })
            .unwrap_or_default();

        let initiating = match (self.role, &inbound.initiating_node_id) {
            (NodeRole::Coprocessor, Some(id)) if coprocessed => id.clone(),
            _ => self.node_id.clone(),
        };

        if args.sync {
            args.lock_bypass = true;
        }

        let node = task.node_mut();
        node.id = Some(self.node_id.clone());
        node.command = Some(command);
        node.initiating_node_id = Some(initiating.clone());
        node.coprocessed = coprocessed || args.sync;
        node.coprocessing = false;
        node.cep_executed = inbound.cep_executed;
        node.states_supported = inbound.states_supported;
        node.states_not_supported = inbound.states_not_supported;
        let sync = args.sync;
        node.command_args = Some(args);

        let current = task.current_state().map(str::to_string);
        if let Some(state) = current {
            task.node_mut().state_last = Some(state);
            if let Some(s) = task.state.as_mut() {
                s.last = None;
            }
        }

        if initiating == self.node_id {
            let meta = task.meta_mut();
            meta.prev_message_id = meta.message_id.take();
            meta.message_id = Some(new_message_id());
        }

        if command == Command::Update
            && !sync
            && let Some(instance_id) = task.instance_id.as_deref()
            && let Some(last) = self.store.get(instance_id).await?
        {
            debug!(instance_id = %instance_id, "Sending update as diff");
            return Ok(outbound_diff(&last, &task));
        }
        Ok(task.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::sync::merge::{check_hash_diff, merge_task, HashCheck};
    use crate::task::CommandArgs;
    use serde_json::json;

    fn outbound(role: NodeRole) -> (Outbound, mpsc::UnboundedReceiver<String>, Arc<MemoryTaskStore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryTaskStore::new());
        (Outbound::new("n1", role, tx, store.clone()), rx, store)
    }

    fn stored() -> Task {
        Task::from_value(json!({
            "id": "root.ui.TaskChat.start",
            "instanceId": "abc123",
            "familyId": "fam1",
            "state": {"current": "send"},
            "output": {"text": "hi"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn command_moves_into_node() {
        let (out, _rx, _store) = outbound(NodeRole::Processor);
        let mut task = stored();
        task.command = Some(Command::Init);
        let value = out.prepare(task, false).await.unwrap();
        assert_eq!(value["node"]["command"], "init");
        assert_eq!(value["node"]["initiatingNodeId"], "n1");
        assert_eq!(value["node"]["stateLast"], "send");
        assert!(value.get("command").is_none());
        assert_eq!(value["meta"]["messageId"].as_str().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn missing_command_is_rejected() {
        let (out, _rx, _store) = outbound(NodeRole::Processor);
        assert!(out.prepare(stored(), false).await.is_err());
    }

    #[tokio::test]
    async fn update_is_sent_as_checked_diff() {
        let (out, mut rx, store) = outbound(NodeRole::Processor);
        store.set("abc123", &stored()).await.unwrap();

        let mut task = stored();
        task.set_payload("output", json!({"text": "bye"}));
        task.command = Some(Command::Update);
        out.send(task).await.unwrap();

        let frame = WireMessage::parse(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.task["output"], json!({"text": "bye"}));
        assert!(frame.task.get("familyId").is_none());
        let node = frame.node().unwrap();
        let last = store.get("abc123").await.unwrap().unwrap();
        assert_eq!(check_hash_diff(&last, &frame.task, &node), HashCheck::Match);
        let merged = merge_task(&last, &frame.task).unwrap();
        assert_eq!(merged.payload("output"), Some(&json!({"text": "bye"})));
    }

    #[tokio::test]
    async fn sync_bypasses_lock_and_coprocessing() {
        let (out, _rx, _store) = outbound(NodeRole::Processor);
        let mut task = Task::default();
        task.command = Some(Command::Update);
        task.command_args = Some(CommandArgs {
            sync: true,
            instance_id: Some("other".into()),
            sync_task: Some(json!({"input": {"x": 1}})),
            ..Default::default()
        });
        let value = out.prepare(task, false).await.unwrap();
        assert_eq!(value["node"]["commandArgs"]["lockBypass"], true);
        assert_eq!(value["node"]["coprocessed"], true);
    }

    #[tokio::test]
    async fn coprocessor_reply_keeps_initiator() {
        let (out, _rx, _store) = outbound(NodeRole::Coprocessor);
        let mut task = stored();
        task.node = Some(crate::task::NodeMeta {
            command: Some(Command::Init),
            initiating_node_id: Some("browser-1".into()),
            coprocessing: true,
            ..Default::default()
        });
        let value = out.prepare(task, true).await.unwrap();
        assert_eq!(value["node"]["initiatingNodeId"], "browser-1");
        assert_eq!(value["node"]["coprocessed"], true);
        assert!(value["node"].get("coprocessing").is_none());
        // Not the initiator, so the message id is left alone.
        assert!(value["meta"].get("messageId").is_none());
    }
}
