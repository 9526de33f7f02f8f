//! Hub command dispatch.
//!
//! The hub owns the committed copy of every task. Each inbound frame is
//! handled to completion before the next frame of the same session; the
//! instance lock orders frames for one task across sessions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connections::SessionSender;
use crate::error::{Error, ProtocolError};
use crate::runtime::NodeRuntime;
use crate::sync::merge::{check_hash_diff, deep_merge, merge_task, outbound_diff};
use crate::sync::{InstanceLock, apply_soft_lease};
use crate::task::model::{DEFAULT_COMMANDS_ACCEPTED, new_message_id};
use crate::task::{
    Command, CommandArgs, NodeInfo, NodeMeta, NodeRole, Task, TaskError, WireMessage,
};

/// One WebSocket session as seen by the hub.
pub struct HubSession {
    pub node_id: Option<String>,
    tx: SessionSender,
}

impl HubSession {
    pub fn new(tx: SessionSender) -> Self {
        Self { node_id: None, tx }
    }
}

/// Lock held across a coprocessor round trip.
struct Parked {
    ticket: u64,
    lock: Option<InstanceLock>,
    timeout: JoinHandle<()>,
}

/// Routing context of one command.
struct Hop<'a> {
    command: Command,
    source: &'a str,
    initiating: String,
    inbound: &'a NodeMeta,
    args: CommandArgs,
}

pub struct HubRouter {
    rt: Arc<NodeRuntime>,
    pending: Arc<Mutex<HashMap<String, Parked>>>,
    tickets: AtomicU64,
}

impl HubRouter {
    pub fn new(rt: Arc<NodeRuntime>) -> Self {
        Self {
            rt,
            pending: Arc::new(Mutex::new(HashMap::new())),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn runtime(&self) -> &Arc<NodeRuntime> {
        &self.rt
    }

    pub fn hub_id(&self) -> &str {
        self.rt.node_id()
    }

    /// Instances waiting for a coprocessor reply.
    pub async fn parked(&self) -> usize {
        self.pending.lock().await.len()
    }

    // ── Entry point ─────────────────────────────────────────────────

    /// Handle one text frame from `session`.
    pub async fn handle_frame(&self, session: &mut HubSession, text: &str) -> Result<(), Error> {
        let msg = WireMessage::parse(text)?;
        let node = msg.node()?;
        let node_id = node
            .id
            .clone()
            .or_else(|| session.node_id.clone())
            .ok_or_else(|| ProtocolError::MissingField {
                field: "node.id".into(),
            })?;

        if session.node_id.as_deref() != Some(node_id.as_str()) {
            self.rt.connections.connect(&node_id, session.tx.clone()).await;
            session.node_id = Some(node_id.clone());
        }

        let command = node.command.ok_or(ProtocolError::MissingCommand)?;
        if command == Command::Register {
            return self.on_register(&node_id, &node).await;
        }
        if !self.rt.connections.is_registered(&node_id).await {
            debug!(node_id = %node_id, command = %command, "Unregistered node, requesting register");
            return self.request_register(&node_id).await;
        }
        if command != Command::Ping {
            debug!(
                node_id = %node_id,
                command = %command,
                instance_id = ?msg.instance_id(),
                "Hub received command"
            );
        }

        let result = match command {
            Command::Ping => self.pong(&node_id).await,
            Command::Pong | Command::Register => Ok(()),
            Command::Start => self.on_start(&node_id, &msg, &node).await.map(|_| ()),
            Command::Init => self.on_init(&node_id, &msg, &node).await,
            Command::Join => self.on_join(&node_id, &msg, &node).await,
            Command::Update => self.on_update(&node_id, &msg, &node).await,
            Command::Error => self.on_error(&node_id, &msg, &node).await,
            Command::Partial => self.on_partial(&node_id, &msg, &node).await,
            Command::Reload => self.on_reload(&node_id, &node).await,
        };

        if let Err(e) = &result {
            error!(node_id = %node_id, command = %command, error = %e, "Hub command failed");
            if let Some(instance_id) = msg.instance_id() {
                self.report_failure(&node_id, instance_id, e).await;
            }
        }
        result
    }

    // ── Liveness ────────────────────────────────────────────────────

    async fn request_register(&self, node_id: &str) -> Result<(), Error> {
        let frame = json!({
            "node": {"command": "register", "commandArgs": {"hubId": self.hub_id()}},
            "meta": {"updatedAt": Utc::now()}
        });
        self.send(node_id, frame).await
    }

    async fn on_register(&self, node_id: &str, node: &NodeMeta) -> Result<(), Error> {
        let info = NodeInfo {
            node_id: node_id.to_string(),
            role: node.role.unwrap_or(NodeRole::Processor),
            node_type: node.node_type.clone().unwrap_or_else(|| "unknown".into()),
            environment: node.environment.clone().unwrap_or_default(),
            commands_accepted: node
                .commands_accepted
                .clone()
                .unwrap_or_else(|| DEFAULT_COMMANDS_ACCEPTED.to_vec()),
        };
        self.rt.connections.register(info).await?;
        Ok(())
    }

    async fn pong(&self, node_id: &str) -> Result<(), Error> {
        let frame = json!({
            "node": {"command": "pong"},
            "meta": {"updatedAt": Utc::now()}
        });
        self.send(node_id, frame).await
    }

    async fn send(&self, node_id: &str, task: Value) -> Result<(), Error> {
        let frame = WireMessage::new(task).to_json()?;
        self.rt.connections.send(node_id, frame).await?;
        Ok(())
    }

    /// Tell the source its command failed, as a task error.
    async fn report_failure(&self, node_id: &str, instance_id: &str, err: &Error) {
        let mut task = Task {
            instance_id: Some(instance_id.to_string()),
            error: Some(TaskError {
                message: err.to_string(),
                source_node_id: Some(self.hub_id().to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        task.node = Some(NodeMeta {
            id: Some(self.hub_id().to_string()),
            command: Some(Command::Error),
            command_args: Some(CommandArgs {
                lock_bypass: true,
                ..Default::default()
            }),
            source_node_id: Some(self.hub_id().to_string()),
            ..Default::default()
        });
        if let Err(e) = self.send(node_id, task.to_value()).await {
            warn!(node_id = %node_id, error = %e, "Could not report failure");
        }
    }

    // ── Task commands ───────────────────────────────────────────────

    fn initiating(source: &str, node: &NodeMeta) -> String {
        node.initiating_node_id
            .clone()
            .unwrap_or_else(|| source.to_string())
    }

    async fn on_start(&self, source: &str, msg: &WireMessage, node: &NodeMeta) -> Result<String, Error> {
        let args = node.args();
        let parent = msg.task()?;
        let mut init = args.init.clone().unwrap_or_else(|| json!({}));
        let Value::Object(fields) = &mut init else {
            return Err(ProtocolError::InvalidMessage("commandArgs.init must be an object".into()).into());
        };
        if !fields.contains_key("id")
            && let Some(id) = &args.id
        {
            fields.insert("id".into(), Value::String(id.clone()));
        }
        let hop = Hop {
            command: Command::Start,
            source,
            initiating: Self::initiating(source, node),
            inbound: node,
            args: CommandArgs::default(),
        };
        self.start_task(hop, Some(&parent), init).await
    }

    /// Create, persist and announce a new instance built from `init`.
    async fn start_task(&self, hop: Hop<'_>, parent: Option<&Task>, init: Value) -> Result<String, Error> {
        let task_id = init
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                field: "commandArgs.init.id".into(),
            })?
            .to_string();

        let base = self
            .rt
            .modules
            .template(&task_id)
            .cloned()
            .unwrap_or_else(|| json!({}));
        let mut task = Task::from_value(deep_merge(&base, &init))?;
        let instance_id = Uuid::new_v4().to_string();
        task.instance_id = Some(instance_id.clone());

        let parent_stored = match parent.and_then(|p| p.instance_id.as_deref()) {
            Some(pid) => self.rt.store.get(pid).await?,
            None => None,
        };
        let parent_view = parent_stored.as_ref().or(parent);
        if task.family_id.is_none() {
            task.family_id = parent_view
                .and_then(|p| p.family_id.clone())
                .or_else(|| Some(instance_id.clone()));
        }
        if task.user.is_none() {
            task.user = parent_view.and_then(|p| p.user.clone());
        }

        let now = Utc::now();
        let meta = task.meta_mut();
        meta.prev_instance_id = parent_view.and_then(|p| p.instance_id.clone());
        meta.prev_message_id = parent_view
            .and_then(|p| p.meta.as_ref())
            .and_then(|m| m.message_id.clone());
        meta.message_id = Some(new_message_id());
        meta.updated_at = Some(now);

        self.rt.store.set(&instance_id, &task).await?;
        self.rt.store.set_active(&instance_id, true).await?;
        self.attach_start_nodes(&task, &hop).await;

        info!(
            instance_id = %instance_id,
            task_id = %task_id,
            family_id = ?task.family_id,
            "Task started"
        );

        let hop = Hop {
            command: Command::Init,
            ..hop
        };
        self.distribute(hop, None, task, None).await?;
        Ok(instance_id)
    }

    /// The initiator plus every processor serving one of the task's
    /// environments.
    async fn attach_start_nodes(&self, task: &Task, hop: &Hop<'_>) {
        let Some(instance_id) = task.instance_id.as_deref() else {
            return;
        };
        let connections = &self.rt.connections;
        connections
            .attach(instance_id, &hop.initiating, hop.inbound.clone())
            .await;
        let Some(envs) = &task.environments else {
            return;
        };
        for info in connections.registered().await {
            if info.role == NodeRole::Processor
                && info.node_id != hop.initiating
                && envs.contains(&info.environment)
            {
                connections
                    .attach(instance_id, &info.node_id, NodeMeta::default())
                    .await;
            }
        }
    }

    async fn on_init(&self, source: &str, msg: &WireMessage, node: &NodeMeta) -> Result<(), Error> {
        let task = msg.task()?;
        let instance_id = task.require_instance_id()?.to_string();
        let lock = self.lock_for(&instance_id, source, node, "hub init").await;

        if node.coprocessed || !self.rt.store.has(&instance_id).await? {
            self.rt.store.set(&instance_id, &task).await?;
        }
        self.rt.store.set_active(&instance_id, true).await?;
        if !node.coprocessed {
            let mut hop_meta = node.clone();
            hop_meta.command = None;
            hop_meta.command_args = None;
            self.rt.connections.attach(&instance_id, source, hop_meta).await;
        }

        let hop = Hop {
            command: Command::Init,
            source,
            initiating: Self::initiating(source, node),
            inbound: node,
            args: node.args(),
        };
        self.distribute(hop, None, task, lock).await.map(|_| ())
    }

    async fn on_join(&self, source: &str, msg: &WireMessage, node: &NodeMeta) -> Result<(), Error> {
        let instance_id = msg
            .instance_id()
            .ok_or_else(|| ProtocolError::MissingField {
                field: "instanceId".into(),
            })?;
        let stored = self
            .rt
            .store
            .get(instance_id)
            .await?
            .ok_or_else(|| ProtocolError::MissingStoredTask {
                instance_id: instance_id.to_string(),
            })?;
        self.rt
            .connections
            .attach(instance_id, source, node.clone())
            .await;
        let mut args = node.args();
        args.lock_bypass = true;
        let hop = Hop {
            command: Command::Join,
            source,
            initiating: source.to_string(),
            inbound: node,
            args,
        };
        self.fan_out(&hop, None, &stored).await
    }

    async fn on_update(&self, source: &str, msg: &WireMessage, node: &NodeMeta) -> Result<(), Error> {
        let args = node.args();
        let instance_id = if args.sync {
            args.instance_id.as_deref().or(msg.instance_id())
        } else {
            msg.instance_id()
        }
        .ok_or_else(|| ProtocolError::MissingField {
            field: "instanceId".into(),
        })?
        .to_string();

        let lock = self.lock_for(&instance_id, source, node, "hub update").await;

        let stored = self
            .rt
            .store
            .get(&instance_id)
            .await?
            .ok_or_else(|| ProtocolError::MissingStoredTask {
                instance_id: instance_id.clone(),
            })?;

        let incoming = if args.sync {
            let mut partial = args.sync_task.clone().unwrap_or_else(|| json!({}));
            if let Value::Object(fields) = &mut partial {
                fields.insert("instanceId".into(), Value::String(instance_id.clone()));
            }
            partial
        } else {
            let message_id = msg
                .task
                .get("meta")
                .and_then(|m| m.get("messageId"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            check_hash_diff(&stored, &msg.task, node).enforce(&instance_id, message_id, false)?;
            msg.task.clone()
        };

        let mut merged = merge_task(&stored, &incoming)?;
        merged.node = None;
        let initiating = Self::initiating(source, node);
        let now = Utc::now();

        if !node.coprocessed {
            apply_soft_lease(
                &mut merged,
                Some(&stored),
                Some(&initiating),
                &args,
                self.rt.config.lease_expiry,
                now,
            )?;
            if incoming.get("error").is_some_and(|e| !e.is_null()) {
                self.rt.errors.record(now)?;
            }
            let meta = merged.meta_mut();
            meta.update_count = Some(meta.update_count.unwrap_or(0) + 1);
        }

        let mut fan_args = args.clone();
        fan_args.sync_task = None;
        let hop = Hop {
            command: Command::Update,
            source,
            initiating: initiating.clone(),
            inbound: node,
            args: fan_args,
        };
        let committed = self.distribute(hop, Some(stored), merged.clone(), lock).await?;

        if committed && args.done {
            self.finish(&instance_id, &merged, source, node, args.next_task_id.as_deref())
                .await?;
        }
        Ok(())
    }

    /// `commandArgs.done`: retire the instance and start the next step.
    async fn finish(
        &self,
        instance_id: &str,
        task: &Task,
        source: &str,
        node: &NodeMeta,
        next_task_id: Option<&str>,
    ) -> Result<(), Error> {
        self.rt.store.set_active(instance_id, false).await?;
        info!(instance_id = %instance_id, next = ?next_task_id, "Task done");
        let Some(next) = next_task_id else {
            return Ok(());
        };
        let init = json!({"id": next, "familyId": task.family_id});
        let hop = Hop {
            command: Command::Start,
            source,
            initiating: Self::initiating(source, node),
            inbound: node,
            args: CommandArgs::default(),
        };
        self.start_task(hop, Some(task), init).await?;
        Ok(())
    }

    async fn on_error(&self, source: &str, msg: &WireMessage, node: &NodeMeta) -> Result<(), Error> {
        let incoming = msg.task()?;
        let instance_id = incoming.require_instance_id()?.to_string();
        let lock = self.lock_for(&instance_id, source, node, "hub error").await;
        self.rt.errors.record(Utc::now())?;

        let stored = self.rt.store.get(&instance_id).await?;
        let mut task = match &stored {
            Some(prev) => merge_task(prev, &msg.task)?,
            None => incoming,
        };
        task.node = None;
        warn!(
            instance_id = %instance_id,
            error = ?task.error.as_ref().map(|e| e.message.as_str()),
            "Task error"
        );
        let hop = Hop {
            command: Command::Error,
            source,
            initiating: Self::initiating(source, node),
            inbound: node,
            args: node.args(),
        };
        self.distribute(hop, None, task, lock).await.map(|_| ())
    }

    async fn on_partial(&self, source: &str, msg: &WireMessage, node: &NodeMeta) -> Result<(), Error> {
        let task = msg.task()?;
        let hop = Hop {
            command: Command::Partial,
            source,
            initiating: Self::initiating(source, node),
            inbound: node,
            args: node.args(),
        };
        self.fan_out(&hop, None, &task).await
    }

    /// Forward `reload` to `commandArgs.nodeId`, or to every other node.
    async fn on_reload(&self, source: &str, node: &NodeMeta) -> Result<(), Error> {
        let target = node
            .args()
            .extra
            .get("nodeId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let frame = json!({"node": {"command": "reload", "sourceNodeId": source}});
        for info in self.rt.connections.registered().await {
            let wanted = match &target {
                Some(t) => *t == info.node_id,
                None => info.node_id != source,
            };
            if wanted {
                info!(node_id = %info.node_id, "Forwarding reload");
                self.send(&info.node_id, frame.clone()).await?;
            }
        }
        Ok(())
    }

    // ── Locking ─────────────────────────────────────────────────────

    /// Reuse the lock parked for the coprocessor's reply, otherwise acquire
    /// one unless the command bypasses locking. Only a non-sync frame from
    /// the coprocessor itself resumes a parked lock.
    async fn lock_for(
        &self,
        instance_id: &str,
        source: &str,
        node: &NodeMeta,
        reason: &str,
    ) -> Option<InstanceLock> {
        let args = node.args();
        let from_coprocessor = node.coprocessed
            && !args.sync
            && self
                .rt
                .connections
                .coprocessor()
                .await
                .is_some_and(|cop| cop.node_id == source);
        if from_coprocessor
            && let Some(parked) = self.unpark(instance_id).await
        {
            debug!(instance_id = %instance_id, "Resuming parked lock after coprocessing");
            return parked;
        }
        if args.lock_bypass {
            return None;
        }
        Some(self.rt.locks.acquire(instance_id, reason).await)
    }

    async fn park(&self, instance_id: &str, lock: Option<InstanceLock>) {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let key = instance_id.to_string();
        let limit = self.rt.config.coprocess_timeout;
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let mut pending = pending.lock().await;
            if pending.get(&key).is_some_and(|p| p.ticket == ticket) {
                pending.remove(&key);
                error!(instance_id = %key, timeout = ?limit, "Coprocessor did not reply, dropping lock");
            }
        });
        let replaced = self.pending.lock().await.insert(
            instance_id.to_string(),
            Parked {
                ticket,
                lock,
                timeout,
            },
        );
        if let Some(old) = replaced {
            old.timeout.abort();
            warn!(instance_id = %instance_id, "Replaced a parked coprocessing lock");
        }
    }

    async fn unpark(&self, instance_id: &str) -> Option<Option<InstanceLock>> {
        let parked = self.pending.lock().await.remove(instance_id)?;
        parked.timeout.abort();
        Some(parked.lock)
    }

    // ── Commit and fan-out ──────────────────────────────────────────

    /// Send to the coprocessor first when it should see the command, else
    /// commit and broadcast. Returns whether the task was committed.
    async fn distribute(
        &self,
        hop: Hop<'_>,
        prev: Option<Task>,
        mut task: Task,
        lock: Option<InstanceLock>,
    ) -> Result<bool, Error> {
        let instance_id = task.require_instance_id()?.to_string();

        let coprocess = matches!(hop.command, Command::Init | Command::Update)
            && !hop.inbound.coprocessing
            && !hop.inbound.coprocessed
            && !hop.args.sync;
        if coprocess
            && let Some(cop) = self.rt.connections.coprocessor().await
            && cop.node_id != hop.source
            && cop.accepts(hop.command)
        {
            let mut node = self.hop_meta(&hop, false);
            node.coprocessing = true;
            let payload = Self::payload(hop.command, prev.as_ref(), &task, node, false);
            self.send(&cop.node_id, payload).await?;
            self.park(&instance_id, lock).await;
            debug!(instance_id = %instance_id, coprocessor = %cop.node_id, "Sent for coprocessing");
            return Ok(false);
        }

        let now = Utc::now();
        let meta = task.meta_mut();
        meta.last_updated_at = meta.updated_at.take();
        meta.updated_at = Some(now);
        meta.broadcast_count = Some(meta.broadcast_count.unwrap_or(0) + 1);

        if hop.command != Command::Partial {
            self.rt.store.set(&instance_id, &task).await?;
        }
        self.fan_out(&hop, prev.as_ref(), &task).await?;
        if let Some(lock) = lock {
            lock.release("committed");
        }
        Ok(true)
    }

    fn hop_meta(&self, hop: &Hop<'_>, coprocessed: bool) -> NodeMeta {
        NodeMeta {
            id: Some(self.hub_id().to_string()),
            command: Some(hop.command),
            command_args: Some(hop.args.clone()),
            initiating_node_id: Some(hop.initiating.clone()),
            source_node_id: Some(hop.source.to_string()),
            coprocessed,
            cep_executed: hop.inbound.cep_executed.clone(),
            ..Default::default()
        }
    }

    fn payload(command: Command, prev: Option<&Task>, task: &Task, node: NodeMeta, full: bool) -> Value {
        let mut outgoing = task.clone();
        outgoing.command = None;
        outgoing.command_args = None;
        outgoing.node = Some(node);
        match prev {
            Some(prev) if command == Command::Update && !full => outbound_diff(prev, &outgoing),
            _ => outgoing.to_value(),
        }
    }

    async fn fan_out(&self, hop: &Hop<'_>, prev: Option<&Task>, task: &Task) -> Result<(), Error> {
        let instance_id = task.require_instance_id()?;
        let connections = &self.rt.connections;
        let mut served: HashSet<String> = HashSet::from([self.hub_id().to_string()]);

        if hop.command != Command::Join
            && let Some(cop) = connections.coprocessor().await
            && cop.accepts(hop.command)
        {
            let payload = Self::payload(hop.command, prev, task, self.hop_meta(hop, true), false);
            self.send_logged(&cop.node_id, payload).await;
            served.insert(cop.node_id);
        }

        for consumer in connections.hub_consumers().await {
            if hop.command == Command::Join || !consumer.accepts(hop.command) {
                continue;
            }
            if served.insert(consumer.node_id.clone()) {
                let node = self.hop_meta(hop, hop.inbound.coprocessed);
                let payload = Self::payload(hop.command, prev, task, node, false);
                self.send_logged(&consumer.node_id, payload).await;
            }
        }

        let state = task.current_state();
        for (node_id, meta) in connections.task_nodes(instance_id).await {
            if served.contains(&node_id) {
                continue;
            }
            if hop.command == Command::Join && node_id != hop.initiating {
                continue;
            }
            let Some(info) = connections.info(&node_id).await else {
                connections.detach(instance_id, &node_id).await;
                continue;
            };
            if !info.accepts(hop.command) || !meta.supports_state(state) {
                debug!(node_id = %node_id, command = %hop.command, "Node does not take this command");
                continue;
            }
            // Tells processors the cycle already went through the coprocessor.
            let mut node = self.hop_meta(hop, hop.inbound.coprocessed);
            node.states_supported = meta.states_supported.clone();
            node.states_not_supported = meta.states_not_supported.clone();
            let payload = Self::payload(hop.command, prev, task, node, meta.wants_full_task());
            self.send_logged(&node_id, payload).await;
            served.insert(node_id);
        }

        debug!(
            instance_id = %instance_id,
            command = %hop.command,
            recipients = served.len() - 1,
            "Fan-out complete"
        );
        Ok(())
    }

    async fn send_logged(&self, node_id: &str, payload: Value) {
        if let Err(e) = self.send(node_id, payload).await {
            warn!(node_id = %node_id, error = %e, "Dropping frame for node");
        }
    }
}
