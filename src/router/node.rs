//! Processor and coprocessor command handling.
//!
//! A node keeps its own copy of every task it takes part in. For each inbound
//! frame it merges into that copy, runs CEP matches, the task-type function
//! and the FSM, and sends whatever changed back to the hub. A coprocessor
//! additionally answers the hub's `coprocessing` pass without persisting, so
//! the hub commits the mutated task first.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::Dispatch;
use super::init;
use super::outbound::Outbound;
use crate::cep::{CepContext, CepMatcher};
use crate::error::{Error, ProtocolError};
use crate::fsm::FsmEvent;
use crate::modules::TaskContext;
use crate::runtime::NodeRuntime;
use crate::sync::merge::{check_hash_diff, merge_task};
use crate::task::{Command, CommandArgs, NodeMeta, NodeRole, Task, TaskError, WireMessage};

pub struct NodeRouter {
    rt: Arc<NodeRuntime>,
    outbound: Outbound,
    hub_id: RwLock<Option<String>>,
}

/// Per-frame facts every pipeline stage needs.
struct Cycle {
    command: Command,
    instance_id: String,
    node: NodeMeta,
    args: CommandArgs,
    self_initiated: bool,
    coprocessing: bool,
}

impl NodeRouter {
    pub fn new(rt: Arc<NodeRuntime>, outbound: Outbound) -> Self {
        Self {
            rt,
            outbound,
            hub_id: RwLock::new(None),
        }
    }

    pub fn runtime(&self) -> &Arc<NodeRuntime> {
        &self.rt
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub async fn hub_id(&self) -> Option<String> {
        self.hub_id.read().await.clone()
    }

    fn is_coprocessor(&self) -> bool {
        self.rt.config.role == NodeRole::Coprocessor
    }

    /// Handle one frame from the hub.
    pub async fn handle(&self, text: &str) -> Result<Dispatch, Error> {
        let msg = WireMessage::parse(text)?;
        let node = msg.node()?;
        let command = node.command.ok_or(ProtocolError::MissingCommand)?;

        match command {
            Command::Register => {
                if let Some(hub_id) = node.args().hub_id {
                    info!(hub_id = %hub_id, "Hub asked for registration");
                    *self.hub_id.write().await = Some(hub_id);
                }
                self.outbound.register(&self.rt.config.node_info())?;
                Ok(Dispatch::Handled)
            }
            Command::Pong => Ok(Dispatch::Pong),
            Command::Reload => {
                info!(source = ?node.source_node_id, "Reload requested");
                Ok(Dispatch::Reload)
            }
            Command::Partial => {
                debug!(instance_id = ?msg.instance_id(), "Partial update");
                Ok(Dispatch::Handled)
            }
            Command::Ping | Command::Start => {
                warn!(command = %command, "Ignoring hub-only command");
                Ok(Dispatch::Handled)
            }
            Command::Init | Command::Join | Command::Update | Command::Error => {
                self.process(command, &msg, node).await?;
                Ok(Dispatch::Handled)
            }
        }
    }

    async fn process(&self, command: Command, msg: &WireMessage, node: NodeMeta) -> Result<(), Error> {
        let instance_id = msg
            .instance_id()
            .ok_or_else(|| ProtocolError::MissingField {
                field: "instanceId".into(),
            })?
            .to_string();
        let args = node.args();
        let cycle = Cycle {
            command,
            self_initiated: node.initiating_node_id.as_deref() == Some(self.rt.node_id()),
            coprocessing: self.is_coprocessor() && node.coprocessing,
            instance_id,
            args,
            node,
        };

        let _lock = if cycle.args.lock_bypass {
            None
        } else {
            Some(self.rt.locks.acquire(&cycle.instance_id, command.as_str()).await)
        };

        match self.run_cycle(&cycle, msg).await {
            Ok(()) => Ok(()),
            // An error frame is already the report.
            Err(e) if command == Command::Error => Err(e),
            Err(e) => {
                let task = self.failed_copy(&cycle, msg).await;
                if let Err(report) = self.fail(&cycle, task, e.to_string()).await {
                    warn!(
                        instance_id = %cycle.instance_id,
                        error = %report,
                        "Could not report cycle failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Reconcile, bind, persist, run CEPs, the task function and the FSM,
    /// then send the result.
    async fn run_cycle(&self, cycle: &Cycle, msg: &WireMessage) -> Result<(), Error> {
        let command = cycle.command;
        let mut task = self.reconcile(cycle, msg).await?;
        task.node = Some(cycle.node.clone());

        if command == Command::Init {
            self.bind_modules(cycle, &task).await?;
        }

        if !cycle.coprocessing {
            self.rt.store.set(&cycle.instance_id, &task).await?;
            if command == Command::Init {
                self.rt.store.set_active(&cycle.instance_id, true).await?;
            }
        }

        if matches!(command, Command::Init | Command::Update) {
            self.run_ceps(cycle, &mut task).await;
        }

        let runs_here = self.runs_here(cycle, &task);
        let mut fsm_event = None;
        if runs_here {
            match self.run_task_function(cycle, &mut task).await {
                Ok(event) => fsm_event = event,
                Err(reason) => return self.fail(cycle, task, reason).await,
            }
        }

        if runs_here && let Some(definition) = self.rt.modules.fsm_for(&task) {
            let event = fsm_event.or_else(|| cycle.args.fsm_event.as_deref().map(FsmEvent::parse));
            let step = self.rt.fsm.drive(&definition, &mut task, event).await?;
            debug!(
                instance_id = %cycle.instance_id,
                from = %step.from,
                to = %step.to,
                resynced = step.resynced,
                "FSM step"
            );
        }

        if command == Command::Update && cycle.args.done && !cycle.coprocessing {
            self.rt.store.set_active(&cycle.instance_id, false).await?;
            self.rt.release_instance(&cycle.instance_id).await;
        }

        if cycle.coprocessing {
            task.command = None;
            task.command_args = None;
            if task.node.is_none() {
                task.node = Some(cycle.node.clone());
            }
            self.outbound.reply_coprocessed(task).await?;
        } else if task.command.is_some() {
            self.outbound.send(task).await?;
        }
        Ok(())
    }

    /// Bring the local copy up to date with the inbound frame.
    async fn reconcile(&self, cycle: &Cycle, msg: &WireMessage) -> Result<Task, Error> {
        let stored = self.rt.store.get(&cycle.instance_id).await?;
        match cycle.command {
            Command::Update => {
                let stored = stored.ok_or_else(|| ProtocolError::MissingStoredTask {
                    instance_id: cycle.instance_id.clone(),
                })?;
                let message_id = msg
                    .task
                    .get("meta")
                    .and_then(|m| m.get("messageId"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                check_hash_diff(&stored, &msg.task, &cycle.node).enforce(
                    &cycle.instance_id,
                    message_id,
                    cycle.self_initiated,
                )?;
                Ok(merge_task(&stored, &msg.task)?)
            }
            Command::Error => match stored {
                Some(stored) => Ok(merge_task(&stored, &msg.task)?),
                None => Ok(msg.task()?),
            },
            _ => Ok(msg.task()?),
        }
    }

    /// Resolve declared modules and, when this node owns them, register CEPs.
    async fn bind_modules(&self, cycle: &Cycle, task: &Task) -> Result<(), Error> {
        let resolved = init::resolve(&self.rt.modules, task, &self.rt.config.environment)?;
        self.rt
            .attach_modules(&cycle.instance_id, resolved.modules)
            .await;

        let owns_ceps = if self.is_coprocessor() {
            cycle.coprocessing
        } else {
            cycle.self_initiated && !cycle.node.coprocessed
        };
        if owns_ceps && !resolved.ceps.is_empty() {
            init::register_ceps(&self.rt.ceps, task, &resolved.ceps).await?;
        }
        Ok(())
    }

    async fn run_ceps(&self, cycle: &Cycle, task: &mut Task) {
        let coprocessor = self.is_coprocessor();
        if coprocessor && !(cycle.coprocessing || cycle.args.sync) {
            return;
        }
        let entries = CepMatcher::new(&self.rt.ceps).matches(task).await;
        let from_cep = cycle.args.sync && cycle.args.cep_source.is_some();

        for entry in entries {
            if from_cep && !self.rt.config.cep_sync_exempt.contains(&entry.name) {
                debug!(cep = %entry.name, source = ?cycle.args.cep_source, "Skipping CEP for CEP-sourced sync");
                continue;
            }
            let ctx = CepContext {
                owner_instance_id: entry.owner_instance_id.clone(),
                name: entry.name.clone(),
                args: entry.args.clone(),
                outbound: self.outbound.clone(),
            };
            if coprocessor {
                match entry.func.call(ctx, task).await {
                    Ok(()) => task.node_mut().cep_executed.push(entry.name),
                    Err(e) => error!(
                        instance_id = %cycle.instance_id,
                        cep = %entry.name,
                        error = %e,
                        "CEP failed"
                    ),
                }
            } else {
                let mut copy = task.clone();
                let func = Arc::clone(&entry.func);
                let name = entry.name;
                tokio::spawn(async move {
                    if let Err(e) = func.call(ctx, &mut copy).await {
                        error!(cep = %name, error = %e, "CEP failed");
                    }
                });
            }
        }
    }

    /// Whether the task function and FSM belong to this node for this frame.
    fn runs_here(&self, cycle: &Cycle, task: &Task) -> bool {
        if matches!(cycle.command, Command::Error | Command::Join) || cycle.self_initiated {
            return false;
        }
        let in_env = task
            .environments
            .as_ref()
            .is_some_and(|envs| envs.contains(&self.rt.config.environment));
        if !in_env {
            return false;
        }
        if self.is_coprocessor() {
            cycle.coprocessing && !cycle.node.coprocessed
        } else {
            true
        }
    }

    /// Run the task-type function. Returns the FSM event it queued.
    async fn run_task_function(&self, cycle: &Cycle, task: &mut Task) -> Result<Option<FsmEvent>, String> {
        let Some(func) = task
            .task_type
            .as_deref()
            .and_then(|t| self.rt.modules.task_function(t))
        else {
            return Ok(None);
        };
        let attached = self
            .rt
            .attached_modules(&cycle.instance_id)
            .await
            .unwrap_or_default();
        let mut ctx = TaskContext::new(self.rt.node_id(), self.outbound.clone(), attached);
        match func.run(&mut ctx, task.clone()).await {
            Ok(Some(next)) => {
                *task = next;
                Ok(ctx.take_fsm_event())
            }
            Ok(None) => Ok(ctx.take_fsm_event()),
            Err(e) => Err(format!("{e:#}")),
        }
    }

    /// Best local view of the task to carry an error: the stored copy,
    /// else the inbound frame.
    async fn failed_copy(&self, cycle: &Cycle, msg: &WireMessage) -> Task {
        let stored = self.rt.store.get(&cycle.instance_id).await.ok().flatten();
        let mut task = stored.or_else(|| msg.task().ok()).unwrap_or_default();
        task.instance_id = Some(cycle.instance_id.clone());
        task.node = Some(cycle.node.clone());
        task
    }

    /// Surface a failed cycle as `task.error`.
    async fn fail(&self, cycle: &Cycle, mut task: Task, reason: String) -> Result<(), Error> {
        error!(
            instance_id = %cycle.instance_id,
            task_type = ?task.task_type,
            error = %reason,
            "Task cycle failed"
        );
        task.error = Some(TaskError {
            message: reason,
            source_node_id: Some(self.rt.node_id().to_string()),
            ..Default::default()
        });
        if cycle.coprocessing {
            task.command = None;
            task.command_args = None;
            return self.outbound.reply_coprocessed(task).await;
        }
        task.command = Some(Command::Update);
        task.command_args = Some(CommandArgs {
            lock_bypass: true,
            ..Default::default()
        });
        self.outbound.send(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cep::CepFunction;
    use crate::config::NodeConfig;
    use crate::error::{MergeError, ModuleError};
    use crate::fsm::FsmDefinition;
    use crate::modules::{ModuleRegistry, TaskFunction};
    use crate::store::MemoryTaskStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Reply;

    #[async_trait]
    impl TaskFunction for Reply {
        async fn run(&self, _ctx: &mut TaskContext, mut task: Task) -> anyhow::Result<Option<Task>> {
            task.set_payload("response", json!({"text": "pong"}));
            task.command = Some(Command::Update);
            Ok(Some(task))
        }
    }

    struct Fails;

    #[async_trait]
    impl TaskFunction for Fails {
        async fn run(&self, _ctx: &mut TaskContext, _task: Task) -> anyhow::Result<Option<Task>> {
            anyhow::bail!("service down")
        }
    }

    struct Audit;

    #[async_trait]
    impl CepFunction for Audit {
        async fn call(&self, _ctx: CepContext, task: &mut Task) -> anyhow::Result<()> {
            task.set_payload("audited", json!(true));
            Ok(())
        }
    }

    struct Notify(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl CepFunction for Notify {
        async fn call(&self, ctx: CepContext, task: &mut Task) -> anyhow::Result<()> {
            let _ = self.0.send(format!("{}:{}", ctx.name, task.instance_id.clone().unwrap_or_default()));
            Ok(())
        }
    }

    struct Harness {
        router: NodeRouter,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Harness {
        fn new(role: NodeRole, modules: ModuleRegistry) -> Self {
            let mut config = NodeConfig::for_role(role);
            config.node_id = "n1".into();
            let store = Arc::new(MemoryTaskStore::new());
            let rt = Arc::new(NodeRuntime::new(config, store.clone(), modules));
            let (tx, rx) = mpsc::unbounded_channel();
            let outbound = Outbound::new("n1", role, tx, store);
            Self {
                router: NodeRouter::new(rt, outbound),
                rx,
            }
        }

        fn rt(&self) -> &Arc<NodeRuntime> {
            self.router.runtime()
        }

        async fn feed(&self, task: Value) -> Result<Dispatch, Error> {
            self.router.handle(&json!({"task": task}).to_string()).await
        }

        fn sent(&mut self) -> Option<WireMessage> {
            self.rx
                .try_recv()
                .ok()
                .map(|text| WireMessage::parse(&text).unwrap())
        }
    }

    fn chat(initiator: &str) -> Value {
        json!({
            "id": "root.ui.TaskChat.start",
            "instanceId": "i1",
            "familyId": "f1",
            "type": "TaskChat",
            "environments": ["rust"],
            "state": {"current": "A"},
            "output": {"text": "hi"},
            "node": {"command": "init", "initiatingNodeId": initiator}
        })
    }

    #[tokio::test]
    async fn register_answers_with_node_info() {
        let mut h = Harness::new(NodeRole::Processor, ModuleRegistry::default());
        let out = h
            .feed(json!({"node": {"command": "register", "commandArgs": {"hubId": "hub-1"}}}))
            .await
            .unwrap();
        assert_eq!(out, Dispatch::Handled);
        assert_eq!(h.router.hub_id().await.as_deref(), Some("hub-1"));
        let reply = h.sent().unwrap();
        let node = reply.node().unwrap();
        assert_eq!(node.command, Some(Command::Register));
        assert_eq!(node.role, Some(NodeRole::Processor));
        assert_eq!(node.id.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn reload_and_pong_are_reported() {
        let h = Harness::new(NodeRole::Processor, ModuleRegistry::default());
        let reload = h.feed(json!({"node": {"command": "reload"}})).await.unwrap();
        assert_eq!(reload, Dispatch::Reload);
        let pong = h.feed(json!({"node": {"command": "pong"}})).await.unwrap();
        assert_eq!(pong, Dispatch::Pong);
    }

    #[tokio::test]
    async fn init_persists_and_runs_task_function() {
        let modules = ModuleRegistry::builder().task_function("TaskChat", Reply).build();
        let mut h = Harness::new(NodeRole::Processor, modules);
        h.feed(chat("browser")).await.unwrap();

        assert!(h.rt().store.is_active("i1").await.unwrap());
        let stored = h.rt().store.get("i1").await.unwrap().unwrap();
        assert!(stored.node.is_none());

        let frame = h.sent().expect("task function result is sent");
        assert_eq!(frame.command().unwrap(), Command::Update);
        assert_eq!(frame.task["response"], json!({"text": "pong"}));
        // Diffed against the stored copy.
        assert!(frame.task.get("output").is_none());
        assert!(!h.rt().locks.is_locked("i1"));
    }

    #[tokio::test]
    async fn own_echo_does_not_rerun_task_function() {
        let modules = ModuleRegistry::builder().task_function("TaskChat", Reply).build();
        let mut h = Harness::new(NodeRole::Processor, modules);
        h.feed(chat("n1")).await.unwrap();
        assert!(h.sent().is_none());
    }

    #[tokio::test]
    async fn task_function_error_becomes_task_error() {
        let modules = ModuleRegistry::builder().task_function("TaskChat", Fails).build();
        let mut h = Harness::new(NodeRole::Processor, modules);
        h.feed(chat("browser")).await.unwrap();

        let frame = h.sent().unwrap();
        let node = frame.node().unwrap();
        assert_eq!(node.command, Some(Command::Update));
        assert!(node.args().lock_bypass);
        assert_eq!(frame.task["error"]["message"], "service down");
        assert_eq!(frame.task["error"]["sourceNodeId"], "n1");
    }

    #[tokio::test]
    async fn update_merges_into_stored_copy() {
        let mut h = Harness::new(NodeRole::Processor, ModuleRegistry::default());
        h.feed(chat("browser")).await.unwrap();
        h.feed(json!({
            "instanceId": "i1",
            "input": {"text": "more"},
            "output": null,
            "node": {"command": "update", "initiatingNodeId": "browser"}
        }))
        .await
        .unwrap();
        let stored = h.rt().store.get("i1").await.unwrap().unwrap();
        assert_eq!(stored.payload("input"), Some(&json!({"text": "more"})));
        assert!(stored.payload("output").is_none());
        assert_eq!(stored.family_id.as_deref(), Some("f1"));
        assert!(h.sent().is_none());
    }

    #[tokio::test]
    async fn update_without_local_copy_fails() {
        let mut h = Harness::new(NodeRole::Processor, ModuleRegistry::default());
        let err = h
            .feed(json!({"instanceId": "nope", "node": {"command": "update"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::MissingStoredTask { .. })));
        assert!(!h.rt().locks.is_locked("nope"));

        let report = h.sent().expect("error reported to hub");
        let node = report.node().unwrap();
        assert_eq!(node.command, Some(Command::Update));
        assert!(node.args().lock_bypass);
        assert_eq!(report.instance_id(), Some("nope"));
        assert!(report.task["error"]["message"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn missing_module_aborts_init_with_task_error() {
        let mut h = Harness::new(NodeRole::Processor, ModuleRegistry::default());
        let mut task = chat("browser");
        task["ceps"] = json!({"gone": {"environments": ["rust"], "moduleName": "CEPMissing", "match": "familyId"}});
        let err = h.feed(task).await.unwrap_err();
        assert!(matches!(err, Error::Module(ModuleError::NotFound { .. })));
        assert!(h.rt().store.get("i1").await.unwrap().is_none());

        let report = h.sent().expect("error reported to hub");
        let node = report.node().unwrap();
        assert_eq!(node.command, Some(Command::Update));
        assert!(node.args().lock_bypass);
        assert!(report.task["error"]["message"].as_str().unwrap().contains("CEPMissing"));
        assert_eq!(report.task["error"]["sourceNodeId"], "n1");
    }

    #[tokio::test]
    async fn coprocessor_failure_is_returned_to_the_hub() {
        let mut h = Harness::new(NodeRole::Coprocessor, ModuleRegistry::default());
        let mut task = chat("browser");
        task["ceps"] = json!({"gone": {"environments": ["rust"], "moduleName": "CEPMissing", "match": "familyId"}});
        task["node"]["coprocessing"] = json!(true);
        h.feed(task).await.unwrap_err();

        let reply = h.sent().expect("coprocessed reply");
        let node = reply.node().unwrap();
        assert!(node.coprocessed);
        assert_eq!(node.command, Some(Command::Init));
        assert_eq!(node.initiating_node_id.as_deref(), Some("browser"));
        assert!(reply.task["error"]["message"].as_str().unwrap().contains("CEPMissing"));
    }

    #[tokio::test]
    async fn own_hash_mismatch_is_fatal() {
        let mut h = Harness::new(NodeRole::Processor, ModuleRegistry::default());
        h.feed(chat("browser")).await.unwrap();
        let update = json!({
            "instanceId": "i1",
            "output": {"text": "bye"},
            "meta": {"hashDiff": 1},
            "node": {"command": "update", "initiatingNodeId": "n1"}
        });
        let err = h.feed(update.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Merge(MergeError::HashMismatch { .. })));
        let report = h.sent().expect("error reported to hub");
        assert!(report.task["error"]["message"].as_str().is_some());
        assert_eq!(h.rt().store.get("i1").await.unwrap().unwrap().payload("output"), Some(&json!({"text": "hi"})));

        // The same divergence from another node only warns.
        let mut remote = update;
        remote["node"]["initiatingNodeId"] = json!("browser");
        h.feed(remote).await.unwrap();
    }

    #[tokio::test]
    async fn fsm_takes_one_step_per_message() {
        let fsm = FsmDefinition::builder("TaskChat")
            .initial("A")
            .always("A", "B")
            .always("B", "C")
            .build()
            .unwrap();
        let modules = ModuleRegistry::builder().fsm("TaskChat", fsm).build();
        let mut h = Harness::new(NodeRole::Processor, modules);

        h.feed(chat("browser")).await.unwrap();
        let first = h.sent().unwrap();
        assert_eq!(first.task["state"]["current"], "B");
        assert_eq!(first.node().unwrap().state_last.as_deref(), Some("B"));

        h.feed(json!({
            "instanceId": "i1",
            "state": {"current": "B"},
            "input": {"x": 1},
            "node": {"command": "update", "initiatingNodeId": "browser"}
        }))
        .await
        .unwrap();
        let second = h.sent().unwrap();
        assert_eq!(second.task["state"]["current"], "C");
    }

    #[tokio::test]
    async fn processor_registers_ceps_and_fires_detached() {
        let (tx, mut fired) = mpsc::unbounded_channel();
        let modules = ModuleRegistry::builder().cep("CEPNotify", Notify(tx)).build();
        let h = Harness::new(NodeRole::Processor, modules);
        let mut task = chat("n1");
        task["ceps"] = json!({"notify": {"environments": ["rust"], "moduleName": "CEPNotify", "match": "familyId"}});
        h.feed(task).await.unwrap();
        assert_eq!(h.rt().ceps.len().await, 1);

        h.feed(json!({
            "instanceId": "i1",
            "input": {"x": 1},
            "node": {"command": "update", "initiatingNodeId": "browser"}
        }))
        .await
        .unwrap();
        let mut names = Vec::new();
        while names.len() < 2 {
            let name = tokio::time::timeout(std::time::Duration::from_secs(1), fired.recv())
                .await
                .unwrap()
                .unwrap();
            names.push(name);
        }
        assert!(names.iter().all(|n| n == "CEPNotify:i1"));
    }

    #[tokio::test]
    async fn coprocessor_replies_without_persisting() {
        let modules = ModuleRegistry::builder().cep("CEPAudit", Audit).build();
        let mut h = Harness::new(NodeRole::Coprocessor, modules);
        let mut task = chat("browser");
        task["ceps"] = json!({"audit": {"environments": ["rust"], "moduleName": "CEPAudit", "match": "familyId"}});
        task["node"]["coprocessing"] = json!(true);
        h.feed(task).await.unwrap();

        assert!(h.rt().store.get("i1").await.unwrap().is_none());
        let reply = h.sent().unwrap();
        let node = reply.node().unwrap();
        assert_eq!(node.command, Some(Command::Init));
        assert!(node.coprocessed);
        assert_eq!(node.initiating_node_id.as_deref(), Some("browser"));
        assert_eq!(node.cep_executed, vec!["CEPAudit".to_string()]);
        assert_eq!(reply.task["audited"], true);
    }

    #[tokio::test]
    async fn cep_sourced_sync_skips_non_exempt_ceps() {
        let (tx, mut fired) = mpsc::unbounded_channel();
        let modules = ModuleRegistry::builder().cep("CEPNotify", Notify(tx)).build();
        let h = Harness::new(NodeRole::Coprocessor, modules);
        let mut task = chat("browser");
        task["ceps"] = json!({"notify": {"environments": ["rust"], "moduleName": "CEPNotify", "match": "familyId"}});
        task["node"]["coprocessing"] = json!(true);
        h.feed(task).await.unwrap();
        assert_eq!(fired.try_recv().unwrap(), "CEPNotify:i1");

        // The committed fan-out copy is what the coprocessor stores.
        let mut committed = chat("browser");
        committed["node"]["coprocessed"] = json!(true);
        h.feed(committed).await.unwrap();
        assert!(fired.try_recv().is_err());

        let sync = |source: Option<&str>| {
            let mut args = json!({"sync": true, "lockBypass": true});
            if let Some(source) = source {
                args["CEPSource"] = json!(source);
            }
            json!({
                "instanceId": "i1",
                "input": {"x": 1},
                "node": {
                    "command": "update",
                    "initiatingNodeId": "browser",
                    "coprocessed": true,
                    "commandArgs": args
                }
            })
        };
        h.feed(sync(Some("CEPNotify"))).await.unwrap();
        assert!(fired.try_recv().is_err());
        h.feed(sync(None)).await.unwrap();
        assert_eq!(fired.try_recv().unwrap(), "CEPNotify:i1");
    }

    #[tokio::test]
    async fn done_releases_instance() {
        let (tx, _fired) = mpsc::unbounded_channel();
        let modules = ModuleRegistry::builder().cep("CEPNotify", Notify(tx)).build();
        let h = Harness::new(NodeRole::Processor, modules);
        let mut task = chat("n1");
        task["ceps"] = json!({"notify": {"environments": ["rust"], "moduleName": "CEPNotify", "match": "familyId"}});
        h.feed(task).await.unwrap();
        assert!(h.rt().attached_modules("i1").await.is_some());

        h.feed(json!({
            "instanceId": "i1",
            "node": {"command": "update", "initiatingNodeId": "n1", "commandArgs": {"done": true}}
        }))
        .await
        .unwrap();
        assert!(!h.rt().store.is_active("i1").await.unwrap());
        assert!(h.rt().attached_modules("i1").await.is_none());
        assert!(h.rt().ceps.is_empty().await);
    }
}
