//! Task document and wire message types.
//!
//! A [`Task`] is the unit of distributed state. Known sub-documents are typed;
//! domain payload (`request`, `response`, `output`, ...) is carried as opaque
//! JSON in `extra` and merged like any other field.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Task ids under this prefix are process-wide singletons.
pub const SYSTEM_TASK_PREFIX: &str = "root.system.";

/// State assumed when a task carries no `state.current`.
pub const DEFAULT_STATE: &str = "init";

fn is_false(b: &bool) -> bool {
    !*b
}

/// Generate an 8-character message id.
pub fn new_message_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

// ── Commands ────────────────────────────────────────────────────────────

/// Protocol command carried in `node.command` (or `task.command` before send).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Join,
    Init,
    Update,
    Error,
    Register,
    Ping,
    Pong,
    Reload,
    Partial,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Join => "join",
            Self::Init => "init",
            Self::Update => "update",
            Self::Error => "error",
            Self::Register => "register",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Reload => "reload",
            Self::Partial => "partial",
        }
    }

    /// Liveness commands never touch task state.
    pub fn is_liveness(&self) -> bool {
        matches!(self, Self::Register | Self::Ping | Self::Pong)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "join" => Ok(Self::Join),
            "init" => Ok(Self::Init),
            "update" => Ok(Self::Update),
            "error" => Ok(Self::Error),
            "register" => Ok(Self::Register),
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "reload" => Ok(Self::Reload),
            "partial" => Ok(Self::Partial),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Commands a node accepts unless configured otherwise.
pub const DEFAULT_COMMANDS_ACCEPTED: &[Command] = &[
    Command::Partial,
    Command::Update,
    Command::Init,
    Command::Join,
    Command::Pong,
    Command::Register,
    Command::Error,
];

// ── Node identity ───────────────────────────────────────────────────────

/// Role a node plays in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Hub,
    Processor,
    Coprocessor,
    Consumer,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hub => "hub",
            Self::Processor => "processor",
            Self::Coprocessor => "coprocessor",
            Self::Consumer => "consumer",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hub" => Ok(Self::Hub),
            "processor" => Ok(Self::Processor),
            "coprocessor" => Ok(Self::Coprocessor),
            "consumer" => Ok(Self::Consumer),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// What a node tells the hub when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(alias = "id", alias = "processorId")]
    pub node_id: String,
    pub role: NodeRole,
    #[serde(rename = "type")]
    pub node_type: String,
    pub environment: String,
    pub commands_accepted: Vec<Command>,
}

impl NodeInfo {
    pub fn accepts(&self, command: Command) -> bool {
        self.commands_accepted.contains(&command)
    }
}

// ── Sub-documents ───────────────────────────────────────────────────────

/// `{current, last, deltaState}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_state: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters of the requested command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandArgs {
    #[serde(default, skip_serializing_if = "is_false")]
    pub sync: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub lock_bypass: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub lock: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unlock: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_task: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsm_event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<String>,
    #[serde(rename = "CEPSource", default, skip_serializing_if = "Option::is_none")]
    pub cep_source: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-hop transport metadata. Replaced wholesale on merge, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_args: Option<CommandArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_description: Option<String>,
    #[serde(
        default,
        alias = "initiatingProcessorId",
        skip_serializing_if = "Option::is_none"
    )]
    pub initiating_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub coprocessing: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub coprocessed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<NodeRole>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_accepted: Option<Vec<Command>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_last: Option<String>,
    #[serde(rename = "CEPExecuted", default, skip_serializing_if = "Vec::is_empty")]
    pub cep_executed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states_not_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_task: Option<Box<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeMeta {
    pub fn args(&self) -> CommandArgs {
        self.command_args.clone().unwrap_or_default()
    }

    /// Whether the receiver should exchange full documents rather than diffs.
    pub fn wants_full_task(&self) -> bool {
        self.states_supported.is_some() || self.states_not_supported.is_some()
    }

    /// Whether a task in `state` should be delivered to this node.
    pub fn supports_state(&self, state: Option<&str>) -> bool {
        let state = state.unwrap_or_default();
        if let Some(supported) = &self.states_supported
            && !supported.iter().any(|s| s == state)
        {
            return false;
        }
        if let Some(unsupported) = &self.states_not_supported
            && unsupported.iter().any(|s| s == state)
        {
            return false;
        }
        true
    }
}

/// Causal chain and bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_ptr: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_diff: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_count: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `task.error` when a task function fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUser {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of a task's `services`, `operators` or `ceps` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environments: Option<Vec<String>>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub module_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_expr: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_regex: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModuleConfig {
    /// Registry name: `moduleName`, else `type`, else the map key.
    pub fn resolve_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.module_name
            .as_deref()
            .or(self.module_type.as_deref())
            .unwrap_or(key)
    }
}

// ── Task ────────────────────────────────────────────────────────────────

/// The distributed task document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<TaskUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_args: Option<CommandArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<TaskMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<BTreeMap<String, ModuleConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operators: Option<BTreeMap<String, ModuleConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceps: Option<BTreeMap<String, ModuleConfig>>,
    /// Domain payload: `request`, `response`, `output`, `input`, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            instance_id: Some(instance_id.into()),
            ..Default::default()
        }
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        // Every field is representable as JSON, so this cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn require_instance_id(&self) -> Result<&str, ProtocolError> {
        self.instance_id
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingField {
                field: "instanceId".into(),
            })
    }

    pub fn require_id(&self) -> Result<&str, ProtocolError> {
        self.id.as_deref().ok_or_else(|| ProtocolError::MissingField {
            field: "id".into(),
        })
    }

    pub fn is_system(&self) -> bool {
        self.id
            .as_deref()
            .is_some_and(|id| id.starts_with(SYSTEM_TASK_PREFIX))
    }

    pub fn current_state(&self) -> Option<&str> {
        self.state.as_ref().and_then(|s| s.current.as_deref())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// `config.local.CEPSecret`, when present.
    pub fn cep_secret(&self) -> Option<&str> {
        self.config
            .as_ref()?
            .get("local")?
            .get("CEPSecret")?
            .as_str()
    }

    /// The command in flight: `node.command`, falling back to `task.command`.
    pub fn effective_command(&self) -> Option<Command> {
        self.node
            .as_ref()
            .and_then(|n| n.command)
            .or(self.command)
    }

    pub fn node_args(&self) -> CommandArgs {
        self.node.as_ref().map(NodeMeta::args).unwrap_or_default()
    }

    pub fn initiating_node_id(&self) -> Option<&str> {
        self.node
            .as_ref()
            .and_then(|n| n.initiating_node_id.as_deref())
    }

    pub fn meta_mut(&mut self) -> &mut TaskMeta {
        self.meta.get_or_insert_with(TaskMeta::default)
    }

    pub fn node_mut(&mut self) -> &mut NodeMeta {
        self.node.get_or_insert_with(NodeMeta::default)
    }

    /// Set `state.current`, recording the previous value in `state.last`.
    pub fn advance_state(&mut self, next: impl Into<String>) {
        let state = self.state.get_or_insert_with(TaskState::default);
        state.last = state.current.take();
        state.current = Some(next.into());
    }

    /// Access a domain payload field such as `output`.
    pub fn payload(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn set_payload(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }
}

// ── Wire ────────────────────────────────────────────────────────────────

/// WebSocket frame: `{"task": <Task>}`.
///
/// The task is kept as raw JSON so that `null` deletions in a partial update
/// survive until the merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub task: Value,
}

impl WireMessage {
    pub fn new(task: Value) -> Self {
        Self { task }
    }

    pub fn from_task(task: &Task) -> Self {
        Self {
            task: task.to_value(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    /// The hop metadata. Accepts the legacy `processor` key.
    pub fn node(&self) -> Result<NodeMeta, ProtocolError> {
        let raw = self
            .task
            .get("node")
            .or_else(|| self.task.get("processor"))
            .cloned()
            .unwrap_or(Value::Null);
        if raw.is_null() {
            return Ok(NodeMeta::default());
        }
        serde_json::from_value(raw).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    pub fn command(&self) -> Result<Command, ProtocolError> {
        self.node()?.command.ok_or(ProtocolError::MissingCommand)
    }

    /// Typed view of the task. Top-level `null`s read as absent.
    pub fn task(&self) -> Result<Task, ProtocolError> {
        Task::from_value(self.task.clone())
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.task.get("instanceId").and_then(Value::as_str)
    }
}
