//! Error types for the task sync protocol.

use std::time::Duration;

/// Top-level error type for a node.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("CEP error: {0}")]
    Cep(#[from] CepError),

    #[error("FSM error: {0}")]
    Fsm(#[from] FsmError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Instance lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Instance {instance_id} is locked by {holder}")]
    Busy { instance_id: String, holder: String },

    #[error("No parked lock for instance {instance_id}")]
    NotParked { instance_id: String },
}

/// Merge and divergence errors.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Task hash mismatch for {instance_id} (message {message_id}): local {local} remote {remote}")]
    HashMismatch {
        instance_id: String,
        message_id: String,
        local: u32,
        remote: u32,
    },

    #[error("Expected a JSON object for {what}")]
    NotAnObject { what: String },

    #[error("Task id changed from {stored} to {incoming}")]
    IdChanged { stored: String, incoming: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// CEP registration and matching errors.
#[derive(Debug, thiserror::Error)]
pub enum CepError {
    #[error("CEP {name} has no match expression")]
    MissingMatch { name: String },

    #[error("CEP {name} has an invalid regex {pattern}: {reason}")]
    InvalidRegex {
        name: String,
        pattern: String,
        reason: String,
    },

    #[error("CEP {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// State machine errors.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("Unknown state {state} in machine {machine}")]
    UnknownState { machine: String, state: String },

    #[error("Machine {machine} has no initial state")]
    NoInitialState { machine: String },

    #[error("Action {action} failed in machine {machine}: {reason}")]
    ActionFailed {
        machine: String,
        action: String,
        reason: String,
    },
}

/// Service, operator and CEP resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} of task {task_id} has no environments")]
    NoEnvironments {
        kind: String,
        name: String,
        task_id: String,
    },

    #[error("Invalid {kind} config for {name}: {reason}")]
    InvalidConfig {
        kind: String,
        name: String,
        reason: String,
    },
}

/// Command dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Message has no command")]
    MissingCommand,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Task is missing {field}")]
    MissingField { field: String },

    #[error("No stored task for instance {instance_id}")]
    MissingStoredTask { instance_id: String },

    #[error("Task {instance_id} locked by {holder}")]
    TaskLocked { instance_id: String, holder: String },

    #[error("Hub error rate exceeded {max} per minute")]
    ErrorRateExceeded { max: u32 },

    #[error("More than one coprocessor registered: {ids:?}")]
    MultipleCoprocessors { ids: Vec<String> },

    #[error("Task function {name} failed: {reason}")]
    TaskFunction { name: String, reason: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// WebSocket and HTTP transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Node {node_id} is not connected")]
    NotConnected { node_id: String },

    #[error("Send to {node_id} failed: {reason}")]
    SendFailed { node_id: String, reason: String },

    #[error("Connection to {url} failed: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("Gave up after {attempts} reconnect attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
