//! Task document model.

pub mod model;

pub use model::{
    Command, CommandArgs, ModuleConfig, NodeInfo, NodeMeta, NodeRole, Task, TaskError, TaskMeta,
    TaskState, TaskUser, WireMessage,
};
