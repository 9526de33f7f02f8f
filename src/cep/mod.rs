//! Complex event processing: subscriptions that fire when other tasks change.
//!
//! A task declares CEPs in its `ceps` map during `init`. Each one subscribes a
//! registered [`CepFunction`] to a match key; every inbound update is then
//! checked against the registry and the matching functions run before (on a
//! coprocessor) or alongside (on a processor) the rest of the pipeline.

pub mod logger;
pub mod matcher;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

use crate::router::Outbound;
use crate::task::Task;

pub use logger::{SYSTEM_LOGGER, SystemLogger};
pub use matcher::{CepMatcher, candidate_keys};
pub use registry::{CepEntry, CepRegistry, REGEX_PREFIX};

/// What a CEP callback gets besides the triggering task.
#[derive(Clone)]
pub struct CepContext {
    /// Instance that registered the subscription.
    pub owner_instance_id: String,
    pub name: String,
    pub args: Option<Value>,
    pub outbound: Outbound,
}

/// A named reaction to a matching task update.
///
/// On a coprocessor the callback is awaited and may mutate `task` before the
/// hub commits it. On a processor it runs detached on a copy.
#[async_trait]
pub trait CepFunction: Send + Sync {
    async fn call(&self, ctx: CepContext, task: &mut Task) -> anyhow::Result<()>;
}
