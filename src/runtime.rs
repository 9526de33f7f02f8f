//! Per-node context shared by every handler.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::cep::CepRegistry;
use crate::config::NodeConfig;
use crate::connections::ConnectionRegistry;
use crate::error::DatabaseError;
use crate::fsm::FsmDriver;
use crate::modules::{AttachedModules, ModuleRegistry};
use crate::store::{LibSqlTaskStore, MemoryTaskStore, TaskStore};
use crate::sync::{ErrorRateLimiter, LockManager};

/// Everything a hub or node needs to process commands. There are no
/// process-wide singletons; two runtimes can live in one process.
pub struct NodeRuntime {
    pub config: NodeConfig,
    pub store: Arc<dyn TaskStore>,
    pub locks: LockManager,
    pub ceps: CepRegistry,
    pub fsm: FsmDriver,
    pub modules: Arc<ModuleRegistry>,
    /// Hub only: connected nodes and task membership.
    pub connections: ConnectionRegistry,
    /// Hub only: error traffic budget.
    pub errors: ErrorRateLimiter,
    /// Services and operators resolved per instance during `init`.
    attached: RwLock<HashMap<String, AttachedModules>>,
}

impl NodeRuntime {
    pub fn new(config: NodeConfig, store: Arc<dyn TaskStore>, modules: ModuleRegistry) -> Self {
        let errors = ErrorRateLimiter::new(config.max_errors_per_minute);
        Self {
            config,
            store,
            locks: LockManager::new(),
            ceps: CepRegistry::new(),
            fsm: FsmDriver::new(),
            modules: Arc::new(modules),
            connections: ConnectionRegistry::new(),
            errors,
            attached: RwLock::new(HashMap::new()),
        }
    }

    /// In-memory store and an empty module registry.
    pub fn in_memory(config: NodeConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryTaskStore::new()),
            ModuleRegistry::default(),
        )
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub async fn attach_modules(&self, instance_id: &str, modules: AttachedModules) {
        self.attached
            .write()
            .await
            .insert(instance_id.to_string(), modules);
    }

    pub async fn attached_modules(&self, instance_id: &str) -> Option<AttachedModules> {
        self.attached.read().await.get(instance_id).cloned()
    }

    /// Forget everything held for a finished instance.
    pub async fn release_instance(&self, instance_id: &str) {
        self.attached.write().await.remove(instance_id);
        self.fsm.forget(instance_id).await;
        let ceps = self.ceps.remove_owner(instance_id).await;
        tracing::debug!(instance_id = %instance_id, ceps, "Released instance");
    }
}

/// Open the configured store: libSQL when `db_path` is set, memory otherwise.
pub async fn open_store(config: &NodeConfig) -> Result<Arc<dyn TaskStore>, DatabaseError> {
    match &config.db_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Opening libSQL task store");
            Ok(Arc::new(LibSqlTaskStore::new_local(path).await?))
        }
        None => {
            tracing::info!("Using in-memory task store");
            Ok(Arc::new(MemoryTaskStore::new()))
        }
    }
}
