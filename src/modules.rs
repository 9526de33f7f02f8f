//! Startup-time registry of everything a task can name: services,
//! operators, CEP functions, task functions, FSM definitions and templates.
//!
//! Nothing is loaded dynamically. A node builds one [`ModuleRegistry`] at
//! startup and hands it to the runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cep::CepFunction;
use crate::error::ModuleError;
use crate::fsm::{FsmDefinition, FsmEvent};
use crate::router::Outbound;
use crate::task::{ModuleConfig, Task};

/// A callable service or operator a task function can use.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, task: &Task, args: Value) -> anyhow::Result<Value>;
}

/// A service bound to a task's configuration entry.
#[derive(Clone)]
pub struct BoundService {
    pub name: String,
    pub config: ModuleConfig,
    pub service: Arc<dyn Service>,
}

impl BoundService {
    /// Call with the configured `args` merged under the call's own.
    pub async fn call(&self, task: &Task, args: Value) -> anyhow::Result<Value> {
        let merged = match &self.config.args {
            Some(base) => crate::sync::merge::deep_merge(base, &args),
            None => args,
        };
        self.service.call(task, merged).await
    }
}

/// Modules resolved for one task instance during `init`.
#[derive(Clone, Default)]
pub struct AttachedModules {
    pub services: BTreeMap<String, BoundService>,
    pub operators: BTreeMap<String, BoundService>,
}

/// Handed to a task function.
pub struct TaskContext {
    pub node_id: String,
    pub outbound: Outbound,
    pub modules: AttachedModules,
    fsm_event: Option<FsmEvent>,
}

impl TaskContext {
    pub fn new(node_id: impl Into<String>, outbound: Outbound, modules: AttachedModules) -> Self {
        Self {
            node_id: node_id.into(),
            outbound,
            modules,
            fsm_event: None,
        }
    }

    /// Queue an event for the FSM step that follows the task function.
    pub fn send_fsm_event(&mut self, event: FsmEvent) {
        self.fsm_event = Some(event);
    }

    pub fn take_fsm_event(&mut self) -> Option<FsmEvent> {
        self.fsm_event.take()
    }

    pub fn service(&self, key: &str) -> Option<&BoundService> {
        self.modules.services.get(key)
    }

    pub fn operator(&self, key: &str) -> Option<&BoundService> {
        self.modules.operators.get(key)
    }
}

/// Behaviour of one task type on a node.
///
/// Returning `Ok(None)` means nothing to broadcast. A returned task with a
/// `command` is sent through the context's outbound link.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    async fn run(&self, ctx: &mut TaskContext, task: Task) -> anyhow::Result<Option<Task>>;
}

/// Which registry a module name is looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Service,
    Operator,
    Cep,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Operator => "operator",
            Self::Cep => "cep",
        }
    }
}

/// Immutable name → implementation map.
#[derive(Default)]
pub struct ModuleRegistry {
    services: HashMap<String, Arc<dyn Service>>,
    operators: HashMap<String, Arc<dyn Service>>,
    ceps: HashMap<String, Arc<dyn CepFunction>>,
    task_functions: HashMap<String, Arc<dyn TaskFunction>>,
    fsms: HashMap<String, Arc<FsmDefinition>>,
    templates: HashMap<String, Value>,
}

impl ModuleRegistry {
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder {
            registry: Self::default(),
        }
    }

    pub fn exists(&self, kind: ModuleKind, name: &str) -> bool {
        match kind {
            ModuleKind::Service => self.services.contains_key(name),
            ModuleKind::Operator => self.operators.contains_key(name),
            ModuleKind::Cep => self.ceps.contains_key(name),
        }
    }

    fn not_found(kind: ModuleKind, name: &str) -> ModuleError {
        ModuleError::NotFound {
            kind: kind.as_str().to_string(),
            name: name.to_string(),
        }
    }

    pub fn resolve_service(&self, kind: ModuleKind, name: &str) -> Result<Arc<dyn Service>, ModuleError> {
        let map = match kind {
            ModuleKind::Service => &self.services,
            ModuleKind::Operator => &self.operators,
            ModuleKind::Cep => return Err(Self::not_found(kind, name)),
        };
        map.get(name).cloned().ok_or_else(|| Self::not_found(kind, name))
    }

    pub fn resolve_cep(&self, name: &str) -> Result<Arc<dyn CepFunction>, ModuleError> {
        self.ceps
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found(ModuleKind::Cep, name))
    }

    pub fn task_function(&self, task_type: &str) -> Option<Arc<dyn TaskFunction>> {
        self.task_functions.get(task_type).cloned()
    }

    /// The machine for `task`: `config.fsm.name` when set, else its type.
    pub fn fsm_for(&self, task: &Task) -> Option<Arc<FsmDefinition>> {
        let named = task
            .config
            .as_ref()
            .and_then(|c| c.get("fsm"))
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str);
        named
            .or(task.task_type.as_deref())
            .and_then(|key| self.fsms.get(key).cloned())
    }

    /// Template to build a task with id `task_id` from.
    pub fn template(&self, task_id: &str) -> Option<&Value> {
        self.templates.get(task_id)
    }
}

pub struct ModuleRegistryBuilder {
    registry: ModuleRegistry,
}

impl ModuleRegistryBuilder {
    pub fn service(mut self, name: impl Into<String>, service: impl Service + 'static) -> Self {
        self.registry.services.insert(name.into(), Arc::new(service));
        self
    }

    pub fn operator(mut self, name: impl Into<String>, operator: impl Service + 'static) -> Self {
        self.registry.operators.insert(name.into(), Arc::new(operator));
        self
    }

    pub fn cep(mut self, name: impl Into<String>, cep: impl CepFunction + 'static) -> Self {
        self.registry.ceps.insert(name.into(), Arc::new(cep));
        self
    }

    pub fn task_function(
        mut self,
        task_type: impl Into<String>,
        func: impl TaskFunction + 'static,
    ) -> Self {
        self.registry
            .task_functions
            .insert(task_type.into(), Arc::new(func));
        self
    }

    pub fn fsm(mut self, key: impl Into<String>, definition: FsmDefinition) -> Self {
        self.registry.fsms.insert(key.into(), Arc::new(definition));
        self
    }

    pub fn template(mut self, task_id: impl Into<String>, template: Value) -> Self {
        self.registry.templates.insert(task_id.into(), template);
        self
    }

    pub fn build(self) -> ModuleRegistry {
        tracing::debug!(
            services = self.registry.services.len(),
            operators = self.registry.operators.len(),
            ceps = self.registry.ceps.len(),
            task_functions = self.registry.task_functions.len(),
            fsms = self.registry.fsms.len(),
            "Module registry built"
        );
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        async fn call(&self, _task: &Task, args: Value) -> anyhow::Result<Value> {
            Ok(args)
        }
    }

    #[test]
    fn lookups_by_kind() {
        let registry = ModuleRegistry::builder()
            .service("chat", Echo)
            .operator("llm", Echo)
            .build();
        assert!(registry.exists(ModuleKind::Service, "chat"));
        assert!(!registry.exists(ModuleKind::Service, "llm"));
        assert!(registry.resolve_service(ModuleKind::Operator, "llm").is_ok());
        assert!(matches!(
            registry.resolve_service(ModuleKind::Service, "missing"),
            Err(ModuleError::NotFound { .. })
        ));
        assert!(registry.resolve_cep("nope").is_err());
    }

    #[test]
    fn fsm_prefers_configured_name() {
        let def = |name: &str| FsmDefinition::builder(name).initial("start").build().unwrap();
        let registry = ModuleRegistry::builder()
            .fsm("TaskChat", def("default"))
            .fsm("custom", def("custom"))
            .build();
        let plain = Task::from_value(json!({"type": "TaskChat"})).unwrap();
        assert_eq!(registry.fsm_for(&plain).unwrap().name(), "default");
        let named = Task::from_value(json!({"type": "TaskChat", "config": {"fsm": {"name": "custom"}}})).unwrap();
        assert_eq!(registry.fsm_for(&named).unwrap().name(), "custom");
        assert!(registry.fsm_for(&Task::default()).is_none());
    }

    #[tokio::test]
    async fn bound_service_merges_configured_args() {
        let bound = BoundService {
            name: "chat".into(),
            config: ModuleConfig {
                args: Some(json!({"model": "a", "temperature": 0})),
                ..Default::default()
            },
            service: Arc::new(Echo),
        };
        let out = bound.call(&Task::default(), json!({"model": "b"})).await.unwrap();
        assert_eq!(out, json!({"model": "b", "temperature": 0}));
    }
}
