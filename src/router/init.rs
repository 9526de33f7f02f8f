//! `init` handling: bind a task's declared services, operators and CEPs to
//! this node's implementations.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cep::{CepFunction, CepRegistry};
use crate::error::{CepError, ModuleError};
use crate::modules::{AttachedModules, BoundService, ModuleKind, ModuleRegistry};
use crate::task::{ModuleConfig, Task};

/// A CEP declared by the task and found in the registry.
pub struct DeclaredCep {
    pub key: String,
    pub name: String,
    pub config: ModuleConfig,
    pub func: Arc<dyn CepFunction>,
}

/// Everything `init` resolved for one task.
pub struct Resolved {
    pub modules: AttachedModules,
    pub ceps: Vec<DeclaredCep>,
}

/// Whether `config` applies to `environment`. No allow-list is an error.
fn applies(
    kind: ModuleKind,
    key: &str,
    config: &ModuleConfig,
    task: &Task,
    environment: &str,
) -> Result<bool, ModuleError> {
    let Some(envs) = &config.environments else {
        return Err(ModuleError::NoEnvironments {
            kind: kind.as_str().to_string(),
            name: key.to_string(),
            task_id: task.id.clone().unwrap_or_default(),
        });
    };
    let ok = envs.iter().any(|e| e == environment);
    if !ok {
        debug!(kind = kind.as_str(), key = %key, environment = %environment, "Skipping module for other environment");
    }
    Ok(ok)
}

fn bind_services(
    registry: &ModuleRegistry,
    kind: ModuleKind,
    declared: Option<&BTreeMap<String, ModuleConfig>>,
    task: &Task,
    environment: &str,
) -> Result<BTreeMap<String, BoundService>, ModuleError> {
    let mut bound = BTreeMap::new();
    for (key, config) in declared.into_iter().flatten() {
        if !applies(kind, key, config, task, environment)? {
            continue;
        }
        let name = config.resolve_name(key).to_string();
        let service = registry.resolve_service(kind, &name)?;
        bound.insert(
            key.clone(),
            BoundService {
                name,
                config: config.clone(),
                service,
            },
        );
    }
    Ok(bound)
}

/// Resolve everything `task` declares for `environment`.
pub fn resolve(
    registry: &ModuleRegistry,
    task: &Task,
    environment: &str,
) -> Result<Resolved, ModuleError> {
    let services = bind_services(registry, ModuleKind::Service, task.services.as_ref(), task, environment)?;
    let operators = bind_services(registry, ModuleKind::Operator, task.operators.as_ref(), task, environment)?;

    let mut ceps = Vec::new();
    for (key, config) in task.ceps.iter().flatten() {
        if !applies(ModuleKind::Cep, key, config, task, environment)? {
            continue;
        }
        let name = config.resolve_name(key).to_string();
        let func = registry.resolve_cep(&name)?;
        ceps.push(DeclaredCep {
            key: key.clone(),
            name,
            config: config.clone(),
            func,
        });
    }

    Ok(Resolved {
        modules: AttachedModules {
            services,
            operators,
        },
        ceps,
    })
}

/// Subscribe the declared CEPs. Returns how many were newly added.
pub async fn register_ceps(
    registry: &CepRegistry,
    task: &Task,
    ceps: &[DeclaredCep],
) -> Result<usize, CepError> {
    let mut added = 0;
    for cep in ceps {
        if registry
            .register(task, &cep.name, &cep.config, Arc::clone(&cep.func))
            .await?
        {
            added += 1;
        }
    }
    if added > 0 {
        info!(instance_id = ?task.instance_id, added, "CEPs registered");
    }
    Ok(added)
}
