//! Candidate-key derivation and lookup for an inbound task.

use std::collections::HashSet;

use super::registry::{CepEntry, CepRegistry};
use crate::task::Task;

/// Literal keys a task can trigger, in firing order: instance, id, family,
/// user, secret.
pub fn candidate_keys(task: &Task) -> Vec<String> {
    let family = task.family_id.as_deref().unwrap_or_default();
    let id = task.id.as_deref().unwrap_or_default();
    let mut keys = Vec::with_capacity(5);
    if let Some(instance_id) = task.instance_id.as_deref() {
        keys.push(format!("{family}-instance-{instance_id}"));
    }
    keys.push(format!("{family}-id-{id}"));
    keys.push(format!("{family}-familyId"));
    if let Some(user_id) = task.user_id() {
        keys.push(format!("{user_id}-userId-{id}"));
    }
    if let Some(secret) = task.cep_secret() {
        keys.push(format!("CEPSecret-{secret}"));
    }
    keys
}

/// Resolves the callbacks an update should fire.
pub struct CepMatcher<'a> {
    registry: &'a CepRegistry,
}

impl<'a> CepMatcher<'a> {
    pub fn new(registry: &'a CepRegistry) -> Self {
        Self { registry }
    }

    /// Ordered, de-duplicated callbacks for `task`. A registration reachable
    /// through several keys fires once, at its first position.
    pub async fn matches(&self, task: &Task) -> Vec<CepEntry> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in candidate_keys(task) {
            for entry in self.registry.find(&key).await {
                if seen.insert((entry.entry_id.clone(), entry.name.clone())) {
                    out.push(entry);
                }
            }
        }
        if !out.is_empty() {
            tracing::debug!(
                instance_id = ?task.instance_id,
                count = out.len(),
                "CEP matches"
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cep::CepFunction;
    use crate::cep::registry::tests::{Noop, owner};
    use crate::task::ModuleConfig;
    use serde_json::json;
    use std::sync::Arc;

    fn cfg(expr: &str) -> ModuleConfig {
        ModuleConfig {
            match_expr: Some(expr.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn candidate_keys_cover_every_scope() {
        let task = Task::from_value(json!({
            "id": "root.ui.chat",
            "instanceId": "abc123",
            "familyId": "fam1",
            "user": {"id": "u1"},
            "config": {"local": {"CEPSecret": "xyz"}}
        }))
        .unwrap();
        assert_eq!(
            candidate_keys(&task),
            vec![
                "fam1-instance-abc123",
                "fam1-id-root.ui.chat",
                "fam1-familyId",
                "u1-userId-root.ui.chat",
                "CEPSecret-xyz",
            ]
        );
    }

    #[tokio::test]
    async fn every_scope_fires_exactly_once() {
        let reg = CepRegistry::new();
        let func: Arc<dyn CepFunction> = Arc::new(Noop);
        let watcher_a = owner("root.ui.a", "wa", "F");
        let watcher_b = owner("root.ui.b", "wb", "F");
        let watcher_c = owner("root.ui.c", "wc", "F");
        reg.register(&watcher_a, "onInstance", &cfg("instance-I"), func.clone()).await.unwrap();
        reg.register(&watcher_b, "onId", &cfg("id-D"), func.clone()).await.unwrap();
        reg.register(&watcher_c, "onFamily", &cfg("familyId"), func.clone()).await.unwrap();
        // Same registration reachable through a second key.
        reg.register(&watcher_a, "onInstance", &cfg("familyId"), func).await.unwrap();

        let task = Task::from_value(json!({"id": "D", "instanceId": "I", "familyId": "F"})).unwrap();
        let names: Vec<String> = CepMatcher::new(&reg)
            .matches(&task)
            .await
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["onInstance", "onId", "onFamily"]);
    }

    #[tokio::test]
    async fn secret_subscription_ignores_family() {
        let reg = CepRegistry::new();
        let watcher = owner("root.ui.monitor", "m1", "other-family");
        reg.register(&watcher, "onSecret", &cfg("CEPSecret-xyz"), Arc::new(Noop))
            .await
            .unwrap();
        let task = Task::from_value(json!({
            "id": "root.ui.chat",
            "instanceId": "abc123",
            "familyId": "fam1",
            "config": {"local": {"CEPSecret": "xyz"}}
        }))
        .unwrap();
        let found = CepMatcher::new(&reg).matches(&task).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner_instance_id, "m1");
    }

    #[tokio::test]
    async fn system_regex_matches_only_system_ids() {
        let reg = CepRegistry::new();
        let sys = owner("root.system.log", "s1", "sys");
        let config = ModuleConfig {
            match_expr: Some("-id-root\\.system\\.".into()),
            is_regex: true,
            ..Default::default()
        };
        reg.register(&sys, "CEPSystemLogger", &config, Arc::new(Noop)).await.unwrap();

        let hit = Task::from_value(json!({"id": "root.system.config", "instanceId": "x", "familyId": "f"})).unwrap();
        let miss = Task::from_value(json!({"id": "root.ui.foo", "instanceId": "y", "familyId": "f"})).unwrap();
        let matcher = CepMatcher::new(&reg);
        assert_eq!(matcher.matches(&hit).await.len(), 1);
        assert!(matcher.matches(&miss).await.is_empty());
    }
}
