//! CEP subscription map: match key → ordered registrations.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;

use super::CepFunction;
use crate::error::CepError;
use crate::task::{ModuleConfig, Task};

/// Prefix marking a match key as a regular expression.
pub const REGEX_PREFIX: &str = "regex:";

/// One subscription.
#[derive(Clone)]
pub struct CepEntry {
    pub match_key: String,
    /// Owner instance, or the task id for system singletons.
    pub entry_id: String,
    pub owner_instance_id: String,
    pub name: String,
    pub args: Option<Value>,
    pub func: Arc<dyn CepFunction>,
}

impl std::fmt::Debug for CepEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CepEntry")
            .field("match_key", &self.match_key)
            .field("entry_id", &self.entry_id)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Default)]
struct Subscriptions {
    by_key: HashMap<String, Vec<CepEntry>>,
    /// Compiled patterns of every `regex:` key.
    patterns: Vec<(String, Regex)>,
}

/// Process-local CEP registry.
#[derive(Default)]
pub struct CepRegistry {
    inner: RwLock<Subscriptions>,
}

/// Full match key for a subscription declared by `task`.
///
/// Relative expressions are scoped to the owner's family. User and secret
/// keys are already global. A system task's regex is left unscoped.
pub fn match_key(task: &Task, expr: &str, is_regex: bool) -> String {
    let absolute = expr.starts_with("CEPSecret-") || expr.contains("-userId-");
    let mut key = if absolute || (task.is_system() && is_regex) {
        expr.to_string()
    } else {
        format!("{}-{}", task.family_id.as_deref().unwrap_or_default(), expr)
    };
    if is_regex {
        key.insert_str(0, REGEX_PREFIX);
    }
    key
}

impl CepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `func` on behalf of `task`. Returns false when the entry was
    /// already present (repeated `init` of the same owner).
    pub async fn register(
        &self,
        task: &Task,
        name: &str,
        config: &ModuleConfig,
        func: Arc<dyn CepFunction>,
    ) -> Result<bool, CepError> {
        let expr = config
            .match_expr
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| CepError::MissingMatch {
                name: name.to_string(),
            })?;
        let key = match_key(task, expr, config.is_regex);

        let compiled = if config.is_regex {
            let pattern = &key[REGEX_PREFIX.len()..];
            Some(Regex::new(pattern).map_err(|e| CepError::InvalidRegex {
                name: name.to_string(),
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?)
        } else {
            None
        };

        let owner = task.instance_id.clone().unwrap_or_default();
        let entry_id = if task.is_system() {
            task.id.clone().unwrap_or_else(|| owner.clone())
        } else {
            owner.clone()
        };

        let mut subs = self.inner.write().await;
        let entries = subs.by_key.entry(key.clone()).or_default();
        if entries.iter().any(|e| e.entry_id == entry_id) {
            tracing::debug!(key = %key, entry_id = %entry_id, "CEP already registered");
            return Ok(false);
        }
        entries.push(CepEntry {
            match_key: key.clone(),
            entry_id,
            owner_instance_id: owner,
            name: name.to_string(),
            args: config.args.clone(),
            func,
        });
        if let Some(regex) = compiled
            && !subs.patterns.iter().any(|(k, _)| *k == key)
        {
            subs.patterns.push((key.clone(), regex));
        }
        tracing::info!(key = %key, cep = %name, "Registered CEP");
        Ok(true)
    }

    /// Entries under `match_expr` itself plus every regex key matching it.
    pub async fn find(&self, match_expr: &str) -> Vec<CepEntry> {
        let subs = self.inner.read().await;
        let mut found: Vec<CepEntry> = subs
            .by_key
            .get(match_expr)
            .cloned()
            .unwrap_or_default();
        for (key, regex) in &subs.patterns {
            if regex.is_match(match_expr)
                && let Some(entries) = subs.by_key.get(key)
            {
                found.extend(entries.iter().cloned());
            }
        }
        found
    }

    /// Drop every subscription owned by `instance_id`.
    pub async fn remove_owner(&self, instance_id: &str) -> usize {
        let mut subs = self.inner.write().await;
        let mut removed = 0;
        subs.by_key.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.owner_instance_id != instance_id);
            removed += before - entries.len();
            !entries.is_empty()
        });
        let Subscriptions { by_key, patterns } = &mut *subs;
        patterns.retain(|(k, _)| by_key.contains_key(k));
        removed
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_key.is_empty()
    }

    /// Number of match keys.
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_key.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cep::CepContext;
    use async_trait::async_trait;
    use serde_json::json;

    pub(crate) struct Noop;

    #[async_trait]
    impl CepFunction for Noop {
        async fn call(&self, _ctx: CepContext, _task: &mut Task) -> anyhow::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn owner(id: &str, instance: &str, family: &str) -> Task {
        Task::from_value(json!({"id": id, "instanceId": instance, "familyId": family})).unwrap()
    }

    fn cfg(expr: &str, is_regex: bool) -> ModuleConfig {
        ModuleConfig {
            match_expr: Some(expr.to_string()),
            is_regex,
            ..Default::default()
        }
    }

    #[test]
    fn keys_are_family_scoped() {
        let t = owner("root.ui.chat", "i1", "fam1");
        assert_eq!(match_key(&t, "id-root.ui.chat", false), "fam1-id-root.ui.chat");
        assert_eq!(match_key(&t, "CEPSecret-xyz", false), "CEPSecret-xyz");
        assert_eq!(match_key(&t, "u1-userId-root.x", false), "u1-userId-root.x");
        assert_eq!(match_key(&t, "id-.*", true), "regex:fam1-id-.*");
        let sys = owner("root.system.log", "s1", "sys");
        assert_eq!(match_key(&sys, "^root\\.system\\..*", true), "regex:^root\\.system\\..*");
    }

    #[tokio::test]
    async fn duplicate_owner_is_not_added_twice() {
        let reg = CepRegistry::new();
        let t = owner("root.ui.chat", "i1", "fam1");
        let f: Arc<dyn CepFunction> = Arc::new(Noop);
        assert!(reg.register(&t, "CEPLog", &cfg("familyId", false), f.clone()).await.unwrap());
        assert!(!reg.register(&t, "CEPLog", &cfg("familyId", false), f).await.unwrap());
        assert_eq!(reg.find("fam1-familyId").await.len(), 1);
    }

    #[tokio::test]
    async fn system_tasks_register_once_per_id() {
        let reg = CepRegistry::new();
        let f: Arc<dyn CepFunction> = Arc::new(Noop);
        let first = owner("root.system.log", "s1", "sys");
        let again = owner("root.system.log", "s2", "sys");
        let config = cfg("^root\\.system\\..*", true);
        assert!(reg.register(&first, "CEPSystemLogger", &config, f.clone()).await.unwrap());
        assert!(!reg.register(&again, "CEPSystemLogger", &config, f).await.unwrap());
    }

    #[tokio::test]
    async fn missing_match_and_bad_regex_are_errors() {
        let reg = CepRegistry::new();
        let t = owner("root.ui.chat", "i1", "fam1");
        let f: Arc<dyn CepFunction> = Arc::new(Noop);
        assert!(matches!(
            reg.register(&t, "x", &ModuleConfig::default(), f.clone()).await,
            Err(CepError::MissingMatch { .. })
        ));
        assert!(matches!(
            reg.register(&t, "x", &cfg("([", true), f).await,
            Err(CepError::InvalidRegex { .. })
        ));
    }

    #[tokio::test]
    async fn regex_keys_match_expressions() {
        let reg = CepRegistry::new();
        let sys = owner("root.system.log", "s1", "sys");
        reg.register(&sys, "CEPSystemLogger", &cfg("^root\\.system\\..*", true), Arc::new(Noop))
            .await
            .unwrap();
        assert_eq!(reg.find("root.system.config").await.len(), 1);
        assert!(reg.find("root.ui.foo").await.is_empty());
    }

    #[tokio::test]
    async fn removing_owner_clears_keys() {
        let reg = CepRegistry::new();
        let t = owner("root.ui.chat", "i1", "fam1");
        reg.register(&t, "a", &cfg("familyId", false), Arc::new(Noop)).await.unwrap();
        reg.register(&t, "b", &cfg("id-.*", true), Arc::new(Noop)).await.unwrap();
        assert_eq!(reg.remove_owner("i1").await, 2);
        assert!(reg.is_empty().await);
        assert!(reg.find("fam1-id-x").await.is_empty());
    }
}
