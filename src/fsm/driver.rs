//! Per-instance single-step FSM driver.
//!
//! One call to [`FsmDriver::drive`] applies at most one transition. The
//! driver keeps the machine's notion of the current state per instance and
//! resynchronizes it with `task.state.current` before every step, so a state
//! written by another node is adopted without replaying its actions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::definition::{FsmDefinition, FsmEvent};
use crate::error::FsmError;
use crate::task::{Command, Task};

struct Interpreter {
    definition: Arc<FsmDefinition>,
    current: String,
}

/// What one drive step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub from: String,
    pub to: String,
    /// State was rewritten because the machine lagged the task.
    pub resynced: bool,
    /// The step was an explicit `GOTO` and needs no broadcast.
    pub via_goto: bool,
    /// The machine reached a state with no outgoing transition.
    pub terminal: bool,
}

impl StepOutcome {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Default)]
pub struct FsmDriver {
    instances: Mutex<HashMap<String, Interpreter>>,
}

impl FsmDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances with a live interpreter.
    pub async fn active(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn current_state(&self, instance_id: &str) -> Option<String> {
        self.instances
            .lock()
            .await
            .get(instance_id)
            .map(|i| i.current.clone())
    }

    pub async fn forget(&self, instance_id: &str) {
        self.instances.lock().await.remove(instance_id);
    }

    /// Resync, take at most one transition, write the result back to `task`.
    pub async fn drive(
        &self,
        definition: &Arc<FsmDefinition>,
        task: &mut Task,
        event: Option<FsmEvent>,
    ) -> Result<StepOutcome, FsmError> {
        let instance_id = task.instance_id.clone().unwrap_or_default();
        let task_state = task.current_state().map(str::to_string);
        let mut instances = self.instances.lock().await;

        let mut resynced = false;
        let interpreter = match instances.entry(instance_id.clone()) {
            std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                let seeded = match &task_state {
                    Some(state) => {
                        definition.check_state(state)?;
                        state.clone()
                    }
                    None => {
                        // Brand new task: enter the initial state for real.
                        definition.run_entry(definition.initial(), task)?;
                        definition.initial().to_string()
                    }
                };
                debug!(instance_id = %instance_id, machine = %definition.name(), state = %seeded, "Started FSM");
                slot.insert(Interpreter {
                    definition: Arc::clone(definition),
                    current: seeded,
                })
            }
        };
        if !Arc::ptr_eq(&interpreter.definition, definition) {
            interpreter.definition = Arc::clone(definition);
        }

        if let Some(state) = &task_state
            && *state != interpreter.current
        {
            definition.check_state(state)?;
            debug!(
                instance_id = %instance_id,
                machine_state = %interpreter.current,
                task_state = %state,
                "Resyncing FSM with GOTO"
            );
            interpreter.current = state.clone();
            resynced = true;
        }

        let from = interpreter.current.clone();
        let mut via_goto = false;

        match event {
            Some(FsmEvent::Goto(target)) => {
                definition.check_state(&target)?;
                interpreter.current = target;
                via_goto = true;
            }
            other => {
                let named = other.filter(|e| *e != FsmEvent::Always);
                let chosen = named
                    .as_ref()
                    .and_then(|e| definition.select(&from, e, task))
                    .or_else(|| definition.select(&from, &FsmEvent::Always, task))
                    .cloned();
                if let Some(transition) = chosen {
                    definition.run_transition(&transition, task)?;
                    interpreter.current = transition.to.clone();
                }
            }
        }

        let to = interpreter.current.clone();
        let terminal = definition.is_terminal(&to);
        if terminal {
            instances.remove(&instance_id);
        }
        drop(instances);

        if task.current_state() != Some(to.as_str()) {
            task.advance_state(to.clone());
            if !via_goto {
                task.command = Some(Command::Update);
            }
            info!(instance_id = %instance_id, from = %from, to = %to, "FSM transition");
        }

        Ok(StepOutcome {
            from,
            to,
            resynced,
            via_goto,
            terminal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn abc() -> Arc<FsmDefinition> {
        Arc::new(
            FsmDefinition::builder("abc")
                .initial("A")
                .always("A", "B")
                .always("B", "C")
                .build()
                .unwrap(),
        )
    }

    fn task_in(state: &str) -> Task {
        let mut task = Task::new("root.ui.TaskChat.start", "abc123");
        task.advance_state(state);
        task
    }

    #[tokio::test]
    async fn one_transition_per_cycle() {
        let driver = FsmDriver::new();
        let def = abc();
        let mut task = task_in("A");

        let step = driver.drive(&def, &mut task, None).await.unwrap();
        assert_eq!(step.to, "B");
        assert_eq!(task.current_state(), Some("B"));
        assert_eq!(task.command, Some(Command::Update));

        task.command = None;
        let step = driver.drive(&def, &mut task, None).await.unwrap();
        assert_eq!((step.from.as_str(), step.to.as_str()), ("B", "C"));
        assert_eq!(task.state.as_ref().unwrap().last.as_deref(), Some("B"));
        assert!(step.terminal);
        assert_eq!(driver.active().await, 0);
    }

    #[tokio::test]
    async fn external_state_write_is_adopted() {
        let driver = FsmDriver::new();
        let def = Arc::new(
            FsmDefinition::builder("m")
                .initial("A")
                .on("A", "next", "B")
                .on("B", "next", "C")
                .on("C", "next", "D")
                .build()
                .unwrap(),
        );
        let mut task = task_in("A");
        driver.drive(&def, &mut task, None).await.unwrap();
        assert_eq!(driver.current_state("abc123").await.as_deref(), Some("A"));

        // Another node moved the task on.
        task.advance_state("C");
        let step = driver
            .drive(&def, &mut task, Some(FsmEvent::Named("next".into())))
            .await
            .unwrap();
        assert!(step.resynced);
        assert_eq!(step.from, "C");
        assert_eq!(task.current_state(), Some("D"));
    }

    #[tokio::test]
    async fn goto_sets_state_without_actions_or_broadcast() {
        let entered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&entered);
        let def = Arc::new(
            FsmDefinition::builder("m")
                .initial("A")
                .on("A", "next", "B")
                .on("B", "next", "A")
                .on_entry("B", "countB")
                .action_fn("countB", move |_t: &mut Task| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let driver = FsmDriver::new();
        let mut task = task_in("A");
        let step = driver
            .drive(&def, &mut task, Some(FsmEvent::Goto("B".into())))
            .await
            .unwrap();
        assert!(step.via_goto);
        assert_eq!(task.current_state(), Some("B"));
        assert!(task.command.is_none());
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        driver
            .drive(&def, &mut task, Some(FsmEvent::Named("next".into())))
            .await
            .unwrap();
        assert_eq!(task.current_state(), Some("A"));
        task.command = None;
        driver
            .drive(&def, &mut task, Some(FsmEvent::Named("next".into())))
            .await
            .unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_state_is_rejected() {
        let driver = FsmDriver::new();
        let mut task = task_in("nowhere");
        let err = driver.drive(&abc(), &mut task, None).await.unwrap_err();
        assert!(matches!(err, FsmError::UnknownState { .. }));
    }

    #[tokio::test]
    async fn new_task_enters_initial_state() {
        let driver = FsmDriver::new();
        let mut task = Task::new("t", "fresh");
        let def = Arc::new(
            FsmDefinition::builder("m")
                .initial("init")
                .on("init", "go", "done")
                .build()
                .unwrap(),
        );
        let step = driver.drive(&def, &mut task, None).await.unwrap();
        assert!(!step.changed());
        assert_eq!(task.current_state(), Some("init"));
        assert!(task.command.is_some());
    }
}
