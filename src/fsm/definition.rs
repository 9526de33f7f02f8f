//! State machine definitions: a transition table plus named guards and
//! actions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::FsmError;
use crate::task::Task;

/// Prefix of the synthetic "jump to state" event.
pub const GOTO_PREFIX: &str = "GOTO";

pub type GuardFn = Arc<dyn Fn(&Task) -> bool + Send + Sync>;
pub type ActionFn = Arc<dyn Fn(&mut Task) -> anyhow::Result<()> + Send + Sync>;

/// Event that can drive a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FsmEvent {
    /// Explicit event sent by a task function or carried in `fsmEvent`.
    Named(String),
    /// Evaluated on every cycle; taken when its guard passes.
    Always,
    /// Force the current state without running any action.
    Goto(String),
}

impl FsmEvent {
    /// `GOTO<state>` parses to [`FsmEvent::Goto`], anything else is named.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(GOTO_PREFIX) {
            Some(state) if !state.is_empty() => Self::Goto(state.to_string()),
            _ => Self::Named(raw.to_string()),
        }
    }
}

impl fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Always => f.write_str("always"),
            Self::Goto(state) => write!(f, "{GOTO_PREFIX}{state}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: String,
    pub event: FsmEvent,
    pub to: String,
    pub guard: Option<String>,
    pub actions: Vec<String>,
}

/// Immutable machine for one task type.
pub struct FsmDefinition {
    name: String,
    initial: String,
    states: Vec<String>,
    transitions: Vec<Transition>,
    entry: HashMap<String, Vec<String>>,
    guards: HashMap<String, GuardFn>,
    actions: HashMap<String, ActionFn>,
}

impl fmt::Debug for FsmDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsmDefinition")
            .field("name", &self.name)
            .field("initial", &self.initial)
            .field("states", &self.states)
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

impl FsmDefinition {
    pub fn builder(name: impl Into<String>) -> FsmDefinitionBuilder {
        FsmDefinitionBuilder {
            name: name.into(),
            initial: None,
            states: Vec::new(),
            transitions: Vec::new(),
            entry: HashMap::new(),
            guards: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// A state with no outgoing transition.
    pub fn is_terminal(&self, state: &str) -> bool {
        !self.transitions.iter().any(|t| t.from == state)
    }

    pub fn check_state(&self, state: &str) -> Result<(), FsmError> {
        if self.has_state(state) {
            Ok(())
        } else {
            Err(FsmError::UnknownState {
                machine: self.name.clone(),
                state: state.to_string(),
            })
        }
    }

    fn guard_passes(&self, transition: &Transition, task: &Task) -> bool {
        match &transition.guard {
            None => true,
            Some(name) => self.guards.get(name).is_some_and(|g| g(task)),
        }
    }

    /// The transition `event` takes from `state`, if any guard allows one.
    pub fn select(&self, state: &str, event: &FsmEvent, task: &Task) -> Option<&Transition> {
        self.transitions
            .iter()
            .filter(|t| t.from == state && t.event == *event)
            .find(|t| self.guard_passes(t, task))
    }

    fn run(&self, names: &[String], task: &mut Task) -> Result<(), FsmError> {
        for name in names {
            let Some(action) = self.actions.get(name) else {
                tracing::debug!(machine = %self.name, action = %name, "No implementation for action");
                continue;
            };
            action(task).map_err(|e| FsmError::ActionFailed {
                machine: self.name.clone(),
                action: name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Run a transition's actions followed by the target's entry actions.
    pub fn run_transition(&self, transition: &Transition, task: &mut Task) -> Result<(), FsmError> {
        self.run(&transition.actions, task)?;
        self.run_entry(&transition.to, task)
    }

    pub fn run_entry(&self, state: &str, task: &mut Task) -> Result<(), FsmError> {
        match self.entry.get(state) {
            Some(names) => self.run(names, task),
            None => Ok(()),
        }
    }
}

/// Builder for [`FsmDefinition`]. `guard` and `action` apply to the most
/// recently added transition.
pub struct FsmDefinitionBuilder {
    name: String,
    initial: Option<String>,
    states: Vec<String>,
    transitions: Vec<Transition>,
    entry: HashMap<String, Vec<String>>,
    guards: HashMap<String, GuardFn>,
    actions: HashMap<String, ActionFn>,
}

impl FsmDefinitionBuilder {
    pub fn initial(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.add_state(&state);
        self.initial = Some(state);
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.add_state(&state.into());
        self
    }

    fn add_state(&mut self, state: &str) {
        if !self.states.iter().any(|s| s == state) {
            self.states.push(state.to_string());
        }
    }

    pub fn transition(
        mut self,
        from: impl Into<String>,
        event: FsmEvent,
        to: impl Into<String>,
    ) -> Self {
        self.transitions.push(Transition {
            from: from.into(),
            event,
            to: to.into(),
            guard: None,
            actions: Vec::new(),
        });
        self
    }

    /// Shorthand for a named-event transition.
    pub fn on(self, from: impl Into<String>, event: impl Into<String>, to: impl Into<String>) -> Self {
        self.transition(from, FsmEvent::Named(event.into()), to)
    }

    /// Shorthand for an eventless transition.
    pub fn always(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transition(from, FsmEvent::Always, to)
    }

    pub fn guard(mut self, name: impl Into<String>) -> Self {
        if let Some(t) = self.transitions.last_mut() {
            t.guard = Some(name.into());
        }
        self
    }

    pub fn action(mut self, name: impl Into<String>) -> Self {
        if let Some(t) = self.transitions.last_mut() {
            t.actions.push(name.into());
        }
        self
    }

    pub fn on_entry(mut self, state: impl Into<String>, action: impl Into<String>) -> Self {
        self.entry.entry(state.into()).or_default().push(action.into());
        self
    }

    pub fn guard_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.guards.insert(name.into(), Arc::new(f));
        self
    }

    pub fn action_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Task) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn build(mut self) -> Result<FsmDefinition, FsmError> {
        let initial = self.initial.take().ok_or_else(|| FsmError::NoInitialState {
            machine: self.name.clone(),
        })?;

        let endpoints: Vec<String> = self
            .transitions
            .iter()
            .flat_map(|t| [t.from.clone(), t.to.clone()])
            .chain(self.entry.keys().cloned())
            .collect();
        for state in endpoints {
            self.add_state(&state);
        }

        // Guards evaluated on another node have no local implementation.
        let missing: Vec<String> = self
            .transitions
            .iter()
            .filter_map(|t| t.guard.clone())
            .filter(|g| !self.guards.contains_key(g))
            .collect();
        for name in missing {
            tracing::debug!(machine = %self.name, guard = %name, "Synthesizing false guard");
            let never: GuardFn = Arc::new(|_: &Task| false);
            self.guards.insert(name, never);
        }

        Ok(FsmDefinition {
            name: self.name,
            initial,
            states: self.states,
            transitions: self.transitions,
            entry: self.entry,
            guards: self.guards,
            actions: self.actions,
        })
    }
}
