//! Finite state machines bound to task types.

pub mod definition;
pub mod driver;

pub use definition::{ActionFn, FsmDefinition, FsmDefinitionBuilder, FsmEvent, GuardFn, Transition};
pub use driver::{FsmDriver, StepOutcome};
