//! Command routing for the hub and for processor / coprocessor nodes.

pub mod hub;
pub mod init;
pub mod node;
pub mod outbound;

pub use hub::{HubRouter, HubSession};
pub use node::NodeRouter;
pub use outbound::Outbound;

/// What the transport loop should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// Liveness reply from the hub.
    Pong,
    /// The hub asked this process to restart.
    Reload,
}
