//! WebSocket transport: the hub endpoint and the node client.

pub mod client;
pub mod server;

pub use client::NodeClient;
pub use server::{hub_routes, serve};
