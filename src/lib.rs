//! Taskflow sync: distributed task synchronization over WebSocket.
//!
//! One hub owns the committed copy of every task; processors and an optional
//! coprocessor exchange partial updates with it under per-instance locks.

pub mod cep;
pub mod config;
pub mod connections;
pub mod error;
pub mod fsm;
pub mod http;
pub mod modules;
pub mod router;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod task;
pub mod ws;
