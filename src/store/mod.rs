//! Persistence layer: committed task documents and the active set.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlTaskStore;
pub use memory::MemoryTaskStore;
pub use traits::TaskStore;
