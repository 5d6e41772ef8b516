//! Persistence layer: durable (libSQL) and ephemeral (in-memory) settings
//! storage behind one `Database` trait.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryBackend;
pub use traits::Database;
