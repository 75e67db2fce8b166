//! Persistence layer — backend-agnostic trait, libSQL implementation,
//! version-tracked migrations.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, EmailLogEntry};
