//! SQLite persistence for cadence.
//!
//! Provides the connection pool, the embedded schema migrations and
//! [`SqliteStore`], which implements every repository port of
//! `cadence-agent`. Each table has a module of synchronous query functions
//! over a `rusqlite::Connection`; the store runs them on the blocking pool.

mod columns;
pub mod conversations;
mod error;
pub mod memories;
pub mod messages;
mod migrations;
mod pool;
pub mod sentences;
mod store;
pub mod tool_uses;

pub use error::DbError;
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
pub use store::{OpenError, SqliteStore};
