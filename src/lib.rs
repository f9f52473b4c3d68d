//! # Grappelli Database
//!
//! Connection pooling and transaction coordination for database
//! adapters.
//!
//! This crate provides:
//! - **Connection Pooling**: Bounded per-shard pools with blocking
//!   checkout, reentrant holds and deferred disconnects (`pool` module)
//! - **Sharding**: Named shards, each with its own sub-pool, added and
//!   removed at runtime (`pool::sharded`)
//! - **Transactions**: Depth tracking per execution context, savepoint
//!   nesting, commit/rollback hooks and a rollback sentinel carried
//!   through `Result` (`transaction`, `database` modules)
//! - **Adapters**: A small trait boundary for drivers plus a
//!   scheme-keyed registry for URL dispatch (`adapter` module)
//! - **Background Worker**: A FIFO job thread, optionally wrapping each
//!   job in a transaction (`worker` module)
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use grappelli_db::prelude::*;
//!
//! let adapter = Arc::new(MockAdapter::new());
//! let db = Database::new(DatabaseConfig::new().with_max_connections(8), adapter)?;
//!
//! let name = db.transaction(TransactionOptions::new(), |conn| {
//! 	conn.execute("INSERT INTO artists (name) VALUES ('Django')")?;
//! 	Ok("Django")
//! })?;
//! assert_eq!(name, Some("Django"));
//! # Ok::<(), grappelli_db::Error>(())
//! ```
//!
//! Blocks request a rollback by returning [`Error::Rollback`]; the
//! transaction boundary absorbs it and reports `Ok(None)` instead of an
//! error.

pub mod adapter;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod mock;
pub mod pool;
pub mod transaction;
pub mod worker;

/// Common imports
pub mod prelude {
	pub use crate::adapter::{Adapter, AdapterRegistry, Connection};
	pub use crate::config::{DatabaseConfig, ServerConfig, ShardId};
	pub use crate::context::ExecutionContext;
	pub use crate::database::Database;
	pub use crate::error::{Error, Result};
	pub use crate::mock::MockAdapter;
	pub use crate::pool::{ConnectionPool, PooledConn};
	pub use crate::transaction::TransactionOptions;
	pub use crate::worker::Worker;
}

pub use config::{DatabaseConfig, ShardId};
pub use database::Database;
pub use error::{Error, Result};
pub use pool::{ConnectionPool, PooledConn};
pub use transaction::TransactionOptions;
