//! Adapter boundary
//!
//! Wire-protocol adapters live outside this crate; they plug in through
//! the [`Adapter`] trait, which covers connection establishment and
//! teardown plus error classification. SQL generation is equally out of
//! scope: the transaction layer only ever sends fixed statements
//! (`BEGIN`, `COMMIT`, savepoint commands) through [`Connection::execute`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{DatabaseConfig, ShardId};
use crate::error::{Error, Result};

/// A physical database connection.
///
/// Owned by at most one execution context at a time; exclusivity is
/// enforced by the pool's allocation map, never by locking the
/// connection itself.
pub trait Connection: Send {
	/// Execute a statement, returning the affected row count.
	fn execute(&mut self, sql: &str) -> Result<u64>;
}

/// A factory and lifecycle handler for connections of one backend.
pub trait Adapter: Send + Sync {
	/// Open a connection for the given shard. Failures are wrapped by the
	/// pool as [`Error::ConnectionFailed`] if the adapter has not already
	/// done so.
	fn connect(&self, shard: &ShardId) -> Result<Box<dyn Connection>>;

	/// Close a connection. Errors returned here are logged and suppressed
	/// by the pool, never propagated.
	fn disconnect(&self, conn: Box<dyn Connection>) -> Result<()> {
		drop(conn);
		Ok(())
	}

	/// Classify an error raised inside a hold block as
	/// connection-poisoning. Poisoned connections are closed and their
	/// pool slot freed instead of being returned to idle.
	fn is_disconnect_error(&self, _err: &Error, _conn: &dyn Connection) -> bool {
		false
	}

	/// Whether the backend supports `SAVEPOINT`.
	fn supports_savepoints(&self) -> bool {
		true
	}
}

/// Constructor registered for one URL scheme.
pub type AdapterConstructor = Arc<dyn Fn(&DatabaseConfig) -> Result<Arc<dyn Adapter>> + Send + Sync>;

/// An owned scheme-to-constructor registry.
///
/// Populated at startup and consulted by
/// [`Database::open_url`](crate::database::Database::open_url); replaces
/// dynamic scheme-name dispatch with ordinary key lookup. Not global:
/// callers create and own their registry.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use grappelli_db::adapter::AdapterRegistry;
/// use grappelli_db::mock::MockAdapter;
///
/// let mut registry = AdapterRegistry::new();
/// registry.register("mock", |_config| Ok(Arc::new(MockAdapter::new()) as _));
/// assert!(registry.lookup("mock").is_some());
/// assert!(registry.lookup("postgres").is_none());
/// ```
#[derive(Default)]
pub struct AdapterRegistry {
	constructors: HashMap<String, AdapterConstructor>,
}

impl AdapterRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<F>(&mut self, scheme: impl Into<String>, constructor: F)
	where
		F: Fn(&DatabaseConfig) -> Result<Arc<dyn Adapter>> + Send + Sync + 'static,
	{
		self.constructors.insert(scheme.into(), Arc::new(constructor));
	}

	pub fn lookup(&self, scheme: &str) -> Option<&AdapterConstructor> {
		self.constructors.get(scheme)
	}

	/// Build an adapter for a `scheme://...` URL.
	pub fn build(&self, url: &str, config: &DatabaseConfig) -> Result<Arc<dyn Adapter>> {
		let scheme = url
			.split_once("://")
			.map(|(scheme, _)| scheme)
			.ok_or_else(|| Error::Config(format!("not a database URL: {url}")))?;
		let constructor = self
			.lookup(scheme)
			.ok_or_else(|| Error::UnknownScheme(scheme.to_string()))?;
		constructor(config)
	}
}
