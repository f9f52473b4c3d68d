//! Single-connection pool for single-threaded mode

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::adapter::Adapter;
use crate::config::ShardId;
use crate::error::{Error, Result};

use super::{PooledConn, close_connection};

/// One lazily-created connection, no checkout bookkeeping.
///
/// Selected by `single_threaded` mode. The mutex around the slot is
/// plain interior mutability; there is no waiting and no allocation map.
pub struct SingleConnectionPool {
	adapter: Arc<dyn Adapter>,
	shard: ShardId,
	conn: Mutex<Option<PooledConn>>,
}

impl SingleConnectionPool {
	pub fn new(adapter: Arc<dyn Adapter>, shard: ShardId) -> Self {
		Self {
			adapter,
			shard,
			conn: Mutex::new(None),
		}
	}

	/// Run `f` with the pool's connection, creating it on first use.
	///
	/// Two sequential holds observe the identical connection. An error
	/// classified as connection-poisoning drops the connection so the
	/// next hold creates a fresh one.
	pub fn hold<T>(&self, f: impl FnOnce(&PooledConn) -> Result<T>) -> Result<T> {
		let conn = self.checkout()?;
		let result = f(&conn);
		if let Err(err) = &result
			&& conn.with_raw(|raw| self.adapter.is_disconnect_error(err, raw))
		{
			self.conn.lock().take();
			close_connection(self.adapter.as_ref(), &self.shard, conn);
		}
		result
	}

	fn checkout(&self) -> Result<PooledConn> {
		let mut slot = self.conn.lock();
		if let Some(conn) = slot.as_ref() {
			return Ok(conn.clone());
		}
		let conn = match self.adapter.connect(&self.shard) {
			Ok(raw) => PooledConn::new(raw),
			Err(err @ Error::ConnectionFailed { .. }) => return Err(err),
			Err(err) => return Err(Error::ConnectionFailed { source: Box::new(err) }),
		};
		debug!(shard = %self.shard, "connection established");
		*slot = Some(conn.clone());
		Ok(conn)
	}

	/// Close the connection, if present.
	pub fn disconnect(&self) {
		if let Some(conn) = self.conn.lock().take() {
			debug!(shard = %self.shard, "disconnecting");
			close_connection(self.adapter.as_ref(), &self.shard, conn);
		}
	}

	pub fn size(&self) -> usize {
		usize::from(self.conn.lock().is_some())
	}

	pub fn available_connections(&self) -> usize {
		self.size()
	}

	pub fn preconnect(&self) -> Result<()> {
		self.checkout().map(drop)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mock::MockAdapter;

	fn pool(adapter: &Arc<MockAdapter>) -> SingleConnectionPool {
		SingleConnectionPool::new(adapter.clone(), ShardId::default_shard())
	}

	#[test]
	fn test_sequential_holds_reuse_connection() {
		let adapter = Arc::new(MockAdapter::new());
		let pool = pool(&adapter);

		let first = pool.hold(|conn| Ok(conn.clone())).unwrap();
		let second = pool.hold(|conn| Ok(conn.clone())).unwrap();

		assert!(first.same_connection(&second));
		assert_eq!(adapter.connect_count(), 1);
	}

	#[test]
	fn test_lazy_creation() {
		let adapter = Arc::new(MockAdapter::new());
		let pool = pool(&adapter);
		assert_eq!(pool.size(), 0);
		pool.hold(|_conn| Ok(())).unwrap();
		assert_eq!(pool.size(), 1);
	}

	#[test]
	fn test_connect_error_is_wrapped() {
		let adapter = Arc::new(MockAdapter::new());
		adapter.set_connect_error(Some("mau"));
		let pool = pool(&adapter);

		let err = pool.hold(|_conn| Ok(())).unwrap_err();
		assert!(matches!(err, Error::ConnectionFailed { .. }));
		assert!(err.original_error().unwrap().to_string().contains("mau"));
	}

	#[test]
	fn test_block_error_propagates_unwrapped() {
		let adapter = Arc::new(MockAdapter::new());
		let pool = pool(&adapter);

		let err = pool
			.hold(|_conn| Err::<(), _>(Error::database("mau")))
			.unwrap_err();
		assert_eq!(err.original_error().unwrap().to_string(), "mau");
		// The connection survives a non-poisoning error.
		assert_eq!(pool.size(), 1);
	}

	#[test]
	fn test_poisoning_error_drops_connection() {
		let adapter = Arc::new(MockAdapter::new().with_poison_marker("gone away"));
		let pool = SingleConnectionPool::new(adapter.clone(), ShardId::default_shard());

		let err = pool
			.hold(|_conn| Err::<(), _>(Error::database("server has gone away")))
			.unwrap_err();
		assert!(!err.is_rollback());
		assert_eq!(pool.size(), 0);
		assert_eq!(adapter.disconnect_count(), 1);

		pool.hold(|_conn| Ok(())).unwrap();
		assert_eq!(adapter.connect_count(), 2);
	}

	#[test]
	fn test_disconnect_clears_connection() {
		let adapter = Arc::new(MockAdapter::new());
		let pool = pool(&adapter);
		pool.hold(|_conn| Ok(())).unwrap();
		pool.disconnect();
		assert_eq!(pool.size(), 0);
		assert_eq!(adapter.disconnect_count(), 1);
	}
}
