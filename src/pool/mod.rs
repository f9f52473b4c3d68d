//! Connection pooling
//!
//! Four pool variants, selected by [`ConnectionPool::new`] from the
//! configuration: a lock-free single-connection pool for single-threaded
//! use, a mutex/condvar bounded pool for threaded use, and sharded
//! wrappers of each keyed by [`ShardId`]. All variants share the same
//! `hold` surface: exclusive, time-bounded, reentrant checkout of a
//! connection for the duration of a block.

pub mod sharded;
pub mod single;
pub mod threaded;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::adapter::{Adapter, Connection};
use crate::config::{DatabaseConfig, ShardId};
use crate::context::ExecutionContext;
use crate::error::{Error, Result};

pub use sharded::{ShardedSingleConnectionPool, ShardedThreadedConnectionPool};
pub use single::SingleConnectionPool;
pub use threaded::ThreadedConnectionPool;

/// Handle to a checked-out connection.
///
/// Clonable so that reentrant `hold` calls from the owning context
/// observe the identical connection. Cross-context exclusivity is
/// enforced by the pool's allocation map; the internal mutex exists only
/// so nested holds on the owning context can interleave statements.
#[derive(Clone)]
pub struct PooledConn {
	inner: Arc<Mutex<Box<dyn Connection>>>,
}

impl PooledConn {
	fn new(conn: Box<dyn Connection>) -> Self {
		Self {
			inner: Arc::new(Mutex::new(conn)),
		}
	}

	/// Execute a statement on the underlying connection.
	pub fn execute(&self, sql: &str) -> Result<u64> {
		self.inner.lock().execute(sql)
	}

	/// Whether two handles refer to the same physical connection.
	pub fn same_connection(&self, other: &PooledConn) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	fn with_raw<R>(&self, f: impl FnOnce(&dyn Connection) -> R) -> R {
		f(self.inner.lock().as_ref())
	}

	fn try_unwrap(self) -> std::result::Result<Box<dyn Connection>, PooledConn> {
		Arc::try_unwrap(self.inner)
			.map(Mutex::into_inner)
			.map_err(|inner| PooledConn { inner })
	}
}

impl std::fmt::Debug for PooledConn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PooledConn").finish_non_exhaustive()
	}
}

/// Close a connection through the adapter, suppressing errors.
///
/// Disconnect failures are logged and never propagated.
pub(crate) fn close_connection(adapter: &dyn Adapter, shard: &ShardId, conn: PooledConn) {
	match conn.try_unwrap() {
		Ok(raw) => {
			if let Err(err) = adapter.disconnect(raw) {
				warn!(shard = %shard, error = %err, "error while closing connection");
			}
		}
		Err(_still_shared) => {
			// A block stashed a clone of the handle; dropping ours is all
			// we can do without racing the holder.
			warn!(shard = %shard, "connection handle still referenced at close");
		}
	}
}

/// A connection pool of the variant selected by the configuration.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use grappelli_db::config::DatabaseConfig;
/// use grappelli_db::context::ExecutionContext;
/// use grappelli_db::mock::MockAdapter;
/// use grappelli_db::pool::ConnectionPool;
///
/// let adapter = Arc::new(MockAdapter::new());
/// let pool = ConnectionPool::new(&DatabaseConfig::default(), adapter).unwrap();
/// let ctx = ExecutionContext::current();
/// let rows = pool.hold(ctx, None, |conn| conn.execute("SELECT 1")).unwrap();
/// assert_eq!(rows, 0);
/// assert_eq!(pool.size(None), 1);
/// ```
pub enum ConnectionPool {
	Single(SingleConnectionPool),
	Threaded(ThreadedConnectionPool),
	ShardedSingle(ShardedSingleConnectionPool),
	ShardedThreaded(ShardedThreadedConnectionPool),
}

impl ConnectionPool {
	/// Validate the configuration and build the matching pool variant:
	/// single vs. threaded by `single_threaded`, sharded when `servers`
	/// is non-empty.
	pub fn new(config: &DatabaseConfig, adapter: Arc<dyn Adapter>) -> Result<Self> {
		config.validate()?;
		let pool = match (config.single_threaded, config.sharded()) {
			(true, false) => {
				ConnectionPool::Single(SingleConnectionPool::new(adapter, ShardId::default_shard()))
			}
			(false, false) => ConnectionPool::Threaded(ThreadedConnectionPool::new(
				adapter,
				ShardId::default_shard(),
				config.max_connections,
				config.pool_timeout,
			)),
			(true, true) => {
				ConnectionPool::ShardedSingle(ShardedSingleConnectionPool::new(config, adapter))
			}
			(false, true) => {
				ConnectionPool::ShardedThreaded(ShardedThreadedConnectionPool::new(config, adapter))
			}
		};
		Ok(pool)
	}

	/// Check out a connection for `shard` (default shard when `None`) and
	/// run `f` with it. Reentrant for the same `(context, shard)`.
	pub fn hold<T>(
		&self,
		ctx: ExecutionContext,
		shard: Option<&ShardId>,
		f: impl FnOnce(&PooledConn) -> Result<T>,
	) -> Result<T> {
		match self {
			ConnectionPool::Single(pool) => pool.hold(f),
			ConnectionPool::Threaded(pool) => pool.hold(ctx, f),
			ConnectionPool::ShardedSingle(pool) => pool.hold(shard, f),
			ConnectionPool::ShardedThreaded(pool) => pool.hold(ctx, shard, f),
		}
	}

	/// Register a shard at runtime ahead of its first hold. Errors on the
	/// unsharded variants.
	pub fn add_shard(&self, shard: ShardId) -> Result<()> {
		match self {
			ConnectionPool::Single(_) | ConnectionPool::Threaded(_) => {
				Err(Error::Config("pool is not sharded".into()))
			}
			ConnectionPool::ShardedSingle(pool) => {
				pool.add_shard(shard);
				Ok(())
			}
			ConnectionPool::ShardedThreaded(pool) => {
				pool.add_shard(shard);
				Ok(())
			}
		}
	}

	/// Drop a shard's sub-pool at runtime, closing its idle connections.
	/// The default shard cannot be removed; errors on the unsharded
	/// variants.
	pub fn remove_shard(&self, shard: &ShardId) -> Result<()> {
		match self {
			ConnectionPool::Single(_) | ConnectionPool::Threaded(_) => {
				Err(Error::Config("pool is not sharded".into()))
			}
			ConnectionPool::ShardedSingle(pool) => pool.remove_shard(shard),
			ConnectionPool::ShardedThreaded(pool) => pool.remove_shard(shard),
		}
	}

	/// Whether this is one of the sharded variants.
	pub fn is_sharded(&self) -> bool {
		matches!(
			self,
			ConnectionPool::ShardedSingle(_) | ConnectionPool::ShardedThreaded(_)
		)
	}

	/// Known shard names; just the default shard on unsharded variants.
	pub fn shards(&self) -> Vec<ShardId> {
		match self {
			ConnectionPool::Single(_) | ConnectionPool::Threaded(_) => {
				vec![ShardId::default_shard()]
			}
			ConnectionPool::ShardedSingle(pool) => pool.shards(),
			ConnectionPool::ShardedThreaded(pool) => pool.shards(),
		}
	}

	/// Close idle connections for `shard`, or for every shard when
	/// `None`. Checked-out connections are flagged and closed when they
	/// are returned.
	pub fn disconnect(&self, shard: Option<&ShardId>) {
		match self {
			ConnectionPool::Single(pool) => pool.disconnect(),
			ConnectionPool::Threaded(pool) => pool.disconnect(),
			ConnectionPool::ShardedSingle(pool) => pool.disconnect(shard),
			ConnectionPool::ShardedThreaded(pool) => pool.disconnect(shard),
		}
	}

	/// Number of connections currently in existence for the shard.
	pub fn size(&self, shard: Option<&ShardId>) -> usize {
		match self {
			ConnectionPool::Single(pool) => pool.size(),
			ConnectionPool::Threaded(pool) => pool.size(),
			ConnectionPool::ShardedSingle(pool) => pool.size(shard),
			ConnectionPool::ShardedThreaded(pool) => pool.size(shard),
		}
	}

	/// Upper bound on connections per shard.
	pub fn max_size(&self) -> usize {
		match self {
			ConnectionPool::Single(_) | ConnectionPool::ShardedSingle(_) => 1,
			ConnectionPool::Threaded(pool) => pool.max_size(),
			ConnectionPool::ShardedThreaded(pool) => pool.max_size(),
		}
	}

	/// Number of idle connections available for checkout on the shard.
	pub fn available_connections(&self, shard: Option<&ShardId>) -> usize {
		match self {
			ConnectionPool::Single(pool) => pool.available_connections(),
			ConnectionPool::Threaded(pool) => pool.available_connections(),
			ConnectionPool::ShardedSingle(pool) => pool.available_connections(shard),
			ConnectionPool::ShardedThreaded(pool) => pool.available_connections(shard),
		}
	}

	/// Eagerly fill the pool(s) instead of connecting on first hold.
	pub fn preconnect(&self) -> Result<()> {
		match self {
			ConnectionPool::Single(pool) => pool.preconnect(),
			ConnectionPool::Threaded(pool) => pool.preconnect(),
			ConnectionPool::ShardedSingle(pool) => pool.preconnect(),
			ConnectionPool::ShardedThreaded(pool) => pool.preconnect(),
		}
	}
}
