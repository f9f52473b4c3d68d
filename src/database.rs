//! Database facade
//!
//! Ties a pool, an adapter and a transaction registry together and
//! resolves the caller's [`ExecutionContext`] once at this outer
//! binding, passing it down explicitly from there.

use std::sync::Arc;

use scopeguard::{ScopeGuard, guard};

use crate::adapter::{Adapter, AdapterRegistry};
use crate::config::{DatabaseConfig, ShardId};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::pool::{ConnectionPool, PooledConn};
use crate::transaction::{TransactionManager, TransactionOptions};

/// A database handle: configuration, adapter, pool and transactions.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use grappelli_db::config::DatabaseConfig;
/// use grappelli_db::database::Database;
/// use grappelli_db::mock::MockAdapter;
/// use grappelli_db::transaction::TransactionOptions;
///
/// let adapter = Arc::new(MockAdapter::new());
/// let db = Database::new(DatabaseConfig::default(), adapter.clone()).unwrap();
///
/// let inserted = db
/// 	.transaction(TransactionOptions::new(), |conn| {
/// 		conn.execute("INSERT INTO artists (name) VALUES ('Django')")
/// 	})
/// 	.unwrap();
/// assert_eq!(inserted, Some(0));
/// assert_eq!(
/// 	adapter.sql_log(),
/// 	vec!["BEGIN", "INSERT INTO artists (name) VALUES ('Django')", "COMMIT"],
/// );
/// ```
pub struct Database {
	config: DatabaseConfig,
	adapter: Arc<dyn Adapter>,
	pool: ConnectionPool,
	txn: TransactionManager,
}

impl Database {
	/// Build a database from a validated configuration and an adapter.
	/// Connects eagerly when `preconnect` is set.
	pub fn new(config: DatabaseConfig, adapter: Arc<dyn Adapter>) -> Result<Self> {
		let pool = ConnectionPool::new(&config, adapter.clone())?;
		let db = Self {
			config,
			adapter,
			pool,
			txn: TransactionManager::new(),
		};
		if db.config.preconnect {
			db.pool.preconnect()?;
		}
		Ok(db)
	}

	/// Build a database from a `scheme://...` URL, dispatching the
	/// adapter through the given registry.
	pub fn open_url(url: &str, registry: &AdapterRegistry, config: DatabaseConfig) -> Result<Self> {
		let adapter = registry.build(url, &config)?;
		Self::new(config, adapter)
	}

	pub fn config(&self) -> &DatabaseConfig {
		&self.config
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	/// Check out a connection on the default shard and run `f` with it.
	/// Reentrant: inside a transaction or an enclosing `synchronize`,
	/// `f` observes the already-held connection.
	pub fn synchronize<T>(&self, f: impl FnOnce(&PooledConn) -> Result<T>) -> Result<T> {
		self.synchronize_on(None, f)
	}

	/// [`synchronize`](Self::synchronize) on a specific shard.
	pub fn synchronize_on<T>(
		&self,
		shard: Option<&ShardId>,
		f: impl FnOnce(&PooledConn) -> Result<T>,
	) -> Result<T> {
		let shard = self.resolve_shard(shard);
		self.pool.hold(ExecutionContext::current(), Some(&shard), f)
	}

	/// An unsharded pool has exactly one set of connections, so a named
	/// shard there must collapse onto the default shard; otherwise the
	/// same physical connection would carry two transaction states.
	fn resolve_shard(&self, shard: Option<&ShardId>) -> ShardId {
		if self.pool.is_sharded() {
			shard.cloned().unwrap_or_default()
		} else {
			ShardId::default_shard()
		}
	}

	/// Run `f` inside a transaction.
	///
	/// Returns `Ok(Some(value))` when the block committed,
	/// `Ok(None)` when the block requested a rollback by returning
	/// [`Error::Rollback`](crate::error::Error::Rollback) (the sentinel
	/// never escapes this boundary), and `Err` after rolling back when
	/// the block failed with any other error.
	///
	/// Nested calls on the same context and shard reuse the open
	/// transaction and its connection. With `savepoint` set (and adapter
	/// support) the nested level becomes a savepoint with partial
	/// rollback; otherwise it is plain reentrant nesting and a rollback
	/// sentinel unwinds to the nearest real boundary.
	pub fn transaction<T>(
		&self,
		opts: TransactionOptions,
		f: impl FnOnce(&PooledConn) -> Result<T>,
	) -> Result<Option<T>> {
		let ctx = ExecutionContext::current();
		let shard = self.resolve_shard(opts.shard.as_ref());

		// Each path arms a guard before running `f` so that a panic in
		// the block unwinds the transaction state instead of leaking it.
		if !self.txn.in_transaction(ctx, &shard) {
			self.pool.hold(ctx, Some(&shard), |conn| {
				self.txn.begin(ctx, &shard, conn)?;
				let unwound = guard((), |()| self.txn.abort(ctx, &shard));
				let out = f(conn);
				ScopeGuard::into_inner(unwound);
				self.txn.finish(ctx, &shard, out)
			})
		} else if opts.savepoint && self.adapter.supports_savepoints() {
			self.pool.hold(ctx, Some(&shard), |conn| {
				self.txn.begin_savepoint(ctx, &shard)?;
				let unwound = guard((), |()| self.txn.abort_savepoint(ctx, &shard));
				let out = f(conn);
				ScopeGuard::into_inner(unwound);
				self.txn.finish_savepoint(ctx, &shard, out)
			})
		} else {
			self.pool.hold(ctx, Some(&shard), |conn| {
				self.txn.push_depth(ctx, &shard);
				let unwound = guard((), |()| self.txn.abort_depth(ctx, &shard));
				let out = f(conn);
				ScopeGuard::into_inner(unwound);
				self.txn.pop_depth(ctx, &shard, out)
			})
		}
	}

	/// Register a hook to run after the current transaction commits.
	/// Outside a transaction the hook runs immediately.
	pub fn after_commit(&self, hook: impl FnOnce() + Send + 'static) {
		self.after_commit_on(None, hook);
	}

	/// [`after_commit`](Self::after_commit) for a specific shard.
	pub fn after_commit_on(&self, shard: Option<&ShardId>, hook: impl FnOnce() + Send + 'static) {
		let ctx = ExecutionContext::current();
		let shard = self.resolve_shard(shard);
		if let Some(hook) = self.txn.add_after_commit(ctx, &shard, Box::new(hook)) {
			// No open transaction: the work is already "committed".
			hook();
		}
	}

	/// Register a hook to run after the current transaction rolls back.
	/// Outside a transaction the hook is dropped.
	pub fn after_rollback(&self, hook: impl FnOnce() + Send + 'static) {
		self.after_rollback_on(None, hook);
	}

	/// [`after_rollback`](Self::after_rollback) for a specific shard.
	pub fn after_rollback_on(&self, shard: Option<&ShardId>, hook: impl FnOnce() + Send + 'static) {
		let ctx = ExecutionContext::current();
		let shard = self.resolve_shard(shard);
		// With no transaction open there is nothing that can roll back.
		drop(self.txn.add_after_rollback(ctx, &shard, Box::new(hook)));
	}

	/// Whether the calling context is inside a transaction on the shard.
	pub fn in_transaction(&self, shard: Option<&ShardId>) -> bool {
		let shard = self.resolve_shard(shard);
		self.txn.in_transaction(ExecutionContext::current(), &shard)
	}

	/// Contexts currently inside a transaction. Diagnostic use.
	pub fn transactions(&self) -> Vec<ExecutionContext> {
		self.txn.active_contexts()
	}

	/// Close idle connections for the shard (all shards when `None`);
	/// checked-out connections are closed when returned.
	pub fn disconnect(&self, shard: Option<&ShardId>) {
		self.pool.disconnect(shard);
	}

	/// Register a shard at runtime. Errors when the pool is not sharded.
	pub fn add_shard(&self, shard: ShardId) -> Result<()> {
		self.pool.add_shard(shard)
	}

	/// Drop a shard at runtime. The default shard cannot be removed.
	pub fn remove_shard(&self, shard: &ShardId) -> Result<()> {
		self.pool.remove_shard(shard)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::Error;
	use crate::mock::MockAdapter;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn database(adapter: &Arc<MockAdapter>) -> Database {
		Database::new(DatabaseConfig::default(), adapter.clone()).unwrap()
	}

	#[test]
	fn test_commit_returns_value() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		let out = db
			.transaction(TransactionOptions::new(), |conn| conn.execute("INSERT 1"))
			.unwrap();
		assert_eq!(out, Some(0));
		assert_eq!(adapter.sql_log(), vec!["BEGIN", "INSERT 1", "COMMIT"]);
	}

	#[test]
	fn test_nested_transaction_issues_single_begin() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		db.transaction(TransactionOptions::new(), |outer| {
			outer.execute("INSERT 1")?;
			let inner = db
				.transaction(TransactionOptions::new(), |inner| {
					assert!(outer.same_connection(inner));
					inner.execute("INSERT 2")
				})?
				.unwrap();
			assert_eq!(inner, 0);
			Ok(())
		})
		.unwrap();

		assert_eq!(adapter.sql_log(), vec!["BEGIN", "INSERT 1", "INSERT 2", "COMMIT"]);
		assert_eq!(adapter.connect_count(), 1);
	}

	#[test]
	fn test_rollback_sentinel_reports_none() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		let out = db
			.transaction(TransactionOptions::new(), |conn| {
				conn.execute("INSERT 1")?;
				Err::<(), _>(Error::Rollback)
			})
			.unwrap();
		assert_eq!(out, None);
		assert_eq!(adapter.sql_log(), vec!["BEGIN", "INSERT 1", "ROLLBACK"]);
	}

	#[test]
	fn test_rollback_sentinel_unwinds_nested_levels() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		let out = db
			.transaction(TransactionOptions::new(), |_conn| {
				// A plain nested level has no boundary of its own; the
				// sentinel keeps going until the outermost transaction.
				db.transaction(TransactionOptions::new(), |_conn| {
					Err::<(), _>(Error::Rollback)
				})?;
				unreachable!("sentinel must propagate past this point")
			})
			.unwrap();
		assert_eq!(out, None::<()>);
		assert_eq!(adapter.sql_log(), vec!["BEGIN", "ROLLBACK"]);
	}

	#[test]
	fn test_block_error_rolls_back_and_propagates() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		let err = db
			.transaction(TransactionOptions::new(), |_conn| {
				Err::<(), _>(Error::database("mau"))
			})
			.unwrap_err();
		assert_eq!(err.original_error().unwrap().to_string(), "mau");
		assert_eq!(adapter.sql_log(), vec!["BEGIN", "ROLLBACK"]);
	}

	#[test]
	fn test_savepoint_commit_and_partial_rollback() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		db.transaction(TransactionOptions::new(), |conn| {
			conn.execute("INSERT 1")?;
			let rolled_back = db.transaction(
				TransactionOptions::new().with_savepoint(true),
				|conn| {
					conn.execute("INSERT 2")?;
					Err::<(), _>(Error::Rollback)
				},
			)?;
			assert_eq!(rolled_back, None);
			let kept = db.transaction(
				TransactionOptions::new().with_savepoint(true),
				|conn| conn.execute("INSERT 3"),
			)?;
			assert_eq!(kept, Some(0));
			Ok(())
		})
		.unwrap();

		assert_eq!(
			adapter.sql_log(),
			vec![
				"BEGIN",
				"INSERT 1",
				"SAVEPOINT sp_1",
				"INSERT 2",
				"ROLLBACK TO SAVEPOINT sp_1",
				"SAVEPOINT sp_1",
				"INSERT 3",
				"RELEASE SAVEPOINT sp_1",
				"COMMIT",
			],
		);
	}

	#[test]
	fn test_savepoint_falls_back_to_nesting_without_support() {
		let adapter = Arc::new(MockAdapter::new().with_savepoints(false));
		let db = Database::new(DatabaseConfig::default(), adapter.clone()).unwrap();

		db.transaction(TransactionOptions::new(), |_conn| {
			db.transaction(TransactionOptions::new().with_savepoint(true), |conn| {
				conn.execute("INSERT 1")
			})
		})
		.unwrap();
		assert_eq!(adapter.sql_log(), vec!["BEGIN", "INSERT 1", "COMMIT"]);
	}

	#[test]
	fn test_after_commit_hooks_run_once_committed() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);
		let fired = Arc::new(AtomicUsize::new(0));

		let hook_fired = fired.clone();
		db.transaction(TransactionOptions::new(), |_conn| {
			db.after_commit(move || {
				hook_fired.fetch_add(1, Ordering::SeqCst);
			});
			// Hooks wait for the COMMIT.
			assert_eq!(fired.load(Ordering::SeqCst), 0);
			Ok(())
		})
		.unwrap();
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_after_rollback_hooks_run_on_rollback_only() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);
		let commits = Arc::new(AtomicUsize::new(0));
		let rollbacks = Arc::new(AtomicUsize::new(0));

		let (c, r) = (commits.clone(), rollbacks.clone());
		db.transaction(TransactionOptions::new(), |_conn| {
			db.after_commit(move || {
				c.fetch_add(1, Ordering::SeqCst);
			});
			db.after_rollback(move || {
				r.fetch_add(1, Ordering::SeqCst);
			});
			Err::<(), _>(Error::Rollback)
		})
		.unwrap();
		assert_eq!(commits.load(Ordering::SeqCst), 0);
		assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_savepoint_hooks_merge_into_parent_on_release() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);
		let fired = Arc::new(AtomicUsize::new(0));

		let hook_fired = fired.clone();
		db.transaction(TransactionOptions::new(), |_conn| {
			db.transaction(TransactionOptions::new().with_savepoint(true), |_conn| {
				db.after_commit(move || {
					hook_fired.fetch_add(1, Ordering::SeqCst);
				});
				Ok(())
			})?;
			// Released, not committed yet.
			assert_eq!(fired.load(Ordering::SeqCst), 0);
			Ok(())
		})
		.unwrap();
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_after_commit_outside_transaction_runs_immediately() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);
		let fired = Arc::new(AtomicUsize::new(0));

		let hook_fired = fired.clone();
		db.after_commit(move || {
			hook_fired.fetch_add(1, Ordering::SeqCst);
		});
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_transactions_lists_active_context() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);
		assert!(db.transactions().is_empty());

		db.transaction(TransactionOptions::new(), |_conn| {
			assert!(db.in_transaction(None));
			assert_eq!(db.transactions(), vec![ExecutionContext::current()]);
			Ok(())
		})
		.unwrap();

		assert!(!db.in_transaction(None));
		assert!(db.transactions().is_empty());
	}

	#[test]
	fn test_shard_transactions_are_independent() {
		let adapter = Arc::new(MockAdapter::new());
		let config = DatabaseConfig::new().with_server("reporting", Default::default());
		let db = Database::new(config, adapter.clone()).unwrap();
		let reporting = ShardId::new("reporting");

		db.transaction(TransactionOptions::new(), |_conn| {
			assert!(!db.in_transaction(Some(&reporting)));
			db.transaction(
				TransactionOptions::new().on_shard(reporting.clone()),
				|conn| conn.execute("INSERT 1"),
			)?;
			assert!(!db.in_transaction(Some(&reporting)));
			Ok(())
		})
		.unwrap();

		// Both shards ran full BEGIN/COMMIT cycles.
		assert_eq!(adapter.sql_log(), vec!["BEGIN", "BEGIN", "INSERT 1", "COMMIT", "COMMIT"]);
	}

	#[test]
	fn test_panicking_block_rolls_back_and_destroys_state() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
			db.transaction(TransactionOptions::new(), |_conn| -> Result<()> {
				panic!("boom")
			})
		}));
		assert!(caught.is_err());

		// No dead transaction left behind, and the rollback was issued.
		assert!(db.transactions().is_empty());
		assert!(!db.in_transaction(None));
		assert_eq!(adapter.sql_log(), vec!["BEGIN", "ROLLBACK"]);

		// The next transaction starts from scratch: fresh connection,
		// real BEGIN.
		db.transaction(TransactionOptions::new(), |conn| conn.execute("INSERT 1"))
			.unwrap();
		assert_eq!(
			adapter.sql_log(),
			vec!["BEGIN", "ROLLBACK", "BEGIN", "INSERT 1", "COMMIT"],
		);
		assert_eq!(adapter.connect_count(), 2);
	}

	#[test]
	fn test_panicking_block_runs_rollback_hooks() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);
		let rollbacks = Arc::new(AtomicUsize::new(0));

		let r = rollbacks.clone();
		let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
			db.transaction(TransactionOptions::new(), |_conn| -> Result<()> {
				db.after_rollback(move || {
					r.fetch_add(1, Ordering::SeqCst);
				});
				panic!("boom")
			})
		}));
		assert!(caught.is_err());
		assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_panicking_savepoint_block_only_unwinds_its_level() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		db.transaction(TransactionOptions::new(), |conn| {
			let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
				db.transaction(
					TransactionOptions::new().with_savepoint(true),
					|_conn| -> Result<()> { panic!("boom") },
				)
			}));
			assert!(caught.is_err());
			// The enclosing transaction is intact and still usable.
			assert!(db.in_transaction(None));
			conn.execute("INSERT 1")
		})
		.unwrap();

		assert_eq!(
			adapter.sql_log(),
			vec![
				"BEGIN",
				"SAVEPOINT sp_1",
				"ROLLBACK TO SAVEPOINT sp_1",
				"INSERT 1",
				"COMMIT",
			],
		);
	}

	#[test]
	fn test_panicking_nested_block_restores_depth() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		db.transaction(TransactionOptions::new(), |conn| {
			let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
				db.transaction(TransactionOptions::new(), |_conn| -> Result<()> {
					panic!("boom")
				})
			}));
			assert!(caught.is_err());
			conn.execute("INSERT 1")
		})
		.unwrap();

		assert_eq!(adapter.sql_log(), vec!["BEGIN", "INSERT 1", "COMMIT"]);
		assert!(db.transactions().is_empty());
	}

	#[test]
	fn test_named_shard_on_unsharded_pool_joins_the_open_transaction() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		db.transaction(TransactionOptions::new(), |outer| {
			db.transaction(
				TransactionOptions::new().on_shard(ShardId::new("reporting")),
				|inner| {
					// One pool, one connection, one transaction.
					assert!(outer.same_connection(inner));
					inner.execute("INSERT 1")
				},
			)
		})
		.unwrap();

		assert_eq!(adapter.sql_log(), vec!["BEGIN", "INSERT 1", "COMMIT"]);
		assert_eq!(adapter.connect_count(), 1);
	}

	#[test]
	fn test_synchronize_reuses_transaction_connection() {
		let adapter = Arc::new(MockAdapter::new());
		let db = database(&adapter);

		db.transaction(TransactionOptions::new(), |txn_conn| {
			db.synchronize(|conn| {
				assert!(txn_conn.same_connection(conn));
				conn.execute("SELECT 1")
			})
		})
		.unwrap();
		assert_eq!(adapter.connect_count(), 1);
	}

	#[test]
	fn test_preconnect_fills_pool() {
		let adapter = Arc::new(MockAdapter::new());
		let config = DatabaseConfig::new()
			.with_max_connections(3)
			.with_preconnect(true);
		let db = Database::new(config, adapter.clone()).unwrap();

		assert_eq!(adapter.connect_count(), 3);
		assert_eq!(db.pool().available_connections(None), 3);
	}
}
