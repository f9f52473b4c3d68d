//! Sharded pool variants
//!
//! A map of shard name to sub-pool. Sub-pools are created lazily for
//! unknown shard names and can be added or removed at runtime without
//! any lock spanning other shards' sub-pools: in-flight holds keep their
//! sub-pool alive through an `Arc`, so removal never disturbs them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::adapter::Adapter;
use crate::config::{DatabaseConfig, ShardId};
use crate::context::ExecutionContext;
use crate::error::{Error, Result};

use super::{PooledConn, SingleConnectionPool, ThreadedConnectionPool};

/// Shard map over [`ThreadedConnectionPool`]s.
///
/// Each shard gets its own bounded sub-pool, so `max_connections` is a
/// per-shard limit and exhaustion of one shard never blocks holds on
/// another.
pub struct ShardedThreadedConnectionPool {
	adapter: Arc<dyn Adapter>,
	max_connections: usize,
	timeout: Duration,
	pools: DashMap<ShardId, Arc<ThreadedConnectionPool>>,
}

impl ShardedThreadedConnectionPool {
	pub fn new(config: &DatabaseConfig, adapter: Arc<dyn Adapter>) -> Self {
		let pool = Self {
			adapter,
			max_connections: config.max_connections,
			timeout: config.pool_timeout,
			pools: DashMap::new(),
		};
		for shard in config.shard_ids() {
			pool.sub_pool(&shard);
		}
		pool
	}

	fn sub_pool(&self, shard: &ShardId) -> Arc<ThreadedConnectionPool> {
		self.pools
			.entry(shard.clone())
			.or_insert_with(|| {
				debug!(shard = %shard, "creating sub-pool");
				Arc::new(ThreadedConnectionPool::new(
					self.adapter.clone(),
					shard.clone(),
					self.max_connections,
					self.timeout,
				))
			})
			.clone()
	}

	pub fn hold<T>(
		&self,
		ctx: ExecutionContext,
		shard: Option<&ShardId>,
		f: impl FnOnce(&PooledConn) -> Result<T>,
	) -> Result<T> {
		let shard = shard.cloned().unwrap_or_default();
		self.sub_pool(&shard).hold(ctx, f)
	}

	/// Register a shard ahead of its first hold.
	pub fn add_shard(&self, shard: ShardId) {
		self.sub_pool(&shard);
	}

	/// Drop a shard's sub-pool, closing its idle connections. The default
	/// shard cannot be removed. Holds already in flight on the shard keep
	/// the sub-pool alive until they finish.
	pub fn remove_shard(&self, shard: &ShardId) -> Result<()> {
		if shard.is_default() {
			return Err(Error::Config("cannot remove the default shard".into()));
		}
		if let Some((_, pool)) = self.pools.remove(shard) {
			pool.disconnect();
		}
		Ok(())
	}

	pub fn shards(&self) -> Vec<ShardId> {
		self.pools.iter().map(|entry| entry.key().clone()).collect()
	}

	pub fn disconnect(&self, shard: Option<&ShardId>) {
		match shard {
			Some(shard) => {
				if let Some(pool) = self.pools.get(shard) {
					pool.disconnect();
				}
			}
			None => {
				for entry in self.pools.iter() {
					entry.value().disconnect();
				}
			}
		}
	}

	pub fn size(&self, shard: Option<&ShardId>) -> usize {
		let shard = shard.cloned().unwrap_or_default();
		self.pools.get(&shard).map_or(0, |pool| pool.size())
	}

	pub fn max_size(&self) -> usize {
		self.max_connections
	}

	pub fn available_connections(&self, shard: Option<&ShardId>) -> usize {
		let shard = shard.cloned().unwrap_or_default();
		self.pools
			.get(&shard)
			.map_or(0, |pool| pool.available_connections())
	}

	pub fn preconnect(&self) -> Result<()> {
		for entry in self.pools.iter() {
			entry.value().preconnect()?;
		}
		Ok(())
	}
}

/// Shard map over [`SingleConnectionPool`]s, for single-threaded mode.
pub struct ShardedSingleConnectionPool {
	adapter: Arc<dyn Adapter>,
	pools: DashMap<ShardId, Arc<SingleConnectionPool>>,
}

impl ShardedSingleConnectionPool {
	pub fn new(config: &DatabaseConfig, adapter: Arc<dyn Adapter>) -> Self {
		let pool = Self {
			adapter,
			pools: DashMap::new(),
		};
		for shard in config.shard_ids() {
			pool.sub_pool(&shard);
		}
		pool
	}

	fn sub_pool(&self, shard: &ShardId) -> Arc<SingleConnectionPool> {
		self.pools
			.entry(shard.clone())
			.or_insert_with(|| {
				Arc::new(SingleConnectionPool::new(self.adapter.clone(), shard.clone()))
			})
			.clone()
	}

	pub fn hold<T>(
		&self,
		shard: Option<&ShardId>,
		f: impl FnOnce(&PooledConn) -> Result<T>,
	) -> Result<T> {
		let shard = shard.cloned().unwrap_or_default();
		self.sub_pool(&shard).hold(f)
	}

	pub fn add_shard(&self, shard: ShardId) {
		self.sub_pool(&shard);
	}

	pub fn remove_shard(&self, shard: &ShardId) -> Result<()> {
		if shard.is_default() {
			return Err(Error::Config("cannot remove the default shard".into()));
		}
		if let Some((_, pool)) = self.pools.remove(shard) {
			pool.disconnect();
		}
		Ok(())
	}

	pub fn shards(&self) -> Vec<ShardId> {
		self.pools.iter().map(|entry| entry.key().clone()).collect()
	}

	pub fn disconnect(&self, shard: Option<&ShardId>) {
		match shard {
			Some(shard) => {
				if let Some(pool) = self.pools.get(shard) {
					pool.disconnect();
				}
			}
			None => {
				for entry in self.pools.iter() {
					entry.value().disconnect();
				}
			}
		}
	}

	pub fn size(&self, shard: Option<&ShardId>) -> usize {
		let shard = shard.cloned().unwrap_or_default();
		self.pools.get(&shard).map_or(0, |pool| pool.size())
	}

	pub fn available_connections(&self, shard: Option<&ShardId>) -> usize {
		self.size(shard)
	}

	pub fn preconnect(&self) -> Result<()> {
		for entry in self.pools.iter() {
			entry.value().preconnect()?;
		}
		Ok(())
	}
}
