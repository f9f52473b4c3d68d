//! Database and pool configuration

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the shard every database has, whether sharded or not.
pub const DEFAULT_SHARD: &str = "default";

/// A named logical database partition with its own sub-pool.
///
/// Cheap to clone and hash; used as the key of the sharded pools' maps
/// and of the transaction registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(Arc<str>);

impl ShardId {
	pub fn new(name: impl AsRef<str>) -> Self {
		ShardId(Arc::from(name.as_ref()))
	}

	/// The always-present default shard.
	pub fn default_shard() -> Self {
		ShardId(Arc::from(DEFAULT_SHARD))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn is_default(&self) -> bool {
		&*self.0 == DEFAULT_SHARD
	}
}

impl Default for ShardId {
	fn default() -> Self {
		Self::default_shard()
	}
}

impl fmt::Display for ShardId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for ShardId {
	fn from(name: &str) -> Self {
		ShardId::new(name)
	}
}

/// Connect options for one shard, handed to the adapter when it opens
/// connections for that shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
	/// Connection URL override for this shard, if any.
	pub url: Option<String>,
	/// Free-form adapter options.
	#[serde(default)]
	pub options: HashMap<String, String>,
}

impl ServerConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_url(mut self, url: impl Into<String>) -> Self {
		self.url = Some(url.into());
		self
	}

	pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.options.insert(key.into(), value.into());
		self
	}
}

/// Top-level configuration for a [`Database`](crate::database::Database).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use grappelli_db::config::DatabaseConfig;
///
/// let config = DatabaseConfig::new()
/// 	.with_max_connections(8)
/// 	.with_pool_timeout(Duration::from_secs(2));
/// assert_eq!(config.max_connections, 8);
/// config.validate().unwrap();
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
	/// Maximum connections per shard.
	pub max_connections: usize,
	/// How long `hold` may block waiting for a connection.
	pub pool_timeout: Duration,
	/// Shard name to connect options. Non-empty selects the sharded pools.
	pub servers: HashMap<String, ServerConfig>,
	/// Use the lock-free single-connection pool.
	pub single_threaded: bool,
	/// Eagerly fill pools at open time instead of connecting lazily.
	pub preconnect: bool,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		Self {
			max_connections: 4,
			pool_timeout: Duration::from_secs(5),
			servers: HashMap::new(),
			single_threaded: false,
			preconnect: false,
		}
	}
}

impl DatabaseConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_max_connections(mut self, max: usize) -> Self {
		self.max_connections = max;
		self
	}

	pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
		self.pool_timeout = timeout;
		self
	}

	pub fn with_server(mut self, shard: impl Into<String>, server: ServerConfig) -> Self {
		self.servers.insert(shard.into(), server);
		self
	}

	pub fn with_single_threaded(mut self, single_threaded: bool) -> Self {
		self.single_threaded = single_threaded;
		self
	}

	pub fn with_preconnect(mut self, preconnect: bool) -> Self {
		self.preconnect = preconnect;
		self
	}

	/// Whether the sharded pool variants should be selected.
	pub fn sharded(&self) -> bool {
		!self.servers.is_empty()
	}

	/// The configured shard names, always including the default shard.
	pub fn shard_ids(&self) -> Vec<ShardId> {
		let mut ids = vec![ShardId::default_shard()];
		for name in self.servers.keys() {
			if name != DEFAULT_SHARD {
				ids.push(ShardId::new(name));
			}
		}
		ids
	}

	pub fn validate(&self) -> Result<()> {
		if self.max_connections == 0 {
			return Err(Error::Config("max_connections must be >= 1".into()));
		}
		if self.pool_timeout == Duration::ZERO {
			return Err(Error::Config("pool_timeout must be non-zero".into()));
		}
		Ok(())
	}
}
