//! Error taxonomy for the pool and transaction layer

use std::time::Duration;

use thiserror::Error;

use crate::config::ShardId;

pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by pools, transactions and the worker.
///
/// Adapter-level errors never cross this boundary bare: a failing
/// connect is wrapped as [`Error::ConnectionFailed`] and any foreign
/// error raised inside a hold block is expected to be wrapped via
/// [`Error::database`]. Crate errors pass through unwrapped, so callers
/// can always match on this enum.
#[derive(Debug, Error)]
pub enum Error {
	/// The adapter failed to establish a connection.
	#[error("failed to establish database connection: {source}")]
	ConnectionFailed {
		#[source]
		source: BoxError,
	},

	/// No connection became available within the pool timeout.
	#[error("no connection available on shard '{shard}' after {timeout:?}")]
	PoolTimeout { shard: ShardId, timeout: Duration },

	/// An error occurred while closing a connection. The pool only ever
	/// logs this; it is never returned across `hold`.
	#[error("error while closing connection: {0}")]
	Disconnect(String),

	/// A wrapped adapter or application error surfaced from inside a
	/// hold or transaction block.
	#[error("database error: {source}")]
	Database {
		#[source]
		source: BoxError,
	},

	/// Invalid pool or database configuration.
	#[error("invalid configuration: {0}")]
	Config(String),

	/// Control-flow sentinel requesting a transaction rollback. Absorbed
	/// at the nearest savepoint or outermost transaction boundary; never
	/// escapes [`Database::transaction`](crate::database::Database::transaction).
	#[error("transaction rollback requested")]
	Rollback,

	/// No adapter constructor registered for a URL scheme.
	#[error("no adapter registered for scheme '{0}'")]
	UnknownScheme(String),

	/// A job was added to a worker that is already shutting down.
	#[error("worker is shut down")]
	WorkerShutdown,
}

impl Error {
	/// Wrap a connect failure, preserving the original error as `source()`.
	///
	/// # Examples
	///
	/// ```
	/// use grappelli_db::error::Error;
	///
	/// let err = Error::connection_failed(std::io::Error::other("mau"));
	/// assert_eq!(err.original_error().unwrap().to_string(), "mau");
	/// ```
	pub fn connection_failed(source: impl Into<BoxError>) -> Self {
		Error::ConnectionFailed {
			source: source.into(),
		}
	}

	/// Wrap a foreign error raised inside a hold or transaction block.
	pub fn database(source: impl Into<BoxError>) -> Self {
		Error::Database {
			source: source.into(),
		}
	}

	/// The wrapped original error, if this error wraps one.
	pub fn original_error(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::ConnectionFailed { source } | Error::Database { source } => Some(source.as_ref()),
			_ => None,
		}
	}

	/// Whether this is the rollback control-flow sentinel.
	pub fn is_rollback(&self) -> bool {
		matches!(self, Error::Rollback)
	}
}
