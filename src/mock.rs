//! Mock adapter
//!
//! An in-memory adapter that records every statement it receives. The
//! crate's own tests are written against it, and it doubles as a way for
//! applications to exercise pool and transaction behavior without a
//! database server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::adapter::{Adapter, Connection};
use crate::config::ShardId;
use crate::error::{Error, Result};

/// A [`Connection`] that appends executed SQL to a shared log.
pub struct MockConnection {
	id: usize,
	shard: ShardId,
	log: Arc<Mutex<Vec<String>>>,
	fail_execute_containing: Option<String>,
}

impl MockConnection {
	/// Sequential number of this connection within its adapter.
	pub fn id(&self) -> usize {
		self.id
	}

	pub fn shard(&self) -> &ShardId {
		&self.shard
	}
}

impl Connection for MockConnection {
	fn execute(&mut self, sql: &str) -> Result<u64> {
		if let Some(pattern) = &self.fail_execute_containing
			&& sql.contains(pattern.as_str())
		{
			return Err(Error::database(format!("mock execute failure: {sql}")));
		}
		self.log.lock().push(sql.to_string());
		Ok(0)
	}
}

/// An [`Adapter`] producing [`MockConnection`]s.
///
/// # Examples
///
/// ```
/// use grappelli_db::config::ShardId;
/// use grappelli_db::adapter::Adapter;
///
/// let adapter = grappelli_db::mock::MockAdapter::new();
/// let mut conn = adapter.connect(&ShardId::default_shard()).unwrap();
/// conn.execute("SELECT 1").unwrap();
/// assert_eq!(adapter.sql_log(), vec!["SELECT 1"]);
/// assert_eq!(adapter.connect_count(), 1);
/// ```
#[derive(Default)]
pub struct MockAdapter {
	log: Arc<Mutex<Vec<String>>>,
	connects: AtomicUsize,
	disconnects: AtomicUsize,
	connect_error: Mutex<Option<String>>,
	fail_execute_containing: Option<String>,
	poison_errors_containing: Option<String>,
	savepoints: bool,
}

impl MockAdapter {
	pub fn new() -> Self {
		Self {
			savepoints: true,
			..Self::default()
		}
	}

	/// Make every `execute` whose SQL contains `pattern` fail.
	pub fn with_execute_failure(mut self, pattern: impl Into<String>) -> Self {
		self.fail_execute_containing = Some(pattern.into());
		self
	}

	/// Classify errors whose message contains `pattern` as
	/// connection-poisoning.
	pub fn with_poison_marker(mut self, pattern: impl Into<String>) -> Self {
		self.poison_errors_containing = Some(pattern.into());
		self
	}

	pub fn with_savepoints(mut self, savepoints: bool) -> Self {
		self.savepoints = savepoints;
		self
	}

	/// Make subsequent connects fail with the given message, or succeed
	/// again when `None`.
	pub fn set_connect_error(&self, message: Option<&str>) {
		*self.connect_error.lock() = message.map(str::to_string);
	}

	/// Every statement executed so far, in order, across all connections.
	pub fn sql_log(&self) -> Vec<String> {
		self.log.lock().clone()
	}

	pub fn clear_log(&self) {
		self.log.lock().clear();
	}

	pub fn connect_count(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn disconnect_count(&self) -> usize {
		self.disconnects.load(Ordering::SeqCst)
	}
}

impl Adapter for MockAdapter {
	fn connect(&self, shard: &ShardId) -> Result<Box<dyn Connection>> {
		if let Some(message) = self.connect_error.lock().clone() {
			return Err(Error::database(message));
		}
		let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
		Ok(Box::new(MockConnection {
			id,
			shard: shard.clone(),
			log: self.log.clone(),
			fail_execute_containing: self.fail_execute_containing.clone(),
		}))
	}

	fn disconnect(&self, conn: Box<dyn Connection>) -> Result<()> {
		self.disconnects.fetch_add(1, Ordering::SeqCst);
		drop(conn);
		Ok(())
	}

	fn is_disconnect_error(&self, err: &Error, _conn: &dyn Connection) -> bool {
		match &self.poison_errors_containing {
			Some(pattern) => err.to_string().contains(pattern.as_str()),
			None => false,
		}
	}

	fn supports_savepoints(&self) -> bool {
		self.savepoints
	}
}
