//! Bounded, mutex/condvar guarded connection pool

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use scopeguard::ScopeGuard;
use tracing::{debug, trace, warn};

use crate::adapter::Adapter;
use crate::config::ShardId;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};

use super::{PooledConn, close_connection};

struct Slot {
	conn: PooledConn,
	pending_disconnect: bool,
}

struct Inner {
	idle: Vec<PooledConn>,
	allocated: HashMap<ExecutionContext, Slot>,
	created: usize,
}

/// A bounded pool of connections for one shard.
///
/// At most `max_connections` connections exist at any instant; `hold`
/// blocks on a condition variable for up to the pool timeout when the
/// pool is exhausted. Checkout is reentrant per [`ExecutionContext`]:
/// a context that already holds a connection gets the identical
/// connection back synchronously, which is what keeps nested
/// hold/transaction calls from self-deadlocking at `max_connections == 1`.
pub struct ThreadedConnectionPool {
	adapter: Arc<dyn Adapter>,
	shard: ShardId,
	max_connections: usize,
	timeout: Duration,
	inner: Mutex<Inner>,
	available: Condvar,
}

impl ThreadedConnectionPool {
	pub fn new(
		adapter: Arc<dyn Adapter>,
		shard: ShardId,
		max_connections: usize,
		timeout: Duration,
	) -> Self {
		Self {
			adapter,
			shard,
			max_connections,
			timeout,
			inner: Mutex::new(Inner {
				idle: Vec::new(),
				allocated: HashMap::new(),
				created: 0,
			}),
			available: Condvar::new(),
		}
	}

	pub fn shard(&self) -> &ShardId {
		&self.shard
	}

	/// Check out a connection, run `f` with it, and check it back in.
	///
	/// An error returned by `f` propagates to the caller after the
	/// connection accounting is fixed up: the connection goes back to
	/// idle, or is dropped and its slot freed when the adapter classifies
	/// the error as connection-poisoning.
	pub fn hold<T>(
		&self,
		ctx: ExecutionContext,
		f: impl FnOnce(&PooledConn) -> Result<T>,
	) -> Result<T> {
		// Reentrant fast path: no wait, no new allocation, no checkin.
		{
			let inner = self.inner.lock();
			if let Some(slot) = inner.allocated.get(&ctx) {
				let conn = slot.conn.clone();
				drop(inner);
				trace!(shard = %self.shard, "reentrant hold");
				return f(&conn);
			}
		}

		let conn = self.checkout(ctx)?;
		// A panic in `f` leaves the connection's session state unknown;
		// drop it and free the slot rather than re-idling it.
		let guard = scopeguard::guard(conn, |conn| self.checkin_panicked(ctx, conn));
		let result = f(&*guard);
		drop(ScopeGuard::into_inner(guard));
		self.checkin(ctx, result.as_ref().err());
		result
	}

	fn checkin_panicked(&self, ctx: ExecutionContext, conn: PooledConn) {
		{
			let mut inner = self.inner.lock();
			inner.allocated.remove(&ctx);
			inner.created -= 1;
			self.available.notify_one();
		}
		warn!(shard = %self.shard, "dropping connection after panic in hold block");
		close_connection(self.adapter.as_ref(), &self.shard, conn);
	}

	/// The connection currently allocated to `ctx`, if any.
	pub fn allocated(&self, ctx: ExecutionContext) -> Option<PooledConn> {
		self.inner.lock().allocated.get(&ctx).map(|slot| slot.conn.clone())
	}

	fn checkout(&self, ctx: ExecutionContext) -> Result<PooledConn> {
		let deadline = Instant::now() + self.timeout;
		let mut inner = self.inner.lock();
		loop {
			if let Some(conn) = inner.idle.pop() {
				trace!(shard = %self.shard, "checkout from idle");
				return Ok(self.allocate(&mut inner, ctx, conn));
			}

			if inner.created < self.max_connections {
				// Reserve the slot, then connect outside the mutex so a
				// slow connect does not block other holders.
				inner.created += 1;
				drop(inner);
				match self.connect() {
					Ok(conn) => {
						let mut inner = self.inner.lock();
						return Ok(self.allocate(&mut inner, ctx, conn));
					}
					Err(err) => {
						let mut inner = self.inner.lock();
						inner.created -= 1;
						self.available.notify_one();
						return Err(err);
					}
				}
			}

			if self.available.wait_until(&mut inner, deadline).timed_out() {
				// One last look before giving up: a connection may have
				// been returned or a slot freed between wakeup and now.
				if let Some(conn) = inner.idle.pop() {
					return Ok(self.allocate(&mut inner, ctx, conn));
				}
				if inner.created < self.max_connections {
					continue;
				}
				warn!(shard = %self.shard, timeout = ?self.timeout, "pool timeout");
				return Err(Error::PoolTimeout {
					shard: self.shard.clone(),
					timeout: self.timeout,
				});
			}
		}
	}

	fn allocate(&self, inner: &mut Inner, ctx: ExecutionContext, conn: PooledConn) -> PooledConn {
		inner.allocated.insert(
			ctx,
			Slot {
				conn: conn.clone(),
				pending_disconnect: false,
			},
		);
		conn
	}

	fn connect(&self) -> Result<PooledConn> {
		match self.adapter.connect(&self.shard) {
			Ok(raw) => {
				debug!(shard = %self.shard, "connection established");
				Ok(PooledConn::new(raw))
			}
			Err(err @ Error::ConnectionFailed { .. }) => Err(err),
			Err(err) => Err(Error::ConnectionFailed { source: Box::new(err) }),
		}
	}

	fn checkin(&self, ctx: ExecutionContext, err: Option<&Error>) {
		let mut inner = self.inner.lock();
		let Some(slot) = inner.allocated.remove(&ctx) else {
			return;
		};
		let poisoned = err.is_some_and(|err| {
			slot.conn.with_raw(|raw| self.adapter.is_disconnect_error(err, raw))
		});
		if poisoned || slot.pending_disconnect {
			// Drop the connection and free its slot so the next request
			// can create a fresh one.
			inner.created -= 1;
			self.available.notify_one();
			drop(inner);
			if poisoned {
				warn!(shard = %self.shard, "dropping poisoned connection");
			}
			close_connection(self.adapter.as_ref(), &self.shard, slot.conn);
		} else {
			inner.idle.push(slot.conn);
			self.available.notify_one();
			trace!(shard = %self.shard, "checkin");
		}
	}

	/// Close all idle connections now and flag checked-out ones to be
	/// closed when they are returned. Never blocks on holders.
	pub fn disconnect(&self) {
		let drained = {
			let mut inner = self.inner.lock();
			for slot in inner.allocated.values_mut() {
				slot.pending_disconnect = true;
			}
			let drained: Vec<_> = inner.idle.drain(..).collect();
			inner.created -= drained.len();
			self.available.notify_all();
			drained
		};
		debug!(shard = %self.shard, closing = drained.len(), "disconnecting idle connections");
		for conn in drained {
			close_connection(self.adapter.as_ref(), &self.shard, conn);
		}
	}

	pub fn size(&self) -> usize {
		self.inner.lock().created
	}

	pub fn max_size(&self) -> usize {
		self.max_connections
	}

	pub fn available_connections(&self) -> usize {
		self.inner.lock().idle.len()
	}

	/// Fill the pool up to `max_connections`.
	pub fn preconnect(&self) -> Result<()> {
		loop {
			{
				let mut inner = self.inner.lock();
				if inner.created >= self.max_connections {
					return Ok(());
				}
				inner.created += 1;
			}
			match self.connect() {
				Ok(conn) => {
					let mut inner = self.inner.lock();
					inner.idle.push(conn);
					self.available.notify_one();
				}
				Err(err) => {
					let mut inner = self.inner.lock();
					inner.created -= 1;
					self.available.notify_one();
					drop(inner);
					return Err(err);
				}
			}
		}
	}
}
