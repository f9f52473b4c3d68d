//! Transaction coordination
//!
//! Tracks transaction depth per `(context, shard)` and issues
//! `BEGIN`/`COMMIT`/`ROLLBACK`/`SAVEPOINT` at exactly the right depth
//! transitions: `BEGIN` when depth goes 0→1, `COMMIT` or `ROLLBACK` when
//! it goes 1→0, savepoint statements for opted-in nested levels, and
//! nothing at all for plain reentrant nesting.
//!
//! Rollback is not an unwinding exception here: [`Error::Rollback`] is a
//! sentinel value carried through `Result`. Plain nested levels pass it
//! outward; the nearest savepoint or outermost boundary absorbs it,
//! performs the actual rollback, and reports `None` to its caller.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::config::ShardId;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::pool::PooledConn;

/// Options for [`Database::transaction`](crate::database::Database::transaction).
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
	/// Use a savepoint when nested inside an open transaction.
	pub savepoint: bool,
	/// Shard to run on; the default shard when `None`.
	pub shard: Option<ShardId>,
}

impl TransactionOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_savepoint(mut self, savepoint: bool) -> Self {
		self.savepoint = savepoint;
		self
	}

	pub fn on_shard(mut self, shard: ShardId) -> Self {
		self.shard = Some(shard);
		self
	}
}

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// One hook frame: the outermost transaction or one savepoint level.
#[derive(Default)]
struct Frame {
	savepoint: Option<usize>,
	after_commit: Vec<Hook>,
	after_rollback: Vec<Hook>,
}

struct TxnState {
	conn: PooledConn,
	depth: usize,
	savepoint_depth: usize,
	rollback_requested: bool,
	frames: Vec<Frame>,
}

/// Per-database transaction registry.
///
/// An owned object referenced by the [`Database`](crate::database::Database)
/// facade; all state transitions and the diagnostic active-context set
/// are guarded by the same mutex.
#[derive(Default)]
pub struct TransactionManager {
	states: Mutex<HashMap<(ExecutionContext, ShardId), TxnState>>,
}

impl TransactionManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether `(ctx, shard)` is inside an open transaction.
	pub fn in_transaction(&self, ctx: ExecutionContext, shard: &ShardId) -> bool {
		self.states.lock().contains_key(&(ctx, shard.clone()))
	}

	/// Contexts currently inside a transaction on any shard, each listed
	/// once. Diagnostic use.
	pub fn active_contexts(&self) -> Vec<ExecutionContext> {
		let states = self.states.lock();
		let mut contexts: Vec<ExecutionContext> = Vec::new();
		for (ctx, _shard) in states.keys() {
			if !contexts.contains(ctx) {
				contexts.push(*ctx);
			}
		}
		contexts
	}

	/// The connection held by the open transaction for `(ctx, shard)`.
	pub fn current_connection(&self, ctx: ExecutionContext, shard: &ShardId) -> Option<PooledConn> {
		self.states
			.lock()
			.get(&(ctx, shard.clone()))
			.map(|state| state.conn.clone())
	}

	/// Open the outermost transaction: issue `BEGIN` and create state at
	/// depth 1. The caller must already hold `conn` via the pool for the
	/// whole transaction duration.
	pub(crate) fn begin(
		&self,
		ctx: ExecutionContext,
		shard: &ShardId,
		conn: &PooledConn,
	) -> Result<()> {
		conn.execute("BEGIN")?;
		trace!(shard = %shard, "BEGIN");
		self.states.lock().insert(
			(ctx, shard.clone()),
			TxnState {
				conn: conn.clone(),
				depth: 1,
				savepoint_depth: 0,
				rollback_requested: false,
				frames: vec![Frame::default()],
			},
		);
		Ok(())
	}

	/// Close the outermost transaction according to the block outcome:
	/// commit on `Ok`, rollback on `Err`. The rollback sentinel is
	/// absorbed here and reported as `Ok(None)`; any other error is
	/// returned unchanged after the rollback. State is destroyed and
	/// hooks run in every path.
	pub(crate) fn finish<T>(
		&self,
		ctx: ExecutionContext,
		shard: &ShardId,
		out: Result<T>,
	) -> Result<Option<T>> {
		let Some(state) = self.states.lock().remove(&(ctx, shard.clone())) else {
			return out.map(Some);
		};
		let conn = state.conn.clone();
		let frame = state.frames.into_iter().next().unwrap_or_default();

		match out {
			Ok(value) => match conn.execute("COMMIT") {
				Ok(_) => {
					trace!(shard = %shard, "COMMIT");
					run_hooks(frame.after_commit);
					Ok(Some(value))
				}
				Err(err) => {
					run_hooks(frame.after_rollback);
					Err(err)
				}
			},
			Err(err) => {
				let absorbed = err.is_rollback();
				if let Err(rollback_err) = conn.execute("ROLLBACK") {
					// Keep the block's error; the failed rollback is only
					// worth surfacing when the sentinel carried no error.
					warn!(shard = %shard, error = %rollback_err, "ROLLBACK failed");
					if absorbed {
						return Err(rollback_err);
					}
				} else {
					trace!(shard = %shard, requested = absorbed, "ROLLBACK");
				}
				run_hooks(frame.after_rollback);
				if absorbed { Ok(None) } else { Err(err) }
			}
		}
	}

	/// Open a savepoint level inside an existing transaction, returning
	/// its number.
	pub(crate) fn begin_savepoint(&self, ctx: ExecutionContext, shard: &ShardId) -> Result<usize> {
		let (conn, number) = {
			let states = self.states.lock();
			let state = states
				.get(&(ctx, shard.clone()))
				.ok_or_else(|| Error::Config("savepoint outside a transaction".into()))?;
			(state.conn.clone(), state.savepoint_depth + 1)
		};
		conn.execute(&format!("SAVEPOINT sp_{number}"))?;
		trace!(shard = %shard, savepoint = number, "SAVEPOINT");

		let mut states = self.states.lock();
		if let Some(state) = states.get_mut(&(ctx, shard.clone())) {
			state.depth += 1;
			state.savepoint_depth = number;
			state.frames.push(Frame {
				savepoint: Some(number),
				..Frame::default()
			});
		}
		Ok(number)
	}

	/// Close a savepoint level: `RELEASE SAVEPOINT` on `Ok` (the frame's
	/// hooks merge into the parent frame), `ROLLBACK TO SAVEPOINT` on
	/// error. The rollback sentinel is absorbed at this level; other
	/// errors propagate after the partial rollback. The outer transaction
	/// is untouched either way.
	pub(crate) fn finish_savepoint<T>(
		&self,
		ctx: ExecutionContext,
		shard: &ShardId,
		out: Result<T>,
	) -> Result<Option<T>> {
		let (conn, frame) = {
			let mut states = self.states.lock();
			let Some(state) = states.get_mut(&(ctx, shard.clone())) else {
				return out.map(Some);
			};
			let frame = state.frames.pop().unwrap_or_default();
			state.depth -= 1;
			state.savepoint_depth -= 1;
			state.rollback_requested = false;
			(state.conn.clone(), frame)
		};
		let number = frame.savepoint.unwrap_or(1);

		match out {
			Ok(value) => {
				conn.execute(&format!("RELEASE SAVEPOINT sp_{number}"))?;
				trace!(shard = %shard, savepoint = number, "RELEASE SAVEPOINT");
				// Savepoint hooks only fire if the enclosing transaction
				// commits (or rolls back), so they move to the parent.
				let mut states = self.states.lock();
				if let Some(state) = states.get_mut(&(ctx, shard.clone()))
					&& let Some(parent) = state.frames.last_mut()
				{
					parent.after_commit.extend(frame.after_commit);
					parent.after_rollback.extend(frame.after_rollback);
				}
				Ok(Some(value))
			}
			Err(err) => {
				let absorbed = err.is_rollback();
				if let Err(rollback_err) = conn.execute(&format!("ROLLBACK TO SAVEPOINT sp_{number}")) {
					warn!(shard = %shard, error = %rollback_err, "ROLLBACK TO SAVEPOINT failed");
					if absorbed {
						return Err(rollback_err);
					}
				} else {
					trace!(shard = %shard, savepoint = number, "ROLLBACK TO SAVEPOINT");
				}
				run_hooks(frame.after_rollback);
				if absorbed { Ok(None) } else { Err(err) }
			}
		}
	}

	/// Destroy the outermost transaction while a panic unwinds through
	/// its block: best-effort `ROLLBACK`, then every frame's rollback
	/// hooks. Leaving the state behind would hand later transactions on
	/// this context a dead `BEGIN`.
	pub(crate) fn abort(&self, ctx: ExecutionContext, shard: &ShardId) {
		let Some(state) = self.states.lock().remove(&(ctx, shard.clone())) else {
			return;
		};
		warn!(shard = %shard, "rolling back transaction abandoned mid-block");
		if let Err(err) = state.conn.execute("ROLLBACK") {
			warn!(shard = %shard, error = %err, "ROLLBACK failed");
		}
		let mut hooks = Vec::new();
		for frame in state.frames.into_iter().rev() {
			hooks.extend(frame.after_rollback);
		}
		run_hooks(hooks);
	}

	/// Savepoint analogue of [`abort`](Self::abort): roll the level back
	/// and drop its frame without touching the enclosing transaction.
	pub(crate) fn abort_savepoint(&self, ctx: ExecutionContext, shard: &ShardId) {
		let Some((conn, frame)) = ({
			let mut states = self.states.lock();
			states.get_mut(&(ctx, shard.clone())).map(|state| {
				let frame = state.frames.pop().unwrap_or_default();
				state.depth -= 1;
				state.savepoint_depth -= 1;
				state.rollback_requested = false;
				(state.conn.clone(), frame)
			})
		}) else {
			return;
		};
		let number = frame.savepoint.unwrap_or(1);
		warn!(shard = %shard, savepoint = number, "rolling back savepoint abandoned mid-block");
		if let Err(err) = conn.execute(&format!("ROLLBACK TO SAVEPOINT sp_{number}")) {
			warn!(shard = %shard, error = %err, "ROLLBACK TO SAVEPOINT failed");
		}
		run_hooks(frame.after_rollback);
	}

	/// Plain-nested analogue: restore the depth and nothing else.
	pub(crate) fn abort_depth(&self, ctx: ExecutionContext, shard: &ShardId) {
		if let Some(state) = self.states.lock().get_mut(&(ctx, shard.clone())) {
			state.depth -= 1;
		}
	}

	/// Enter a plain nested level: same connection, no SQL.
	pub(crate) fn push_depth(&self, ctx: ExecutionContext, shard: &ShardId) {
		if let Some(state) = self.states.lock().get_mut(&(ctx, shard.clone())) {
			state.depth += 1;
		}
	}

	/// Leave a plain nested level. The rollback sentinel marks the state
	/// and keeps propagating so the nearest real boundary performs the
	/// actual rollback.
	pub(crate) fn pop_depth<T>(
		&self,
		ctx: ExecutionContext,
		shard: &ShardId,
		out: Result<T>,
	) -> Result<Option<T>> {
		if let Some(state) = self.states.lock().get_mut(&(ctx, shard.clone())) {
			state.depth -= 1;
			if matches!(out, Err(Error::Rollback)) {
				state.rollback_requested = true;
			}
		}
		out.map(Some)
	}

	/// Register an after-commit hook on the innermost open frame.
	/// Hands the hook back when no transaction is open, so the caller can
	/// run it immediately.
	pub(crate) fn add_after_commit(
		&self,
		ctx: ExecutionContext,
		shard: &ShardId,
		hook: Hook,
	) -> Option<Hook> {
		let mut states = self.states.lock();
		match states.get_mut(&(ctx, shard.clone())).and_then(|state| state.frames.last_mut()) {
			Some(frame) => {
				frame.after_commit.push(hook);
				None
			}
			None => Some(hook),
		}
	}

	/// Register an after-rollback hook on the innermost open frame.
	/// Hands the hook back when no transaction is open; with no
	/// transaction there is nothing that can roll back, so the caller
	/// drops it.
	pub(crate) fn add_after_rollback(
		&self,
		ctx: ExecutionContext,
		shard: &ShardId,
		hook: Hook,
	) -> Option<Hook> {
		let mut states = self.states.lock();
		match states.get_mut(&(ctx, shard.clone())).and_then(|state| state.frames.last_mut()) {
			Some(frame) => {
				frame.after_rollback.push(hook);
				None
			}
			None => Some(hook),
		}
	}

	/// Current nesting depth for `(ctx, shard)`; 0 outside a transaction.
	pub fn depth(&self, ctx: ExecutionContext, shard: &ShardId) -> usize {
		self.states
			.lock()
			.get(&(ctx, shard.clone()))
			.map_or(0, |state| state.depth)
	}

	/// Whether a nested level has requested a rollback of the enclosing
	/// transaction.
	pub fn rollback_requested(&self, ctx: ExecutionContext, shard: &ShardId) -> bool {
		self.states
			.lock()
			.get(&(ctx, shard.clone()))
			.is_some_and(|state| state.rollback_requested)
	}
}

fn run_hooks(hooks: Vec<Hook>) {
	for hook in hooks {
		hook();
	}
}
