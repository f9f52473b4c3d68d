//! Background job worker
//!
//! A dedicated thread draining a FIFO queue of jobs. `add` never blocks
//! the producer; `join` stops accepting work, drains what is queued and
//! waits for the thread to exit. When built with a database handle,
//! every job runs inside its own transaction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use scopeguard::guard;
use tracing::{debug, error, trace};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::transaction::TransactionOptions;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct QueuedJob {
	job: Job,
	enqueued_at: Instant,
}

struct State {
	queue: VecDeque<QueuedJob>,
	running: bool,
	shutting_down: bool,
	first_error: Option<Error>,
}

struct Shared {
	state: Mutex<State>,
	work_available: Condvar,
}

/// A single background thread processing queued jobs in order.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use grappelli_db::worker::Worker;
///
/// let worker = Worker::new();
/// let done = Arc::new(AtomicUsize::new(0));
/// for _ in 0..3 {
/// 	let done = done.clone();
/// 	worker
/// 		.add(move || {
/// 			done.fetch_add(1, Ordering::SeqCst);
/// 			Ok(())
/// 		})
/// 		.unwrap();
/// }
/// worker.join().unwrap();
/// assert_eq!(done.load(Ordering::SeqCst), 3);
/// ```
pub struct Worker {
	shared: Arc<Shared>,
	handle: Option<JoinHandle<()>>,
}

impl Worker {
	/// Spawn a worker whose jobs run bare.
	pub fn new() -> Self {
		Self::spawn(None)
	}

	/// Spawn a worker that wraps each job in a transaction on `db`.
	pub fn with_database(db: Arc<Database>) -> Self {
		Self::spawn(Some(db))
	}

	fn spawn(db: Option<Arc<Database>>) -> Self {
		let shared = Arc::new(Shared {
			state: Mutex::new(State {
				queue: VecDeque::new(),
				running: false,
				shutting_down: false,
				first_error: None,
			}),
			work_available: Condvar::new(),
		});
		let handle = {
			let shared = shared.clone();
			thread::Builder::new()
				.name("grappelli-worker".into())
				.spawn(move || run_loop(&shared, db.as_deref()))
				.unwrap_or_else(|err| panic!("failed to spawn worker thread: {err}"))
		};
		Self {
			shared,
			handle: Some(handle),
		}
	}

	/// Queue a job. Never blocks; returns [`Error::WorkerShutdown`] once
	/// [`join`](Self::join) has begun.
	pub fn add(&self, job: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
		let mut state = self.shared.state.lock();
		if state.shutting_down {
			return Err(Error::WorkerShutdown);
		}
		state.queue.push_back(QueuedJob {
			job: Box::new(job),
			enqueued_at: Instant::now(),
		});
		self.shared.work_available.notify_one();
		Ok(())
	}

	/// Whether the worker has queued or in-flight work.
	pub fn busy(&self) -> bool {
		let state = self.shared.state.lock();
		state.running || !state.queue.is_empty()
	}

	/// Jobs waiting in the queue, not counting one in flight.
	pub fn queued(&self) -> usize {
		self.shared.state.lock().queue.len()
	}

	/// Stop accepting jobs, drain the queue and wait for the thread.
	/// Returns the first error any job produced, if there was one.
	pub fn join(mut self) -> Result<()> {
		{
			let mut state = self.shared.state.lock();
			state.shutting_down = true;
			self.shared.work_available.notify_all();
		}
		if let Some(handle) = self.handle.take()
			&& let Err(panic) = handle.join()
		{
			std::panic::resume_unwind(panic);
		}
		match self.shared.state.lock().first_error.take() {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}
}

impl Default for Worker {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for Worker {
	fn drop(&mut self) {
		// Dropped without join: let the thread drain what is queued and
		// exit on its own.
		if self.handle.take().is_some() {
			let mut state = self.shared.state.lock();
			state.shutting_down = true;
			self.shared.work_available.notify_all();
		}
	}
}

fn run_loop(shared: &Shared, db: Option<&Database>) {
	loop {
		let queued = {
			let mut state = shared.state.lock();
			loop {
				if let Some(queued) = state.queue.pop_front() {
					state.running = true;
					break queued;
				}
				if state.shutting_down {
					return;
				}
				shared.work_available.wait(&mut state);
			}
		};
		trace!(waited = ?queued.enqueued_at.elapsed(), "dequeued job");
		let job = queued.job;

		let outcome = {
			// Reset the in-flight flag even if the job panics.
			let _reset = guard((), |()| {
				shared.state.lock().running = false;
			});
			match db {
				Some(db) => db
					.transaction(TransactionOptions::new(), |_conn| job())
					.map(drop),
				None => job(),
			}
		};
		let mut state = shared.state.lock();
		if let Err(err) = outcome {
			error!(error = %err, "worker job failed");
			if state.first_error.is_none() {
				state.first_error = Some(err);
			}
		} else {
			debug!("worker job completed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::DatabaseConfig;
	use crate::mock::MockAdapter;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::time::Duration;

	#[test]
	fn test_jobs_run_in_fifo_order() {
		let worker = Worker::new();
		let seen = Arc::new(Mutex::new(Vec::new()));

		for n in 0..20 {
			let seen = seen.clone();
			worker
				.add(move || {
					seen.lock().push(n);
					Ok(())
				})
				.unwrap();
		}
		worker.join().unwrap();

		assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
	}

	#[test]
	fn test_busy_reflects_in_flight_job() {
		let worker = Worker::new();
		let release = Arc::new(AtomicBool::new(false));

		let gate = release.clone();
		worker
			.add(move || {
				while !gate.load(Ordering::SeqCst) {
					thread::sleep(Duration::from_millis(1));
				}
				Ok(())
			})
			.unwrap();

		// The job is queued or running until released.
		thread::sleep(Duration::from_millis(20));
		assert!(worker.busy());

		release.store(true, Ordering::SeqCst);
		worker.join().unwrap();
	}

	#[test]
	fn test_join_drains_queue_before_returning() {
		let worker = Worker::new();
		let seen = Arc::new(Mutex::new(Vec::new()));

		for n in 0..5 {
			let seen = seen.clone();
			worker
				.add(move || {
					thread::sleep(Duration::from_millis(5));
					seen.lock().push(n);
					Ok(())
				})
				.unwrap();
		}
		worker.join().unwrap();
		assert_eq!(seen.lock().len(), 5);
	}

	#[test]
	fn test_join_surfaces_first_job_error() {
		let worker = Worker::new();
		worker.add(|| Err(Error::database("mau"))).unwrap();
		worker.add(|| Err(Error::database("second"))).unwrap();
		worker.add(|| Ok(())).unwrap();

		let err = worker.join().unwrap_err();
		assert_eq!(err.original_error().unwrap().to_string(), "mau");
	}

	#[test]
	fn test_database_worker_wraps_jobs_in_transactions() {
		let adapter = Arc::new(MockAdapter::new());
		let db = Arc::new(Database::new(DatabaseConfig::default(), adapter.clone()).unwrap());
		let worker = Worker::with_database(db.clone());

		{
			let db = db.clone();
			worker
				.add(move || db.synchronize(|conn| conn.execute("INSERT 1").map(drop)))
				.unwrap();
		}
		worker.join().unwrap();

		assert_eq!(adapter.sql_log(), vec!["BEGIN", "INSERT 1", "COMMIT"]);
	}

	#[test]
	fn test_database_worker_rolls_back_failed_jobs() {
		let adapter = Arc::new(MockAdapter::new());
		let db = Arc::new(Database::new(DatabaseConfig::default(), adapter.clone()).unwrap());
		let worker = Worker::with_database(db.clone());

		worker.add(|| Err(Error::database("mau"))).unwrap();
		let err = worker.join().unwrap_err();

		assert_eq!(err.original_error().unwrap().to_string(), "mau");
		assert_eq!(adapter.sql_log(), vec!["BEGIN", "ROLLBACK"]);
	}
}
