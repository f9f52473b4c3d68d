//! Pool timeout and contention tests
//! Covers blocking checkout, timeout errors and wakeup on release

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use grappelli_db::config::DatabaseConfig;
use grappelli_db::context::ExecutionContext;
use grappelli_db::error::Error;
use grappelli_db::mock::MockAdapter;
use grappelli_db::pool::ConnectionPool;

fn contended_pool(timeout: Duration) -> (Arc<MockAdapter>, Arc<ConnectionPool>) {
	let adapter = Arc::new(MockAdapter::new());
	let config = DatabaseConfig::new()
		.with_max_connections(1)
		.with_pool_timeout(timeout);
	let pool = ConnectionPool::new(&config, adapter.clone()).expect("Failed to create pool");
	(adapter, Arc::new(pool))
}

#[test]
fn test_checkout_times_out_when_pool_is_exhausted() {
	let (_, pool) = contended_pool(Duration::from_millis(100));

	// Park one thread on the only connection for longer than the timeout
	let holder = {
		let pool = pool.clone();
		thread::spawn(move || {
			pool.hold(ExecutionContext::current(), None, |_conn| {
				thread::sleep(Duration::from_millis(300));
				Ok(())
			})
			.unwrap();
		})
	};
	thread::sleep(Duration::from_millis(30));

	let started = Instant::now();
	let err = pool
		.hold(ExecutionContext::current(), None, |_conn| Ok(()))
		.expect_err("Checkout should time out");
	let waited = started.elapsed();

	assert!(matches!(err, Error::PoolTimeout { .. }));
	assert!(waited >= Duration::from_millis(100));
	assert!(waited < Duration::from_millis(280), "waited {waited:?}");
	holder.join().unwrap();
}

#[test]
fn test_waiter_wakes_when_connection_is_released() {
	let (adapter, pool) = contended_pool(Duration::from_secs(5));
	let observed_empty = Arc::new(AtomicBool::new(false));

	let holder = {
		let pool = pool.clone();
		thread::spawn(move || {
			pool.hold(ExecutionContext::current(), None, |_conn| {
				thread::sleep(Duration::from_millis(120));
				Ok(())
			})
			.unwrap();
		})
	};
	thread::sleep(Duration::from_millis(30));

	// The pool is exhausted while the holder sleeps
	assert_eq!(pool.available_connections(None), 0);
	observed_empty.store(true, Ordering::SeqCst);

	let started = Instant::now();
	pool.hold(ExecutionContext::current(), None, |conn| conn.execute("SELECT 1"))
		.expect("Waiter should obtain the released connection");

	assert!(observed_empty.load(Ordering::SeqCst));
	assert!(started.elapsed() < Duration::from_secs(1));
	// The released connection was reused, not replaced
	assert_eq!(adapter.connect_count(), 1);
	holder.join().unwrap();
}

#[test]
fn test_failed_connect_frees_the_reserved_slot() {
	let (adapter, pool) = contended_pool(Duration::from_millis(200));

	adapter.set_connect_error(Some("refused"));
	let err = pool
		.hold(ExecutionContext::current(), None, |_conn| Ok(()))
		.expect_err("Connect should fail");
	assert!(matches!(err, Error::ConnectionFailed { .. }));

	// The reservation was rolled back, so the next checkout gets the slot
	adapter.set_connect_error(None);
	pool.hold(ExecutionContext::current(), None, |_conn| Ok(()))
		.expect("Slot should be free after a failed connect");
}

#[test]
fn test_poisoned_connection_frees_the_slot_for_waiters() {
	let adapter = Arc::new(MockAdapter::new().with_poison_marker("gone away"));
	let config = DatabaseConfig::new()
		.with_max_connections(1)
		.with_pool_timeout(Duration::from_secs(5));
	let pool =
		Arc::new(ConnectionPool::new(&config, adapter.clone()).expect("Failed to create pool"));

	let poisoner = {
		let pool = pool.clone();
		thread::spawn(move || {
			let _ = pool.hold(ExecutionContext::current(), None, |_conn| {
				thread::sleep(Duration::from_millis(80));
				Err::<(), _>(Error::database("server has gone away"))
			});
		})
	};
	thread::sleep(Duration::from_millis(20));

	// The waiter gets a fresh connection after the poisoned one is dropped
	pool.hold(ExecutionContext::current(), None, |conn| conn.execute("SELECT 1"))
		.expect("Waiter should get a replacement connection");

	poisoner.join().unwrap();
	assert_eq!(adapter.connect_count(), 2);
	assert_eq!(adapter.disconnect_count(), 1);
}

#[test]
fn test_disconnect_defers_closing_held_connections() {
	let (adapter, pool) = contended_pool(Duration::from_secs(5));

	pool.hold(ExecutionContext::current(), None, |_conn| {
		pool.disconnect(None);
		// Still usable while held; closing happens at release
		assert_eq!(adapter.disconnect_count(), 0);
		Ok(())
	})
	.unwrap();

	assert_eq!(adapter.disconnect_count(), 1);
	assert_eq!(pool.size(None), 0);
}
