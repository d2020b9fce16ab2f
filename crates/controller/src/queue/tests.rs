use std::sync::Arc;

use easel_locks::LockSet;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use super::{DependencyQueue, QueuePhase, Work};
use crate::error::{CancelReason, ControllerError};

/// Work that records its start and holds until the gate is notified.
fn gated(label: &'static str, log: &Arc<Mutex<Vec<String>>>, gate: &Arc<Notify>) -> Work {
	let log = Arc::clone(log);
	let gate = Arc::clone(gate);
	Box::new(move || {
		Box::pin(async move {
			log.lock().push(format!("{label}:start"));
			gate.notified().await;
			log.lock().push(format!("{label}:end"));
			Ok(Value::Null)
		})
	})
}

/// Work that completes immediately with the given label as its value.
fn quick(label: &'static str) -> Work {
	Box::new(move || Box::pin(async move { Ok(Value::String(label.to_string())) }))
}

/// Lets spawned queue jobs run up to their next suspension point.
async fn settle() {
	for _ in 0..32 {
		tokio::task::yield_now().await;
	}
}

#[tokio::test]
async fn conflicting_writers_run_one_at_a_time() {
	let queue = DependencyQueue::new("test", 8);
	let log = Arc::new(Mutex::new(Vec::new()));
	let gate = Arc::new(Notify::new());

	let a = queue.push(gated("a", &log, &gate), LockSet::empty(), LockSet::PS_DOC, "a");
	let b = queue.push(gated("b", &log, &gate), LockSet::empty(), LockSet::PS_DOC, "b");
	settle().await;

	assert_eq!(queue.active(), 1);
	assert_eq!(queue.pending(), 1);
	assert!(queue.find_active("a").is_some());
	assert!(queue.find_pending("b").is_some());

	gate.notify_one();
	a.await.unwrap();
	settle().await;
	assert!(queue.find_active("b").is_some(), "b starts once a retires");

	gate.notify_one();
	b.await.unwrap();
	assert!(queue.is_idle());
	assert_eq!(log.lock().as_slice(), ["a:start", "a:end", "b:start", "b:end"]);
}

#[tokio::test]
async fn readers_share_writers_exclude_in_fifo_order() {
	let queue = DependencyQueue::new("test", 8);
	let log = Arc::new(Mutex::new(Vec::new()));
	let gate = Arc::new(Notify::new());

	let r1 = queue.push(gated("r1", &log, &gate), LockSet::PS_DOC, LockSet::empty(), "r1");
	let r2 = queue.push(gated("r2", &log, &gate), LockSet::PS_DOC, LockSet::empty(), "r2");
	let w = queue.push(gated("w", &log, &gate), LockSet::empty(), LockSet::PS_DOC, "w");
	let r3 = queue.push(gated("r3", &log, &gate), LockSet::PS_DOC, LockSet::empty(), "r3");
	settle().await;

	// Both readers run together; the writer pends and blocks the later reader.
	assert_eq!(queue.active(), 2);
	assert_eq!(queue.pending(), 2);
	assert!(queue.find_pending("w").is_some());
	assert!(queue.find_pending("r3").is_some());

	gate.notify_one();
	gate.notify_one();
	r1.await.unwrap();
	r2.await.unwrap();
	settle().await;

	// Writer runs alone even though r3 would be compatible with nothing active.
	assert!(queue.find_active("w").is_some());
	assert_eq!(queue.active(), 1);
	assert!(queue.find_pending("r3").is_some());

	gate.notify_one();
	w.await.unwrap();
	gate.notify_one();
	r3.await.unwrap();
	assert!(queue.is_idle());
}

#[tokio::test]
async fn ceiling_bounds_compatible_jobs() {
	let queue = DependencyQueue::new("test", 2);
	let log = Arc::new(Mutex::new(Vec::new()));
	let gate = Arc::new(Notify::new());

	// All lock-free, so only the ceiling holds the third one back.
	let _a = queue.push(gated("a", &log, &gate), LockSet::empty(), LockSet::empty(), "a");
	let _b = queue.push(gated("b", &log, &gate), LockSet::empty(), LockSet::empty(), "b");
	let c = queue.push(gated("c", &log, &gate), LockSet::empty(), LockSet::empty(), "c");
	settle().await;

	assert_eq!(queue.active(), 2);
	assert_eq!(queue.pending(), 1);

	gate.notify_one();
	settle().await;
	assert_eq!(queue.active(), 2, "c starts as soon as one retires");
	assert!(queue.find_pending("c").is_none());

	gate.notify_one();
	gate.notify_one();
	c.await.unwrap();
}

#[tokio::test]
async fn lock_free_jobs_run_fully_concurrently() {
	let queue = DependencyQueue::new("test", 8);
	let log = Arc::new(Mutex::new(Vec::new()));
	let gate = Arc::new(Notify::new());

	let tickets: Vec<_> = (0..8)
		.map(|i| queue.push(gated("job", &log, &gate), LockSet::empty(), LockSet::empty(), format!("job{i}")))
		.collect();
	settle().await;
	assert_eq!(queue.active(), 8);

	for _ in 0..8 {
		gate.notify_one();
	}
	for ticket in tickets {
		ticket.await.unwrap();
	}
	assert!(queue.is_idle());
}

#[tokio::test]
async fn remove_all_cancels_pending_but_not_active() {
	let queue = DependencyQueue::new("test", 8);
	let log = Arc::new(Mutex::new(Vec::new()));
	let gate = Arc::new(Notify::new());

	let active = queue.push(gated("active", &log, &gate), LockSet::empty(), LockSet::PS_APP, "active");
	let pending = queue.push(gated("pending", &log, &gate), LockSet::empty(), LockSet::PS_APP, "pending");
	settle().await;

	assert_eq!(queue.remove_all(CancelReason::Reset), 1);
	assert_eq!(queue.pending(), 0);
	assert_eq!(queue.active(), 1);

	match pending.await {
		Err(ControllerError::Cancelled(CancelReason::Reset)) => {}
		other => panic!("pending job should reject with the reset reason, got {other:?}"),
	}

	gate.notify_one();
	active.await.unwrap();
	assert!(queue.is_idle());
}

#[tokio::test]
async fn rejected_work_retires_the_job() {
	let queue = DependencyQueue::new("test", 8);

	let failing: Work = Box::new(|| Box::pin(async { Err(ControllerError::Cancelled(CancelReason::QueueCleared)) }));
	let failed = queue.push(failing, LockSet::empty(), LockSet::PS_DOC, "failing");
	let after = queue.push(quick("after"), LockSet::empty(), LockSet::PS_DOC, "after");

	assert!(failed.await.is_err());
	assert_eq!(after.await.unwrap(), Value::String("after".to_string()));
	assert!(queue.is_idle());
}

#[tokio::test]
async fn phase_tracks_idle_active_transitions() {
	let queue = DependencyQueue::new("test", 8);
	let mut phase = queue.phase();
	assert_eq!(*phase.borrow_and_update(), QueuePhase::Idle);

	let log = Arc::new(Mutex::new(Vec::new()));
	let gate = Arc::new(Notify::new());
	let job = queue.push(gated("job", &log, &gate), LockSet::empty(), LockSet::empty(), "job");
	settle().await;

	phase.changed().await.unwrap();
	assert_eq!(*phase.borrow_and_update(), QueuePhase::Active);

	gate.notify_one();
	job.await.unwrap();
	phase.changed().await.unwrap();
	assert_eq!(*phase.borrow_and_update(), QueuePhase::Idle);
}
