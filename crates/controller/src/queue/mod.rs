//! Multi-reader/single-writer FIFO scheduler over declared lock sets.
//!
//! Jobs carry a read set and a write set of [`LockSet`] bits. A scheduling
//! pass starts the head of the pending queue while it is compatible with
//! every active job and the concurrency ceiling is not reached; it never
//! skips past an incompatible head, so broad-lock writers cannot starve
//! behind a stream of narrow readers. Correctness derives from lock
//! compatibility alone; the ceiling only bounds peak work in flight.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use easel_bridge::BoxFuture;
use easel_locks::LockSet;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::error::{CancelReason, ControllerError};

/// Concurrency ceiling used when the host core count is unavailable.
pub const DEFAULT_CEILING: usize = 8;

/// Returns the ceiling for a fresh queue: the host core count, or
/// [`DEFAULT_CEILING`] when it cannot be determined.
pub fn default_ceiling() -> usize {
	std::thread::available_parallelism().map(|n| n.get()).unwrap_or(DEFAULT_CEILING).max(1)
}

/// Unit of work scheduled on a [`DependencyQueue`].
pub type Work = Box<dyn FnOnce() -> BoxFuture<Result<Value, ControllerError>> + Send + 'static>;

/// Whether the queue currently has active jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
	/// No job is active.
	Idle,
	/// At least one job is active.
	Active,
}

/// Snapshot of a queued or active job's metadata.
#[derive(Debug, Clone)]
pub struct JobInfo {
	pub seq: u64,
	pub name: String,
	pub reads: LockSet,
	pub writes: LockSet,
}

struct Job {
	seq: u64,
	name: String,
	reads: LockSet,
	writes: LockSet,
	work: Work,
	done: oneshot::Sender<Result<Value, ControllerError>>,
}

struct ActiveJob {
	seq: u64,
	name: String,
	reads: LockSet,
	writes: LockSet,
}

struct Inner {
	pending: VecDeque<Job>,
	active: Vec<ActiveJob>,
	seq_next: u64,
	phase_tx: watch::Sender<QueuePhase>,
}

impl Inner {
	/// Lock compatibility against every active job: the candidate's writes
	/// must not overlap active reads or writes, and its reads must not
	/// overlap active writes.
	fn compatible(&self, reads: LockSet, writes: LockSet) -> bool {
		self.active.iter().all(|active| {
			writes.intersection(active.reads | active.writes).is_empty() && reads.intersection(active.writes).is_empty()
		})
	}
}

/// FIFO queue that starts jobs when their lock sets permit.
pub struct DependencyQueue {
	label: &'static str,
	ceiling: usize,
	inner: Arc<Mutex<Inner>>,
	phase_rx: watch::Receiver<QueuePhase>,
}

impl DependencyQueue {
	/// Creates a queue with the given diagnostic label and ceiling.
	pub fn new(label: &'static str, ceiling: usize) -> Self {
		let (phase_tx, phase_rx) = watch::channel(QueuePhase::Idle);
		Self {
			label,
			ceiling: ceiling.max(1),
			inner: Arc::new(Mutex::new(Inner {
				pending: VecDeque::new(),
				active: Vec::new(),
				seq_next: 0,
				phase_tx,
			})),
			phase_rx,
		}
	}

	/// Enqueues one job and returns a ticket for its eventual result.
	///
	/// The declared reads are widened by the writes before scheduling, so
	/// a write lock always implies the matching read lock.
	pub fn push(&self, work: Work, reads: LockSet, writes: LockSet, name: impl Into<String>) -> JobTicket {
		let (done, rx) = oneshot::channel();
		let mut inner = self.inner.lock();
		let seq = inner.seq_next;
		inner.seq_next = inner.seq_next.wrapping_add(1);
		let name = name.into();
		tracing::trace!(
			queue = self.label,
			job = %name,
			seq,
			pending = inner.pending.len() + 1,
			active = inner.active.len(),
			"queue.push"
		);
		inner.pending.push_back(Job {
			seq,
			name,
			reads: reads | writes,
			writes,
			work,
			done,
		});
		pump(&self.inner, &mut inner, self.ceiling, self.label);
		JobTicket { rx }
	}

	/// Returns the number of active jobs.
	pub fn active(&self) -> usize {
		self.inner.lock().active.len()
	}

	/// Returns the number of pending jobs.
	pub fn pending(&self) -> usize {
		self.inner.lock().pending.len()
	}

	/// Returns true when no job is active or pending.
	pub fn is_idle(&self) -> bool {
		let inner = self.inner.lock();
		inner.active.is_empty() && inner.pending.is_empty()
	}

	/// Returns the first pending job with the given name.
	pub fn find_pending(&self, name: &str) -> Option<JobInfo> {
		self.inner.lock().pending.iter().find(|job| job.name == name).map(|job| JobInfo {
			seq: job.seq,
			name: job.name.clone(),
			reads: job.reads,
			writes: job.writes,
		})
	}

	/// Returns the first active job with the given name.
	pub fn find_active(&self, name: &str) -> Option<JobInfo> {
		self.inner.lock().active.iter().find(|job| job.name == name).map(|job| JobInfo {
			seq: job.seq,
			name: job.name.clone(),
			reads: job.reads,
			writes: job.writes,
		})
	}

	/// Watch channel observing idle/active transitions.
	pub fn phase(&self) -> watch::Receiver<QueuePhase> {
		self.phase_rx.clone()
	}

	/// Cancels every pending job, rejecting its ticket with the reason.
	///
	/// Active jobs are not interruptible; they retire on their own.
	/// Returns the number of jobs cancelled.
	pub fn remove_all(&self, reason: CancelReason) -> usize {
		let removed: Vec<Job> = {
			let mut inner = self.inner.lock();
			inner.pending.drain(..).collect()
		};
		if !removed.is_empty() {
			tracing::debug!(queue = self.label, cancelled = removed.len(), %reason, "queue.clear");
		}
		let count = removed.len();
		for job in removed {
			let _ = job.done.send(Err(ControllerError::Cancelled(reason)));
		}
		count
	}
}

/// Starts head-of-queue jobs while locks and the ceiling permit.
fn pump(inner_arc: &Arc<Mutex<Inner>>, inner: &mut Inner, ceiling: usize, label: &'static str) {
	while inner.active.len() < ceiling {
		let compatible = match inner.pending.front() {
			Some(head) => inner.compatible(head.reads, head.writes),
			None => break,
		};
		if !compatible {
			break;
		}
		let Some(job) = inner.pending.pop_front() else { break };
		tracing::trace!(queue = label, job = %job.name, seq = job.seq, active = inner.active.len() + 1, "queue.start");
		inner.active.push(ActiveJob {
			seq: job.seq,
			name: job.name.clone(),
			reads: job.reads,
			writes: job.writes,
		});
		if inner.active.len() == 1 {
			let _ = inner.phase_tx.send(QueuePhase::Active);
		}
		let Job { seq, work, done, .. } = job;
		let inner_arc = Arc::clone(inner_arc);
		tokio::spawn(async move {
			let result = (work)().await;
			let _ = done.send(result);
			let mut inner = inner_arc.lock();
			inner.active.retain(|active| active.seq != seq);
			tracing::trace!(queue = label, seq, active = inner.active.len(), "queue.retire");
			if inner.active.is_empty() {
				let _ = inner.phase_tx.send(QueuePhase::Idle);
			}
			pump(&inner_arc, &mut inner, ceiling, label);
		});
	}
}

/// Future resolving with a pushed job's result.
///
/// Rejects with [`CancelReason`]-flavored errors when the job is cancelled
/// out of the pending queue.
#[derive(Debug)]
pub struct JobTicket {
	rx: oneshot::Receiver<Result<Value, ControllerError>>,
}

impl Future for JobTicket {
	type Output = Result<Value, ControllerError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(Ok(result)) => Poll::Ready(result),
			Poll::Ready(Err(_)) => Poll::Ready(Err(ControllerError::Cancelled(CancelReason::QueueCleared))),
			Poll::Pending => Poll::Pending,
		}
	}
}

#[cfg(test)]
mod tests;
