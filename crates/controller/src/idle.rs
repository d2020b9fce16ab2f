//! Idle-window task deferral.
//!
//! An idle task waits until the main queue goes idle and stays idle for
//! [`IDLE_QUIESCE`], then until the host runtime reports an idle callback,
//! and only then enqueues its action. Queue activity during the quiesce
//! window restarts the wait. Tasks are cancelable at any point; the
//! controller cancels the whole outstanding set on reset.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerCore;
use crate::error::{CancelReason, ControllerError};
use crate::queue::QueuePhase;
use crate::registry::ActionEntry;

/// How long the main queue must stay idle before an idle task may fire.
pub const IDLE_QUIESCE: Duration = Duration::from_millis(1000);

/// Outstanding idle-task handles, keyed for cancellation.
#[derive(Default)]
pub(crate) struct IdleTasks {
	tasks: Mutex<FxHashMap<u64, CancellationToken>>,
	seq: AtomicU64,
}

impl IdleTasks {
	fn register(&self) -> (u64, CancellationToken) {
		let id = self.seq.fetch_add(1, Ordering::Relaxed);
		let token = CancellationToken::new();
		self.tasks.lock().insert(id, token.clone());
		(id, token)
	}

	fn complete(&self, id: u64) {
		self.tasks.lock().remove(&id);
	}

	/// Cancels every outstanding idle task.
	pub(crate) fn cancel_all(&self) {
		let tokens: Vec<CancellationToken> = self.tasks.lock().values().cloned().collect();
		if !tokens.is_empty() {
			tracing::debug!(cancelled = tokens.len(), "idle tasks cancelled");
		}
		for token in tokens {
			token.cancel();
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.tasks.lock().len()
	}
}

/// Cancelable handle resolving with the deferred invocation's result.
#[derive(Debug)]
pub struct IdleTicket {
	token: CancellationToken,
	rx: oneshot::Receiver<Result<Value, ControllerError>>,
}

impl IdleTicket {
	/// Cancels the idle task, tearing down its timers and listeners.
	pub fn cancel(&self) {
		self.token.cancel();
	}
}

impl Future for IdleTicket {
	type Output = Result<Value, ControllerError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(Ok(result)) => Poll::Ready(result),
			Poll::Ready(Err(_)) => Poll::Ready(Err(ControllerError::Cancelled(CancelReason::IdleTask))),
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Spawns an idle task for `entry` and returns its ticket.
pub(crate) fn spawn_idle_task(core: &Arc<ControllerCore>, entry: Arc<ActionEntry>, args: Vec<Value>) -> IdleTicket {
	let (id, token) = core.idle_tasks().register();
	let (tx, rx) = oneshot::channel();
	let core = Arc::clone(core);
	let task_token = token.clone();
	tracing::trace!(action = %entry.id(), task = id, "idle.schedule");
	tokio::spawn(async move {
		let result = tokio::select! {
			biased;
			_ = task_token.cancelled() => Err(ControllerError::Cancelled(CancelReason::IdleTask)),
			result = wait_quiet_then_run(&core, entry, args) => result,
		};
		core.idle_tasks().complete(id);
		let _ = tx.send(result);
	});
	IdleTicket { token, rx }
}

/// Waits for quiesce plus the host idle callback, then enqueues.
async fn wait_quiet_then_run(
	core: &Arc<ControllerCore>,
	entry: Arc<ActionEntry>,
	args: Vec<Value>,
) -> Result<Value, ControllerError> {
	let mut phase = core.queue().phase();
	loop {
		while *phase.borrow_and_update() != QueuePhase::Idle {
			if phase.changed().await.is_err() {
				return Err(ControllerError::Cancelled(CancelReason::IdleTask));
			}
		}
		tokio::select! {
			biased;
			reactivated = wait_for_active(&mut phase) => {
				if reactivated.is_err() {
					return Err(ControllerError::Cancelled(CancelReason::IdleTask));
				}
				continue;
			}
			_ = tokio::time::sleep(IDLE_QUIESCE) => {}
		}
		core.host().request_idle().await;
		break;
	}
	tracing::trace!(action = %entry.id(), "idle.fire");
	core.enqueue_entry(&entry, args)?.await
}

async fn wait_for_active(phase: &mut watch::Receiver<QueuePhase>) -> Result<(), watch::error::RecvError> {
	loop {
		phase.changed().await?;
		if *phase.borrow_and_update() == QueuePhase::Active {
			return Ok(());
		}
	}
}
