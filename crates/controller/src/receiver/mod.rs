//! Per-action invocation context.
//!
//! Each registered action owns one receiver for the lifetime of the
//! controller. Action bodies use it to dispatch events, delegate to a
//! declared sibling action without releasing the locks already held
//! ([`transfer`](ActionReceiver::transfer)), schedule fresh top-level work
//! ([`enqueue`](ActionReceiver::enqueue)), or defer work to the next idle
//! window ([`when_idle`](ActionReceiver::when_idle)).
//!
//! The transfer queue is shared across simultaneous invocations of the
//! same action. That is sound because overlapping invocations are only
//! possible for reader-only actions, and each invocation awaits its own
//! transfer tickets in program order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use easel_bridge::EventBus;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::controller::ControllerCore;
use crate::error::{CancelReason, ControllerError};
use crate::idle::IdleTicket;
use crate::queue::{DependencyQueue, JobTicket, default_ceiling};
use crate::registry::{ActionEntry, ActionId};

/// Observable receiver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
	/// No transfer in flight.
	Idle,
	/// The transfer queue holds or runs at least one transfer.
	Transferring,
	/// A controller reset cleared the transfer queue; leaves this state on
	/// the next transfer.
	Cleared,
}

/// Invocation context tied to one registered action.
pub struct ActionReceiver {
	id: ActionId,
	transfers: FxHashSet<ActionId>,
	allow_failure: bool,
	queue: DependencyQueue,
	cleared: AtomicBool,
	core: Weak<ControllerCore>,
	bus: Arc<dyn EventBus>,
}

impl ActionReceiver {
	pub(crate) fn new(entry: &ActionEntry, core: Weak<ControllerCore>, bus: Arc<dyn EventBus>) -> Self {
		Self {
			id: entry.id().clone(),
			transfers: entry.transfers.clone(),
			allow_failure: entry.allow_failure,
			queue: DependencyQueue::new("transfer", default_ceiling()),
			cleared: AtomicBool::new(false),
			core,
			bus,
		}
	}

	/// Identifier of the action owning this receiver.
	pub fn id(&self) -> &ActionId {
		&self.id
	}

	pub fn state(&self) -> ReceiverState {
		if !self.queue.is_idle() {
			ReceiverState::Transferring
		} else if self.cleared.load(Ordering::SeqCst) {
			ReceiverState::Cleared
		} else {
			ReceiverState::Idle
		}
	}

	/// Forwards an event to the bus synchronously.
	pub fn dispatch(&self, event: &str, payload: Value) {
		self.bus.dispatch(event, payload);
	}

	/// Forwards an event to the bus on the next tick.
	///
	/// The dispatch happens whether or not the returned future is awaited;
	/// awaiting it resolves after delivery.
	pub fn dispatch_async(&self, event: &str, payload: Value) -> impl Future<Output = ()> + Send + 'static {
		let bus = Arc::clone(&self.bus);
		let event = event.to_string();
		let (tx, rx) = oneshot::channel();
		tokio::spawn(async move {
			tokio::task::yield_now().await;
			bus.dispatch(&event, payload);
			let _ = tx.send(());
		});
		async move {
			let _ = rx.await;
		}
	}

	/// Delegates to a declared transfer target under the caller's locks.
	///
	/// The target runs on this receiver's transfer queue with its own
	/// transitive lock sets; no main-queue job is pushed, so the outer
	/// action's locks stay held across the delegation. Transferring to an
	/// undeclared or unknown target is a programmer error returned
	/// synchronously. A failing transfer rejects the ticket and triggers a
	/// controller reset unless the owning action allows failure.
	pub fn transfer(&self, target: &str, args: Vec<Value>) -> Result<JobTicket, ControllerError> {
		let core = self.core()?;
		let entry = core
			.registry()
			.resolve(target)
			.cloned()
			.ok_or_else(|| ControllerError::UnknownAction(target.to_string()))?;
		if !self.transfers.contains(entry.id()) {
			tracing::error!(from = %self.id, to = %entry.id(), "transfer target not declared");
			return Err(ControllerError::IllegalTransfer {
				from: self.id.clone(),
				target: entry.id().clone(),
			});
		}
		if core.log_transfers() {
			tracing::debug!(from = %self.id, to = %entry.id(), "action.transfer");
		}
		self.cleared.store(false, Ordering::SeqCst);

		let receiver = core.receiver(entry.id())?;
		let body = Arc::clone(&entry.body);
		let action = entry.id().clone();
		let outer_allows = self.allow_failure;
		let reads = entry.reads_star();
		let writes = entry.writes_star();
		let name = entry.id().as_str().to_string();
		let ticket = self.queue.push(
			Box::new(move || {
				Box::pin(async move {
					match body(receiver, args).await {
						Ok(value) => Ok(value),
						Err(err) => {
							let err = Arc::new(err);
							if !outer_allows {
								core.reset_controller(Arc::clone(&err));
							}
							Err(ControllerError::ActionFailed { action, cause: err })
						}
					}
				})
			}),
			reads,
			writes,
			name,
		);
		Ok(ticket)
	}

	/// Schedules a fresh top-level invocation on the main queue.
	pub fn enqueue(&self, target: &str, args: Vec<Value>) -> Result<JobTicket, ControllerError> {
		self.core()?.enqueue_by_name(target, args)
	}

	/// Defers an invocation until the main queue has been idle for the
	/// quiesce window and the host reports an idle callback.
	pub fn when_idle(&self, target: &str, args: Vec<Value>) -> Result<IdleTicket, ControllerError> {
		self.core()?.when_idle(target, args)
	}

	/// Clears the transfer queue on controller reset.
	///
	/// A transfer body already executing is not aborted; it observes the
	/// reset through its own error propagation.
	pub(crate) fn reset(&self) {
		let cancelled = self.queue.remove_all(CancelReason::Reset);
		self.cleared.store(true, Ordering::SeqCst);
		if cancelled > 0 {
			tracing::debug!(action = %self.id, cancelled, "receiver.cleared");
		}
	}

	#[cfg(test)]
	pub(crate) fn transfer_queue(&self) -> &DependencyQueue {
		&self.queue
	}

	fn core(&self) -> Result<Arc<ControllerCore>, ControllerError> {
		self.core.upgrade().ok_or(ControllerError::NotRunning)
	}
}

#[cfg(test)]
mod tests;
