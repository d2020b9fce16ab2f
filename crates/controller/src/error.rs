//! Controller error taxonomy.
//!
//! Programmer errors (illegal transfers, unknown actions, lifecycle misuse)
//! are distinct variants surfaced to the caller synchronously; they never
//! trigger a reset by themselves. Operational failures carry the action
//! body's error as an `Arc` so the same cause can reach both the awaiting
//! caller and the reset path.

use std::fmt;
use std::sync::Arc;

use crate::registry::ActionId;

/// Error produced by the controller, its queues, and its receivers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControllerError {
	/// No action is registered under this dotted identifier.
	#[error("unknown action: {0}")]
	UnknownAction(String),

	/// An action body transferred to a target outside its declared set.
	#[error("action {from} is not declared to transfer to {target}")]
	IllegalTransfer { from: ActionId, target: ActionId },

	/// `start` was called while the controller is running.
	#[error("controller is already running")]
	AlreadyRunning,

	/// `stop` was called while the controller is not running, or a
	/// receiver outlived its controller.
	#[error("controller is not running")]
	NotRunning,

	/// A module lifecycle hook rejected during startup.
	#[error("module {module} failed during startup: {cause}")]
	StartupFailed { module: &'static str, cause: Arc<anyhow::Error> },

	/// An action body rejected.
	#[error("action {action} failed: {cause}")]
	ActionFailed { action: ActionId, cause: Arc<anyhow::Error> },

	/// The job was cancelled before or instead of completing.
	#[error("action cancelled: {0}")]
	Cancelled(CancelReason),
}

/// Why a job or idle task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
	/// The queue's pending jobs were cleared.
	QueueCleared,
	/// A controller reset cancelled pending work.
	Reset,
	/// The idle task was cancelled before it fired.
	IdleTask,
}

impl fmt::Display for CancelReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::QueueCleared => f.write_str("queue cleared"),
			Self::Reset => f.write_str("controller reset"),
			Self::IdleTask => f.write_str("idle task cancelled"),
		}
	}
}
