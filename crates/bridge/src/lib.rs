//! Interface contracts between the action controller and its collaborators.
//!
//! The controller never talks to the panel UI, the native host editor, or
//! the preferences store directly. It is injected with the three trait
//! objects defined here, which keeps the controller testable and keeps the
//! host bridge swappable. Implementations live with their owners; this
//! crate only carries the contracts, the shared event names, and in-memory
//! test doubles.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

pub mod test_support;

/// Boxed future used at the bridge trait seams.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Handler invoked for a subscribed host event.
pub type HostHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Publish/subscribe channel to the panel store layer.
///
/// The bus is the only permitted channel for broadcasting state changes;
/// action bodies must not mutate other components' state directly.
pub trait EventBus: Send + Sync {
	/// Delivers one event to every store synchronously.
	fn dispatch(&self, event: &str, payload: Value);
}

/// Bridge to the native host image editor.
pub trait HostDescriptor: Send + Sync {
	/// Returns true while the host holds a modal tool state.
	fn modal_tool_active(&self) -> bool;

	/// Ends the host's modal tool state.
	///
	/// Rejections from an already-ended state are the caller's to swallow.
	fn end_modal_tool_state(&self, force: bool) -> BoxFuture<anyhow::Result<()>>;

	/// Resolves when the host runtime next reports an idle window.
	fn request_idle(&self) -> BoxFuture<()>;

	/// Subscribes a handler to a host event stream.
	fn subscribe(&self, event: &str, handler: HostHandler);

	/// Removes every handler subscribed to a host event stream.
	fn unsubscribe(&self, event: &str);
}

/// Read access to the preferences store.
pub trait PrefStore: Send + Sync {
	/// Returns the stored value for a key, if any.
	fn get(&self, key: &str) -> Option<Value>;

	/// Returns a boolean preference, falling back to `default`.
	fn get_bool(&self, key: &str, default: bool) -> bool {
		self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
	}
}

/// Event names dispatched on the bus by the controller.
pub mod events {
	/// Global reset notification; stores clear their state on receipt.
	pub const RESET: &str = "RESET";
	/// Canvas overlays are about to be hidden for an action.
	pub const START_CANVAS_UPDATE: &str = "START_CANVAS_UPDATE";
	/// Canvas overlays may be restored.
	pub const END_CANVAS_UPDATE: &str = "END_CANVAS_UPDATE";
}

/// Preference keys consulted by the controller and its collaborators.
pub mod prefs {
	/// Run declared postconditions after each successful action.
	pub const POST_CONDITIONS_ENABLED: &str = "postConditionsEnabled";
	/// Log every synchronized action invocation.
	pub const LOG_ACTIONS: &str = "logActions";
	/// Log every in-flight transfer between actions.
	pub const LOG_ACTION_TRANSFERS: &str = "logActionTransfers";
	/// Emit policy frame diagnostics from the host bridge.
	pub const POLICY_FRAMES_ENABLED: &str = "policyFramesEnabled";
	/// Log raw host descriptor traffic.
	pub const DESCRIPTOR_LOGGING_ENABLED: &str = "descriptorLoggingEnabled";
	/// Forward usage telemetry to the host.
	pub const HEADLIGHTS_LOGGING_ENABLED: &str = "headlightsLoggingEnabled";
}
