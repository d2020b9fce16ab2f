//! In-memory doubles for the bridge contracts, shared by controller tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::{BoxFuture, EventBus, HostDescriptor, HostHandler, PrefStore};

/// Event bus that records every dispatch.
#[derive(Default)]
pub struct RecordingBus {
	events: Mutex<Vec<(String, Value)>>,
}

impl RecordingBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns a snapshot of every dispatched `(event, payload)` pair.
	pub fn events(&self) -> Vec<(String, Value)> {
		self.events.lock().clone()
	}

	/// Returns the dispatched event names in order.
	pub fn names(&self) -> Vec<String> {
		self.events.lock().iter().map(|(name, _)| name.clone()).collect()
	}

	/// Drains the recorded events.
	pub fn take(&self) -> Vec<(String, Value)> {
		std::mem::take(&mut self.events.lock())
	}
}

impl EventBus for RecordingBus {
	fn dispatch(&self, event: &str, payload: Value) {
		self.events.lock().push((event.to_string(), payload));
	}
}

/// Host descriptor double with scriptable modal state and idle callback.
pub struct FakeHost {
	modal: AtomicBool,
	fail_end_modal: AtomicBool,
	end_modal_calls: AtomicUsize,
	idle_immediate: AtomicBool,
	idle_notify: Arc<Notify>,
	handlers: Mutex<HashMap<String, Vec<HostHandler>>>,
}

impl Default for FakeHost {
	fn default() -> Self {
		Self {
			modal: AtomicBool::new(false),
			fail_end_modal: AtomicBool::new(false),
			end_modal_calls: AtomicUsize::new(0),
			idle_immediate: AtomicBool::new(true),
			idle_notify: Arc::new(Notify::new()),
			handlers: Mutex::new(HashMap::new()),
		}
	}
}

impl FakeHost {
	pub fn new() -> Self {
		Self::default()
	}

	/// Puts the fake host into (or out of) a modal tool state.
	pub fn set_modal(&self, modal: bool) {
		self.modal.store(modal, Ordering::SeqCst);
	}

	/// Makes subsequent `end_modal_tool_state` calls reject.
	pub fn fail_end_modal(&self, fail: bool) {
		self.fail_end_modal.store(fail, Ordering::SeqCst);
	}

	/// Returns how many times `end_modal_tool_state` was called.
	pub fn end_modal_calls(&self) -> usize {
		self.end_modal_calls.load(Ordering::SeqCst)
	}

	/// Holds `request_idle` futures until [`FakeHost::fire_idle`] is called.
	pub fn defer_idle(&self) {
		self.idle_immediate.store(false, Ordering::SeqCst);
	}

	/// Releases every pending `request_idle` future.
	pub fn fire_idle(&self) {
		self.idle_notify.notify_waiters();
	}

	/// Invokes every handler subscribed to `event`.
	pub fn emit(&self, event: &str, payload: Value) {
		let handlers: Vec<HostHandler> = self.handlers.lock().get(event).cloned().unwrap_or_default();
		for handler in handlers {
			handler(payload.clone());
		}
	}

	/// Returns how many handlers are subscribed to `event`.
	pub fn handler_count(&self, event: &str) -> usize {
		self.handlers.lock().get(event).map_or(0, Vec::len)
	}
}

impl HostDescriptor for FakeHost {
	fn modal_tool_active(&self) -> bool {
		self.modal.load(Ordering::SeqCst)
	}

	fn end_modal_tool_state(&self, _force: bool) -> BoxFuture<anyhow::Result<()>> {
		self.end_modal_calls.fetch_add(1, Ordering::SeqCst);
		self.modal.store(false, Ordering::SeqCst);
		let fail = self.fail_end_modal.load(Ordering::SeqCst);
		Box::pin(async move {
			if fail {
				Err(anyhow::anyhow!("modal tool state already ended"))
			} else {
				Ok(())
			}
		})
	}

	fn request_idle(&self) -> BoxFuture<()> {
		if self.idle_immediate.load(Ordering::SeqCst) {
			return Box::pin(std::future::ready(()));
		}
		let notify = Arc::clone(&self.idle_notify);
		Box::pin(async move {
			notify.notified().await;
		})
	}

	fn subscribe(&self, event: &str, handler: HostHandler) {
		self.handlers.lock().entry(event.to_string()).or_default().push(handler);
	}

	fn unsubscribe(&self, event: &str) {
		self.handlers.lock().remove(event);
	}
}

/// Preferences store backed by an in-memory map.
#[derive(Default)]
pub struct MemoryPrefs {
	values: Mutex<HashMap<String, Value>>,
}

impl MemoryPrefs {
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets one preference value.
	pub fn set(&self, key: &str, value: Value) {
		self.values.lock().insert(key.to_string(), value);
	}
}

impl PrefStore for MemoryPrefs {
	fn get(&self, key: &str) -> Option<Value> {
		self.values.lock().get(key).cloned()
	}
}
