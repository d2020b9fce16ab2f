//! Shared fixtures for controller tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use easel_bridge::test_support::{FakeHost, MemoryPrefs, RecordingBus};
use easel_bridge::{EventBus, HostDescriptor, PrefStore};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::controller::{Controller, ControllerEvent};
use crate::module::Module;
use crate::registry::{ActionContext, ActionDef, ActionFuture};

pub(crate) type Log = Arc<Mutex<Vec<String>>>;

pub(crate) fn new_log() -> Log {
	Arc::new(Mutex::new(Vec::new()))
}

/// Module fixture recording its lifecycle hooks into a shared log.
pub(crate) struct TestModule {
	name: &'static str,
	priority: i32,
	defs: Vec<ActionDef>,
	log: Log,
	startup_value: Value,
	fail_before_startup: Arc<AtomicBool>,
}

impl TestModule {
	pub fn new(name: &'static str, log: &Log) -> Self {
		Self {
			name,
			priority: 0,
			defs: Vec::new(),
			log: Arc::clone(log),
			startup_value: Value::Null,
			fail_before_startup: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn priority(mut self, priority: i32) -> Self {
		self.priority = priority;
		self
	}

	pub fn action(mut self, def: ActionDef) -> Self {
		self.defs.push(def);
		self
	}

	pub fn startup_value(mut self, value: Value) -> Self {
		self.startup_value = value;
		self
	}

	/// Flag making `before_startup` reject while set.
	pub fn fail_before_startup_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.fail_before_startup)
	}
}

#[async_trait]
impl Module for TestModule {
	fn name(&self) -> &'static str {
		self.name
	}

	fn priority(&self) -> i32 {
		self.priority
	}

	fn actions(&self) -> Vec<ActionDef> {
		self.defs.clone()
	}

	async fn before_startup(&self, restart: bool) -> anyhow::Result<Value> {
		self.log.lock().push(format!("{}.before_startup({restart})", self.name));
		if self.fail_before_startup.load(Ordering::SeqCst) {
			anyhow::bail!("{} refused to start", self.name);
		}
		Ok(self.startup_value.clone())
	}

	async fn after_startup(&self, startup: Value) -> anyhow::Result<()> {
		self.log.lock().push(format!("{}.after_startup({startup})", self.name));
		Ok(())
	}

	async fn on_reset(&self) -> anyhow::Result<()> {
		self.log.lock().push(format!("{}.on_reset", self.name));
		Ok(())
	}

	async fn on_shutdown(&self) -> anyhow::Result<()> {
		self.log.lock().push(format!("{}.on_shutdown", self.name));
		Ok(())
	}
}

/// Action whose body resolves immediately with its own name.
pub(crate) fn ok_action(name: &'static str) -> ActionDef {
	ActionDef::new(name, move |_ctx: ActionContext, _args: Vec<Value>| -> ActionFuture {
		Box::pin(async move { Ok(json!(name)) })
	})
}

/// Action whose body always rejects.
pub(crate) fn failing_action(name: &'static str) -> ActionDef {
	ActionDef::new(name, move |_ctx: ActionContext, _args: Vec<Value>| -> ActionFuture {
		Box::pin(async move { Err(anyhow::anyhow!("{name} exploded")) })
	})
}

pub(crate) struct Fixture {
	pub controller: Controller,
	pub bus: Arc<RecordingBus>,
	pub host: Arc<FakeHost>,
	pub prefs: Arc<MemoryPrefs>,
}

/// Builds a controller over the modules with recording bridge doubles.
pub(crate) fn fixture(modules: Vec<Arc<dyn Module>>) -> Fixture {
	let bus = Arc::new(RecordingBus::new());
	let host = Arc::new(FakeHost::new());
	let prefs = Arc::new(MemoryPrefs::new());
	let controller = Controller::new(
		modules,
		Arc::clone(&bus) as Arc<dyn EventBus>,
		Arc::clone(&host) as Arc<dyn HostDescriptor>,
		Arc::clone(&prefs) as Arc<dyn PrefStore>,
	)
	.expect("fixture registry must build");
	Fixture { controller, bus, host, prefs }
}

/// Lets spawned jobs and timers run up to their next suspension point.
pub(crate) async fn settle() {
	for _ in 0..32 {
		tokio::task::yield_now().await;
	}
}

/// Drains every event already delivered to the subscription.
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<ControllerEvent>) -> Vec<&'static str> {
	let mut names = Vec::new();
	while let Ok(event) = rx.try_recv() {
		names.push(match event {
			ControllerEvent::Ready => "ready",
			ControllerEvent::Lock => "lock",
			ControllerEvent::Unlock => "unlock",
			ControllerEvent::Error { .. } => "error",
		});
	}
	names
}
