//! Controller orchestration: lifecycle, synchronized invocation, modal
//! preemption, UI-lock signalling, and throttled reset recovery.
//!
//! The controller is an owned object, never a process-wide global: the
//! event bus, host descriptor, and preferences store are injected so tests
//! can instantiate as many controllers as they need.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use easel_bridge::{EventBus, HostDescriptor, PrefStore, events, prefs};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{CancelReason, ControllerError};
use crate::idle::{IdleTasks, IdleTicket, spawn_idle_task};
use crate::module::Module;
use crate::queue::{DependencyQueue, JobTicket, default_ceiling};
use crate::receiver::ActionReceiver;
use crate::registry::{ActionEntry, ActionId, ActionRegistry, RegistryError};
use crate::throttle::{DEBOUNCE_GAP, DEBOUNCED_SUFFIX, Debounce, THROTTLE_WINDOW, THROTTLED_SUFFIX, Throttle};

/// First retry delay of the reset pipeline; doubles on every re-entrant
/// reset.
pub const RESET_DELAY_INITIAL: Duration = Duration::from_millis(200);

/// Ceiling on the reset retry delay. Once the stored delay exceeds this,
/// the controller emits [`ControllerEvent::Error`] and stops retrying.
pub const MAX_RETRY_WINDOW: Duration = Duration::from_millis(6400);

/// Events emitted by the controller.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
	/// Startup (or a recovery cycle) completed.
	Ready,
	/// The UI must disable input.
	Lock,
	/// The UI may re-enable input.
	Unlock,
	/// Recovery was abandoned; the host should surface the cause.
	Error { cause: Arc<anyhow::Error> },
}

struct ControllerState {
	running: bool,
	ui_locked: bool,
	allow_failure: bool,
	reset_pending: bool,
	reset_retry_delay: Duration,
}

/// Orchestrates modules, the main dependency queue, and recovery.
pub struct Controller {
	core: Arc<ControllerCore>,
}

pub(crate) struct ControllerCore {
	registry: ActionRegistry,
	modules: Vec<Arc<dyn Module>>,
	queue: DependencyQueue,
	receivers: FxHashMap<ActionId, Arc<ActionReceiver>>,
	bus: Arc<dyn EventBus>,
	host: Arc<dyn HostDescriptor>,
	prefs: Arc<dyn PrefStore>,
	events: broadcast::Sender<ControllerEvent>,
	state: Mutex<ControllerState>,
	idle: IdleTasks,
	reset_throttle: Throttle<()>,
	throttles: Mutex<FxHashMap<ActionId, Arc<Throttle<Vec<Value>>>>>,
	debounces: Mutex<FxHashMap<ActionId, Arc<Debounce<Vec<Value>>>>>,
}

impl Controller {
	/// Builds a controller over the given modules and injected bridges.
	///
	/// Modules are ordered by descending priority here; registry
	/// construction validates every action and transfer declaration.
	pub fn new(
		modules: Vec<Arc<dyn Module>>,
		bus: Arc<dyn EventBus>,
		host: Arc<dyn HostDescriptor>,
		prefs: Arc<dyn PrefStore>,
	) -> Result<Self, RegistryError> {
		let mut modules = modules;
		modules.sort_by_key(|module| Reverse(module.priority()));
		let registry = ActionRegistry::build(&modules)?;
		let (events, _) = broadcast::channel(64);
		let core = Arc::new_cyclic(|weak: &std::sync::Weak<ControllerCore>| {
			let receivers = registry
				.iter()
				.map(|entry| {
					(entry.id().clone(), Arc::new(ActionReceiver::new(entry, weak.clone(), Arc::clone(&bus))))
				})
				.collect();
			let reset_weak = weak.clone();
			let reset_throttle = Throttle::new(RESET_DELAY_INITIAL, move |()| {
				if let Some(core) = reset_weak.upgrade() {
					tokio::spawn(reset_with_delay(core));
				}
			});
			ControllerCore {
				registry,
				modules,
				queue: DependencyQueue::new("main", default_ceiling()),
				receivers,
				bus,
				host,
				prefs,
				events,
				state: Mutex::new(ControllerState {
					running: false,
					ui_locked: false,
					allow_failure: false,
					reset_pending: false,
					reset_retry_delay: RESET_DELAY_INITIAL,
				}),
				idle: IdleTasks::default(),
				reset_throttle,
				throttles: Mutex::new(FxHashMap::default()),
				debounces: Mutex::new(FxHashMap::default()),
			}
		});
		Ok(Self { core })
	}

	/// Subscribes to controller events.
	pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
		self.core.events.subscribe()
	}

	/// Starts the controller: preempts any host modal state, runs every
	/// module's `before_startup` in descending priority, marks the
	/// controller running, emits [`ControllerEvent::Ready`], then runs
	/// `after_startup` with each module's startup value.
	pub async fn start(&self) -> Result<(), ControllerError> {
		let core = &self.core;
		if core.state.lock().running {
			return Err(ControllerError::AlreadyRunning);
		}
		core.preempt_modal_state().await;

		let mut startup: FxHashMap<&'static str, Value> = FxHashMap::default();
		for module in &core.modules {
			let value = module.before_startup(false).await.map_err(|err| ControllerError::StartupFailed {
				module: module.name(),
				cause: Arc::new(err),
			})?;
			startup.insert(module.name(), value);
		}
		core.state.lock().running = true;
		core.emit(ControllerEvent::Ready);
		tracing::info!(modules = core.modules.len(), actions = core.registry.len(), "controller started");

		for module in &core.modules {
			let value = startup.remove(module.name()).unwrap_or(Value::Null);
			module.after_startup(value).await.map_err(|err| ControllerError::StartupFailed {
				module: module.name(),
				cause: Arc::new(err),
			})?;
		}
		Ok(())
	}

	/// Stops the controller: locks the UI and runs every module's
	/// `on_shutdown` in descending priority. Hook rejections are logged;
	/// shutdown always completes.
	pub async fn stop(&self) -> Result<(), ControllerError> {
		let core = &self.core;
		{
			let mut state = core.state.lock();
			if !state.running {
				return Err(ControllerError::NotRunning);
			}
			state.running = false;
		}
		core.lock_ui();
		for module in &core.modules {
			if let Err(err) = module.on_shutdown().await {
				tracing::error!(module = module.name(), error = %err, "on_shutdown failed");
			}
		}
		tracing::info!("controller stopped");
		Ok(())
	}

	/// Invokes an action by name on its synchronized surface.
	///
	/// Resolution order: an exact identifier wins; otherwise the
	/// `Throttled`/`Debounced` suffixes select the rate-limited variants
	/// (which resolve immediately with `Null` once scheduled). Private
	/// actions (leaf name starting with `_`) are passed through without
	/// queueing, modal preemption, or UI signalling.
	pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ControllerError> {
		let core = &self.core;
		if let Some(entry) = core.registry.resolve(name).cloned() {
			if entry.private {
				let receiver = core.receiver(entry.id())?;
				let action = entry.id().clone();
				return (entry.body)(receiver, args)
					.await
					.map_err(|err| ControllerError::ActionFailed { action, cause: Arc::new(err) });
			}
			return core.enqueue_entry(&entry, args)?.await;
		}
		if let Some(base) = name.strip_suffix(THROTTLED_SUFFIX) {
			let entry = core.registry.resolve(base).cloned().ok_or_else(|| ControllerError::UnknownAction(name.to_string()))?;
			core.throttled(&entry).call(args);
			return Ok(Value::Null);
		}
		if let Some(base) = name.strip_suffix(DEBOUNCED_SUFFIX) {
			let entry = core.registry.resolve(base).cloned().ok_or_else(|| ControllerError::UnknownAction(name.to_string()))?;
			core.debounced(&entry).call(args);
			return Ok(Value::Null);
		}
		Err(ControllerError::UnknownAction(name.to_string()))
	}

	/// Pushes a synchronized invocation and returns its ticket without
	/// awaiting it. Suffix variants and private actions are not accepted
	/// here; use [`call`](Controller::call) for those.
	pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<JobTicket, ControllerError> {
		self.core.enqueue_by_name(name, args)
	}

	/// Defers an invocation to the next quiet idle window.
	pub fn when_idle(&self, name: &str, args: Vec<Value>) -> Result<IdleTicket, ControllerError> {
		self.core.when_idle(name, args)
	}

	pub fn is_running(&self) -> bool {
		self.core.state.lock().running
	}

	pub fn is_ui_locked(&self) -> bool {
		self.core.state.lock().ui_locked
	}

	/// Returns true when the main queue has no active or pending job.
	pub fn is_idle(&self) -> bool {
		self.core.queue.is_idle()
	}

	#[cfg(test)]
	pub(crate) fn core(&self) -> &Arc<ControllerCore> {
		&self.core
	}
}

impl ControllerCore {
	pub(crate) fn registry(&self) -> &ActionRegistry {
		&self.registry
	}

	pub(crate) fn queue(&self) -> &DependencyQueue {
		&self.queue
	}

	pub(crate) fn host(&self) -> &Arc<dyn HostDescriptor> {
		&self.host
	}

	pub(crate) fn idle_tasks(&self) -> &IdleTasks {
		&self.idle
	}

	pub(crate) fn log_transfers(&self) -> bool {
		self.prefs.get_bool(prefs::LOG_ACTION_TRANSFERS, false)
	}

	fn log_actions(&self) -> bool {
		self.prefs.get_bool(prefs::LOG_ACTIONS, false)
	}

	pub(crate) fn receiver(&self, id: &ActionId) -> Result<Arc<ActionReceiver>, ControllerError> {
		self.receivers
			.get(id)
			.cloned()
			.ok_or_else(|| ControllerError::UnknownAction(id.as_str().to_string()))
	}

	pub(crate) fn enqueue_by_name(self: &Arc<Self>, name: &str, args: Vec<Value>) -> Result<JobTicket, ControllerError> {
		let entry = self
			.registry
			.resolve(name)
			.cloned()
			.ok_or_else(|| ControllerError::UnknownAction(name.to_string()))?;
		self.enqueue_entry(&entry, args)
	}

	/// Pushes one top-level invocation onto the main queue with the
	/// action's transitive lock sets.
	pub(crate) fn enqueue_entry(self: &Arc<Self>, entry: &Arc<ActionEntry>, args: Vec<Value>) -> Result<JobTicket, ControllerError> {
		let receiver = self.receiver(entry.id())?;
		if self.log_actions() {
			tracing::debug!(action = %entry.id(), "action.enqueue");
		}
		let core = Arc::clone(self);
		let entry = Arc::clone(entry);
		let reads = entry.reads_star();
		let writes = entry.writes_star();
		let name = entry.id().as_str().to_string();
		Ok(self.queue.push(
			Box::new(move || Box::pin(run_action(core, entry, receiver, args))),
			reads,
			writes,
			name,
		))
	}

	pub(crate) fn when_idle(self: &Arc<Self>, name: &str, args: Vec<Value>) -> Result<IdleTicket, ControllerError> {
		let entry = self
			.registry
			.resolve(name)
			.cloned()
			.ok_or_else(|| ControllerError::UnknownAction(name.to_string()))?;
		Ok(spawn_idle_task(self, entry, args))
	}

	/// Cancels pending work everywhere and schedules throttled recovery.
	///
	/// Active jobs are left to complete or reject on their own. When the
	/// controller is not running, or the retry delay has outgrown
	/// [`MAX_RETRY_WINDOW`], recovery is abandoned: the delay returns to
	/// its initial value and [`ControllerEvent::Error`] carries the cause.
	pub(crate) fn reset_controller(self: &Arc<Self>, cause: Arc<anyhow::Error>) {
		let cancelled = self.queue.remove_all(CancelReason::Reset);
		for receiver in self.receivers.values() {
			receiver.reset();
		}
		self.idle.cancel_all();

		let recover = {
			let mut state = self.state.lock();
			if !state.running || state.reset_retry_delay > MAX_RETRY_WINDOW {
				state.reset_retry_delay = RESET_DELAY_INITIAL;
				false
			} else {
				state.reset_pending = true;
				true
			}
		};
		tracing::warn!(cancelled, recover, error = %cause, "controller reset");
		if !recover {
			self.emit(ControllerEvent::Error { cause });
			return;
		}
		self.lock_ui();
		self.reset_throttle.call(());
	}

	async fn preempt_modal_state(&self) {
		if !self.host.modal_tool_active() {
			return;
		}
		if let Err(err) = self.host.end_modal_tool_state(true).await {
			tracing::debug!(error = %err, "modal tool state preemption rejected");
		}
	}

	fn throttled(self: &Arc<Self>, entry: &Arc<ActionEntry>) -> Arc<Throttle<Vec<Value>>> {
		let mut throttles = self.throttles.lock();
		Arc::clone(throttles.entry(entry.id().clone()).or_insert_with(|| {
			let weak = Arc::downgrade(self);
			let entry = Arc::clone(entry);
			Arc::new(Throttle::new(THROTTLE_WINDOW, move |args| {
				if let Some(core) = weak.upgrade() {
					let _ = core.enqueue_entry(&entry, args);
				}
			}))
		}))
	}

	fn debounced(self: &Arc<Self>, entry: &Arc<ActionEntry>) -> Arc<Debounce<Vec<Value>>> {
		let mut debounces = self.debounces.lock();
		Arc::clone(debounces.entry(entry.id().clone()).or_insert_with(|| {
			let weak = Arc::downgrade(self);
			let entry = Arc::clone(entry);
			Arc::new(Debounce::new(DEBOUNCE_GAP, move |args| {
				if let Some(core) = weak.upgrade() {
					let _ = core.enqueue_entry(&entry, args);
				}
			}))
		}))
	}

	fn emit(&self, event: ControllerEvent) {
		let _ = self.events.send(event);
	}

	fn lock_ui(&self) {
		self.state.lock().ui_locked = true;
		self.emit(ControllerEvent::Lock);
	}

	fn unlock_ui(&self) {
		self.state.lock().ui_locked = false;
		self.emit(ControllerEvent::Unlock);
	}

	#[cfg(test)]
	pub(crate) fn reset_retry_delay(&self) -> Duration {
		self.state.lock().reset_retry_delay
	}

	#[cfg(test)]
	pub(crate) fn allow_failure_flag(&self) -> bool {
		self.state.lock().allow_failure
	}

	#[cfg(test)]
	pub(crate) fn is_reset_pending(&self) -> bool {
		self.state.lock().reset_pending
	}
}

/// Runs one synchronized invocation: modal preemption, overlay and
/// UI-lock signalling, the body itself, postconditions, and the failure
/// path.
async fn run_action(
	core: Arc<ControllerCore>,
	entry: Arc<ActionEntry>,
	receiver: Arc<ActionReceiver>,
	args: Vec<Value>,
) -> Result<Value, ControllerError> {
	if !entry.modal && core.host.modal_tool_active() {
		// A rejection from an already-ended modal state is swallowed.
		if let Err(err) = core.host.end_modal_tool_state(true).await {
			tracing::debug!(action = %entry.id(), error = %err, "modal tool state preemption rejected");
		}
	}
	if entry.hide_overlays {
		core.bus.dispatch(events::START_CANVAS_UPDATE, Value::Null);
	}
	if entry.lock_ui {
		core.lock_ui();
	}
	if entry.allow_failure {
		core.state.lock().allow_failure = true;
	}
	if core.log_actions() {
		tracing::debug!(action = %entry.id(), "action.start");
	}

	let result = (entry.body)(receiver, args).await;

	if entry.hide_overlays {
		core.bus.dispatch(events::END_CANVAS_UPDATE, Value::Null);
	}
	if entry.lock_ui {
		core.unlock_ui();
	}
	if entry.allow_failure {
		core.state.lock().allow_failure = false;
	}

	match result {
		Ok(value) => {
			if !entry.post.is_empty() && core.prefs.get_bool(prefs::POST_CONDITIONS_ENABLED, false) {
				run_postconditions(&entry).await;
			}
			if core.log_actions() {
				tracing::debug!(action = %entry.id(), "action.finish");
			}
			Ok(value)
		}
		Err(err) => {
			let err = Arc::new(err);
			if entry.allow_failure {
				tracing::debug!(action = %entry.id(), error = %err, "action failure allowed");
				Ok(Value::Null)
			} else {
				tracing::error!(action = %entry.id(), error = %err, "action failed");
				core.reset_controller(Arc::clone(&err));
				Err(ControllerError::ActionFailed {
					action: entry.id().clone(),
					cause: err,
				})
			}
		}
	}
}

/// Runs every declared postcondition concurrently, logging rejections.
async fn run_postconditions(entry: &ActionEntry) {
	let mut checks: FuturesUnordered<_> = entry.post.iter().map(|check| check()).collect();
	while let Some(result) = checks.next().await {
		if let Err(err) = result {
			tracing::warn!(action = %entry.id(), error = %err, "postcondition failed");
		}
	}
}

/// One recovery cycle, entered through the trailing-edge reset throttle.
///
/// The stored delay doubles up front so concurrent failures always see a
/// larger window. A lifecycle rejection during recovery re-enters
/// `reset_controller`, which either schedules the next attempt or gives up
/// past [`MAX_RETRY_WINDOW`]. After a quiet full delay the backoff returns
/// to its initial value.
async fn reset_with_delay(core: Arc<ControllerCore>) {
	let delay = {
		let mut state = core.state.lock();
		let delay = state.reset_retry_delay;
		state.reset_retry_delay = delay * 2;
		state.reset_pending = false;
		delay
	};
	tracing::info!(delay_ms = delay.as_millis() as u64, "controller recovery");
	core.bus.dispatch(events::RESET, Value::Null);
	if let Err(err) = core.host.end_modal_tool_state(true).await {
		tracing::debug!(error = %err, "modal tool state preemption rejected");
	}

	let mut failure: Option<Arc<anyhow::Error>> = None;
	for module in &core.modules {
		if let Err(err) = module.on_reset().await {
			tracing::error!(module = module.name(), error = %err, "on_reset failed");
			failure.get_or_insert(Arc::new(err));
		}
	}
	let mut startup: FxHashMap<&'static str, Value> = FxHashMap::default();
	for module in &core.modules {
		match module.before_startup(true).await {
			Ok(value) => {
				startup.insert(module.name(), value);
			}
			Err(err) => {
				tracing::error!(module = module.name(), error = %err, "before_startup failed during recovery");
				failure.get_or_insert(Arc::new(err));
			}
		}
	}
	for module in &core.modules {
		let value = startup.remove(module.name()).unwrap_or(Value::Null);
		if let Err(err) = module.after_startup(value).await {
			tracing::error!(module = module.name(), error = %err, "after_startup failed during recovery");
			failure.get_or_insert(Arc::new(err));
		}
	}

	if let Some(cause) = failure {
		core.reset_controller(cause);
		return;
	}

	core.unlock_ui();
	core.emit(ControllerEvent::Ready);

	tokio::time::sleep(delay).await;
	let mut state = core.state.lock();
	if !state.reset_pending {
		state.reset_retry_delay = RESET_DELAY_INITIAL;
	}
}
