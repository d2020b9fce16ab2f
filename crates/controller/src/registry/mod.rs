//! Action definitions and the registry resolving them.
//!
//! Modules author [`ActionDef`]s; the registry indexes them under dotted
//! `"module.name"` identifiers, resolves declared transfer targets to
//! interned [`ActionId`]s, and precomputes each action's transitive lock
//! closures across its transfer graph. All validation happens at build
//! time so the runtime never schedules against an unresolved target.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use easel_bridge::BoxFuture;
use easel_locks::LockSet;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::module::Module;
use crate::receiver::ActionReceiver;

/// Invocation context handed to an action body.
pub type ActionContext = Arc<ActionReceiver>;

/// Future returned by an action body.
pub type ActionFuture = BoxFuture<anyhow::Result<Value>>;

/// An action body: invoked with its receiver and the caller's arguments.
pub type ActionBody = Arc<dyn Fn(ActionContext, Vec<Value>) -> ActionFuture + Send + Sync>;

/// Postcondition check run after a successful invocation under the debug
/// preference.
pub type PostCondition = Arc<dyn Fn() -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// Interned dotted action identifier, `"module.name"`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ActionId(Arc<str>);

impl ActionId {
	fn new(module: &str, name: &str) -> Self {
		Self(Arc::from(format!("{module}.{name}")))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ActionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl fmt::Debug for ActionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ActionId({})", self.0)
	}
}

impl Borrow<str> for ActionId {
	fn borrow(&self) -> &str {
		&self.0
	}
}

/// Declaration of one action, as authored by a module.
///
/// Lock sets default to [`LockSet::ALL`] when absent; reads are always
/// widened by writes. Built with chained setters:
///
/// ```ignore
/// ActionDef::new("select", body)
/// 	.writes(LockSet::PS_DOC | LockSet::JS_DOC)
/// 	.transfers(["layers.commit"])
/// 	.lock_ui()
/// ```
#[derive(Clone)]
pub struct ActionDef {
	pub(crate) name: &'static str,
	pub(crate) body: ActionBody,
	pub(crate) reads: Option<LockSet>,
	pub(crate) writes: Option<LockSet>,
	pub(crate) transfers: Vec<String>,
	pub(crate) modal: bool,
	pub(crate) lock_ui: bool,
	pub(crate) hide_overlays: bool,
	pub(crate) allow_failure: bool,
	pub(crate) post: Vec<PostCondition>,
}

impl ActionDef {
	/// Creates a definition with default flags and lock sets.
	pub fn new<F>(name: &'static str, body: F) -> Self
	where
		F: Fn(ActionContext, Vec<Value>) -> ActionFuture + Send + Sync + 'static,
	{
		Self {
			name,
			body: Arc::new(body),
			reads: None,
			writes: None,
			transfers: Vec::new(),
			modal: false,
			lock_ui: false,
			hide_overlays: false,
			allow_failure: false,
			post: Vec::new(),
		}
	}

	/// Declares the read lock set.
	pub fn reads(mut self, locks: LockSet) -> Self {
		self.reads = Some(locks);
		self
	}

	/// Declares the write lock set.
	pub fn writes(mut self, locks: LockSet) -> Self {
		self.writes = Some(locks);
		self
	}

	/// Declares the dotted identifiers this action may transfer to.
	pub fn transfers<I, S>(mut self, targets: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.transfers = targets.into_iter().map(Into::into).collect();
		self
	}

	/// Marks the action as compatible with the host's modal tool state.
	pub fn modal(mut self) -> Self {
		self.modal = true;
		self
	}

	/// Emits the lock/unlock UI signal around the invocation.
	pub fn lock_ui(mut self) -> Self {
		self.lock_ui = true;
		self
	}

	/// Dispatches canvas-update start/end events around the invocation.
	pub fn hide_overlays(mut self) -> Self {
		self.hide_overlays = true;
		self
	}

	/// Swallows body failures instead of triggering a reset.
	pub fn allow_failure(mut self) -> Self {
		self.allow_failure = true;
		self
	}

	/// Adds a postcondition check.
	pub fn post<F>(mut self, check: F) -> Self
	where
		F: Fn() -> BoxFuture<anyhow::Result<()>> + Send + Sync + 'static,
	{
		self.post.push(Arc::new(check));
		self
	}
}

/// A resolved action: declaration plus interned id, resolved transfer
/// targets, and transitive lock closures.
pub struct ActionEntry {
	pub(crate) id: ActionId,
	pub(crate) body: ActionBody,
	pub(crate) reads: LockSet,
	pub(crate) writes: LockSet,
	pub(crate) reads_star: LockSet,
	pub(crate) writes_star: LockSet,
	pub(crate) transfers: FxHashSet<ActionId>,
	pub(crate) modal: bool,
	pub(crate) lock_ui: bool,
	pub(crate) hide_overlays: bool,
	pub(crate) allow_failure: bool,
	pub(crate) post: Vec<PostCondition>,
	pub(crate) private: bool,
}

impl ActionEntry {
	pub fn id(&self) -> &ActionId {
		&self.id
	}

	/// Declared reads widened by writes.
	pub fn reads(&self) -> LockSet {
		self.reads
	}

	pub fn writes(&self) -> LockSet {
		self.writes
	}

	/// Read closure across the transfer graph; what the queue schedules on.
	pub fn reads_star(&self) -> LockSet {
		self.reads_star
	}

	/// Write closure across the transfer graph.
	pub fn writes_star(&self) -> LockSet {
		self.writes_star
	}
}

/// Registry construction failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
	/// Two modules (or one module twice) declared the same identifier.
	#[error("duplicate action id: {0}")]
	DuplicateAction(String),

	/// A declared transfer target does not resolve to a known action.
	#[error("action {action} declares unknown transfer target {target}")]
	UnknownTransferTarget { action: String, target: String },
}

/// Index of every registered action.
pub struct ActionRegistry {
	entries: FxHashMap<ActionId, Arc<ActionEntry>>,
}

impl ActionRegistry {
	/// Builds the registry from the modules' action definitions.
	///
	/// Transfer targets are resolved to interned ids here, so the
	/// receiver's runtime legality check can compare ids alone.
	pub fn build(modules: &[Arc<dyn Module>]) -> Result<Self, RegistryError> {
		let mut defs: Vec<(ActionId, ActionDef)> = Vec::new();
		let mut ids: FxHashSet<ActionId> = FxHashSet::default();
		for module in modules {
			for def in module.actions() {
				let id = ActionId::new(module.name(), def.name);
				if !ids.insert(id.clone()) {
					return Err(RegistryError::DuplicateAction(id.as_str().to_string()));
				}
				defs.push((id, def));
			}
		}

		// Resolve declared transfers and normalize lock declarations.
		let all_ids: Vec<ActionId> = defs.iter().map(|(id, _)| id.clone()).collect();
		let mut transfers: Vec<Vec<usize>> = Vec::with_capacity(defs.len());
		let mut reads: Vec<LockSet> = Vec::with_capacity(defs.len());
		let mut writes: Vec<LockSet> = Vec::with_capacity(defs.len());
		let index: FxHashMap<&str, usize> = all_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
		for (id, def) in &defs {
			let mut targets = Vec::with_capacity(def.transfers.len());
			for target in &def.transfers {
				let Some(&target_index) = index.get(target.as_str()) else {
					return Err(RegistryError::UnknownTransferTarget {
						action: id.as_str().to_string(),
						target: target.clone(),
					});
				};
				targets.push(target_index);
			}
			transfers.push(targets);

			if def.writes.is_none() {
				tracing::warn!(action = %id, "action declares no writes; assuming all locks");
			}
			let declared_writes = def.writes.unwrap_or(LockSet::ALL);
			writes.push(declared_writes);
			reads.push(def.reads.unwrap_or(LockSet::ALL) | declared_writes);
		}

		let mut entries = FxHashMap::default();
		for (i, (id, def)) in defs.into_iter().enumerate() {
			let (reads_star, writes_star) = closure(i, &transfers, &reads, &writes);
			let private = def.name.starts_with('_');
			entries.insert(
				id.clone(),
				Arc::new(ActionEntry {
					id,
					body: def.body,
					reads: reads[i],
					writes: writes[i],
					reads_star,
					writes_star,
					transfers: transfers[i].iter().map(|&t| all_ids[t].clone()).collect(),
					modal: def.modal,
					lock_ui: def.lock_ui,
					hide_overlays: def.hide_overlays,
					allow_failure: def.allow_failure,
					post: def.post,
					private,
				}),
			);
		}
		Ok(Self { entries })
	}

	/// Resolves a dotted identifier.
	pub fn resolve(&self, name: &str) -> Option<&Arc<ActionEntry>> {
		self.entries.get(name)
	}

	/// Looks up a resolved entry by id.
	pub fn get(&self, id: &ActionId) -> Option<&Arc<ActionEntry>> {
		self.entries.get(id)
	}

	/// Iterates every resolved entry.
	pub fn iter(&self) -> impl Iterator<Item = &Arc<ActionEntry>> {
		self.entries.values()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

/// Depth-first union of declared lock sets across the transfer graph.
///
/// The visited set truncates cycles; each action appears once in its own
/// closure.
fn closure(root: usize, transfers: &[Vec<usize>], reads: &[LockSet], writes: &[LockSet]) -> (LockSet, LockSet) {
	let mut reads_star = LockSet::empty();
	let mut writes_star = LockSet::empty();
	let mut visited = FxHashSet::default();
	let mut stack = vec![root];
	while let Some(node) = stack.pop() {
		if !visited.insert(node) {
			continue;
		}
		reads_star |= reads[node];
		writes_star |= writes[node];
		stack.extend(&transfers[node]);
	}
	(reads_star, writes_star)
}

#[cfg(test)]
mod tests;
