//! Per-module lifecycle contract.
//!
//! A module owns a set of action definitions and optional lifecycle hooks.
//! The controller drives the hooks module-by-module in descending
//! [`priority`](Module::priority) order, at startup, on every reset cycle,
//! and at shutdown.

use async_trait::async_trait;
use serde_json::Value;

use crate::registry::ActionDef;

/// One panel module: a bundle of actions plus lifecycle hooks.
#[async_trait]
pub trait Module: Send + Sync {
	/// Module name; the prefix of its actions' dotted identifiers.
	fn name(&self) -> &'static str;

	/// Startup/reset ordering priority; higher runs first.
	fn priority(&self) -> i32 {
		0
	}

	/// Action definitions owned by this module.
	fn actions(&self) -> Vec<ActionDef> {
		Vec::new()
	}

	/// Runs before the controller marks itself ready.
	///
	/// `restart` is true when invoked from the reset pipeline. The return
	/// value is handed back to [`after_startup`](Module::after_startup).
	async fn before_startup(&self, restart: bool) -> anyhow::Result<Value> {
		let _ = restart;
		Ok(Value::Null)
	}

	/// Runs once the controller is ready, with this module's
	/// `before_startup` value.
	async fn after_startup(&self, startup: Value) -> anyhow::Result<()> {
		let _ = startup;
		Ok(())
	}

	/// Runs at the start of every recovery cycle.
	async fn on_reset(&self) -> anyhow::Result<()> {
		Ok(())
	}

	/// Runs when the controller stops.
	async fn on_shutdown(&self) -> anyhow::Result<()> {
		Ok(())
	}
}
