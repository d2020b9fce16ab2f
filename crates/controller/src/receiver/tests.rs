use std::sync::Arc;

use easel_locks::LockSet;
use serde_json::{Value, json};
use tokio::sync::Notify;

use super::ReceiverState;
use crate::error::ControllerError;
use crate::registry::{ActionContext, ActionDef, ActionFuture};
use crate::test_support::{TestModule, drain_events, fixture, new_log, ok_action, settle};

/// Action that delegates to `target` and returns the transferred value.
fn transferring_action(name: &'static str, target: &'static str) -> ActionDef {
	ActionDef::new(name, move |ctx: ActionContext, _args: Vec<Value>| -> ActionFuture {
		Box::pin(async move { Ok(ctx.transfer(target, vec![])?.await?) })
	})
	.transfers([target])
}

/// Action gated on a notify, so tests can observe it mid-flight.
fn gated_action(name: &'static str, gate: &Arc<Notify>) -> ActionDef {
	let gate = Arc::clone(gate);
	ActionDef::new(name, move |_ctx: ActionContext, _args: Vec<Value>| -> ActionFuture {
		let gate = Arc::clone(&gate);
		Box::pin(async move {
			gate.notified().await;
			Ok(json!(name))
		})
	})
}

#[tokio::test]
async fn transfer_runs_target_under_callers_locks() {
	let log = new_log();
	let gate = Arc::new(Notify::new());
	let fx = fixture(vec![Arc::new(
		TestModule::new("m", &log)
			.action(transferring_action("a", "m.b").writes(LockSet::PS_DOC | LockSet::JS_DOC))
			.action(gated_action("b", &gate).writes(LockSet::PS_DOC)),
	)]);
	fx.controller.start().await.unwrap();

	let ticket = fx.controller.invoke("m.a", vec![]).unwrap();
	settle().await;

	// The delegation never re-enters the main queue; it runs on a's
	// transfer queue while a keeps its locks.
	let core = fx.controller.core();
	assert_eq!(core.queue().active(), 1);
	assert_eq!(core.queue().pending(), 0);
	assert!(core.queue().find_active("m.b").is_none());
	let a_id = core.registry().resolve("m.a").unwrap().id().clone();
	let receiver = core.receiver(&a_id).unwrap();
	assert_eq!(receiver.state(), ReceiverState::Transferring);
	assert!(receiver.transfer_queue().find_active("m.b").is_some());

	gate.notify_one();
	assert_eq!(ticket.await.unwrap(), json!("b"));
	settle().await;
	assert_eq!(receiver.state(), ReceiverState::Idle);
	assert!(fx.controller.is_idle());
}

#[tokio::test]
async fn undeclared_transfer_is_a_synchronous_hard_error() {
	let log = new_log();
	let fx = fixture(vec![Arc::new(
		TestModule::new("m", &log)
			.action(ActionDef::new("a", |ctx: ActionContext, _args: Vec<Value>| -> ActionFuture {
				Box::pin(async move {
					// No transfers declared: the call must fail before any
					// scheduling happens.
					let err = ctx.transfer("m.b", vec![]).unwrap_err();
					assert!(matches!(err, ControllerError::IllegalTransfer { .. }));
					Err(err.into())
				})
			}))
			.action(ok_action("b")),
	)]);
	fx.controller.start().await.unwrap();
	let mut events = fx.controller.subscribe();

	let result = fx.controller.call("m.a", vec![]).await;
	assert!(matches!(result, Err(ControllerError::ActionFailed { .. })));

	// The rejection still counts as an action failure: reset begins.
	assert!(fx.controller.core().is_reset_pending());
	assert!(drain_events(&mut events).contains(&"lock"));
}

#[tokio::test]
async fn transfer_to_unknown_target_is_rejected() {
	let log = new_log();
	let fx = fixture(vec![Arc::new(TestModule::new("m", &log).action(ok_action("a")))]);
	fx.controller.start().await.unwrap();

	let core = fx.controller.core();
	let a_id = core.registry().resolve("m.a").unwrap().id().clone();
	let receiver = core.receiver(&a_id).unwrap();
	match receiver.transfer("m.ghost", vec![]) {
		Err(ControllerError::UnknownAction(name)) => assert_eq!(name, "m.ghost"),
		other => panic!("expected unknown action, got {other:?}"),
	}
}

#[tokio::test]
async fn transfer_failure_propagates_and_resets() {
	let log = new_log();
	let fx = fixture(vec![Arc::new(
		TestModule::new("m", &log)
			.action(transferring_action("a", "m.b").writes(LockSet::ALL))
			.action(crate::test_support::failing_action("b").writes(LockSet::PS_DOC)),
	)]);
	fx.controller.start().await.unwrap();
	let mut events = fx.controller.subscribe();

	let result = fx.controller.call("m.a", vec![]).await;
	assert!(matches!(result, Err(ControllerError::ActionFailed { .. })));
	assert!(fx.controller.core().is_reset_pending());
	assert!(drain_events(&mut events).contains(&"lock"));
}

#[tokio::test]
async fn allow_failure_suppresses_transfer_reset() {
	let log = new_log();
	let survivor = ActionDef::new("a", |ctx: ActionContext, _args: Vec<Value>| -> ActionFuture {
		Box::pin(async move {
			let failed = ctx.transfer("m.b", vec![])?.await;
			assert!(failed.is_err(), "the rejection still reaches the caller");
			Ok(json!("survived"))
		})
	})
	.transfers(["m.b"])
	.writes(LockSet::ALL)
	.allow_failure();
	let fx = fixture(vec![Arc::new(
		TestModule::new("m", &log)
			.action(survivor)
			.action(crate::test_support::failing_action("b").writes(LockSet::PS_DOC)),
	)]);
	fx.controller.start().await.unwrap();
	let mut events = fx.controller.subscribe();

	assert_eq!(fx.controller.call("m.a", vec![]).await.unwrap(), json!("survived"));
	assert!(!fx.controller.core().is_reset_pending());
	assert!(!drain_events(&mut events).contains(&"lock"));
}

#[tokio::test]
async fn dispatch_is_synchronous_and_dispatch_async_next_tick() {
	let log = new_log();
	let announcer = ActionDef::new("announce", |ctx: ActionContext, _args: Vec<Value>| -> ActionFuture {
		Box::pin(async move {
			ctx.dispatch("SELECTION_CHANGED", json!({ "count": 1 }));
			ctx.dispatch_async("HISTORY_PUSHED", json!({ "depth": 2 })).await;
			Ok(Value::Null)
		})
	});
	let fx = fixture(vec![Arc::new(TestModule::new("m", &log).action(announcer))]);
	fx.controller.start().await.unwrap();

	fx.controller.call("m.announce", vec![]).await.unwrap();
	let names = fx.bus.names();
	assert_eq!(names, ["SELECTION_CHANGED", "HISTORY_PUSHED"]);
}

#[tokio::test]
async fn reset_clears_the_transfer_queue() {
	let log = new_log();
	let gate = Arc::new(Notify::new());
	let fx = fixture(vec![Arc::new(
		TestModule::new("m", &log)
			.action(ok_action("a").transfers(["m.b"]).writes(LockSet::ALL))
			.action(gated_action("b", &gate).writes(LockSet::PS_DOC)),
	)]);
	fx.controller.start().await.unwrap();

	let core = fx.controller.core();
	let a_id = core.registry().resolve("m.a").unwrap().id().clone();
	let receiver = core.receiver(&a_id).unwrap();

	// Two transfers: one starts, one queues behind the write lock.
	let first = receiver.transfer("m.b", vec![]).unwrap();
	let second = receiver.transfer("m.b", vec![]).unwrap();
	settle().await;
	assert_eq!(receiver.state(), ReceiverState::Transferring);
	assert_eq!(receiver.transfer_queue().pending(), 1);

	receiver.reset();
	assert_eq!(receiver.transfer_queue().pending(), 0);
	assert!(matches!(second.await, Err(ControllerError::Cancelled(_))));

	// The in-flight transfer body is not aborted by the reset.
	gate.notify_one();
	assert_eq!(first.await.unwrap(), json!("b"));
	settle().await;
	assert_eq!(receiver.state(), ReceiverState::Cleared);
}
