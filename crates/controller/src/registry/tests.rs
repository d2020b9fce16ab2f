use std::sync::Arc;

use easel_locks::LockSet;

use super::{ActionRegistry, RegistryError};
use crate::module::Module;
use crate::test_support::{TestModule, new_log, ok_action};

fn build(module: TestModule) -> Result<ActionRegistry, RegistryError> {
	ActionRegistry::build(&[Arc::new(module) as Arc<dyn Module>])
}

#[test]
fn resolves_dotted_ids_and_widens_reads_by_writes() {
	let log = new_log();
	let registry = build(
		TestModule::new("edit", &log)
			.action(ok_action("select").reads(LockSet::JS_DOC).writes(LockSet::PS_DOC)),
	)
	.unwrap();

	let entry = registry.resolve("edit.select").expect("id must resolve");
	assert_eq!(entry.id().as_str(), "edit.select");
	assert_eq!(entry.reads(), LockSet::JS_DOC | LockSet::PS_DOC);
	assert_eq!(entry.writes(), LockSet::PS_DOC);
	assert!(registry.resolve("edit.missing").is_none());
}

#[test]
fn transfer_closures_union_target_locks() {
	let log = new_log();
	let registry = build(
		TestModule::new("layers", &log)
			.action(
				ok_action("reorder")
					.writes(LockSet::PS_DOC | LockSet::JS_DOC)
					.transfers(["layers.commit"]),
			)
			.action(ok_action("commit").writes(LockSet::PS_DOC).reads(LockSet::JS_HISTORY)),
	)
	.unwrap();

	let reorder = registry.resolve("layers.reorder").unwrap();
	assert_eq!(reorder.writes_star(), LockSet::PS_DOC | LockSet::JS_DOC);
	assert_eq!(reorder.reads_star(), LockSet::PS_DOC | LockSet::JS_DOC | LockSet::JS_HISTORY);

	let commit = registry.resolve("layers.commit").unwrap();
	assert_eq!(commit.writes_star(), LockSet::PS_DOC);
}

#[test]
fn cyclic_transfers_truncate_and_still_build() {
	let log = new_log();
	let registry = build(
		TestModule::new("text", &log)
			.action(ok_action("apply").writes(LockSet::JS_TYPE).transfers(["text.measure"]))
			.action(ok_action("measure").writes(LockSet::JS_STYLE).transfers(["text.apply"])),
	)
	.unwrap();

	let apply = registry.resolve("text.apply").unwrap();
	let measure = registry.resolve("text.measure").unwrap();
	assert_eq!(apply.writes_star(), LockSet::JS_TYPE | LockSet::JS_STYLE);
	assert_eq!(measure.writes_star(), LockSet::JS_TYPE | LockSet::JS_STYLE);
}

#[test]
fn closures_are_supersets_of_every_transfer_target() {
	let log = new_log();
	let registry = build(
		TestModule::new("m", &log)
			.action(ok_action("a").writes(LockSet::PS_APP).transfers(["m.b", "m.c"]))
			.action(ok_action("b").writes(LockSet::PS_DOC).transfers(["m.c"]))
			.action(ok_action("c").writes(LockSet::JS_DOC)),
	)
	.unwrap();

	for entry in registry.iter() {
		for target in &entry.transfers {
			let target = registry.get(target).expect("transfer targets resolve");
			assert!(
				entry.reads_star().contains(target.reads_star()),
				"{} reads* must cover {}",
				entry.id(),
				target.id()
			);
			assert!(
				entry.writes_star().contains(target.writes_star()),
				"{} writes* must cover {}",
				entry.id(),
				target.id()
			);
		}
	}
}

#[test]
fn unknown_transfer_target_fails_construction() {
	let log = new_log();
	let err = build(TestModule::new("m", &log).action(ok_action("a").transfers(["m.missing"]))).unwrap_err();
	assert_eq!(
		err,
		RegistryError::UnknownTransferTarget {
			action: "m.a".to_string(),
			target: "m.missing".to_string(),
		}
	);
}

#[test]
fn duplicate_ids_fail_construction() {
	let log = new_log();
	let err = build(TestModule::new("m", &log).action(ok_action("a")).action(ok_action("a"))).unwrap_err();
	assert_eq!(err, RegistryError::DuplicateAction("m.a".to_string()));
}

#[test]
fn undeclared_locks_default_to_all() {
	let log = new_log();
	let registry = build(TestModule::new("m", &log).action(ok_action("a"))).unwrap();
	let entry = registry.resolve("m.a").unwrap();
	assert_eq!(entry.writes(), LockSet::ALL);
	assert_eq!(entry.reads(), LockSet::ALL);
}

#[test]
fn explicit_empty_sets_stay_empty() {
	let log = new_log();
	let registry = build(
		TestModule::new("m", &log).action(ok_action("a").reads(LockSet::empty()).writes(LockSet::empty())),
	)
	.unwrap();
	let entry = registry.resolve("m.a").unwrap();
	assert_eq!(entry.reads(), LockSet::empty());
	assert_eq!(entry.writes(), LockSet::empty());
}

#[test]
fn underscore_names_are_private() {
	let log = new_log();
	let registry = build(TestModule::new("m", &log).action(ok_action("_helper")).action(ok_action("visible"))).unwrap();
	assert!(registry.resolve("m._helper").unwrap().private);
	assert!(!registry.resolve("m.visible").unwrap().private);
}
