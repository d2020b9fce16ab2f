//! Named resource locks for the action controller.
//!
//! Every schedulable resource (a host-editor subsystem or a client-side
//! store) is identified by one lock out of a closed vocabulary. Actions
//! declare the locks they read and write as [`LockSet`] values; the
//! dependency queue schedules purely on set overlap. Lock identity is
//! opaque and ordering carries no meaning.

use bitflags::bitflags;

bitflags! {
	/// Set of named resource locks.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct LockSet: u32 {
		const PS_APP = 1 << 0;
		const JS_APP = 1 << 1;
		const PS_DOC = 1 << 2;
		const JS_DOC = 1 << 3;
		const PS_TOOL = 1 << 4;
		const JS_TOOL = 1 << 5;
		const PS_MENU = 1 << 6;
		const JS_MENU = 1 << 7;
		const JS_DIALOG = 1 << 8;
		const JS_TYPE = 1 << 9;
		const JS_POLICY = 1 << 10;
		const JS_SHORTCUT = 1 << 11;
		const JS_UI = 1 << 12;
		const JS_PANEL = 1 << 13;
		const JS_PREF = 1 << 14;
		const JS_HISTORY = 1 << 15;
		const JS_STYLE = 1 << 16;
		const JS_LIBRARIES = 1 << 17;
		const JS_EXPORT = 1 << 18;
		const JS_SEARCH = 1 << 19;
		const CC_LIBRARIES = 1 << 20;
		const OS_CLIPBOARD = 1 << 21;
		const GENERATOR = 1 << 22;
	}
}

impl LockSet {
	/// Every lock in the vocabulary.
	pub const ALL: Self = Self::all();

	/// Host-editor subset.
	pub const HOST: Self = Self::PS_APP.union(Self::PS_DOC).union(Self::PS_TOOL).union(Self::PS_MENU);

	/// Host subset plus external native services.
	pub const NATIVE: Self = Self::HOST.union(Self::CC_LIBRARIES).union(Self::OS_CLIPBOARD).union(Self::GENERATOR);

	/// Parses one lock by its wire name.
	pub fn from_name(name: &str) -> Result<Self, UnknownLock> {
		NAMES
			.iter()
			.find(|(n, _)| *n == name)
			.map(|(_, lock)| *lock)
			.ok_or_else(|| UnknownLock(name.to_string()))
	}

	/// Parses a set of locks from wire names.
	pub fn from_names<'a, I>(names: I) -> Result<Self, UnknownLock>
	where
		I: IntoIterator<Item = &'a str>,
	{
		let mut set = Self::empty();
		for name in names {
			set |= Self::from_name(name)?;
		}
		Ok(set)
	}

	/// Wire names of the locks contained in this set, for diagnostics.
	pub fn names(self) -> impl Iterator<Item = &'static str> {
		NAMES.iter().filter(move |(_, lock)| self.contains(*lock)).map(|(name, _)| *name)
	}
}

/// A lock name outside the closed vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lock name: {0}")]
pub struct UnknownLock(pub String);

/// Wire name of every lock, in declaration order.
const NAMES: &[(&str, LockSet)] = &[
	("psApp", LockSet::PS_APP),
	("jsApp", LockSet::JS_APP),
	("psDoc", LockSet::PS_DOC),
	("jsDoc", LockSet::JS_DOC),
	("psTool", LockSet::PS_TOOL),
	("jsTool", LockSet::JS_TOOL),
	("psMenu", LockSet::PS_MENU),
	("jsMenu", LockSet::JS_MENU),
	("jsDialog", LockSet::JS_DIALOG),
	("jsType", LockSet::JS_TYPE),
	("jsPolicy", LockSet::JS_POLICY),
	("jsShortcut", LockSet::JS_SHORTCUT),
	("jsUI", LockSet::JS_UI),
	("jsPanel", LockSet::JS_PANEL),
	("jsPref", LockSet::JS_PREF),
	("jsHistory", LockSet::JS_HISTORY),
	("jsStyle", LockSet::JS_STYLE),
	("jsLibraries", LockSet::JS_LIBRARIES),
	("jsExport", LockSet::JS_EXPORT),
	("jsSearch", LockSet::JS_SEARCH),
	("ccLibraries", LockSet::CC_LIBRARIES),
	("osClipboard", LockSet::OS_CLIPBOARD),
	("generator", LockSet::GENERATOR),
];
