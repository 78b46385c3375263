#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use murmur_domain::{AccountId, GroupId};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Key of a logical lock. Ordering is the canonical acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
	Account(AccountId),
	Group(GroupId),
}

impl fmt::Display for LockKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			LockKey::Account(a) => write!(f, "account:{a}"),
			LockKey::Group(g) => write!(f, "group:{g}"),
		}
	}
}

impl From<AccountId> for LockKey {
	fn from(a: AccountId) -> Self {
		LockKey::Account(a)
	}
}

impl From<GroupId> for LockKey {
	fn from(g: GroupId) -> Self {
		LockKey::Group(g)
	}
}

/// Held logical locks. Released on drop.
#[must_use]
pub struct LockSet {
	keys: Vec<LockKey>,
	_guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
	pub fn keys(&self) -> &[LockKey] {
		&self.keys
	}
}

impl fmt::Debug for LockSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LockSet").field("keys", &self.keys).finish()
	}
}

/// One async mutex per account or group id, created on demand.
///
/// Unrelated keys never contend. Idle entries are pruned once the table grows.
#[derive(Debug, Default)]
pub struct KeyedLocks {
	table: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

const PRUNE_THRESHOLD: usize = 1024;

impl KeyedLocks {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn lock(&self, key: impl Into<LockKey>) -> LockSet {
		self.lock_many([key.into()]).await
	}

	/// Acquire every key in sorted order, skipping duplicates.
	pub async fn lock_many(&self, keys: impl IntoIterator<Item = LockKey>) -> LockSet {
		let mut keys: Vec<LockKey> = keys.into_iter().collect();
		keys.sort_unstable();
		keys.dedup();

		let mutexes: Vec<Arc<AsyncMutex<()>>> = {
			let mut table = self.table.lock();
			if table.len() >= PRUNE_THRESHOLD {
				table.retain(|_, m| Arc::strong_count(m) > 1);
			}
			keys.iter()
				.map(|k| Arc::clone(table.entry(*k).or_default()))
				.collect()
		};

		let mut guards = Vec::with_capacity(mutexes.len());
		for m in mutexes {
			guards.push(m.lock_owned().await);
		}

		LockSet { keys, _guards: guards }
	}

	/// Number of entries currently in the table.
	pub fn len(&self) -> usize {
		self.table.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
