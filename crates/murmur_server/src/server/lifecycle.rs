#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use murmur_domain::{AccountId, AccountRecord};
use tracing::{debug, info, warn};

use crate::server::locks::{KeyedLocks, LockKey};
pub use crate::store::{CascadeFailure, CascadeStep};
use crate::store::{CascadeReport, SharedStore, StoreError, with_deadline};

/// Per-step outcome of a delete.
#[derive(Debug, Default)]
pub struct DeleteReport {
	/// False when the account was already gone.
	pub existed: bool,
	/// Contacts of the deleted account, for notification.
	pub contacts: Vec<AccountId>,
	pub groups_left: usize,
	pub contacts_unlinked: usize,
	pub chats_deleted: usize,
	pub account_removed: bool,
	pub failures: Vec<CascadeFailure>,
}

impl DeleteReport {
	pub fn is_complete(&self) -> bool {
		self.failures.is_empty() && (self.account_removed || !self.existed)
	}
}

/// The account plus every contact and group it touches.
fn lock_keys(record: &AccountRecord) -> Vec<LockKey> {
	let mut keys: Vec<LockKey> = vec![record.id.into()];
	keys.extend(record.contacts.iter().map(|c| LockKey::Account(c.contact_id)));
	keys.extend(record.groups.iter().map(|g| LockKey::Group(g.group_id)));
	keys
}

/// Cascading account deletion.
#[derive(Clone)]
pub struct AccountLifecycle {
	store: SharedStore,
	locks: Arc<KeyedLocks>,
	timeout: Duration,
}

impl AccountLifecycle {
	pub fn new(store: SharedStore, locks: Arc<KeyedLocks>, timeout: Duration) -> Self {
		Self { store, locks, timeout }
	}

	/// Delete `account` and every relation that points at it.
	///
	/// Runs under the locks of the account, its contacts and its groups. How the
	/// cascade commits is up to the store; the record is only removed once every
	/// relation is gone, so a rerun converges. Only the loads can fail the call.
	pub async fn delete(&self, account: AccountId) -> Result<DeleteReport, StoreError> {
		let Some(snapshot) = with_deadline(self.timeout, self.store.find_account(account)).await? else {
			return Ok(DeleteReport::default());
		};

		let mut keys = lock_keys(&snapshot);
		let (_held, record) = loop {
			let held = self.locks.lock_many(keys.iter().copied()).await;

			// Reload under the locks; the earlier load only chose which keys to take.
			let Some(record) = with_deadline(self.timeout, self.store.find_account(account)).await? else {
				return Ok(DeleteReport::default());
			};
			let wanted = lock_keys(&record);
			if wanted.iter().all(|k| held.keys().binary_search(k).is_ok()) {
				break (held, record);
			}

			debug!(account_id = %account, "relations changed while locking; retrying with the new set");
			drop(held);
			keys = wanted;
		};

		let CascadeReport {
			groups_left,
			contacts_unlinked,
			chats_deleted,
			account_removed,
			failures,
		} = self.store.delete_account_cascade(&record, self.timeout).await;
		let report = DeleteReport {
			existed: true,
			contacts: record.contact_ids(),
			groups_left,
			contacts_unlinked,
			chats_deleted,
			account_removed,
			failures,
		};

		for f in &report.failures {
			warn!(account_id = %account, step = %f.step, error = %f.error, "delete cascade step failed");
		}
		info!(
			account_id = %account,
			groups_left = report.groups_left,
			contacts_unlinked = report.contacts_unlinked,
			chats_deleted = report.chats_deleted,
			account_removed = report.account_removed,
			failures = report.failures.len(),
			"account delete cascade finished"
		);

		Ok(report)
	}
}
