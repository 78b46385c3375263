#![forbid(unsafe_code)]

//! Login-time views over the denormalized account graph.
//!
//! Contacts go through four stages, in order:
//!
//! 1. unwind the account's contact list into one row per entry;
//! 2. left-join each row with the counterpart account, then with the shared chat;
//! 3. group rows by `(contact id, chat id)`, first occurrence wins;
//! 4. reshape into [`HydratedContact`].
//!
//! Rows whose counterpart or chat does not resolve are dropped at the end of stage 2.
//! Groups follow the same unwind / join / reshape path keyed by group id.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use murmur_domain::{AccountId, AccountRecord, ChatId, ChatThread, ContactInfo, ContactRef, Group, GroupMembership};
use murmur_protocol::outbound::{HydratedContact, HydratedGroup};
use thiserror::Error;
use tracing::debug;

use crate::store::{SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum HydrationError {
	#[error("hydration timed out after {0:?}")]
	Timeout(Duration),

	#[error("account {0} does not exist")]
	AccountNotFound(AccountId),

	#[error("store error during hydration: {0}")]
	Store(#[from] StoreError),
}

/// Contacts and groups of one account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hydrated {
	pub contacts: Vec<HydratedContact>,
	pub groups: Vec<HydratedGroup>,
}

#[derive(Clone)]
pub struct AccountHydrator {
	store: SharedStore,
	timeout: Duration,
}

impl AccountHydrator {
	pub fn new(store: SharedStore, timeout: Duration) -> Self {
		Self { store, timeout }
	}

	/// Load the account and build both views, bounded by the hydration deadline.
	pub async fn hydrate(&self, account: AccountId) -> Result<(AccountRecord, Hydrated), HydrationError> {
		self.bounded(async {
			let record = self
				.store
				.find_account(account)
				.await?
				.ok_or(HydrationError::AccountNotFound(account))?;
			let hydrated = self.hydrate_record(&record).await?;
			Ok((record, hydrated))
		})
		.await
	}

	/// Build both views for an already loaded record.
	pub async fn hydrate_record(&self, record: &AccountRecord) -> Result<Hydrated, HydrationError> {
		let contacts = self.contacts(&record.contacts).await?;
		let groups = self.groups(&record.groups).await?;
		debug!(
			account_id = %record.id,
			contacts = contacts.len(),
			groups = groups.len(),
			"hydrated account"
		);
		Ok(Hydrated { contacts, groups })
	}

	/// Hydrate a subset of contact entries, e.g. a single freshly added contact.
	pub async fn contacts(&self, entries: &[ContactRef]) -> Result<Vec<HydratedContact>, HydrationError> {
		self.bounded(async {
			let rows = unwind_contacts(entries);

			let account_ids: Vec<AccountId> = dedup(rows.iter().map(|r| r.contact_id));
			let accounts: HashMap<AccountId, ContactInfo> = self
				.store
				.find_accounts(&account_ids)
				.await?
				.into_iter()
				.map(|a| (a.id, a.info()))
				.collect();

			let chat_ids: Vec<ChatId> = dedup(rows.iter().map(|r| r.chat_id));
			let chats: HashMap<ChatId, ChatThread> = self.store.find_chats(&chat_ids).await?.into_iter().collect();

			let joined = join_contacts(rows, &accounts, &chats);
			Ok(reshape_contacts(group_contacts(joined)))
		})
		.await
	}

	/// Hydrate a subset of group memberships.
	pub async fn groups(&self, memberships: &[GroupMembership]) -> Result<Vec<HydratedGroup>, HydrationError> {
		self.bounded(async {
			let rows = unwind_groups(memberships);
			let group_ids = dedup(rows.iter().map(|m| m.group_id));
			let groups: HashMap<_, Group> = self
				.store
				.find_groups(&group_ids)
				.await?
				.into_iter()
				.map(|g| (g.id, g))
				.collect();
			Ok(reshape_groups(join_groups(rows, &groups)))
		})
		.await
	}

	async fn bounded<T>(
		&self,
		fut: impl Future<Output = Result<T, HydrationError>>,
	) -> Result<T, HydrationError> {
		match tokio::time::timeout(self.timeout, fut).await {
			Ok(res) => res,
			Err(_) => Err(HydrationError::Timeout(self.timeout)),
		}
	}
}

fn dedup<T: Copy + Eq + std::hash::Hash>(it: impl Iterator<Item = T>) -> Vec<T> {
	let mut seen = HashSet::new();
	it.filter(|v| seen.insert(*v)).collect()
}

fn unwind_contacts(entries: &[ContactRef]) -> Vec<ContactRef> {
	entries.to_vec()
}

/// Contact row after both joins.
#[derive(Debug)]
struct JoinedContact {
	entry: ContactRef,
	info: ContactInfo,
	thread: ChatThread,
}

fn join_contacts(
	rows: Vec<ContactRef>,
	accounts: &HashMap<AccountId, ContactInfo>,
	chats: &HashMap<ChatId, ChatThread>,
) -> Vec<JoinedContact> {
	rows.into_iter()
		.filter_map(|entry| {
			let info = accounts.get(&entry.contact_id).cloned();
			let thread = chats.get(&entry.chat_id).cloned();
			match (info, thread) {
				(Some(info), Some(thread)) => Some(JoinedContact { entry, info, thread }),
				_ => {
					debug!(
						contact_id = %entry.contact_id,
						chat_id = %entry.chat_id,
						"dropping orphaned contact relation"
					);
					None
				}
			}
		})
		.collect()
}

fn group_contacts(rows: Vec<JoinedContact>) -> Vec<JoinedContact> {
	let mut seen = HashSet::new();
	rows.into_iter()
		.filter(|r| seen.insert((r.entry.contact_id, r.entry.chat_id)))
		.collect()
}

fn reshape_contacts(rows: Vec<JoinedContact>) -> Vec<HydratedContact> {
	rows.into_iter()
		.map(|r| HydratedContact {
			contact_info: r.info,
			chat_id: r.entry.chat_id,
			unread_messages: r.entry.unread_messages,
			chat_messages: r.thread.messages,
		})
		.collect()
}

fn unwind_groups(memberships: &[GroupMembership]) -> Vec<GroupMembership> {
	let mut seen = HashSet::new();
	memberships
		.iter()
		.filter(|m| seen.insert(m.group_id))
		.cloned()
		.collect()
}

fn join_groups(rows: Vec<GroupMembership>, groups: &HashMap<murmur_domain::GroupId, Group>) -> Vec<(GroupMembership, Group)> {
	rows.into_iter()
		.filter_map(|m| match groups.get(&m.group_id) {
			Some(g) => Some((m, g.clone())),
			None => {
				debug!(group_id = %m.group_id, "dropping orphaned group membership");
				None
			}
		})
		.collect()
}

fn reshape_groups(rows: Vec<(GroupMembership, Group)>) -> Vec<HydratedGroup> {
	rows.into_iter()
		.map(|(m, g)| hydrated_group(g, m.group_unread_messages))
		.collect()
}

/// Response shape of a group as seen by one member.
pub fn hydrated_group(g: Group, unread: u32) -> HydratedGroup {
	HydratedGroup {
		id: g.id,
		group_name: g.name,
		group_unread_messages: unread,
		group_image_url: g.image_url,
		group_admin: g.admin,
		group_members: g.members,
		group_messages: g.messages,
	}
}
