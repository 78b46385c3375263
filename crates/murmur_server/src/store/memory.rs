#![forbid(unsafe_code)]

use std::collections::HashMap;
#[cfg(test)]
use std::collections::HashSet;
#[cfg(test)]
use std::time::Duration;

use murmur_domain::{
	AccountId, AccountRecord, ChatId, ChatMessage, ChatThread, ContactRef, Group, GroupId, GroupMembership, MessageId,
};
use parking_lot::Mutex;

use super::{AccountStore, NewGroupRecord, StoreError};

/// In-process store. Single record atomicity comes from one short critical section per call.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
	#[cfg(test)]
	faults: Mutex<Faults>,
}

#[derive(Debug, Default)]
struct Inner {
	accounts: HashMap<AccountId, AccountRecord>,
	chats: HashMap<ChatId, ChatThread>,
	groups: HashMap<GroupId, Group>,
	last_chat_id: i64,
	last_group_id: i64,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct Faults {
	latency: Option<Duration>,
	slow: HashMap<&'static str, Duration>,
	failing: HashSet<&'static str>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make every call named `op` fail with `Unavailable`.
	#[cfg(test)]
	pub(crate) fn fail_op(&self, op: &'static str) {
		self.faults.lock().failing.insert(op);
	}

	#[cfg(test)]
	pub(crate) fn heal_op(&self, op: &'static str) {
		self.faults.lock().failing.remove(op);
	}

	/// Delay only calls named `op`, on top of any global latency.
	#[cfg(test)]
	pub(crate) fn slow_op(&self, op: &'static str, delay: Duration) {
		self.faults.lock().slow.insert(op, delay);
	}

	/// Delay every call by `latency`.
	#[cfg(test)]
	pub(crate) fn set_latency(&self, latency: Option<Duration>) {
		self.faults.lock().latency = latency;
	}

	/// Insert a chat under a caller-chosen id.
	#[cfg(test)]
	pub(crate) fn put_chat(&self, chat_id: ChatId, thread: ChatThread) {
		self.inner.lock().chats.insert(chat_id, thread);
	}

	#[cfg(test)]
	async fn enter(&self, op: &'static str) -> Result<(), StoreError> {
		let (latency, slow, fail) = {
			let f = self.faults.lock();
			(f.latency, f.slow.get(op).copied(), f.failing.contains(op))
		};
		for d in [latency, slow].into_iter().flatten() {
			tokio::time::sleep(d).await;
		}
		if fail {
			return Err(StoreError::Unavailable(format!("injected failure: {op}")));
		}
		Ok(())
	}

	#[cfg(not(test))]
	async fn enter(&self, _op: &'static str) -> Result<(), StoreError> {
		Ok(())
	}

	fn with_account<R>(&self, id: AccountId, f: impl FnOnce(&mut AccountRecord) -> R) -> Option<R> {
		let mut inner = self.inner.lock();
		inner.accounts.get_mut(&id).map(f)
	}

	fn with_group<R>(&self, id: GroupId, f: impl FnOnce(&mut Group) -> R) -> Option<R> {
		let mut inner = self.inner.lock();
		inner.groups.get_mut(&id).map(f)
	}
}

#[async_trait::async_trait]
impl AccountStore for MemoryStore {
	async fn find_account(&self, id: AccountId) -> Result<Option<AccountRecord>, StoreError> {
		self.enter("find_account").await?;
		Ok(self.inner.lock().accounts.get(&id).cloned())
	}

	async fn find_accounts(&self, ids: &[AccountId]) -> Result<Vec<AccountRecord>, StoreError> {
		self.enter("find_accounts").await?;
		let inner = self.inner.lock();
		Ok(ids.iter().filter_map(|id| inner.accounts.get(id).cloned()).collect())
	}

	async fn insert_account(&self, record: &AccountRecord) -> Result<(), StoreError> {
		self.enter("insert_account").await?;
		let mut inner = self.inner.lock();
		if inner.accounts.contains_key(&record.id) {
			return Err(StoreError::AlreadyExists(format!("account {}", record.id)));
		}
		inner.accounts.insert(record.id, record.clone());
		Ok(())
	}

	async fn delete_account(&self, id: AccountId) -> Result<bool, StoreError> {
		self.enter("delete_account").await?;
		Ok(self.inner.lock().accounts.remove(&id).is_some())
	}

	async fn set_status(&self, id: AccountId, online: bool) -> Result<bool, StoreError> {
		self.enter("set_status").await?;
		Ok(self.with_account(id, |a| a.status = online).is_some())
	}

	async fn set_names(&self, id: AccountId, first_name: &str, last_name: &str) -> Result<bool, StoreError> {
		self.enter("set_names").await?;
		Ok(self
			.with_account(id, |a| {
				a.first_name = first_name.to_string();
				a.last_name = last_name.to_string();
			})
			.is_some())
	}

	async fn set_image_url(&self, id: AccountId, image_url: &str) -> Result<bool, StoreError> {
		self.enter("set_image_url").await?;
		Ok(self.with_account(id, |a| a.image_url = image_url.to_string()).is_some())
	}

	async fn set_password(&self, id: AccountId, hashed_password: &str) -> Result<bool, StoreError> {
		self.enter("set_password").await?;
		Ok(self
			.with_account(id, |a| a.hashed_password = hashed_password.to_string())
			.is_some())
	}

	async fn push_contact(&self, owner: AccountId, contact: &ContactRef) -> Result<bool, StoreError> {
		self.enter("push_contact").await?;
		Ok(self.with_account(owner, |a| a.contacts.push(contact.clone())).is_some())
	}

	async fn remove_contact(&self, owner: AccountId, chat_id: ChatId) -> Result<u64, StoreError> {
		self.enter("remove_contact").await?;
		Ok(self
			.with_account(owner, |a| {
				let before = a.contacts.len();
				a.contacts.retain(|c| c.chat_id != chat_id);
				(before - a.contacts.len()) as u64
			})
			.unwrap_or(0))
	}

	async fn set_contact_unread(&self, owner: AccountId, chat_id: ChatId, unread: u32) -> Result<bool, StoreError> {
		self.enter("set_contact_unread").await?;
		Ok(self
			.with_account(owner, |a| {
				let mut hit = false;
				for c in a.contacts.iter_mut().filter(|c| c.chat_id == chat_id) {
					c.unread_messages = unread;
					hit = true;
				}
				hit
			})
			.unwrap_or(false))
	}

	async fn increment_contact_unread(&self, owner: AccountId, chat_id: ChatId) -> Result<bool, StoreError> {
		self.enter("increment_contact_unread").await?;
		Ok(self
			.with_account(owner, |a| {
				let mut hit = false;
				for c in a.contacts.iter_mut().filter(|c| c.chat_id == chat_id) {
					c.unread_messages = c.unread_messages.saturating_add(1);
					hit = true;
				}
				hit
			})
			.unwrap_or(false))
	}

	async fn create_chat(&self, messages: &[ChatMessage]) -> Result<ChatId, StoreError> {
		self.enter("create_chat").await?;
		let mut inner = self.inner.lock();
		inner.last_chat_id += 1;
		let id = ChatId::new(inner.last_chat_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
		inner.chats.insert(
			id,
			ChatThread {
				messages: messages.to_vec(),
			},
		);
		Ok(id)
	}

	async fn find_chats(&self, ids: &[ChatId]) -> Result<Vec<(ChatId, ChatThread)>, StoreError> {
		self.enter("find_chats").await?;
		let inner = self.inner.lock();
		Ok(ids
			.iter()
			.filter_map(|id| inner.chats.get(id).map(|t| (*id, t.clone())))
			.collect())
	}

	async fn push_chat_message(&self, chat_id: ChatId, message: &ChatMessage) -> Result<bool, StoreError> {
		self.enter("push_chat_message").await?;
		let mut inner = self.inner.lock();
		Ok(inner
			.chats
			.get_mut(&chat_id)
			.map(|t| t.messages.push(message.clone()))
			.is_some())
	}

	async fn remove_chat_message(
		&self,
		chat_id: ChatId,
		message_id: MessageId,
		sender: AccountId,
	) -> Result<bool, StoreError> {
		self.enter("remove_chat_message").await?;
		let mut inner = self.inner.lock();
		let Some(thread) = inner.chats.get_mut(&chat_id) else {
			return Ok(false);
		};
		let before = thread.messages.len();
		thread
			.messages
			.retain(|m| !(m.message_id == message_id && m.sender == sender));
		Ok(thread.messages.len() != before)
	}

	async fn delete_chat(&self, chat_id: ChatId) -> Result<bool, StoreError> {
		self.enter("delete_chat").await?;
		Ok(self.inner.lock().chats.remove(&chat_id).is_some())
	}

	async fn insert_group(&self, group: &NewGroupRecord) -> Result<GroupId, StoreError> {
		self.enter("insert_group").await?;
		let mut inner = self.inner.lock();
		inner.last_group_id += 1;
		let id = GroupId::new(inner.last_group_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
		let mut members = Vec::with_capacity(group.members.len());
		for m in &group.members {
			if !members.contains(m) {
				members.push(*m);
			}
		}
		inner.groups.insert(
			id,
			Group {
				id,
				name: group.name.clone(),
				admin: group.admin,
				image_url: group.image_url.clone(),
				members,
				messages: Vec::new(),
			},
		);
		Ok(id)
	}

	async fn find_groups(&self, ids: &[GroupId]) -> Result<Vec<Group>, StoreError> {
		self.enter("find_groups").await?;
		let inner = self.inner.lock();
		Ok(ids.iter().filter_map(|id| inner.groups.get(id).cloned()).collect())
	}

	async fn set_group_image(&self, group_id: GroupId, image_url: &str) -> Result<bool, StoreError> {
		self.enter("set_group_image").await?;
		Ok(self
			.with_group(group_id, |g| g.image_url = image_url.to_string())
			.is_some())
	}

	async fn add_group_member(&self, group_id: GroupId, account: AccountId) -> Result<bool, StoreError> {
		self.enter("add_group_member").await?;
		Ok(self
			.with_group(group_id, |g| {
				if g.members.contains(&account) {
					false
				} else {
					g.members.push(account);
					true
				}
			})
			.unwrap_or(false))
	}

	async fn remove_group_member(&self, group_id: GroupId, account: AccountId) -> Result<bool, StoreError> {
		self.enter("remove_group_member").await?;
		Ok(self
			.with_group(group_id, |g| {
				let before = g.members.len();
				g.members.retain(|m| *m != account);
				g.members.len() != before
			})
			.unwrap_or(false))
	}

	async fn add_membership(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError> {
		self.enter("add_membership").await?;
		Ok(self
			.with_account(account, |a| {
				if a.is_member_of(group_id) {
					false
				} else {
					a.groups.push(GroupMembership {
						group_id,
						group_unread_messages: 0,
					});
					true
				}
			})
			.unwrap_or(false))
	}

	async fn remove_membership(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError> {
		self.enter("remove_membership").await?;
		Ok(self
			.with_account(account, |a| {
				let before = a.groups.len();
				a.groups.retain(|g| g.group_id != group_id);
				a.groups.len() != before
			})
			.unwrap_or(false))
	}

	async fn set_group_unread(&self, account: AccountId, group_id: GroupId, unread: u32) -> Result<bool, StoreError> {
		self.enter("set_group_unread").await?;
		Ok(self
			.with_account(account, |a| match a.groups.iter_mut().find(|g| g.group_id == group_id) {
				Some(g) => {
					g.group_unread_messages = unread;
					true
				}
				None => false,
			})
			.unwrap_or(false))
	}

	async fn increment_group_unread(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError> {
		self.enter("increment_group_unread").await?;
		Ok(self
			.with_account(account, |a| match a.groups.iter_mut().find(|g| g.group_id == group_id) {
				Some(g) => {
					g.group_unread_messages = g.group_unread_messages.saturating_add(1);
					true
				}
				None => false,
			})
			.unwrap_or(false))
	}

	async fn push_group_message(&self, group_id: GroupId, message: &ChatMessage) -> Result<bool, StoreError> {
		self.enter("push_group_message").await?;
		Ok(self
			.with_group(group_id, |g| g.messages.push(message.clone()))
			.is_some())
	}

	async fn remove_group_message(
		&self,
		group_id: GroupId,
		message_id: MessageId,
		sender: AccountId,
	) -> Result<bool, StoreError> {
		self.enter("remove_group_message").await?;
		Ok(self
			.with_group(group_id, |g| {
				let before = g.messages.len();
				g.messages
					.retain(|m| !(m.message_id == message_id && m.sender == sender));
				g.messages.len() != before
			})
			.unwrap_or(false))
	}
}
