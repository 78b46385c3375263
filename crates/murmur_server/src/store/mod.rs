#![forbid(unsafe_code)]

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use murmur_domain::{AccountId, AccountRecord, ChatId, ChatMessage, ChatThread, ContactRef, Group, GroupId, MessageId};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Default deadline for a single store or hydration call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store call timed out after {0:?}")]
	Timeout(Duration),

	#[error("record already exists: {0}")]
	AlreadyExists(String),

	#[error("store unavailable: {0}")]
	Unavailable(String),

	#[error("corrupt record: {0}")]
	Corrupt(String),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
	pub fn is_timeout(&self) -> bool {
		matches!(self, StoreError::Timeout(_))
	}
}

/// One step of the account deletion cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStep {
	LeaveGroup(GroupId),
	UnlinkContact { contact: AccountId, chat: ChatId },
	DeleteChat(ChatId),
	RemoveAccount,
	/// Opening or committing the cascade transaction.
	Transaction,
}

impl fmt::Display for CascadeStep {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CascadeStep::LeaveGroup(g) => write!(f, "leave group {g}"),
			CascadeStep::UnlinkContact { contact, chat } => write!(f, "unlink contact {contact} (chat {chat})"),
			CascadeStep::DeleteChat(c) => write!(f, "delete chat {c}"),
			CascadeStep::RemoveAccount => f.write_str("remove account"),
			CascadeStep::Transaction => f.write_str("open or commit transaction"),
		}
	}
}

#[derive(Debug)]
pub struct CascadeFailure {
	pub step: CascadeStep,
	pub error: StoreError,
}

/// What a deletion cascade changed.
#[derive(Debug, Default)]
pub struct CascadeReport {
	pub groups_left: usize,
	pub contacts_unlinked: usize,
	pub chats_deleted: usize,
	pub account_removed: bool,
	pub failures: Vec<CascadeFailure>,
}

/// New group document; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewGroupRecord {
	pub name: String,
	pub admin: AccountId,
	pub image_url: String,
	pub members: Vec<AccountId>,
}

/// Persisted account/contact/chat/group graph.
///
/// Every call other than `delete_account_cascade` is atomic for a single record only. Relations are denormalized and
/// callers keep both sides in sync. Removal calls report whether anything changed
/// and succeed when the target is already gone.
#[async_trait::async_trait]
pub trait AccountStore: Send + Sync {
	async fn find_account(&self, id: AccountId) -> Result<Option<AccountRecord>, StoreError>;

	/// Accounts that exist among `ids`, in no particular order.
	async fn find_accounts(&self, ids: &[AccountId]) -> Result<Vec<AccountRecord>, StoreError>;

	/// Fails with `AlreadyExists` when the id is taken.
	async fn insert_account(&self, record: &AccountRecord) -> Result<(), StoreError>;

	async fn delete_account(&self, id: AccountId) -> Result<bool, StoreError>;

	async fn set_status(&self, id: AccountId, online: bool) -> Result<bool, StoreError>;

	async fn set_names(&self, id: AccountId, first_name: &str, last_name: &str) -> Result<bool, StoreError>;

	async fn set_image_url(&self, id: AccountId, image_url: &str) -> Result<bool, StoreError>;

	async fn set_password(&self, id: AccountId, hashed_password: &str) -> Result<bool, StoreError>;

	/// Append a contact entry to the owner's ordered contact list.
	async fn push_contact(&self, owner: AccountId, contact: &ContactRef) -> Result<bool, StoreError>;

	/// Remove every contact entry of `owner` that points at `chat_id`. Returns the count removed.
	async fn remove_contact(&self, owner: AccountId, chat_id: ChatId) -> Result<u64, StoreError>;

	async fn set_contact_unread(&self, owner: AccountId, chat_id: ChatId, unread: u32) -> Result<bool, StoreError>;

	async fn increment_contact_unread(&self, owner: AccountId, chat_id: ChatId) -> Result<bool, StoreError>;

	/// Create a chat thread seeded with `messages`.
	async fn create_chat(&self, messages: &[ChatMessage]) -> Result<ChatId, StoreError>;

	/// Threads that exist among `ids`.
	async fn find_chats(&self, ids: &[ChatId]) -> Result<Vec<(ChatId, ChatThread)>, StoreError>;

	async fn push_chat_message(&self, chat_id: ChatId, message: &ChatMessage) -> Result<bool, StoreError>;

	/// Remove a message only if it was sent by `sender`.
	async fn remove_chat_message(
		&self,
		chat_id: ChatId,
		message_id: MessageId,
		sender: AccountId,
	) -> Result<bool, StoreError>;

	async fn delete_chat(&self, chat_id: ChatId) -> Result<bool, StoreError>;

	/// Insert the group document only. Member accounts are updated separately.
	async fn insert_group(&self, group: &NewGroupRecord) -> Result<GroupId, StoreError>;

	async fn find_groups(&self, ids: &[GroupId]) -> Result<Vec<Group>, StoreError>;

	async fn set_group_image(&self, group_id: GroupId, image_url: &str) -> Result<bool, StoreError>;

	/// Add `account` to the group's member set.
	async fn add_group_member(&self, group_id: GroupId, account: AccountId) -> Result<bool, StoreError>;

	/// Remove `account` from the group's member set.
	async fn remove_group_member(&self, group_id: GroupId, account: AccountId) -> Result<bool, StoreError>;

	/// Record the membership on the account side.
	async fn add_membership(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError>;

	async fn remove_membership(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError>;

	async fn set_group_unread(&self, account: AccountId, group_id: GroupId, unread: u32) -> Result<bool, StoreError>;

	async fn increment_group_unread(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError>;

	async fn push_group_message(&self, group_id: GroupId, message: &ChatMessage) -> Result<bool, StoreError>;

	async fn remove_group_message(
		&self,
		group_id: GroupId,
		message_id: MessageId,
		sender: AccountId,
	) -> Result<bool, StoreError>;

	/// Remove `record` and every relation that points at it: the group member
	/// entries, the mirrored contact entries with their chats, then the account.
	///
	/// This default runs each step on its own under `step_timeout` and removes the
	/// account only when every earlier step succeeded, so a rerun converges.
	/// Stores with multi-record transactions override it to commit all or nothing.
	async fn delete_account_cascade(&self, record: &AccountRecord, step_timeout: Duration) -> CascadeReport {
		let account = record.id;
		let mut report = CascadeReport::default();

		for membership in &record.groups {
			let step = CascadeStep::LeaveGroup(membership.group_id);
			match with_deadline(step_timeout, self.remove_group_member(membership.group_id, account)).await {
				Ok(_) => report.groups_left += 1,
				Err(error) => report.failures.push(CascadeFailure { step, error }),
			}
		}

		for contact in &record.contacts {
			let step = CascadeStep::UnlinkContact {
				contact: contact.contact_id,
				chat: contact.chat_id,
			};
			match with_deadline(step_timeout, self.remove_contact(contact.contact_id, contact.chat_id)).await {
				Ok(_) => report.contacts_unlinked += 1,
				Err(error) => report.failures.push(CascadeFailure { step, error }),
			}

			let step = CascadeStep::DeleteChat(contact.chat_id);
			match with_deadline(step_timeout, self.delete_chat(contact.chat_id)).await {
				Ok(_) => report.chats_deleted += 1,
				Err(error) => report.failures.push(CascadeFailure { step, error }),
			}
		}

		if report.failures.is_empty() {
			match with_deadline(step_timeout, self.delete_account(account)).await {
				Ok(_) => report.account_removed = true,
				Err(error) => report.failures.push(CascadeFailure {
					step: CascadeStep::RemoveAccount,
					error,
				}),
			}
		}

		report
	}
}

pub type SharedStore = Arc<dyn AccountStore>;

/// Bound a store call by `limit`.
pub async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
	F: Future<Output = Result<T, StoreError>>,
{
	match tokio::time::timeout(limit, fut).await {
		Ok(res) => res,
		Err(_) => Err(StoreError::Timeout(limit)),
	}
}

/// Open the store named by `database_url`.
///
/// `memory:` (or an empty url) selects the in-process store.
pub async fn connect(database_url: Option<&str>) -> Result<SharedStore, StoreError> {
	match database_url.map(str::trim).filter(|s| !s.is_empty()) {
		None | Some("memory:") => Ok(Arc::new(MemoryStore::new())),
		Some(url) if url.starts_with("sqlite:") => Ok(Arc::new(SqliteStore::connect(url).await?)),
		Some(other) => Err(StoreError::Unavailable(format!(
			"unsupported database_url {other:?} (use sqlite: or memory:)"
		))),
	}
}
