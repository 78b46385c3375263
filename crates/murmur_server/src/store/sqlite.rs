#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;

use murmur_domain::{
	AccountId, AccountRecord, ChatId, ChatMessage, ChatThread, ContactRef, Group, GroupId, GroupMembership, MessageId,
	MessageKind,
};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use super::{AccountStore, CascadeFailure, CascadeReport, CascadeStep, NewGroupRecord, StoreError, with_deadline};

type AccountRow = (i64, String, String, String, bool, String, String, String);
type MessageRow = (String, i64, String, String, Option<String>, String);

/// `sqlx` SQLite store with embedded migrations.
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

impl SqliteStore {
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
		// Every connection to `:memory:` would otherwise see its own database.
		let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
		let pool = SqlitePoolOptions::new()
			.max_connections(max_connections)
			.connect_with(opts)
			.await?;
		sqlx::migrate!("migrations/sqlite").run(&pool).await?;
		info!(max_connections, "sqlite store ready");
		Ok(Self { pool })
	}

	async fn load_messages(&self, sql: &str, owner: i64) -> Result<Vec<ChatMessage>, StoreError> {
		let rows: Vec<MessageRow> = sqlx::query_as(sql).bind(owner).fetch_all(&self.pool).await?;
		rows.into_iter().map(message_from_row).collect()
	}

	async fn account_exists(&self, id: AccountId) -> Result<bool, StoreError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM accounts WHERE id = ?")
			.bind(id.get())
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.is_some())
	}

	async fn cascade_in_transaction(
		&self,
		record: &AccountRecord,
		limit: Duration,
	) -> Result<CascadeReport, CascadeFailure> {
		let id = record.id.get();
		let mut tx = with_deadline(limit, async { self.pool.begin().await.map_err(StoreError::from) })
			.await
			.map_err(|error| CascadeFailure {
				step: CascadeStep::Transaction,
				error,
			})?;
		let mut report = CascadeReport::default();

		for m in &record.groups {
			let step = CascadeStep::LeaveGroup(m.group_id);
			let sql = "DELETE FROM group_members WHERE group_id = ? AND account_id = ?";
			exec_step(&mut tx, limit, step, sql, &[m.group_id.get(), id]).await?;
			report.groups_left += 1;
		}

		for c in &record.contacts {
			let step = CascadeStep::UnlinkContact {
				contact: c.contact_id,
				chat: c.chat_id,
			};
			let sql = "DELETE FROM contacts WHERE owner_id = ? AND chat_id = ?";
			exec_step(&mut tx, limit, step, sql, &[c.contact_id.get(), c.chat_id.get()]).await?;
			report.contacts_unlinked += 1;

			let step = CascadeStep::DeleteChat(c.chat_id);
			exec_step(&mut tx, limit, step, "DELETE FROM chat_messages WHERE chat_id = ?", &[c.chat_id.get()]).await?;
			exec_step(&mut tx, limit, step, "DELETE FROM chats WHERE id = ?", &[c.chat_id.get()]).await?;
			report.chats_deleted += 1;
		}

		for sql in [
			"DELETE FROM account_groups WHERE account_id = ?",
			"DELETE FROM contacts WHERE owner_id = ?",
			"DELETE FROM accounts WHERE id = ?",
		] {
			exec_step(&mut tx, limit, CascadeStep::RemoveAccount, sql, &[id]).await?;
		}

		with_deadline(limit, async { tx.commit().await.map_err(StoreError::from) })
			.await
			.map_err(|error| CascadeFailure {
				step: CascadeStep::Transaction,
				error,
			})?;
		report.account_removed = true;
		Ok(report)
	}

	async fn group_exists(&self, id: GroupId) -> Result<bool, StoreError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM chat_groups WHERE id = ?")
			.bind(id.get())
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.is_some())
	}
}

fn corrupt(e: impl ToString) -> StoreError {
	StoreError::Corrupt(e.to_string())
}

fn unread(v: i64) -> Result<u32, StoreError> {
	u32::try_from(v).map_err(corrupt)
}

fn message_from_row(row: MessageRow) -> Result<ChatMessage, StoreError> {
	let (message_id, sender, kind, body, file_name, time) = row;
	Ok(ChatMessage {
		message_id: MessageId(uuid::Uuid::parse_str(&message_id).map_err(corrupt)?),
		sender: AccountId::new(sender).map_err(corrupt)?,
		kind: MessageKind::from_str(&kind).map_err(corrupt)?,
		body,
		file_name,
		time,
	})
}

#[async_trait::async_trait]
impl AccountStore for SqliteStore {
	async fn find_account(&self, id: AccountId) -> Result<Option<AccountRecord>, StoreError> {
		let row: Option<AccountRow> = sqlx::query_as(
			"SELECT id, first_name, last_name, image_url, status, hashed_password, secret_question, secret_answer \
			FROM accounts WHERE id = ?",
		)
		.bind(id.get())
		.fetch_optional(&self.pool)
		.await?;

		let Some((_, first_name, last_name, image_url, status, hashed_password, secret_question, secret_answer)) = row
		else {
			return Ok(None);
		};

		let contact_rows: Vec<(i64, i64, i64)> = sqlx::query_as(
			"SELECT contact_id, chat_id, unread_messages FROM contacts WHERE owner_id = ? ORDER BY seq",
		)
		.bind(id.get())
		.fetch_all(&self.pool)
		.await?;
		let mut contacts = Vec::with_capacity(contact_rows.len());
		for (contact_id, chat_id, unread_messages) in contact_rows {
			contacts.push(ContactRef {
				contact_id: AccountId::new(contact_id).map_err(corrupt)?,
				chat_id: ChatId::new(chat_id).map_err(corrupt)?,
				unread_messages: unread(unread_messages)?,
			});
		}

		let group_rows: Vec<(i64, i64)> = sqlx::query_as(
			"SELECT group_id, group_unread_messages FROM account_groups WHERE account_id = ? ORDER BY seq",
		)
		.bind(id.get())
		.fetch_all(&self.pool)
		.await?;
		let mut groups = Vec::with_capacity(group_rows.len());
		for (group_id, group_unread_messages) in group_rows {
			groups.push(GroupMembership {
				group_id: GroupId::new(group_id).map_err(corrupt)?,
				group_unread_messages: unread(group_unread_messages)?,
			});
		}

		Ok(Some(AccountRecord {
			id,
			first_name,
			last_name,
			image_url,
			status,
			hashed_password,
			secret_question,
			secret_answer,
			contacts,
			groups,
		}))
	}

	async fn find_accounts(&self, ids: &[AccountId]) -> Result<Vec<AccountRecord>, StoreError> {
		let mut out = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(rec) = self.find_account(*id).await? {
				out.push(rec);
			}
		}
		Ok(out)
	}

	async fn insert_account(&self, record: &AccountRecord) -> Result<(), StoreError> {
		let mut tx = self.pool.begin().await?;
		let res = sqlx::query(
			"INSERT INTO accounts (id, first_name, last_name, image_url, status, hashed_password, secret_question, secret_answer) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
		)
		.bind(record.id.get())
		.bind(&record.first_name)
		.bind(&record.last_name)
		.bind(&record.image_url)
		.bind(record.status)
		.bind(&record.hashed_password)
		.bind(&record.secret_question)
		.bind(&record.secret_answer)
		.execute(&mut *tx)
		.await?;
		if res.rows_affected() == 0 {
			return Err(StoreError::AlreadyExists(format!("account {}", record.id)));
		}

		for c in &record.contacts {
			sqlx::query("INSERT INTO contacts (owner_id, contact_id, chat_id, unread_messages) VALUES (?, ?, ?, ?)")
				.bind(record.id.get())
				.bind(c.contact_id.get())
				.bind(c.chat_id.get())
				.bind(i64::from(c.unread_messages))
				.execute(&mut *tx)
				.await?;
		}
		for g in &record.groups {
			sqlx::query(
				"INSERT OR IGNORE INTO account_groups (account_id, group_id, group_unread_messages) VALUES (?, ?, ?)",
			)
			.bind(record.id.get())
			.bind(g.group_id.get())
			.bind(i64::from(g.group_unread_messages))
			.execute(&mut *tx)
			.await?;
		}
		tx.commit().await?;
		Ok(())
	}

	async fn delete_account(&self, id: AccountId) -> Result<bool, StoreError> {
		let mut tx = self.pool.begin().await?;
		let res = sqlx::query("DELETE FROM accounts WHERE id = ?")
			.bind(id.get())
			.execute(&mut *tx)
			.await?;
		sqlx::query("DELETE FROM contacts WHERE owner_id = ?")
			.bind(id.get())
			.execute(&mut *tx)
			.await?;
		sqlx::query("DELETE FROM account_groups WHERE account_id = ?")
			.bind(id.get())
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;
		Ok(res.rows_affected() > 0)
	}

	async fn set_status(&self, id: AccountId, online: bool) -> Result<bool, StoreError> {
		let res = sqlx::query("UPDATE accounts SET status = ? WHERE id = ?")
			.bind(online)
			.bind(id.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn set_names(&self, id: AccountId, first_name: &str, last_name: &str) -> Result<bool, StoreError> {
		let res = sqlx::query("UPDATE accounts SET first_name = ?, last_name = ? WHERE id = ?")
			.bind(first_name)
			.bind(last_name)
			.bind(id.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn set_image_url(&self, id: AccountId, image_url: &str) -> Result<bool, StoreError> {
		let res = sqlx::query("UPDATE accounts SET image_url = ? WHERE id = ?")
			.bind(image_url)
			.bind(id.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn set_password(&self, id: AccountId, hashed_password: &str) -> Result<bool, StoreError> {
		let res = sqlx::query("UPDATE accounts SET hashed_password = ? WHERE id = ?")
			.bind(hashed_password)
			.bind(id.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn push_contact(&self, owner: AccountId, contact: &ContactRef) -> Result<bool, StoreError> {
		if !self.account_exists(owner).await? {
			return Ok(false);
		}
		sqlx::query("INSERT INTO contacts (owner_id, contact_id, chat_id, unread_messages) VALUES (?, ?, ?, ?)")
			.bind(owner.get())
			.bind(contact.contact_id.get())
			.bind(contact.chat_id.get())
			.bind(i64::from(contact.unread_messages))
			.execute(&self.pool)
			.await?;
		Ok(true)
	}

	async fn remove_contact(&self, owner: AccountId, chat_id: ChatId) -> Result<u64, StoreError> {
		let res = sqlx::query("DELETE FROM contacts WHERE owner_id = ? AND chat_id = ?")
			.bind(owner.get())
			.bind(chat_id.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected())
	}

	async fn set_contact_unread(&self, owner: AccountId, chat_id: ChatId, unread: u32) -> Result<bool, StoreError> {
		let res = sqlx::query("UPDATE contacts SET unread_messages = ? WHERE owner_id = ? AND chat_id = ?")
			.bind(i64::from(unread))
			.bind(owner.get())
			.bind(chat_id.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn increment_contact_unread(&self, owner: AccountId, chat_id: ChatId) -> Result<bool, StoreError> {
		let res = sqlx::query(
			"UPDATE contacts SET unread_messages = unread_messages + 1 WHERE owner_id = ? AND chat_id = ?",
		)
		.bind(owner.get())
		.bind(chat_id.get())
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn create_chat(&self, messages: &[ChatMessage]) -> Result<ChatId, StoreError> {
		let mut tx = self.pool.begin().await?;
		let id = sqlx::query("INSERT INTO chats DEFAULT VALUES")
			.execute(&mut *tx)
			.await?
			.last_insert_rowid();
		for m in messages {
			insert_message(&mut tx, "chat_messages", "chat_id", id, m).await?;
		}
		tx.commit().await?;
		ChatId::new(id).map_err(corrupt)
	}

	async fn find_chats(&self, ids: &[ChatId]) -> Result<Vec<(ChatId, ChatThread)>, StoreError> {
		let mut out = Vec::with_capacity(ids.len());
		for id in ids {
			let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM chats WHERE id = ?")
				.bind(id.get())
				.fetch_optional(&self.pool)
				.await?;
			if row.is_none() {
				continue;
			}
			let messages = self
				.load_messages(
					"SELECT message_id, sender, kind, body, file_name, time FROM chat_messages \
					WHERE chat_id = ? ORDER BY seq",
					id.get(),
				)
				.await?;
			out.push((*id, ChatThread { messages }));
		}
		Ok(out)
	}

	async fn push_chat_message(&self, chat_id: ChatId, message: &ChatMessage) -> Result<bool, StoreError> {
		let mut tx = self.pool.begin().await?;
		let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM chats WHERE id = ?")
			.bind(chat_id.get())
			.fetch_optional(&mut *tx)
			.await?;
		if row.is_none() {
			return Ok(false);
		}
		insert_message(&mut tx, "chat_messages", "chat_id", chat_id.get(), message).await?;
		tx.commit().await?;
		Ok(true)
	}

	async fn remove_chat_message(
		&self,
		chat_id: ChatId,
		message_id: MessageId,
		sender: AccountId,
	) -> Result<bool, StoreError> {
		let res = sqlx::query("DELETE FROM chat_messages WHERE chat_id = ? AND message_id = ? AND sender = ?")
			.bind(chat_id.get())
			.bind(message_id.to_string())
			.bind(sender.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn delete_chat(&self, chat_id: ChatId) -> Result<bool, StoreError> {
		let mut tx = self.pool.begin().await?;
		let res = sqlx::query("DELETE FROM chats WHERE id = ?")
			.bind(chat_id.get())
			.execute(&mut *tx)
			.await?;
		sqlx::query("DELETE FROM chat_messages WHERE chat_id = ?")
			.bind(chat_id.get())
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;
		Ok(res.rows_affected() > 0)
	}

	async fn insert_group(&self, group: &NewGroupRecord) -> Result<GroupId, StoreError> {
		let mut tx = self.pool.begin().await?;
		let id = sqlx::query("INSERT INTO chat_groups (name, admin_id, image_url) VALUES (?, ?, ?)")
			.bind(&group.name)
			.bind(group.admin.get())
			.bind(&group.image_url)
			.execute(&mut *tx)
			.await?
			.last_insert_rowid();
		for m in &group.members {
			sqlx::query("INSERT OR IGNORE INTO group_members (group_id, account_id) VALUES (?, ?)")
				.bind(id)
				.bind(m.get())
				.execute(&mut *tx)
				.await?;
		}
		tx.commit().await?;
		GroupId::new(id).map_err(corrupt)
	}

	async fn find_groups(&self, ids: &[GroupId]) -> Result<Vec<Group>, StoreError> {
		let mut out = Vec::with_capacity(ids.len());
		for id in ids {
			let row: Option<(String, i64, String)> =
				sqlx::query_as("SELECT name, admin_id, image_url FROM chat_groups WHERE id = ?")
					.bind(id.get())
					.fetch_optional(&self.pool)
					.await?;
			let Some((name, admin_id, image_url)) = row else {
				continue;
			};
			let member_rows: Vec<(i64,)> =
				sqlx::query_as("SELECT account_id FROM group_members WHERE group_id = ? ORDER BY seq")
					.bind(id.get())
					.fetch_all(&self.pool)
					.await?;
			let members = member_rows
				.into_iter()
				.map(|(m,)| AccountId::new(m).map_err(corrupt))
				.collect::<Result<Vec<_>, _>>()?;
			let messages = self
				.load_messages(
					"SELECT message_id, sender, kind, body, file_name, time FROM group_messages \
					WHERE group_id = ? ORDER BY seq",
					id.get(),
				)
				.await?;
			out.push(Group {
				id: *id,
				name,
				admin: AccountId::new(admin_id).map_err(corrupt)?,
				image_url,
				members,
				messages,
			});
		}
		Ok(out)
	}

	async fn set_group_image(&self, group_id: GroupId, image_url: &str) -> Result<bool, StoreError> {
		let res = sqlx::query("UPDATE chat_groups SET image_url = ? WHERE id = ?")
			.bind(image_url)
			.bind(group_id.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn add_group_member(&self, group_id: GroupId, account: AccountId) -> Result<bool, StoreError> {
		if !self.group_exists(group_id).await? {
			return Ok(false);
		}
		let res = sqlx::query("INSERT OR IGNORE INTO group_members (group_id, account_id) VALUES (?, ?)")
			.bind(group_id.get())
			.bind(account.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn remove_group_member(&self, group_id: GroupId, account: AccountId) -> Result<bool, StoreError> {
		let res = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND account_id = ?")
			.bind(group_id.get())
			.bind(account.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn add_membership(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError> {
		if !self.account_exists(account).await? {
			return Ok(false);
		}
		let res = sqlx::query(
			"INSERT OR IGNORE INTO account_groups (account_id, group_id, group_unread_messages) VALUES (?, ?, 0)",
		)
		.bind(account.get())
		.bind(group_id.get())
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn remove_membership(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError> {
		let res = sqlx::query("DELETE FROM account_groups WHERE account_id = ? AND group_id = ?")
			.bind(account.get())
			.bind(group_id.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn set_group_unread(&self, account: AccountId, group_id: GroupId, unread: u32) -> Result<bool, StoreError> {
		let res =
			sqlx::query("UPDATE account_groups SET group_unread_messages = ? WHERE account_id = ? AND group_id = ?")
				.bind(i64::from(unread))
				.bind(account.get())
				.bind(group_id.get())
				.execute(&self.pool)
				.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn increment_group_unread(&self, account: AccountId, group_id: GroupId) -> Result<bool, StoreError> {
		let res = sqlx::query(
			"UPDATE account_groups SET group_unread_messages = group_unread_messages + 1 \
			WHERE account_id = ? AND group_id = ?",
		)
		.bind(account.get())
		.bind(group_id.get())
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn push_group_message(&self, group_id: GroupId, message: &ChatMessage) -> Result<bool, StoreError> {
		let mut tx = self.pool.begin().await?;
		let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM chat_groups WHERE id = ?")
			.bind(group_id.get())
			.fetch_optional(&mut *tx)
			.await?;
		if row.is_none() {
			return Ok(false);
		}
		insert_message(&mut tx, "group_messages", "group_id", group_id.get(), message).await?;
		tx.commit().await?;
		Ok(true)
	}

	async fn remove_group_message(
		&self,
		group_id: GroupId,
		message_id: MessageId,
		sender: AccountId,
	) -> Result<bool, StoreError> {
		let res = sqlx::query("DELETE FROM group_messages WHERE group_id = ? AND message_id = ? AND sender = ?")
			.bind(group_id.get())
			.bind(message_id.to_string())
			.bind(sender.get())
			.execute(&self.pool)
			.await?;
		Ok(res.rows_affected() > 0)
	}

	/// The whole cascade commits or rolls back as one transaction.
	async fn delete_account_cascade(&self, record: &AccountRecord, step_timeout: Duration) -> CascadeReport {
		match self.cascade_in_transaction(record, step_timeout).await {
			Ok(report) => report,
			Err(failure) => CascadeReport {
				failures: vec![failure],
				..CascadeReport::default()
			},
		}
	}
}

/// Run one cascade statement inside `tx`. Dropping `tx` on error rolls everything back.
async fn exec_step(
	tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
	limit: Duration,
	step: CascadeStep,
	sql: &'static str,
	binds: &[i64],
) -> Result<u64, CascadeFailure> {
	let mut query = sqlx::query(sql);
	for b in binds {
		query = query.bind(*b);
	}
	with_deadline(limit, async { query.execute(&mut **tx).await.map_err(StoreError::from) })
		.await
		.map(|res| res.rows_affected())
		.map_err(|error| CascadeFailure { step, error })
}

async fn insert_message(
	tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
	table: &'static str,
	owner_column: &'static str,
	owner: i64,
	m: &ChatMessage,
) -> Result<(), StoreError> {
	let sql = format!(
		"INSERT INTO {table} ({owner_column}, message_id, sender, kind, body, file_name, time) \
		VALUES (?, ?, ?, ?, ?, ?, ?)"
	);
	sqlx::query(&sql)
		.bind(owner)
		.bind(m.message_id.to_string())
		.bind(m.sender.get())
		.bind(m.kind.as_str())
		.bind(&m.body)
		.bind(m.file_name.as_deref())
		.bind(&m.time)
		.execute(&mut **tx)
		.await?;
	Ok(())
}
