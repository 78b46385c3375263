#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Image url assigned to accounts without a custom profile picture.
pub const DEFAULT_PROFILE_IMAGE_URL: &str = "https://slays3.s3.us-east-1.amazonaws.com/contact.png";

/// Image url assigned to freshly created groups.
pub const DEFAULT_GROUP_IMAGE_URL: &str = "https://slays3.s3.amazonaws.com/networking.png";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("identifier must be positive: {0}")]
	NotPositive(i64),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! numeric_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "i64", into = "i64")]
		pub struct $name(i64);

		impl $name {
			/// Create a positive identifier.
			pub fn new(id: i64) -> Result<Self, ParseIdError> {
				if id <= 0 {
					return Err(ParseIdError::NotPositive(id));
				}
				Ok(Self(id))
			}

			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl TryFrom<i64> for $name {
			type Error = ParseIdError;

			fn try_from(id: i64) -> Result<Self, Self::Error> {
				Self::new(id)
			}
		}

		impl From<$name> for i64 {
			fn from(id: $name) -> i64 {
				id.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				let id = s
					.parse::<i64>()
					.map_err(|_| ParseIdError::InvalidFormat(s.to_string()))?;
				Self::new(id)
			}
		}
	};
}

numeric_id!(
	/// Stable account identifier (the account's phone number).
	AccountId
);

numeric_id!(
	/// Identifier of a one-to-one chat thread shared by two contacts.
	ChatId
);

numeric_id!(
	/// Group identifier.
	GroupId
);

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Identifier of a live transport session. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "s{}", self.0)
	}
}

/// Kind of content carried by a chat or group message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	#[default]
	Text,
	File,
	Audio,
}

impl MessageKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::File => "file",
			MessageKind::Audio => "audio",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"text" => Ok(MessageKind::Text),
			"file" => Ok(MessageKind::File),
			"audio" => Ok(MessageKind::Audio),
			"" => Err(ParseIdError::Empty),
			other => Err(ParseIdError::InvalidFormat(other.to_string())),
		}
	}
}

/// A single message stored in a chat thread or a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub message_id: MessageId,
	pub sender: AccountId,
	#[serde(default)]
	pub kind: MessageKind,
	/// Text for `Text`, blob reference for `File`/`Audio`.
	#[serde(rename = "message")]
	pub body: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file_name: Option<String>,
	/// Display time as supplied by the sending client.
	pub time: String,
}

impl ChatMessage {
	pub fn text(sender: AccountId, body: impl Into<String>, time: impl Into<String>) -> Self {
		Self {
			message_id: MessageId::new_v4(),
			sender,
			kind: MessageKind::Text,
			body: body.into(),
			file_name: None,
			time: time.into(),
		}
	}
}

/// Contact relation as stored on the owning account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
	#[serde(rename = "contactID")]
	pub contact_id: AccountId,
	#[serde(rename = "chatID")]
	pub chat_id: ChatId,
	#[serde(default)]
	pub unread_messages: u32,
}

/// Group membership as stored on the member's account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	#[serde(default)]
	pub group_unread_messages: u32,
}

/// Persisted account document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
	pub id: AccountId,
	pub first_name: String,
	pub last_name: String,
	pub image_url: String,
	pub status: bool,
	/// Opaque credential hash produced by the credential service.
	pub hashed_password: String,
	pub secret_question: String,
	pub secret_answer: String,
	pub contacts: Vec<ContactRef>,
	pub groups: Vec<GroupMembership>,
}

impl AccountRecord {
	/// A freshly signed-up, offline account with no relations.
	pub fn new(
		id: AccountId,
		first_name: impl Into<String>,
		last_name: impl Into<String>,
		hashed_password: impl Into<String>,
	) -> Self {
		Self {
			id,
			first_name: first_name.into(),
			last_name: last_name.into(),
			image_url: DEFAULT_PROFILE_IMAGE_URL.to_string(),
			status: false,
			hashed_password: hashed_password.into(),
			secret_question: String::new(),
			secret_answer: String::new(),
			contacts: Vec::new(),
			groups: Vec::new(),
		}
	}

	pub fn contact_ids(&self) -> Vec<AccountId> {
		self.contacts.iter().map(|c| c.contact_id).collect()
	}

	pub fn contact(&self, contact_id: AccountId) -> Option<&ContactRef> {
		self.contacts.iter().find(|c| c.contact_id == contact_id)
	}

	pub fn contact_by_chat(&self, chat_id: ChatId) -> Option<&ContactRef> {
		self.contacts.iter().find(|c| c.chat_id == chat_id)
	}

	pub fn is_member_of(&self, group_id: GroupId) -> bool {
		self.groups.iter().any(|g| g.group_id == group_id)
	}

	/// Public identity fields shown to contacts.
	pub fn info(&self) -> ContactInfo {
		ContactInfo {
			id: self.id,
			first_name: self.first_name.clone(),
			last_name: self.last_name.clone(),
			status: self.status,
			image_url: self.image_url.clone(),
		}
	}
}

/// Identity fields of an account as seen by its contacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
	#[serde(rename = "_id")]
	pub id: AccountId,
	pub first_name: String,
	pub last_name: String,
	pub status: bool,
	pub image_url: String,
}

/// One-to-one conversation shared by two contacts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatThread {
	pub messages: Vec<ChatMessage>,
}

/// Persisted group document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
	pub id: GroupId,
	pub name: String,
	pub admin: AccountId,
	pub image_url: String,
	pub members: Vec<AccountId>,
	pub messages: Vec<ChatMessage>,
}

impl Group {
	pub fn has_member(&self, account: AccountId) -> bool {
		self.members.contains(&account)
	}
}
