#![forbid(unsafe_code)]

use core::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use murmur_domain::{AccountId, ChatId, GroupId, MessageId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Every `type` tag the server accepts from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
	SignUp,
	LoginRequest,
	LookupFriend,
	Text,
	File,
	Audio,
	IsTyping,
	ProfileImage,
	ProfileImageDeleted,
	UpdateInfo,
	UpdatePassword,
	RetrieveQuestion,
	NewGroup,
	GroupText,
	GroupFile,
	GroupAudio,
	GroupIsTyping,
	GroupProfileImage,
	AddGroupMember,
	RemoveGroupMember,
	DeleteMessage,
	DeleteGroupMessage,
	UpdateUnreadMessage,
	UpdateGroupUnreadMessage,
	DeleteAccount,
}

impl MessageType {
	pub const ALL: [MessageType; 25] = [
		MessageType::SignUp,
		MessageType::LoginRequest,
		MessageType::LookupFriend,
		MessageType::Text,
		MessageType::File,
		MessageType::Audio,
		MessageType::IsTyping,
		MessageType::ProfileImage,
		MessageType::ProfileImageDeleted,
		MessageType::UpdateInfo,
		MessageType::UpdatePassword,
		MessageType::RetrieveQuestion,
		MessageType::NewGroup,
		MessageType::GroupText,
		MessageType::GroupFile,
		MessageType::GroupAudio,
		MessageType::GroupIsTyping,
		MessageType::GroupProfileImage,
		MessageType::AddGroupMember,
		MessageType::RemoveGroupMember,
		MessageType::DeleteMessage,
		MessageType::DeleteGroupMessage,
		MessageType::UpdateUnreadMessage,
		MessageType::UpdateGroupUnreadMessage,
		MessageType::DeleteAccount,
	];

	/// Wire tag.
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageType::SignUp => "sign_up",
			MessageType::LoginRequest => "login_request",
			MessageType::LookupFriend => "lookup_friend",
			MessageType::Text => "text",
			MessageType::File => "file",
			MessageType::Audio => "audio",
			MessageType::IsTyping => "is_typing",
			MessageType::ProfileImage => "profile_image",
			MessageType::ProfileImageDeleted => "profile_image_deleted",
			MessageType::UpdateInfo => "contact_info_updated",
			MessageType::UpdatePassword => "update_password",
			MessageType::RetrieveQuestion => "retrieve_question",
			MessageType::NewGroup => "new_group",
			MessageType::GroupText => "group_text",
			MessageType::GroupFile => "group_file",
			MessageType::GroupAudio => "group_audio",
			MessageType::GroupIsTyping => "group_is_typing",
			MessageType::GroupProfileImage => "group_profile_image",
			MessageType::AddGroupMember => "add_group_member",
			MessageType::RemoveGroupMember => "remove_group_member",
			MessageType::DeleteMessage => "delete_message",
			MessageType::DeleteGroupMessage => "delete_group_message",
			MessageType::UpdateUnreadMessage => "update_unread_message",
			MessageType::UpdateGroupUnreadMessage => "update_group_unread_message",
			MessageType::DeleteAccount => "delete_account",
		}
	}

	pub fn from_tag(tag: &str) -> Option<Self> {
		Self::ALL.iter().copied().find(|t| t.as_str() == tag)
	}

	/// Whether the message may be handled before the session is bound to an account.
	pub const fn allowed_before_login(self) -> bool {
		matches!(
			self,
			MessageType::SignUp | MessageType::LoginRequest | MessageType::UpdatePassword | MessageType::RetrieveQuestion
		)
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl Serialize for MessageType {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

/// Decoded client message. One statically checked payload shape per tag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
	SignUp(SignUp),
	LoginRequest(LoginRequest),
	LookupFriend(AccountRef),
	Text(DirectText),
	File(DirectAttachment),
	Audio(DirectAttachment),
	IsTyping(IsTyping),
	ProfileImage(Upload),
	ProfileImageDeleted,
	#[serde(rename = "contact_info_updated")]
	UpdateInfo(UpdateInfo),
	UpdatePassword(UpdatePassword),
	RetrieveQuestion(AccountRef),
	NewGroup(NewGroup),
	GroupText(GroupText),
	GroupFile(GroupAttachment),
	GroupAudio(GroupAttachment),
	GroupIsTyping(GroupRef),
	GroupProfileImage(GroupUpload),
	AddGroupMember(GroupMemberChange),
	RemoveGroupMember(GroupMemberChange),
	DeleteMessage(DeleteMessage),
	DeleteGroupMessage(DeleteGroupMessage),
	UpdateUnreadMessage(ChatRef),
	UpdateGroupUnreadMessage(GroupRef),
	DeleteAccount,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignUp {
	pub phone_number: AccountId,
	pub first_name: String,
	pub last_name: String,
	pub password: String,
	#[serde(default)]
	pub secret_question: String,
	#[serde(default)]
	pub secret_answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginRequest {
	pub phone_number: AccountId,
	pub password: String,
	#[serde(default)]
	pub time_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountRef {
	pub phone_number: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectText {
	pub receiver: AccountId,
	#[serde(rename = "chatID")]
	pub chat_id: ChatId,
	pub message: String,
	#[serde(default)]
	pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectAttachment {
	pub receiver: AccountId,
	#[serde(rename = "chatID")]
	pub chat_id: ChatId,
	pub file_name: String,
	#[serde(deserialize_with = "base64_bytes")]
	pub file_data: Vec<u8>,
	#[serde(default)]
	pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IsTyping {
	pub receiver: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Upload {
	pub file_name: String,
	#[serde(deserialize_with = "base64_bytes")]
	pub file_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateInfo {
	pub first_name: String,
	pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdatePassword {
	pub phone_number: AccountId,
	pub secret_answer: String,
	pub new_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewGroup {
	pub group_name: String,
	#[serde(default)]
	pub group_members: Vec<AccountId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupText {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	pub message: String,
	#[serde(default)]
	pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupAttachment {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	pub file_name: String,
	#[serde(deserialize_with = "base64_bytes")]
	pub file_data: Vec<u8>,
	#[serde(default)]
	pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupRef {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupUpload {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	pub file_name: String,
	#[serde(deserialize_with = "base64_bytes")]
	pub file_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupMemberChange {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	pub phone_number: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeleteMessage {
	#[serde(rename = "chatID")]
	pub chat_id: ChatId,
	pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeleteGroupMessage {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatRef {
	#[serde(rename = "chatID")]
	pub chat_id: ChatId,
}

fn base64_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
	D: Deserializer<'de>,
{
	let s = String::deserialize(deserializer)?;
	STANDARD.decode(s.trim()).map_err(serde::de::Error::custom)
}

fn require(field: &str, value: &str) -> Result<(), String> {
	if value.trim().is_empty() {
		return Err(format!("{field} must be non-empty"));
	}
	Ok(())
}

fn require_file(file_name: &str, file_data: &[u8]) -> Result<(), String> {
	require("file_name", file_name)?;
	if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
		return Err("file_name must not contain path separators".to_string());
	}
	if file_data.is_empty() {
		return Err("file_data must be non-empty".to_string());
	}
	Ok(())
}

impl InboundMessage {
	pub fn message_type(&self) -> MessageType {
		match self {
			InboundMessage::SignUp(_) => MessageType::SignUp,
			InboundMessage::LoginRequest(_) => MessageType::LoginRequest,
			InboundMessage::LookupFriend(_) => MessageType::LookupFriend,
			InboundMessage::Text(_) => MessageType::Text,
			InboundMessage::File(_) => MessageType::File,
			InboundMessage::Audio(_) => MessageType::Audio,
			InboundMessage::IsTyping(_) => MessageType::IsTyping,
			InboundMessage::ProfileImage(_) => MessageType::ProfileImage,
			InboundMessage::ProfileImageDeleted => MessageType::ProfileImageDeleted,
			InboundMessage::UpdateInfo(_) => MessageType::UpdateInfo,
			InboundMessage::UpdatePassword(_) => MessageType::UpdatePassword,
			InboundMessage::RetrieveQuestion(_) => MessageType::RetrieveQuestion,
			InboundMessage::NewGroup(_) => MessageType::NewGroup,
			InboundMessage::GroupText(_) => MessageType::GroupText,
			InboundMessage::GroupFile(_) => MessageType::GroupFile,
			InboundMessage::GroupAudio(_) => MessageType::GroupAudio,
			InboundMessage::GroupIsTyping(_) => MessageType::GroupIsTyping,
			InboundMessage::GroupProfileImage(_) => MessageType::GroupProfileImage,
			InboundMessage::AddGroupMember(_) => MessageType::AddGroupMember,
			InboundMessage::RemoveGroupMember(_) => MessageType::RemoveGroupMember,
			InboundMessage::DeleteMessage(_) => MessageType::DeleteMessage,
			InboundMessage::DeleteGroupMessage(_) => MessageType::DeleteGroupMessage,
			InboundMessage::UpdateUnreadMessage(_) => MessageType::UpdateUnreadMessage,
			InboundMessage::UpdateGroupUnreadMessage(_) => MessageType::UpdateGroupUnreadMessage,
			InboundMessage::DeleteAccount => MessageType::DeleteAccount,
		}
	}

	/// Field-level checks serde cannot express. Run once by the decoder.
	pub fn validate(&self) -> Result<(), String> {
		match self {
			InboundMessage::SignUp(m) => {
				require("first_name", &m.first_name)?;
				require("last_name", &m.last_name)?;
				require("password", &m.password)
			}
			InboundMessage::LoginRequest(m) => require("password", &m.password),
			InboundMessage::Text(m) => require("message", &m.message),
			InboundMessage::File(m) | InboundMessage::Audio(m) => require_file(&m.file_name, &m.file_data),
			InboundMessage::ProfileImage(m) => require_file(&m.file_name, &m.file_data),
			InboundMessage::UpdateInfo(m) => {
				require("first_name", &m.first_name)?;
				require("last_name", &m.last_name)
			}
			InboundMessage::UpdatePassword(m) => {
				require("secret_answer", &m.secret_answer)?;
				require("new_password", &m.new_password)
			}
			InboundMessage::NewGroup(m) => require("group_name", &m.group_name),
			InboundMessage::GroupText(m) => require("message", &m.message),
			InboundMessage::GroupFile(m) | InboundMessage::GroupAudio(m) => require_file(&m.file_name, &m.file_data),
			InboundMessage::GroupProfileImage(m) => require_file(&m.file_name, &m.file_data),
			InboundMessage::LookupFriend(_)
			| InboundMessage::IsTyping(_)
			| InboundMessage::ProfileImageDeleted
			| InboundMessage::RetrieveQuestion(_)
			| InboundMessage::GroupIsTyping(_)
			| InboundMessage::AddGroupMember(_)
			| InboundMessage::RemoveGroupMember(_)
			| InboundMessage::DeleteMessage(_)
			| InboundMessage::DeleteGroupMessage(_)
			| InboundMessage::UpdateUnreadMessage(_)
			| InboundMessage::UpdateGroupUnreadMessage(_)
			| InboundMessage::DeleteAccount => Ok(()),
		}
	}
}
