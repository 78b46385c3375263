#![forbid(unsafe_code)]

use murmur_domain::{AccountId, AccountRecord, ChatId, ChatMessage, ContactInfo, GroupId, MessageId};
use serde::Serialize;

use crate::inbound::MessageType;

/// Any frame the server writes to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
	Response(Response),
	Event(Event),
}

impl From<Response> for OutboundFrame {
	fn from(r: Response) -> Self {
		OutboundFrame::Response(r)
	}
}

impl From<Event> for OutboundFrame {
	fn from(e: Event) -> Self {
		OutboundFrame::Event(e)
	}
}

/// Reply to a request, tagged with the request's own type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
	#[serde(rename = "type")]
	pub kind: MessageType,
	pub status: bool,
	pub message: String,
	#[serde(flatten)]
	pub data: Option<ResponseData>,
}

impl Response {
	pub fn ok(kind: MessageType, message: impl Into<String>) -> Self {
		Self {
			kind,
			status: true,
			message: message.into(),
			data: None,
		}
	}

	/// Uniform failure envelope `{type, status:false, message}`.
	pub fn failure(kind: MessageType, message: impl Into<String>) -> Self {
		Self {
			kind,
			status: false,
			message: message.into(),
			data: None,
		}
	}

	pub fn with_data(mut self, data: ResponseData) -> Self {
		self.data = Some(data);
		self
	}
}

/// Type-specific fields merged into a successful response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
	Login(Box<LoginSnapshot>),
	Contacts {
		json_array: Vec<HydratedContact>,
	},
	Groups {
		groups: Vec<HydratedGroup>,
	},
	SecretQuestion {
		secret_question: String,
	},
	Image {
		image_url: String,
	},
	Sent {
		message_id: MessageId,
		#[serde(skip_serializing_if = "Option::is_none")]
		url: Option<String>,
	},
}

/// Server-initiated push to a peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
	ClientConnected {
		phone_number: AccountId,
	},
	ClientDisconnected {
		phone_number: AccountId,
	},
	AddedYou {
		message: String,
		json_array: Vec<HydratedContact>,
	},
	Text(DirectMessageEvent),
	File(DirectMessageEvent),
	Audio(DirectMessageEvent),
	IsTyping {
		phone_number: AccountId,
	},
	ClientProfileImage {
		phone_number: AccountId,
		image_url: String,
	},
	ContactInfoUpdated {
		phone_number: AccountId,
		first_name: String,
		last_name: String,
	},
	ContactDeleted {
		phone_number: AccountId,
	},
	MessageDeleted {
		#[serde(rename = "chatID")]
		chat_id: ChatId,
		message_id: MessageId,
	},
	AddedToGroup {
		groups: Vec<HydratedGroup>,
	},
	RemovedFromGroup {
		#[serde(rename = "groupID")]
		group_id: GroupId,
	},
	GroupMemberAdded {
		#[serde(rename = "groupID")]
		group_id: GroupId,
		phone_number: AccountId,
	},
	GroupMemberRemoved {
		#[serde(rename = "groupID")]
		group_id: GroupId,
		phone_number: AccountId,
	},
	GroupText(GroupMessageEvent),
	GroupFile(GroupMessageEvent),
	GroupAudio(GroupMessageEvent),
	GroupIsTyping {
		#[serde(rename = "groupID")]
		group_id: GroupId,
		phone_number: AccountId,
	},
	GroupProfileImage {
		#[serde(rename = "groupID")]
		group_id: GroupId,
		group_image_url: String,
	},
	GroupMessageDeleted {
		#[serde(rename = "groupID")]
		group_id: GroupId,
		message_id: MessageId,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectMessageEvent {
	#[serde(rename = "chatID")]
	pub chat_id: ChatId,
	#[serde(flatten)]
	pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMessageEvent {
	#[serde(rename = "groupID")]
	pub group_id: GroupId,
	#[serde(flatten)]
	pub message: ChatMessage,
}

/// Account fields returned to their owner at login. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountProfile {
	#[serde(rename = "_id")]
	pub id: AccountId,
	pub first_name: String,
	pub last_name: String,
	pub image_url: String,
	pub status: bool,
	pub secret_question: String,
}

impl From<&AccountRecord> for AccountProfile {
	fn from(rec: &AccountRecord) -> Self {
		Self {
			id: rec.id,
			first_name: rec.first_name.clone(),
			last_name: rec.last_name.clone(),
			image_url: rec.image_url.clone(),
			status: rec.status,
			secret_question: rec.secret_question.clone(),
		}
	}
}

/// Contact joined with its identity fields and shared chat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HydratedContact {
	#[serde(rename = "contactInfo")]
	pub contact_info: ContactInfo,
	#[serde(rename = "chatID")]
	pub chat_id: ChatId,
	pub unread_messages: u32,
	#[serde(rename = "chatMessages")]
	pub chat_messages: Vec<ChatMessage>,
}

/// Group joined with the member's unread counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HydratedGroup {
	#[serde(rename = "_id")]
	pub id: GroupId,
	pub group_name: String,
	pub group_unread_messages: u32,
	pub group_image_url: String,
	pub group_admin: AccountId,
	pub group_members: Vec<AccountId>,
	pub group_messages: Vec<ChatMessage>,
}

/// Everything a client needs right after login.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginSnapshot {
	pub my_info: AccountProfile,
	pub contacts: Vec<HydratedContact>,
	pub groups: Vec<HydratedGroup>,
}
