use murmur_domain::{AccountId, ChatId, ChatMessage, GroupId};
use murmur_protocol::inbound::{DirectText, LoginRequest, NewGroup};
use murmur_protocol::outbound::{DirectMessageEvent, HydratedContact};
use murmur_protocol::{
	DEFAULT_MAX_FRAME_SIZE, Event, InboundMessage, MessageType, OutboundFrame, ProtocolError, Response, ResponseData,
	decode_inbound, encode_outbound,
};
use proptest::prelude::*;
use serde_json::{Value, json};

fn account(id: i64) -> AccountId {
	AccountId::new(id).expect("valid account id")
}

fn decode(v: Value) -> Result<InboundMessage, ProtocolError> {
	decode_inbound(v.to_string().as_bytes(), DEFAULT_MAX_FRAME_SIZE)
}

fn encode(frame: impl Into<OutboundFrame>) -> Value {
	let text = encode_outbound(&frame.into(), DEFAULT_MAX_FRAME_SIZE).expect("encode");
	serde_json::from_str(&text).expect("valid json")
}

#[test]
fn login_request_decodes_with_optional_time_zone() {
	let msg = decode(json!({"type": "login_request", "phone_number": 5551234, "password": "pw"})).expect("decode");
	assert_eq!(
		msg,
		InboundMessage::LoginRequest(LoginRequest {
			phone_number: account(5551234),
			password: "pw".to_string(),
			time_zone: None,
		})
	);
	assert_eq!(msg.message_type(), MessageType::LoginRequest);
}

#[test]
fn text_uses_camel_case_chat_id() {
	let msg = decode(json!({
		"type": "text",
		"receiver": 2,
		"chatID": 99,
		"message": "hi",
		"time": "10:02",
		"extra_client_field": true
	}))
	.expect("decode");

	assert_eq!(
		msg,
		InboundMessage::Text(DirectText {
			receiver: account(2),
			chat_id: ChatId::new(99).unwrap(),
			message: "hi".to_string(),
			time: "10:02".to_string(),
		})
	);
}

#[test]
fn update_info_is_tagged_contact_info_updated() {
	let msg = decode(json!({"type": "contact_info_updated", "first_name": "A", "last_name": "B"})).expect("decode");
	assert_eq!(msg.message_type(), MessageType::UpdateInfo);
}

#[test]
fn unit_messages_ignore_extra_fields() {
	let msg = decode(json!({"type": "delete_account", "phone_number": 3})).expect("decode");
	assert_eq!(msg, InboundMessage::DeleteAccount);
}

#[test]
fn attachments_are_base64_decoded_once() {
	let msg = decode(json!({
		"type": "file",
		"receiver": 2,
		"chatID": 4,
		"file_name": "notes.txt",
		"file_data": "aGVsbG8="
	}))
	.expect("decode");

	match msg {
		InboundMessage::File(f) => assert_eq!(f.file_data, b"hello"),
		other => panic!("expected file, got {other:?}"),
	}

	let err = decode(json!({
		"type": "file",
		"receiver": 2,
		"chatID": 4,
		"file_name": "notes.txt",
		"file_data": "%%%"
	}))
	.unwrap_err();
	assert_eq!(err.reply_type(), Some(MessageType::File));
}

#[test]
fn non_positive_ids_are_rejected_at_decode_time() {
	let err = decode(json!({"type": "lookup_friend", "phone_number": 0})).unwrap_err();
	match err {
		ProtocolError::InvalidPayload { message_type, .. } => assert_eq!(message_type, MessageType::LookupFriend),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn blank_required_fields_fail_validation() {
	let err = decode(json!({
		"type": "sign_up",
		"phone_number": 1,
		"first_name": "  ",
		"last_name": "x",
		"password": "pw"
	}))
	.unwrap_err();
	assert!(err.to_string().contains("first_name"), "{err}");
}

#[test]
fn new_group_members_default_to_empty() {
	let msg = decode(json!({"type": "new_group", "group_name": "climbers"})).expect("decode");
	assert_eq!(
		msg,
		InboundMessage::NewGroup(NewGroup {
			group_name: "climbers".to_string(),
			group_members: Vec::new(),
		})
	);
}

#[test]
fn failure_response_is_uniform() {
	let v = encode(Response::failure(MessageType::LoginRequest, "already connected elsewhere"));
	assert_eq!(
		v,
		json!({"type": "login_request", "status": false, "message": "already connected elsewhere"})
	);
}

#[test]
fn response_data_is_flattened() {
	let v = encode(
		Response::ok(MessageType::RetrieveQuestion, "ok").with_data(ResponseData::SecretQuestion {
			secret_question: "first pet?".to_string(),
		}),
	);
	assert_eq!(v["type"], "retrieve_question");
	assert_eq!(v["status"], true);
	assert_eq!(v["secret_question"], "first pet?");
}

#[test]
fn presence_events_carry_subject_phone_number() {
	let v = encode(Event::ClientConnected {
		phone_number: account(42),
	});
	assert_eq!(v, json!({"type": "client_connected", "phone_number": 42}));
}

#[test]
fn direct_message_event_flattens_the_stored_message() {
	let message = ChatMessage::text(account(1), "yo", "09:00");
	let id = message.message_id.to_string();
	let v = encode(Event::Text(DirectMessageEvent {
		chat_id: ChatId::new(8).unwrap(),
		message,
	}));

	assert_eq!(v["type"], "text");
	assert_eq!(v["chatID"], 8);
	assert_eq!(v["sender"], 1);
	assert_eq!(v["message"], "yo");
	assert_eq!(v["message_id"], id);
}

#[test]
fn hydrated_contact_uses_wire_names() {
	let rec = murmur_domain::AccountRecord::new(account(2), "B", "C", "h");
	let v = encode(Event::AddedYou {
		message: "1 added You".to_string(),
		json_array: vec![HydratedContact {
			contact_info: rec.info(),
			chat_id: ChatId::new(3).unwrap(),
			unread_messages: 0,
			chat_messages: Vec::new(),
		}],
	});
	assert_eq!(v["json_array"][0]["contactInfo"]["_id"], 2);
	assert_eq!(v["json_array"][0]["chatID"], 3);
	assert!(v["json_array"][0]["chatMessages"].as_array().unwrap().is_empty());
}

#[test]
fn encode_rejects_too_large() {
	let frame: OutboundFrame = Event::GroupProfileImage {
		group_id: GroupId::new(1).unwrap(),
		group_image_url: "u".repeat(128),
	}
	.into();
	match encode_outbound(&frame, 32) {
		Err(ProtocolError::FrameTooLarge { len, max }) => assert!(len > max),
		other => panic!("unexpected result: {other:?}"),
	}
}

proptest! {
	#[test]
	fn arbitrary_bytes_never_panic_the_decoder(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
		let _ = decode_inbound(&bytes, DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	fn unknown_tags_are_never_answered(tag in "[a-z_]{1,24}") {
		prop_assume!(MessageType::from_tag(&tag).is_none());
		let frame = json!({"type": tag}).to_string();
		let err = decode_inbound(frame.as_bytes(), DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		prop_assert!(matches!(err, ProtocolError::UnknownType(_)));
		prop_assert_eq!(err.reply_type(), None);
	}
}
