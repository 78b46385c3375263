#![forbid(unsafe_code)]

use serde_json::Value;
use thiserror::Error;

use crate::inbound::{InboundMessage, MessageType};
use crate::outbound::OutboundFrame;

/// Default maximum frame size. Attachments travel inline as base64.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("malformed json: {0}")]
	Malformed(#[source] serde_json::Error),

	#[error("frame is not a json object")]
	NotAnObject,

	#[error("missing or non-string `type` field")]
	MissingType,

	#[error("unknown message type: {0}")]
	UnknownType(String),

	#[error("invalid {message_type} payload: {reason}")]
	InvalidPayload {
		message_type: MessageType,
		reason: String,
	},

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

impl ProtocolError {
	/// The message type to answer with, when the frame named a known type.
	///
	/// `None` means the frame is dropped without a reply.
	pub fn reply_type(&self) -> Option<MessageType> {
		match self {
			ProtocolError::InvalidPayload { message_type, .. } => Some(*message_type),
			_ => None,
		}
	}
}

/// Decode and validate one inbound frame.
pub fn decode_inbound(src: &[u8], max_frame_size: usize) -> Result<InboundMessage, ProtocolError> {
	if src.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	let value: Value = serde_json::from_slice(src).map_err(ProtocolError::Malformed)?;
	let Some(obj) = value.as_object() else {
		return Err(ProtocolError::NotAnObject);
	};

	let tag = obj
		.get("type")
		.and_then(Value::as_str)
		.ok_or(ProtocolError::MissingType)?;
	let message_type = MessageType::from_tag(tag).ok_or_else(|| ProtocolError::UnknownType(tag.to_string()))?;

	let msg: InboundMessage = serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
		message_type,
		reason: e.to_string(),
	})?;

	msg.validate()
		.map_err(|reason| ProtocolError::InvalidPayload { message_type, reason })?;

	Ok(msg)
}

/// Encode an outbound frame as a JSON text frame.
pub fn encode_outbound(frame: &OutboundFrame, max_frame_size: usize) -> Result<String, ProtocolError> {
	let text = serde_json::to_string(frame).map_err(ProtocolError::Encode)?;
	if text.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_frames_over_the_limit_before_parsing() {
		let err = decode_inbound(&[b' '; 64], 32).unwrap_err();
		match err {
			ProtocolError::FrameTooLarge { len, max } => {
				assert_eq!(len, 64);
				assert_eq!(max, 32);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn distinguishes_missing_and_unknown_type() {
		assert!(matches!(
			decode_inbound(br#"{"phone_number": 1}"#, DEFAULT_MAX_FRAME_SIZE),
			Err(ProtocolError::MissingType)
		));
		assert!(matches!(
			decode_inbound(br#"{"type": 7}"#, DEFAULT_MAX_FRAME_SIZE),
			Err(ProtocolError::MissingType)
		));
		match decode_inbound(br#"{"type": "not_a_real_type"}"#, DEFAULT_MAX_FRAME_SIZE) {
			Err(ProtocolError::UnknownType(t)) => assert_eq!(t, "not_a_real_type"),
			other => panic!("unexpected result: {other:?}"),
		}
		assert!(matches!(
			decode_inbound(b"[1,2]", DEFAULT_MAX_FRAME_SIZE),
			Err(ProtocolError::NotAnObject)
		));
	}

	#[test]
	fn only_invalid_payloads_get_a_reply() {
		let err = decode_inbound(br#"{"type": "lookup_friend"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert_eq!(err.reply_type(), Some(MessageType::LookupFriend));

		let err = decode_inbound(b"{not json", DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert_eq!(err.reply_type(), None);
	}
}
