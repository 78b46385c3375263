#![forbid(unsafe_code)]

pub mod codec;
pub mod inbound;
pub mod outbound;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, ProtocolError, decode_inbound, encode_outbound};
pub use inbound::{InboundMessage, MessageType};
pub use outbound::{Event, OutboundFrame, Response, ResponseData};
