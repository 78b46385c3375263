#![forbid(unsafe_code)]

use std::sync::Arc;

use murmur_protocol::{Response, decode_inbound};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::ServerContext;
use crate::server::handlers;
use crate::server::registry::SessionHandle;

/// What happened to one inbound frame.
#[derive(Debug)]
pub enum Dispatched {
	/// Undecodable or unknown type; nothing was sent.
	Dropped,
	/// Known type with an invalid payload; a failure frame was queued for the sender.
	Rejected,
	/// Handed to a handler task.
	Spawned(JoinHandle<()>),
}

/// Per-connection dispatcher. Each decoded message runs in its own task; at most
/// `max_inflight_per_conn` run at once, after which `dispatch` waits for a slot.
pub struct Dispatcher {
	ctx: ServerContext,
	session: SessionHandle,
	inflight: Arc<Semaphore>,
}

impl Dispatcher {
	pub fn new(ctx: ServerContext, session: SessionHandle) -> Self {
		let inflight = Arc::new(Semaphore::new(ctx.settings.max_inflight_per_conn.max(1)));
		Self { ctx, session, inflight }
	}

	pub async fn dispatch(&self, frame: &[u8]) -> Dispatched {
		let session_id = self.session.id();
		metrics::counter!("murmur_server_frames_in_total").increment(1);

		let msg = match decode_inbound(frame, self.ctx.settings.max_frame_bytes) {
			Ok(msg) => msg,
			Err(e) => {
				metrics::counter!("murmur_server_protocol_errors_total").increment(1);
				let Some(kind) = e.reply_type() else {
					debug!(%session_id, error = %e, "dropping inbound frame");
					return Dispatched::Dropped;
				};
				debug!(%session_id, %kind, error = %e, "rejecting invalid payload");
				if let Err(err) = self.session.try_send(Response::failure(kind, e.to_string())) {
					warn!(%session_id, error = %err, "validation failure not delivered");
				}
				return Dispatched::Rejected;
			}
		};

		let Ok(permit) = Arc::clone(&self.inflight).acquire_owned().await else {
			return Dispatched::Dropped;
		};

		let ctx = self.ctx.clone();
		let session = self.session.clone();
		let handle = tokio::spawn(async move {
			let _permit = permit;
			let kind = msg.message_type();
			if let Some(resp) = handlers::handle(&ctx, &session, msg).await
				&& let Err(e) = session.try_send(resp)
			{
				warn!(session_id = %session.id(), %kind, error = %e, "response not delivered");
			}
		});
		Dispatched::Spawned(handle)
	}
}
