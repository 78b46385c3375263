#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::{Context as _, anyhow};
use futures::{SinkExt, StreamExt};
use murmur_domain::SessionId;
use murmur_protocol::{OutboundFrame, encode_outbound};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::ServerContext;
use crate::server::dispatcher::Dispatcher;
use crate::server::presence::PresenceKind;

/// Accept websocket clients on `listener` until it fails.
pub async fn serve(listener: TcpListener, ctx: ServerContext) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		metrics::counter!("murmur_server_connections_total").increment(1);
		let ctx = ctx.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(ctx, stream, Some(remote)).await {
				warn!(%remote, error = %e, "connection handler exited with error");
			}
		});
	}
}

/// Run one connection: handshake, register, read loop, then the disconnect cascade.
pub async fn handle_connection<S>(ctx: ServerContext, stream: S, remote: Option<SocketAddr>) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("murmur_server_active_connections").decrement(1.0);
		}
	}

	let ws = tokio_tungstenite::accept_async(stream)
		.await
		.context("websocket handshake")?;

	metrics::gauge!("murmur_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut sink, mut source) = ws.split();
	let (tx, mut rx) = mpsc::channel::<OutboundFrame>(ctx.settings.outbound_queue_capacity.max(1));
	let session = ctx.registry.register(tx);
	let session_id = session.id();
	info!(%session_id, remote = ?remote, "session registered");

	let max_frame_bytes = ctx.settings.max_frame_bytes;
	tokio::spawn(async move {
		while let Some(frame) = rx.recv().await {
			let text = match encode_outbound(&frame, max_frame_bytes) {
				Ok(text) => text,
				Err(e) => {
					warn!(%session_id, error = %e, "dropping unencodable frame");
					continue;
				}
			};
			if let Err(e) = sink.send(Message::text(text)).await {
				debug!(%session_id, error = %e, "writer stopped");
				break;
			}
		}
		let _ = sink.close().await;
	});

	let dispatcher = Dispatcher::new(ctx.clone(), session);
	let result = loop {
		match source.next().await {
			Some(Ok(Message::Text(text))) => {
				dispatcher.dispatch(text.as_str().as_bytes()).await;
			}
			Some(Ok(Message::Binary(bytes))) => {
				dispatcher.dispatch(&bytes).await;
			}
			Some(Ok(Message::Close(_))) | None => break Ok(()),
			Some(Ok(_)) => {}
			Some(Err(e)) => break Err(anyhow!(e).context("websocket read")),
		}
	};

	drop(dispatcher);
	disconnect(&ctx, session_id).await;
	result
}

/// Remove the session and, if it was logged in, mark the account offline and tell its contacts.
pub async fn disconnect(ctx: &ServerContext, session_id: SessionId) {
	let Some(account) = ctx.registry.unregister(session_id) else {
		info!(%session_id, "session closed");
		return;
	};

	// Held through the status write and the notice so a concurrent login lands after both.
	let _held = ctx.locks.lock(account).await;

	// Another session may have logged in as the same account meanwhile.
	if ctx.registry.lookup_account(account).is_some() {
		info!(%session_id, account_id = %account, "session closed; account live elsewhere");
		return;
	}

	if let Err(e) = ctx.timed(ctx.store.set_status(account, false)).await {
		warn!(%session_id, account_id = %account, error = %e, "offline status not persisted");
	}

	let contacts = match ctx.timed(ctx.store.find_account(account)).await {
		Ok(Some(record)) => record.contact_ids(),
		Ok(None) => Vec::new(),
		Err(e) => {
			warn!(%session_id, account_id = %account, error = %e, "contacts not loaded for disconnect notice");
			Vec::new()
		}
	};
	let report = ctx.presence.notify(account, PresenceKind::Disconnected, &contacts);
	info!(
		%session_id,
		account_id = %account,
		notified = report.delivered,
		"session closed"
	);
}
