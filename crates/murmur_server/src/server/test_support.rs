#![forbid(unsafe_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use murmur_domain::{AccountId, AccountRecord, ChatId, ChatMessage, ContactRef, GroupId};
use murmur_protocol::{DEFAULT_MAX_FRAME_SIZE, OutboundFrame, decode_inbound};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::blob::LocalBlobStore;
use crate::config::SecretString;
use crate::credentials::{CredentialError, CredentialVerifier};
use crate::server::registry::{ConnectionRegistry, SessionHandle};
use crate::server::{RelaySettings, ServerContext, handlers};
use crate::store::{AccountStore, MemoryStore};

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub(crate) fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("MURMUR_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

pub(crate) fn account(id: i64) -> AccountId {
	AccountId::new(id).expect("valid account id")
}

pub(crate) fn chat(id: i64) -> ChatId {
	ChatId::new(id).expect("valid chat id")
}

pub(crate) fn group(id: i64) -> GroupId {
	GroupId::new(id).expect("valid group id")
}

/// Reversible stand-in for argon2.
#[derive(Debug, Default)]
pub(crate) struct PlainCredentials;

impl CredentialVerifier for PlainCredentials {
	fn hash(&self, secret: &str) -> Result<String, CredentialError> {
		Ok(format!("plain:{secret}"))
	}

	fn verify(&self, secret: &str, encoded: &str) -> bool {
		encoded.strip_prefix("plain:") == Some(secret)
	}
}

pub(crate) struct Harness {
	pub ctx: ServerContext,
	pub store: Arc<MemoryStore>,
	_blob_dir: tempfile::TempDir,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_timeout(Duration::from_millis(500))
	}

	pub fn with_timeout(store_timeout: Duration) -> Self {
		init_test_logging();

		let store = Arc::new(MemoryStore::new());
		let blob_dir = tempfile::tempdir().expect("tempdir");
		let blobs = LocalBlobStore::new(
			blob_dir.path().to_path_buf(),
			"media",
			"http://blobs.test",
			SecretString::new("test-secret"),
		)
		.expect("blob store");

		let settings = RelaySettings {
			store_timeout,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 32,
			max_inflight_per_conn: 4,
		};
		let ctx = ServerContext::new(
			Arc::new(ConnectionRegistry::new()),
			store.clone(),
			Arc::new(blobs),
			Arc::new(PlainCredentials),
			settings,
		);

		Self {
			ctx,
			store,
			_blob_dir: blob_dir,
		}
	}

	/// Register a provisional session.
	pub fn connect(&self) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
		let (tx, rx) = mpsc::channel(32);
		(self.ctx.registry.register(tx), rx)
	}

	/// Insert an account whose password is `pw-{id}`.
	pub async fn seed_account(&self, id: i64, first_name: &str) -> AccountRecord {
		let mut rec = AccountRecord::new(account(id), first_name, "Test", format!("plain:pw-{id}"));
		rec.secret_question = "first pet?".to_string();
		rec.secret_answer = "plain:rex".to_string();
		self.store.insert_account(&rec).await.expect("insert account");
		rec
	}

	/// Mirror a contact relation between `a` and `b` over a fresh chat.
	pub async fn link(&self, a: i64, b: i64) -> ChatId {
		let seed = ChatMessage::text(account(a), "Server: New Conversation", "09:00");
		let chat_id = self.store.create_chat(&[seed]).await.expect("create chat");
		for (owner, contact) in [(a, b), (b, a)] {
			let entry = ContactRef {
				contact_id: account(contact),
				chat_id,
				unread_messages: 0,
			};
			self.store
				.push_contact(account(owner), &entry)
				.await
				.expect("push contact");
		}
		chat_id
	}

	/// Decode `frame` and run its handler; returns the reply as JSON.
	pub async fn request(&self, session: &SessionHandle, frame: Value) -> Option<Value> {
		let bytes = serde_json::to_vec(&frame).expect("encode request");
		let msg = decode_inbound(&bytes, DEFAULT_MAX_FRAME_SIZE).expect("decodable request");
		handlers::handle(&self.ctx, session, msg)
			.await
			.map(|resp| serde_json::to_value(resp).expect("encode response"))
	}

	/// Log `id` in on a new session and drain the login frames.
	pub async fn login(&self, id: i64) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
		let (session, mut rx) = self.connect();
		let reply = self
			.request(
				&session,
				serde_json::json!({"type": "login_request", "phone_number": id, "password": format!("pw-{id}")}),
			)
			.await;
		assert!(reply.is_none(), "login replies through the session queue: {reply:?}");
		let snapshot = next_json(&mut rx).await;
		assert_eq!(snapshot["status"], true, "login failed: {snapshot}");
		(session, rx)
	}
}

pub(crate) fn to_json(frame: &OutboundFrame) -> Value {
	serde_json::to_value(frame).expect("encode frame")
}

/// Next queued frame as JSON, failing the test after one second.
pub(crate) async fn next_json(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
	let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
		.await
		.expect("frame within timeout")
		.expect("channel open");
	to_json(&frame)
}

/// Every frame queued right now.
pub(crate) fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<Value> {
	let mut out = Vec::new();
	while let Ok(frame) = rx.try_recv() {
		out.push(to_json(&frame));
	}
	out
}
