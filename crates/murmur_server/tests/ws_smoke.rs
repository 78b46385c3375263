#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use futures::{SinkExt, StreamExt};
use murmur_server::blob::LocalBlobStore;
use murmur_server::config::SecretString;
use murmur_server::credentials::{CredentialError, CredentialVerifier};
use murmur_server::server::connection::serve;
use murmur_server::server::registry::ConnectionRegistry;
use murmur_server::server::{RelaySettings, ServerContext};
use murmur_server::store::MemoryStore;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
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

/// Cheap stand-in so the smoke test does not pay for argon2.
struct PlainCredentials;

impl CredentialVerifier for PlainCredentials {
	fn hash(&self, secret: &str) -> Result<String, CredentialError> {
		Ok(format!("plain:{secret}"))
	}

	fn verify(&self, secret: &str, encoded: &str) -> bool {
		encoded.strip_prefix("plain:") == Some(secret)
	}
}

async fn start_server(blob_root: &std::path::Path) -> anyhow::Result<SocketAddr> {
	let blobs = LocalBlobStore::new(
		blob_root.to_path_buf(),
		"media",
		"http://blobs.test",
		SecretString::new("smoke-secret"),
	)
	.context("blob store")?;

	let ctx = ServerContext::new(
		Arc::new(ConnectionRegistry::new()),
		Arc::new(MemoryStore::new()),
		Arc::new(blobs),
		Arc::new(PlainCredentials),
		RelaySettings::default(),
	);

	let listener = TcpListener::bind("127.0.0.1:0").await.context("bind")?;
	let addr = listener.local_addr()?;
	tokio::spawn(async move {
		if let Err(e) = serve(listener, ctx).await {
			eprintln!("server exited: {e:#}");
		}
	});
	Ok(addr)
}

async fn connect(addr: SocketAddr) -> anyhow::Result<Client> {
	let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
		.await
		.context("websocket connect")?;
	Ok(ws)
}

async fn send(ws: &mut Client, frame: Value) -> anyhow::Result<()> {
	ws.send(Message::text(frame.to_string())).await.context("send frame")
}

async fn recv(ws: &mut Client) -> anyhow::Result<Value> {
	loop {
		let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
			.await
			.context("timed out waiting for frame")?
			.ok_or_else(|| anyhow!("connection closed"))??;
		match msg {
			Message::Text(text) => return serde_json::from_str(text.as_str()).context("decode frame"),
			Message::Close(_) => return Err(anyhow!("connection closed")),
			_ => continue,
		}
	}
}

async fn sign_up_and_login(ws: &mut Client, phone: i64, first: &str) -> anyhow::Result<Value> {
	send(
		ws,
		json!({
			"type": "sign_up",
			"phone_number": phone,
			"first_name": first,
			"last_name": "Smoke",
			"password": "hunter2",
			"secret_question": "pet?",
			"secret_answer": "rex"
		}),
	)
	.await?;
	let created = recv(ws).await?;
	anyhow::ensure!(created["status"] == true, "sign up failed: {created}");

	send(ws, json!({"type": "login_request", "phone_number": phone, "password": "hunter2"})).await?;
	recv(ws).await
}

#[tokio::test]
async fn sign_up_login_and_presence_over_websocket() {
	init_test_logging();

	let blob_dir = tempfile::tempdir().expect("tempdir");
	let addr = start_server(blob_dir.path()).await.expect("start server");

	let mut alice = connect(addr).await.expect("connect alice");
	let snapshot = sign_up_and_login(&mut alice, 5550001, "Alice")
		.await
		.expect("alice login");
	assert_eq!(snapshot["type"], "login_request");
	assert_eq!(snapshot["status"], true);
	assert_eq!(snapshot["my_info"]["_id"], 5550001);
	assert_eq!(snapshot["my_info"]["status"], true);

	// Unknown types are dropped silently; the connection stays usable.
	send(&mut alice, json!({"type": "definitely_not_a_type"}))
		.await
		.expect("send unknown");
	send(&mut alice, json!({"type": "retrieve_question", "phone_number": 5550001}))
		.await
		.expect("send retrieve_question");
	let question = recv(&mut alice).await.expect("question");
	assert_eq!(question["type"], "retrieve_question");
	assert_eq!(question["secret_question"], "pet?");

	let mut bob = connect(addr).await.expect("connect bob");
	let snapshot = sign_up_and_login(&mut bob, 5550002, "Bob").await.expect("bob login");
	assert_eq!(snapshot["status"], true);

	send(&mut bob, json!({"type": "lookup_friend", "phone_number": 5550001}))
		.await
		.expect("send lookup");
	let added = recv(&mut bob).await.expect("lookup reply");
	assert_eq!(added["status"], true, "{added}");
	assert_eq!(added["json_array"][0]["contactInfo"]["_id"], 5550001);

	let notice = recv(&mut alice).await.expect("added_you");
	assert_eq!(notice["type"], "added_you");
	assert_eq!(notice["json_array"][0]["contactInfo"]["_id"], 5550002);

	bob.close(None).await.expect("close bob");
	let gone = recv(&mut alice).await.expect("disconnect notice");
	assert_eq!(gone, json!({"type": "client_disconnected", "phone_number": 5550002}));
}

#[tokio::test]
async fn requests_before_login_are_refused() {
	init_test_logging();

	let blob_dir = tempfile::tempdir().expect("tempdir");
	let addr = start_server(blob_dir.path()).await.expect("start server");
	let mut ws = connect(addr).await.expect("connect");

	send(&mut ws, json!({"type": "lookup_friend", "phone_number": 5550009}))
		.await
		.expect("send");
	let reply = recv(&mut ws).await.expect("reply");
	assert_eq!(reply, json!({"type": "lookup_friend", "status": false, "message": "not logged in"}));

	send(&mut ws, json!({"type": "lookup_friend", "phone_number": -3}))
		.await
		.expect("send invalid");
	let reply = recv(&mut ws).await.expect("validation reply");
	assert_eq!(reply["type"], "lookup_friend");
	assert_eq!(reply["status"], false);
}
