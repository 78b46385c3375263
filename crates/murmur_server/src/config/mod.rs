#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::store::DEFAULT_STORE_TIMEOUT;

/// String secret that never prints.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Default bind endpoint.
pub const DEFAULT_BIND: &str = "ws://127.0.0.1:8585";

/// Default config path: `~/.murmur/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".murmur").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Parse `ws://host:port` (the scheme is optional) into a socket address.
pub fn parse_bind(endpoint: &str) -> anyhow::Result<SocketAddr> {
	let s = endpoint.trim();
	let s = s.strip_prefix("ws://").unwrap_or(s);
	let s = s.trim_end_matches('/');
	if s.is_empty() {
		return Err(anyhow!("bind endpoint must be non-empty (expected ws://host:port)"));
	}
	s.parse::<SocketAddr>()
		.with_context(|| format!("invalid bind endpoint {endpoint:?} (expected ws://ip:port)"))
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub store: StoreSettings,
	pub blob: BlobSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Websocket listen address.
	pub bind: SocketAddr,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub max_frame_bytes: usize,
	/// Per-session outbound queue depth.
	pub outbound_queue_capacity: usize,
	/// Concurrently running handlers per connection.
	pub max_inflight_per_conn: usize,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
	/// `sqlite:` url, or `memory:` / unset for the in-process store.
	pub database_url: Option<String>,
	/// Deadline for every store and hydration call.
	pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BlobSettings {
	pub root: PathBuf,
	pub bucket: String,
	pub public_base_url: String,
	pub signing_secret: SecretString,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([127, 0, 0, 1], 8585)),
			metrics_bind: None,
			health_bind: None,
			max_frame_bytes: murmur_protocol::DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			max_inflight_per_conn: 16,
		}
	}
}

impl Default for StoreSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			timeout: DEFAULT_STORE_TIMEOUT,
		}
	}
}

impl Default for BlobSettings {
	fn default() -> Self {
		Self {
			root: PathBuf::from("murmur-media"),
			bucket: "media".to_string(),
			public_base_url: "http://127.0.0.1:8585/media".to_string(),
			signing_secret: SecretString::new("dev-only-signing-secret"),
		}
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			server: ServerSettings::default(),
			store: StoreSettings::default(),
			blob: BlobSettings::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	store: FileStoreSettings,

	#[serde(default)]
	blob: FileBlobSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	max_inflight_per_conn: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	database_url: Option<String>,
	timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBlobSettings {
	root: Option<String>,
	bucket: Option<String>,
	public_base_url: Option<String>,
	signing_secret: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerConfig::default();

		let bind = match file.server.bind.filter(|s| !s.trim().is_empty()) {
			Some(b) => parse_bind(&b).context("server.bind")?,
			None => defaults.server.bind,
		};

		Ok(Self {
			server: ServerSettings {
				bind,
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.max_frame_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.outbound_queue_capacity),
				max_inflight_per_conn: file
					.server
					.max_inflight_per_conn
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.max_inflight_per_conn),
			},
			store: StoreSettings {
				database_url: file.store.database_url.filter(|s| !s.trim().is_empty()),
				timeout: file
					.store
					.timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.store.timeout),
			},
			blob: BlobSettings {
				root: file
					.blob
					.root
					.filter(|s| !s.trim().is_empty())
					.map(PathBuf::from)
					.unwrap_or(defaults.blob.root),
				bucket: file
					.blob
					.bucket
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.blob.bucket),
				public_base_url: file
					.blob
					.public_base_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.blob.public_base_url),
				signing_secret: file
					.blob
					.signing_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new)
					.unwrap_or(defaults.blob.signing_secret),
			},
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn env_positive<T: std::str::FromStr + PartialOrd + Default>(name: &str) -> Option<T> {
	env_string(name)
		.and_then(|v| v.parse::<T>().ok())
		.filter(|v| *v > T::default())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("MURMUR_BIND") {
		match parse_bind(&v) {
			Ok(addr) => {
				cfg.server.bind = addr;
				info!(%addr, "server config: bind overridden by env");
			}
			Err(e) => warn!(error = %e, "server config: ignoring invalid MURMUR_BIND"),
		}
	}

	if let Some(v) = env_string("MURMUR_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("MURMUR_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(bytes) = env_positive::<usize>("MURMUR_MAX_FRAME_BYTES") {
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(capacity) = env_positive::<usize>("MURMUR_OUTBOUND_QUEUE_CAPACITY") {
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(limit) = env_positive::<usize>("MURMUR_MAX_INFLIGHT_PER_CONN") {
		cfg.server.max_inflight_per_conn = limit;
		info!(limit, "server config: max_inflight_per_conn overridden by env");
	}

	if let Some(v) = env_string("MURMUR_DATABASE_URL") {
		cfg.store.database_url = Some(v);
		info!("store config: database_url overridden by env");
	}

	if let Some(ms) = env_positive::<u64>("MURMUR_STORE_TIMEOUT_MS") {
		cfg.store.timeout = Duration::from_millis(ms);
		info!(ms, "store config: timeout overridden by env");
	}

	if let Some(v) = env_string("MURMUR_BLOB_ROOT") {
		cfg.blob.root = PathBuf::from(v);
		info!("blob config: root overridden by env");
	}

	if let Some(v) = env_string("MURMUR_BLOB_BUCKET") {
		cfg.blob.bucket = v;
		info!("blob config: bucket overridden by env");
	}

	if let Some(v) = env_string("MURMUR_BLOB_PUBLIC_BASE_URL") {
		cfg.blob.public_base_url = v;
		info!("blob config: public_base_url overridden by env");
	}

	if let Some(v) = env_string("MURMUR_BLOB_SIGNING_SECRET") {
		cfg.blob.signing_secret = SecretString::new(v);
		info!("blob config: signing_secret overridden by env");
	}

	if cfg.blob.signing_secret == BlobSettings::default().signing_secret {
		warn!("blob config: using the built-in dev signing secret");
	}
}
