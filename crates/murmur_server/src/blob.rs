#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use murmur_domain::{AccountId, ChatId, GroupId, MessageId};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::config::SecretString;

/// Lifetime of a reference returned by `put`.
pub const REFERENCE_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum BlobError {
	#[error("invalid blob key: {0}")]
	InvalidKey(String),

	#[error("blob not found: {0}")]
	NotFound(String),

	#[error("invalid blob reference: {0}")]
	InvalidReference(String),

	#[error("blob reference expired")]
	Expired,

	#[error("blob io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Sanitized object key, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey(String);

fn sanitize_segment(raw: &str) -> Result<String, BlobError> {
	let s: String = raw
		.trim()
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
		.collect();
	if s.is_empty() || s.chars().all(|c| c == '.') {
		return Err(BlobError::InvalidKey(raw.to_string()));
	}
	Ok(s)
}

impl BlobKey {
	pub fn new(segments: &[&str]) -> Result<Self, BlobError> {
		if segments.is_empty() {
			return Err(BlobError::InvalidKey(String::new()));
		}
		let parts = segments
			.iter()
			.map(|s| sanitize_segment(s))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(Self(parts.join("/")))
	}

	pub fn profile_image(account: AccountId, file_name: &str) -> Result<Self, BlobError> {
		Self::new(&["accounts", &account.to_string(), "profile", file_name])
	}

	pub fn chat_attachment(
		account: AccountId,
		chat: ChatId,
		message: MessageId,
		file_name: &str,
	) -> Result<Self, BlobError> {
		Self::new(&[
			"accounts",
			&account.to_string(),
			"chats",
			&chat.to_string(),
			&format!("{message}-{file_name}"),
		])
	}

	pub fn group_image(group: GroupId, file_name: &str) -> Result<Self, BlobError> {
		Self::new(&["groups", &group.to_string(), "profile", file_name])
	}

	pub fn group_attachment(
		group: GroupId,
		sender: AccountId,
		message: MessageId,
		file_name: &str,
	) -> Result<Self, BlobError> {
		Self::new(&[
			"groups",
			&group.to_string(),
			&sender.to_string(),
			&format!("{message}-{file_name}"),
		])
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	fn parse(s: &str) -> Result<Self, BlobError> {
		let segments: Vec<&str> = s.split('/').collect();
		let key = Self::new(&segments)?;
		if key.0 != s {
			return Err(BlobError::InvalidKey(s.to_string()));
		}
		Ok(key)
	}
}

/// Binary object storage for media.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
	/// Store `bytes` and return a reference valid for [`REFERENCE_VALIDITY`].
	async fn put(&self, key: &BlobKey, bytes: &[u8]) -> Result<String, BlobError>;

	async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError>;

	async fn delete(&self, key: &BlobKey) -> Result<(), BlobError>;
}

/// Filesystem objects under `root/bucket/key` with HMAC-signed references.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
	root: PathBuf,
	bucket: String,
	public_base_url: String,
	secret: SecretString,
	validity: Duration,
}

impl LocalBlobStore {
	pub fn new(root: PathBuf, bucket: &str, public_base_url: &str, secret: SecretString) -> Result<Self, BlobError> {
		Ok(Self {
			root,
			bucket: sanitize_segment(bucket)?,
			public_base_url: public_base_url.trim_end_matches('/').to_string(),
			secret,
			validity: REFERENCE_VALIDITY,
		})
	}

	fn path_for(&self, key: &BlobKey) -> PathBuf {
		let mut p = self.root.join(&self.bucket);
		for seg in key.as_str().split('/') {
			p.push(seg);
		}
		p
	}

	fn sign(&self, key: &BlobKey, expires: u64) -> Result<String, BlobError> {
		let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.expose().as_bytes())
			.map_err(|e| BlobError::InvalidReference(e.to_string()))?;
		mac.update(self.bucket.as_bytes());
		mac.update(b"/");
		mac.update(key.as_str().as_bytes());
		mac.update(b"\n");
		mac.update(expires.to_string().as_bytes());
		Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
	}

	/// Signed reference for `key` expiring at `expires` (unix seconds).
	pub fn reference(&self, key: &BlobKey, expires: u64) -> Result<String, BlobError> {
		let sig = self.sign(key, expires)?;
		Ok(format!(
			"{}/{}/{}?expires={expires}&sig={sig}",
			self.public_base_url,
			self.bucket,
			key.as_str()
		))
	}

	/// Check signature and expiry of a reference produced by this store.
	pub fn verify_reference(&self, reference: &str, now_unix: u64) -> Result<BlobKey, BlobError> {
		let invalid = |why: &str| BlobError::InvalidReference(why.to_string());

		let prefix = format!("{}/{}/", self.public_base_url, self.bucket);
		let rest = reference.strip_prefix(&prefix).ok_or_else(|| invalid("foreign base url or bucket"))?;
		let (key, query) = rest.split_once('?').ok_or_else(|| invalid("missing query"))?;
		let key = BlobKey::parse(key)?;

		let mut expires = None;
		let mut sig = None;
		for pair in query.split('&') {
			match pair.split_once('=') {
				Some(("expires", v)) => expires = v.parse::<u64>().ok(),
				Some(("sig", v)) => sig = Some(v),
				_ => {}
			}
		}
		let expires = expires.ok_or_else(|| invalid("missing expires"))?;
		let sig = sig.ok_or_else(|| invalid("missing sig"))?;

		let expected = self.sign(&key, expires)?;
		if !constant_time_eq(expected.as_bytes(), sig.as_bytes()) {
			return Err(invalid("bad signature"));
		}
		if expires <= now_unix {
			return Err(BlobError::Expired);
		}
		Ok(key)
	}
}

pub fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
	async fn put(&self, key: &BlobKey, bytes: &[u8]) -> Result<String, BlobError> {
		let path = self.path_for(key);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(&path, bytes).await?;
		debug!(key = key.as_str(), len = bytes.len(), "blob stored");
		self.reference(key, unix_now().saturating_add(self.validity.as_secs()))
	}

	async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError> {
		match tokio::fs::read(self.path_for(key)).await {
			Ok(b) => Ok(b),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound(key.as_str().to_string())),
			Err(e) => Err(e.into()),
		}
	}

	async fn delete(&self, key: &BlobKey) -> Result<(), BlobError> {
		match tokio::fs::remove_file(self.path_for(key)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound(key.as_str().to_string())),
			Err(e) => Err(e.into()),
		}
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store(root: &std::path::Path) -> LocalBlobStore {
		LocalBlobStore::new(
			root.to_path_buf(),
			"media",
			"https://cdn.example.test/",
			SecretString::new("k3y"),
		)
		.unwrap()
	}

	#[test]
	fn keys_cannot_escape_the_bucket() {
		assert!(BlobKey::new(&[".."]).is_err());
		assert!(BlobKey::new(&[""]).is_err());
		let k = BlobKey::new(&["a/../b", "x y.png"]).unwrap();
		assert_eq!(k.as_str(), "a_.._b/x_y.png");
		assert!(!k.as_str().split('/').any(|s| s == ".."));
	}

	#[tokio::test]
	async fn put_get_delete() {
		let dir = tempfile::tempdir().unwrap();
		let s = store(dir.path());
		let key = BlobKey::profile_image(AccountId::new(5).unwrap(), "me.png").unwrap();

		let url = s.put(&key, b"png-bytes").await.unwrap();
		assert!(url.starts_with("https://cdn.example.test/media/accounts/5/profile/me.png?expires="));
		assert_eq!(s.get(&key).await.unwrap(), b"png-bytes");
		assert!(dir.path().join("media/accounts/5/profile/me.png").exists());

		s.delete(&key).await.unwrap();
		assert!(matches!(s.get(&key).await, Err(BlobError::NotFound(_))));
		assert!(matches!(s.delete(&key).await, Err(BlobError::NotFound(_))));
	}

	#[test]
	fn references_expire_after_seven_days() {
		let dir = tempfile::tempdir().unwrap();
		let s = store(dir.path());
		let key = BlobKey::group_image(GroupId::new(3).unwrap(), "g.png").unwrap();

		let now = 1_700_000_000;
		let url = s.reference(&key, now + REFERENCE_VALIDITY.as_secs()).unwrap();
		assert_eq!(s.verify_reference(&url, now).unwrap(), key);
		assert!(s.verify_reference(&url, now + REFERENCE_VALIDITY.as_secs() - 1).is_ok());
		assert!(matches!(
			s.verify_reference(&url, now + REFERENCE_VALIDITY.as_secs()),
			Err(BlobError::Expired)
		));
	}

	#[test]
	fn tampered_references_are_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let s = store(dir.path());
		let key = BlobKey::new(&["accounts", "1", "profile", "a.png"]).unwrap();
		let url = s.reference(&key, u64::MAX).unwrap();

		let forged = url.replace("accounts/1/", "accounts/2/");
		assert!(matches!(s.verify_reference(&forged, 0), Err(BlobError::InvalidReference(_))));

		let other = LocalBlobStore::new(dir.path().to_path_buf(), "media", "https://cdn.example.test", SecretString::new("other"))
			.unwrap();
		assert!(other.verify_reference(&url, 0).is_err());
	}
}
