#![forbid(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod health;
pub mod hydrator;
pub mod lifecycle;
pub mod locks;
pub mod presence;
pub mod rebinder;
pub mod registry;


#[cfg(test)]
mod hydrator_tests;

#[cfg(test)]
mod lifecycle_tests;

#[cfg(test)]
mod registry_tests;

#[cfg(test)]
pub(crate) mod test_support;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::blob::BlobStore;
use crate::config::ServerConfig;
use crate::credentials::{CredentialError, CredentialVerifier};
use crate::server::hydrator::AccountHydrator;
use crate::server::lifecycle::AccountLifecycle;
use crate::server::locks::KeyedLocks;
use crate::server::presence::PresenceNotifier;
use crate::server::registry::ConnectionRegistry;
use crate::store::{DEFAULT_STORE_TIMEOUT, SharedStore, StoreError, with_deadline};

/// Per-connection and per-call limits.
#[derive(Debug, Clone)]
pub struct RelaySettings {
	pub store_timeout: Duration,
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,
	pub max_inflight_per_conn: usize,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			store_timeout: DEFAULT_STORE_TIMEOUT,
			max_frame_bytes: murmur_protocol::DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			max_inflight_per_conn: 16,
		}
	}
}

impl From<&ServerConfig> for RelaySettings {
	fn from(cfg: &ServerConfig) -> Self {
		Self {
			store_timeout: cfg.store.timeout,
			max_frame_bytes: cfg.server.max_frame_bytes,
			outbound_queue_capacity: cfg.server.outbound_queue_capacity.max(1),
			max_inflight_per_conn: cfg.server.max_inflight_per_conn.max(1),
		}
	}
}

/// Everything a handler may touch. Cheap to clone; one instance per server.
#[derive(Clone)]
pub struct ServerContext {
	pub registry: Arc<ConnectionRegistry>,
	pub locks: Arc<KeyedLocks>,
	pub store: SharedStore,
	pub blobs: Arc<dyn BlobStore>,
	pub credentials: Arc<dyn CredentialVerifier>,
	pub presence: PresenceNotifier,
	pub hydrator: AccountHydrator,
	pub lifecycle: AccountLifecycle,
	pub settings: RelaySettings,
}

impl ServerContext {
	pub fn new(
		registry: Arc<ConnectionRegistry>,
		store: SharedStore,
		blobs: Arc<dyn BlobStore>,
		credentials: Arc<dyn CredentialVerifier>,
		settings: RelaySettings,
	) -> Self {
		let locks = Arc::new(KeyedLocks::new());
		Self {
			presence: PresenceNotifier::new(Arc::clone(&registry)),
			hydrator: AccountHydrator::new(Arc::clone(&store), settings.store_timeout),
			lifecycle: AccountLifecycle::new(Arc::clone(&store), Arc::clone(&locks), settings.store_timeout),
			registry,
			locks,
			store,
			blobs,
			credentials,
			settings,
		}
	}

	/// Run a store call under the configured deadline.
	pub async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
	where
		F: Future<Output = Result<T, StoreError>>,
	{
		with_deadline(self.settings.store_timeout, fut).await
	}

	/// Hash on the blocking pool.
	pub async fn hash_secret(&self, secret: String) -> Result<String, CredentialError> {
		let credentials = Arc::clone(&self.credentials);
		tokio::task::spawn_blocking(move || credentials.hash(&secret))
			.await
			.map_err(|e| CredentialError::Hash(e.to_string()))?
	}

	/// Verify on the blocking pool. A panicked or cancelled check counts as a mismatch.
	pub async fn verify_secret(&self, secret: String, encoded: String) -> bool {
		let credentials = Arc::clone(&self.credentials);
		tokio::task::spawn_blocking(move || credentials.verify(&secret, &encoded))
			.await
			.unwrap_or(false)
	}
}
