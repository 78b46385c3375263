#![forbid(unsafe_code)]

use thiserror::Error;

use crate::blob::BlobError;
use crate::credentials::CredentialError;
use crate::server::hydrator::HydrationError;
use crate::store::StoreError;

/// Outbound enqueue failure for a single session.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
	#[error("outbound queue full")]
	QueueFull,
	#[error("session closed")]
	Closed,
}

/// Failure of a single handler invocation. Always answered with the failure envelope.
#[derive(Debug, Error)]
pub enum HandlerError {
	#[error("not logged in")]
	NotLoggedIn,

	/// Business rule or input rejection; the text goes to the client verbatim.
	#[error("{0}")]
	Rejected(String),

	#[error("persistence failure")]
	Store(#[from] StoreError),

	#[error("media storage failure")]
	Blob(#[from] BlobError),

	#[error("credential failure")]
	Credential(#[from] CredentialError),

	#[error("could not load account data")]
	Hydration(#[from] HydrationError),
}

impl HandlerError {
	pub fn rejected(msg: impl Into<String>) -> Self {
		HandlerError::Rejected(msg.into())
	}

	/// Label used for the `outcome` metric dimension.
	pub fn kind(&self) -> &'static str {
		match self {
			HandlerError::NotLoggedIn => "not_logged_in",
			HandlerError::Rejected(_) => "rejected",
			HandlerError::Store(e) if e.is_timeout() => "timeout",
			HandlerError::Store(_) => "store",
			HandlerError::Blob(_) => "blob",
			HandlerError::Credential(_) => "credential",
			HandlerError::Hydration(_) => "hydration",
		}
	}
}
