#![forbid(unsafe_code)]

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
	#[error("password hash failed: {0}")]
	Hash(String),
}

/// Opaque credential hashing. Implementations never panic on bad input.
pub trait CredentialVerifier: Send + Sync {
	fn hash(&self, secret: &str) -> Result<String, CredentialError>;

	/// Fails closed: a malformed stored value verifies as `false`.
	fn verify(&self, secret: &str, encoded: &str) -> bool;
}

/// Argon2id with default parameters, stored as PHC strings.
#[derive(Debug, Clone, Default)]
pub struct Argon2Credentials;

impl CredentialVerifier for Argon2Credentials {
	fn hash(&self, secret: &str) -> Result<String, CredentialError> {
		let salt = SaltString::generate(&mut OsRng);
		Argon2::default()
			.hash_password(secret.as_bytes(), &salt)
			.map(|h| h.to_string())
			.map_err(|e| CredentialError::Hash(e.to_string()))
	}

	fn verify(&self, secret: &str, encoded: &str) -> bool {
		let Ok(parsed) = PasswordHash::new(encoded) else {
			return false;
		};
		Argon2::default().verify_password(secret.as_bytes(), &parsed).is_ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hash_then_verify() {
		let c = Argon2Credentials;
		let encoded = c.hash("hunter2").unwrap();
		assert!(encoded.starts_with("$argon2"));
		assert!(c.verify("hunter2", &encoded));
		assert!(!c.verify("hunter3", &encoded));
	}

	#[test]
	fn malformed_hash_fails_closed() {
		let c = Argon2Credentials;
		assert!(!c.verify("anything", ""));
		assert!(!c.verify("anything", "not-a-phc-string"));
	}

	#[test]
	fn salts_differ_per_hash() {
		let c = Argon2Credentials;
		assert_ne!(c.hash("same").unwrap(), c.hash("same").unwrap());
	}
}
