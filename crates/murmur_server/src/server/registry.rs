#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use murmur_domain::{AccountId, SessionId};
use murmur_protocol::OutboundFrame;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::server::error::RelayError;

/// Sending half of a session's bounded outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
	id: SessionId,
	tx: mpsc::Sender<OutboundFrame>,
}

impl SessionHandle {
	pub fn new(id: SessionId, tx: mpsc::Sender<OutboundFrame>) -> Self {
		Self { id, tx }
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	/// Non-blocking enqueue. Never waits on a slow peer.
	pub fn try_send(&self, frame: impl Into<OutboundFrame>) -> Result<(), RelayError> {
		match self.tx.try_send(frame.into()) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => Err(RelayError::QueueFull),
			Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::Closed),
		}
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
	#[error("session {0} is not registered")]
	UnknownSession(SessionId),

	#[error("account {account} is already bound to session {holder}")]
	Conflict {
		account: AccountId,
		holder: SessionId,
	},

	#[error("session {session} is already bound to account {account}")]
	SessionBound {
		session: SessionId,
		account: AccountId,
	},
}

/// Authoritative map of live sessions and their bound accounts.
///
/// One short synchronous critical section per operation; nothing awaits while it is held.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
	inner: Mutex<Inner>,
	last_id: AtomicU64,
}

#[derive(Debug, Default)]
struct Inner {
	sessions: HashMap<SessionId, Entry>,
	bound: HashMap<AccountId, SessionId>,
}

#[derive(Debug)]
struct Entry {
	handle: SessionHandle,
	account: Option<AccountId>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a provisional session. Ids come from a counter and are never reused.
	pub fn register(&self, tx: mpsc::Sender<OutboundFrame>) -> SessionHandle {
		let id = SessionId(self.last_id.fetch_add(1, Ordering::Relaxed) + 1);
		let handle = SessionHandle::new(id, tx);
		self.inner.lock().sessions.insert(
			id,
			Entry {
				handle: handle.clone(),
				account: None,
			},
		);
		handle
	}

	/// Bind `session` to `account`.
	///
	/// Rebinding a session to the account it already holds succeeds without change.
	pub fn rebind(&self, session: SessionId, account: AccountId) -> Result<(), RegistryError> {
		let mut inner = self.inner.lock();
		let Inner { sessions, bound } = &mut *inner;

		let entry = sessions
			.get_mut(&session)
			.ok_or(RegistryError::UnknownSession(session))?;

		match entry.account {
			Some(current) if current == account => return Ok(()),
			Some(current) => {
				return Err(RegistryError::SessionBound {
					session,
					account: current,
				});
			}
			None => {}
		}

		if let Some(holder) = bound.get(&account) {
			return Err(RegistryError::Conflict {
				account,
				holder: *holder,
			});
		}

		entry.account = Some(account);
		bound.insert(account, session);
		Ok(())
	}

	/// Return a bound session to provisional state. Returns the account it held.
	pub fn unbind(&self, session: SessionId) -> Option<AccountId> {
		let mut inner = self.inner.lock();
		let account = inner.sessions.get_mut(&session)?.account.take()?;
		if inner.bound.get(&account) == Some(&session) {
			inner.bound.remove(&account);
		}
		Some(account)
	}

	/// Remove a session. Idempotent; returns the account that was bound, if any.
	pub fn unregister(&self, session: SessionId) -> Option<AccountId> {
		let mut inner = self.inner.lock();
		let entry = inner.sessions.remove(&session)?;
		let account = entry.account?;
		if inner.bound.get(&account) == Some(&session) {
			inner.bound.remove(&account);
		}
		Some(account)
	}

	pub fn lookup_session(&self, session: SessionId) -> Option<SessionHandle> {
		self.inner.lock().sessions.get(&session).map(|e| e.handle.clone())
	}

	pub fn lookup_account(&self, account: AccountId) -> Option<SessionHandle> {
		let inner = self.inner.lock();
		let session = inner.bound.get(&account)?;
		inner.sessions.get(session).map(|e| e.handle.clone())
	}

	/// Account currently bound to `session`.
	pub fn account_of(&self, session: SessionId) -> Option<AccountId> {
		self.inner.lock().sessions.get(&session).and_then(|e| e.account)
	}

	/// Copy out the handles of every live account in `accounts`.
	pub fn handles_for(&self, accounts: &[AccountId]) -> Vec<(AccountId, Option<SessionHandle>)> {
		let inner = self.inner.lock();
		accounts
			.iter()
			.map(|a| {
				let handle = inner
					.bound
					.get(a)
					.and_then(|s| inner.sessions.get(s))
					.map(|e| e.handle.clone());
				(*a, handle)
			})
			.collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn bound_len(&self) -> usize {
		self.inner.lock().bound.len()
	}
}
