#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use murmur_domain::{AccountId, SessionId};
use murmur_protocol::{Event, OutboundFrame};
use proptest::prelude::*;
use tokio::sync::mpsc;

use crate::server::error::RelayError;
use crate::server::registry::{ConnectionRegistry, RegistryError};

fn account(id: i64) -> AccountId {
	AccountId::new(id).expect("valid id")
}

fn channel() -> (mpsc::Sender<OutboundFrame>, mpsc::Receiver<OutboundFrame>) {
	mpsc::channel(4)
}

#[test]
fn session_ids_are_never_reused() {
	let reg = ConnectionRegistry::new();
	let (tx, _rx) = channel();
	let a = reg.register(tx.clone()).id();
	reg.unregister(a);
	let b = reg.register(tx).id();
	assert_ne!(a, b);
	assert!(b > a);
	assert_eq!(reg.len(), 1);
}

#[test]
fn second_login_to_same_account_conflicts_and_stays_provisional() {
	let reg = ConnectionRegistry::new();
	let (tx, _rx) = channel();
	let s1 = reg.register(tx.clone()).id();
	let s2 = reg.register(tx).id();

	assert_eq!(reg.rebind(s1, account(7)), Ok(()));
	assert_eq!(
		reg.rebind(s2, account(7)),
		Err(RegistryError::Conflict {
			account: account(7),
			holder: s1,
		})
	);

	assert_eq!(reg.account_of(s2), None);
	assert!(reg.lookup_session(s2).is_some());
	assert_eq!(reg.lookup_account(account(7)).map(|h| h.id()), Some(s1));
}

#[test]
fn rebind_to_same_account_is_a_no_op() {
	let reg = ConnectionRegistry::new();
	let (tx, _rx) = channel();
	let s = reg.register(tx).id();
	reg.rebind(s, account(1)).unwrap();
	assert_eq!(reg.rebind(s, account(1)), Ok(()));
	assert_eq!(
		reg.rebind(s, account(2)),
		Err(RegistryError::SessionBound {
			session: s,
			account: account(1),
		})
	);
	assert_eq!(reg.bound_len(), 1);
}

#[test]
fn unregister_is_idempotent_and_releases_account() {
	let reg = ConnectionRegistry::new();
	let (tx, _rx) = channel();
	let s = reg.register(tx.clone()).id();
	reg.rebind(s, account(3)).unwrap();

	assert_eq!(reg.unregister(s), Some(account(3)));
	assert_eq!(reg.unregister(s), None);
	assert!(reg.lookup_account(account(3)).is_none());

	let s2 = reg.register(tx).id();
	assert_eq!(reg.rebind(s2, account(3)), Ok(()));
}

#[test]
fn unbind_returns_session_to_provisional() {
	let reg = ConnectionRegistry::new();
	let (tx, _rx) = channel();
	let s = reg.register(tx).id();
	reg.rebind(s, account(9)).unwrap();
	assert_eq!(reg.unbind(s), Some(account(9)));
	assert_eq!(reg.unbind(s), None);
	assert!(reg.lookup_session(s).is_some());
	assert_eq!(reg.rebind(s, account(10)), Ok(()));
}

#[test]
fn unknown_session_cannot_bind() {
	let reg = ConnectionRegistry::new();
	assert_eq!(
		reg.rebind(SessionId(99), account(1)),
		Err(RegistryError::UnknownSession(SessionId(99)))
	);
}

#[test]
fn handles_for_reports_offline_accounts() {
	let reg = ConnectionRegistry::new();
	let (tx, _rx) = channel();
	let s = reg.register(tx).id();
	reg.rebind(s, account(1)).unwrap();

	let got = reg.handles_for(&[account(1), account(2)]);
	assert_eq!(got.len(), 2);
	assert_eq!(got[0].1.as_ref().map(|h| h.id()), Some(s));
	assert!(got[1].1.is_none());
}

#[test]
fn full_queue_is_reported_not_awaited() {
	let reg = ConnectionRegistry::new();
	let (tx, rx) = mpsc::channel(1);
	let handle = reg.register(tx);
	let ev = Event::ClientConnected {
		phone_number: account(1),
	};
	assert_eq!(handle.try_send(ev.clone()), Ok(()));
	assert_eq!(handle.try_send(ev.clone()), Err(RelayError::QueueFull));
	drop(rx);
	assert_eq!(handle.try_send(ev), Err(RelayError::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_logins_have_exactly_one_winner() {
	let reg = Arc::new(ConnectionRegistry::new());
	let (tx, _rx) = channel();
	let sessions: Vec<_> = (0..16).map(|_| reg.register(tx.clone()).id()).collect();

	let mut tasks = Vec::new();
	for s in sessions {
		let reg = Arc::clone(&reg);
		tasks.push(tokio::spawn(async move { reg.rebind(s, account(42)).is_ok() }));
	}

	let mut winners = 0;
	for t in tasks {
		if t.await.unwrap() {
			winners += 1;
		}
	}
	assert_eq!(winners, 1);
	assert_eq!(reg.bound_len(), 1);
}

#[derive(Debug, Clone)]
enum Op {
	Register,
	Rebind(usize, i64),
	Unbind(usize),
	Unregister(usize),
}

fn op() -> impl Strategy<Value = Op> {
	prop_oneof![
		Just(Op::Register),
		(0usize..8, 1i64..5).prop_map(|(s, a)| Op::Rebind(s, a)),
		(0usize..8).prop_map(Op::Unbind),
		(0usize..8).prop_map(Op::Unregister),
	]
}

proptest! {
	/// The registry agrees with a trivial model after any sequence of operations.
	#[test]
	fn lookup_reflects_latest_operation(ops in proptest::collection::vec(op(), 1..64)) {
		let reg = ConnectionRegistry::new();
		let (tx, _rx) = channel();

		let mut ids: Vec<SessionId> = Vec::new();
		let mut live: HashMap<SessionId, Option<AccountId>> = HashMap::new();

		for op in ops {
			match op {
				Op::Register => {
					let id = reg.register(tx.clone()).id();
					prop_assert!(!ids.contains(&id));
					ids.push(id);
					live.insert(id, None);
				}
				Op::Rebind(idx, a) => {
					let Some(&s) = ids.get(idx) else { continue };
					let a = account(a);
					let res = reg.rebind(s, a);
					let holder = live.iter().find(|(_, v)| **v == Some(a)).map(|(k, _)| *k);
					match live.get(&s).copied() {
						None => prop_assert_eq!(res, Err(RegistryError::UnknownSession(s))),
						Some(Some(cur)) if cur == a => prop_assert_eq!(res, Ok(())),
						Some(Some(cur)) => prop_assert_eq!(res, Err(RegistryError::SessionBound { session: s, account: cur })),
						Some(None) => match holder {
							Some(h) => prop_assert_eq!(res, Err(RegistryError::Conflict { account: a, holder: h })),
							None => {
								prop_assert_eq!(res, Ok(()));
								live.insert(s, Some(a));
							}
						},
					}
				}
				Op::Unbind(idx) => {
					let Some(&s) = ids.get(idx) else { continue };
					let expected = live.get_mut(&s).and_then(|v| v.take());
					prop_assert_eq!(reg.unbind(s), expected);
				}
				Op::Unregister(idx) => {
					let Some(&s) = ids.get(idx) else { continue };
					let expected = live.remove(&s).flatten();
					prop_assert_eq!(reg.unregister(s), expected);
				}
			}

			for s in &ids {
				let model = live.get(s);
				prop_assert_eq!(reg.lookup_session(*s).is_some(), model.is_some());
				prop_assert_eq!(reg.account_of(*s), model.copied().flatten());
			}
			for (s, a) in &live {
				if let Some(a) = a {
					prop_assert_eq!(reg.lookup_account(*a).map(|h| h.id()), Some(*s));
				}
			}
		}
	}
}
