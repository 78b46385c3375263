#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use murmur_domain::AccountId;
use murmur_protocol::{Event, OutboundFrame};
use tracing::debug;

use crate::server::error::RelayError;
use crate::server::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
	Connected,
	Disconnected,
}

impl PresenceKind {
	pub fn event(self, subject: AccountId) -> Event {
		match self {
			PresenceKind::Connected => Event::ClientConnected { phone_number: subject },
			PresenceKind::Disconnected => Event::ClientDisconnected { phone_number: subject },
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			PresenceKind::Connected => "connected",
			PresenceKind::Disconnected => "disconnected",
		}
	}
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
	pub delivered: usize,
	pub offline: usize,
	pub dropped: usize,
}

/// Best-effort delivery of events to the live sessions of a set of accounts.
#[derive(Debug, Clone)]
pub struct PresenceNotifier {
	registry: Arc<ConnectionRegistry>,
}

impl PresenceNotifier {
	pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
		Self { registry }
	}

	/// Tell every live contact that `subject` connected or disconnected.
	pub fn notify(&self, subject: AccountId, kind: PresenceKind, contacts: &[AccountId]) -> FanoutReport {
		let report = self.fan_out(kind.event(subject), contacts);
		debug!(
			account_id = %subject,
			kind = kind.as_str(),
			delivered = report.delivered,
			offline = report.offline,
			dropped = report.dropped,
			"presence fan-out"
		);
		report
	}

	/// Enqueue `frame` to each live target independently. Offline targets are skipped.
	pub fn fan_out(&self, frame: impl Into<OutboundFrame>, targets: &[AccountId]) -> FanoutReport {
		let frame = frame.into();

		let mut seen = HashSet::with_capacity(targets.len());
		let unique: Vec<AccountId> = targets.iter().copied().filter(|a| seen.insert(*a)).collect();

		// Handles are copied out so no send happens under the registry lock.
		let handles = self.registry.handles_for(&unique);

		let mut report = FanoutReport::default();
		for (account, handle) in handles {
			let Some(handle) = handle else {
				report.offline += 1;
				continue;
			};
			match handle.try_send(frame.clone()) {
				Ok(()) => report.delivered += 1,
				Err(e) => {
					report.dropped += 1;
					metrics::counter!("murmur_server_presence_dropped_total").increment(1);
					debug!(
						account_id = %account,
						session_id = %handle.id(),
						reason = match e {
							RelayError::QueueFull => "queue_full",
							RelayError::Closed => "closed",
						},
						"fan-out delivery dropped"
					);
				}
			}
		}
		report
	}

	/// Deliver to a single account if it is online.
	pub fn send_to(&self, target: AccountId, frame: impl Into<OutboundFrame>) -> FanoutReport {
		self.fan_out(frame, &[target])
	}
}

#[cfg(test)]
mod tests {
	use murmur_protocol::Event;
	use tokio::sync::mpsc;

	use super::*;

	fn account(id: i64) -> AccountId {
		AccountId::new(id).unwrap()
	}

	#[test]
	fn connected_event_reaches_only_live_contacts() {
		let registry = Arc::new(ConnectionRegistry::new());
		let notifier = PresenceNotifier::new(Arc::clone(&registry));

		let (tx_a, mut rx_a) = mpsc::channel(8);
		let a = registry.register(tx_a);
		registry.rebind(a.id(), account(1)).unwrap();

		let report = notifier.notify(account(9), PresenceKind::Connected, &[account(1), account(2)]);
		assert_eq!(
			report,
			FanoutReport {
				delivered: 1,
				offline: 1,
				dropped: 0,
			}
		);

		match rx_a.try_recv().unwrap() {
			OutboundFrame::Event(Event::ClientConnected { phone_number }) => assert_eq!(phone_number, account(9)),
			other => panic!("unexpected frame: {other:?}"),
		}
		assert!(rx_a.try_recv().is_err());

		// Account 2 connects afterwards and finds nothing queued for it.
		let (tx_b, mut rx_b) = mpsc::channel(8);
		let b = registry.register(tx_b);
		registry.rebind(b.id(), account(2)).unwrap();
		assert!(rx_b.try_recv().is_err());
	}

	#[test]
	fn full_peer_does_not_block_the_others() {
		let registry = Arc::new(ConnectionRegistry::new());
		let notifier = PresenceNotifier::new(Arc::clone(&registry));

		let (tx_slow, _rx_slow) = mpsc::channel(1);
		let slow = registry.register(tx_slow);
		registry.rebind(slow.id(), account(1)).unwrap();
		slow.try_send(Event::IsTyping { phone_number: account(5) }).unwrap();

		let (tx_fast, mut rx_fast) = mpsc::channel(8);
		let fast = registry.register(tx_fast);
		registry.rebind(fast.id(), account(2)).unwrap();

		let report = notifier.notify(account(5), PresenceKind::Disconnected, &[account(1), account(2), account(2)]);
		assert_eq!(report.delivered, 1);
		assert_eq!(report.dropped, 1);
		assert!(matches!(
			rx_fast.try_recv().unwrap(),
			OutboundFrame::Event(Event::ClientDisconnected { .. })
		));
		assert!(rx_fast.try_recv().is_err());
	}
}
