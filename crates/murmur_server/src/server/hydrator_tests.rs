#![forbid(unsafe_code)]

use std::time::Duration;

use murmur_domain::{ChatMessage, ChatThread, ContactRef, GroupMembership};

use crate::server::hydrator::HydrationError;
use crate::server::test_support::{Harness, account, chat, group};
use crate::store::{AccountStore, NewGroupRecord};

#[tokio::test]
async fn contact_with_missing_chat_is_omitted() {
	let h = Harness::new();
	h.seed_account(1, "Ada").await;
	h.seed_account(2, "Bob").await;
	h.seed_account(3, "Cy").await;
	let good = h.link(1, 2).await;

	h.store
		.push_contact(
			account(1),
			&ContactRef {
				contact_id: account(3),
				chat_id: chat(999),
				unread_messages: 4,
			},
		)
		.await
		.unwrap();

	let (_, hydrated) = h.ctx.hydrator.hydrate(account(1)).await.unwrap();
	assert_eq!(hydrated.contacts.len(), 1);
	assert_eq!(hydrated.contacts[0].chat_id, good);
	assert_eq!(hydrated.contacts[0].contact_info.first_name, "Bob");
	assert_eq!(hydrated.contacts[0].chat_messages.len(), 1);
}

#[tokio::test]
async fn contact_pointing_at_missing_account_is_omitted() {
	let h = Harness::new();
	h.seed_account(1, "Ada").await;
	h.seed_account(2, "Bob").await;
	h.link(1, 2).await;
	h.store.delete_account(account(2)).await.unwrap();

	let (_, hydrated) = h.ctx.hydrator.hydrate(account(1)).await.unwrap();
	assert!(hydrated.contacts.is_empty());
}

#[tokio::test]
async fn duplicate_contact_entries_collapse_to_the_first() {
	let h = Harness::new();
	h.seed_account(1, "Ada").await;
	h.seed_account(2, "Bob").await;
	let c = h.link(1, 2).await;

	h.store
		.push_contact(
			account(1),
			&ContactRef {
				contact_id: account(2),
				chat_id: c,
				unread_messages: 9,
			},
		)
		.await
		.unwrap();

	let (_, hydrated) = h.ctx.hydrator.hydrate(account(1)).await.unwrap();
	assert_eq!(hydrated.contacts.len(), 1);
	assert_eq!(hydrated.contacts[0].unread_messages, 0);
}

#[tokio::test]
async fn empty_chat_is_kept_and_order_follows_contact_list() {
	let h = Harness::new();
	for (id, name) in [(1, "Ada"), (2, "Bob"), (3, "Cy")] {
		h.seed_account(id, name).await;
	}
	let first = h.link(1, 3).await;
	h.store.put_chat(chat(50), ChatThread::default());
	h.store
		.push_contact(
			account(1),
			&ContactRef {
				contact_id: account(2),
				chat_id: chat(50),
				unread_messages: 0,
			},
		)
		.await
		.unwrap();

	let (_, hydrated) = h.ctx.hydrator.hydrate(account(1)).await.unwrap();
	let chats: Vec<_> = hydrated.contacts.iter().map(|c| c.chat_id).collect();
	assert_eq!(chats, vec![first, chat(50)]);
	assert!(hydrated.contacts[1].chat_messages.is_empty());
}

#[tokio::test]
async fn groups_join_unread_counters_and_drop_orphans() {
	let h = Harness::new();
	h.seed_account(1, "Ada").await;
	h.seed_account(2, "Bob").await;
	let g = h
		.store
		.insert_group(&NewGroupRecord {
			name: "climbers".to_string(),
			admin: account(2),
			image_url: "img".to_string(),
			members: vec![account(2), account(1)],
		})
		.await
		.unwrap();
	h.store.add_membership(account(1), g).await.unwrap();
	h.store.increment_group_unread(account(1), g).await.unwrap();
	h.store
		.push_group_message(g, &ChatMessage::text(account(2), "hi", "10:00"))
		.await
		.unwrap();
	h.store.add_membership(account(1), group(404)).await.unwrap();

	let (record, hydrated) = h.ctx.hydrator.hydrate(account(1)).await.unwrap();
	assert_eq!(record.groups.len(), 2);
	assert_eq!(hydrated.groups.len(), 1);

	let got = &hydrated.groups[0];
	assert_eq!(got.id, g);
	assert_eq!(got.group_name, "climbers");
	assert_eq!(got.group_admin, account(2));
	assert_eq!(got.group_unread_messages, 1);
	assert_eq!(got.group_messages.len(), 1);
}

#[tokio::test]
async fn missing_account_is_not_found() {
	let h = Harness::new();
	let err = h.ctx.hydrator.hydrate(account(77)).await.unwrap_err();
	assert!(matches!(err, HydrationError::AccountNotFound(id) if id == account(77)));
}

#[tokio::test]
async fn slow_store_times_out_instead_of_returning_empty() {
	let h = Harness::with_timeout(Duration::from_millis(50));
	h.seed_account(1, "Ada").await;

	let (_, empty) = h.ctx.hydrator.hydrate(account(1)).await.unwrap();
	assert!(empty.contacts.is_empty());

	h.store.set_latency(Some(Duration::from_millis(200)));
	let err = h.ctx.hydrator.hydrate(account(1)).await.unwrap_err();
	assert!(matches!(err, HydrationError::Timeout(_)));
}

#[tokio::test]
async fn membership_rows_are_deduplicated() {
	let h = Harness::new();
	h.seed_account(1, "Ada").await;
	let g = h
		.store
		.insert_group(&NewGroupRecord {
			name: "g".to_string(),
			admin: account(1),
			image_url: "img".to_string(),
			members: vec![account(1)],
		})
		.await
		.unwrap();

	let rows = [
		GroupMembership {
			group_id: g,
			group_unread_messages: 2,
		},
		GroupMembership {
			group_id: g,
			group_unread_messages: 7,
		},
	];
	let groups = h.ctx.hydrator.groups(&rows).await.unwrap();
	assert_eq!(groups.len(), 1);
	assert_eq!(groups[0].group_unread_messages, 2);
}
