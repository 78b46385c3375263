#![forbid(unsafe_code)]

use std::time::Duration;

use crate::server::lifecycle::CascadeStep;
use crate::server::test_support::{Harness, account};
use crate::store::{AccountStore, NewGroupRecord};

async fn shared_group(h: &Harness, members: &[i64]) -> murmur_domain::GroupId {
	let members: Vec<_> = members.iter().map(|id| account(*id)).collect();
	let g = h
		.store
		.insert_group(&NewGroupRecord {
			name: "crew".to_string(),
			admin: members[0],
			image_url: "img".to_string(),
			members: members.clone(),
		})
		.await
		.unwrap();
	for m in members {
		h.store.add_membership(m, g).await.unwrap();
	}
	g
}

#[tokio::test]
async fn delete_cascades_and_rerun_is_a_noop() {
	let h = Harness::new();
	h.seed_account(1, "X").await;
	h.seed_account(2, "Y").await;
	h.seed_account(3, "Z").await;
	let c = h.link(1, 2).await;
	let other = h.link(2, 3).await;
	let g = shared_group(&h, &[2, 1]).await;

	let report = h.ctx.lifecycle.delete(account(1)).await.unwrap();
	assert!(report.is_complete(), "{report:?}");
	assert!(report.existed);
	assert_eq!(report.contacts, vec![account(2)]);
	assert_eq!(report.groups_left, 1);
	assert_eq!(report.contacts_unlinked, 1);
	assert_eq!(report.chats_deleted, 1);

	assert!(h.store.find_account(account(1)).await.unwrap().is_none());
	let y = h.store.find_account(account(2)).await.unwrap().unwrap();
	assert!(y.contact(account(1)).is_none());
	assert_eq!(y.contact(account(3)).map(|c| c.chat_id), Some(other));
	assert!(h.store.find_chats(&[c]).await.unwrap().is_empty());
	let groups = h.store.find_groups(&[g]).await.unwrap();
	assert_eq!(groups[0].members, vec![account(2)]);

	let again = h.ctx.lifecycle.delete(account(1)).await.unwrap();
	assert!(!again.existed);
	assert!(again.is_complete());
	assert!(again.failures.is_empty());
}

#[tokio::test]
async fn failed_step_keeps_the_record_and_rerun_converges() {
	let h = Harness::new();
	h.seed_account(1, "X").await;
	h.seed_account(2, "Y").await;
	h.seed_account(3, "Z").await;
	let c12 = h.link(1, 2).await;
	let c13 = h.link(1, 3).await;

	h.store.fail_op("delete_chat");
	let report = h.ctx.lifecycle.delete(account(1)).await.unwrap();
	assert!(!report.is_complete());
	assert!(!report.account_removed);
	assert_eq!(report.contacts_unlinked, 2);
	assert_eq!(report.failures.len(), 2);
	assert!(
		report
			.failures
			.iter()
			.all(|f| matches!(f.step, CascadeStep::DeleteChat(_)))
	);

	// Other steps still ran.
	let y = h.store.find_account(account(2)).await.unwrap().unwrap();
	assert!(y.contacts.is_empty());
	assert!(h.store.find_account(account(1)).await.unwrap().is_some());

	h.store.heal_op("delete_chat");
	let report = h.ctx.lifecycle.delete(account(1)).await.unwrap();
	assert!(report.is_complete(), "{report:?}");
	assert!(report.account_removed);
	assert!(h.store.find_chats(&[c12, c13]).await.unwrap().is_empty());
	assert!(h.store.find_account(account(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn group_step_failure_does_not_stop_contact_cleanup() {
	let h = Harness::new();
	h.seed_account(1, "X").await;
	h.seed_account(2, "Y").await;
	let c = h.link(1, 2).await;
	let g = shared_group(&h, &[1, 2]).await;

	h.store.fail_op("remove_group_member");
	let report = h.ctx.lifecycle.delete(account(1)).await.unwrap();
	assert_eq!(report.failures.len(), 1);
	assert_eq!(report.failures[0].step, CascadeStep::LeaveGroup(g));
	assert_eq!(report.chats_deleted, 1);
	assert!(h.store.find_chats(&[c]).await.unwrap().is_empty());
	assert!(h.store.find_account(account(1)).await.unwrap().is_some());
}

#[tokio::test]
async fn deleting_unknown_account_succeeds() {
	let h = Harness::new();
	let report = h.ctx.lifecycle.delete(account(42)).await.unwrap();
	assert!(!report.existed);
	assert!(report.is_complete());
}

#[tokio::test]
async fn contact_added_while_waiting_for_locks_is_locked_too() {
	let h = Harness::new();
	h.seed_account(1, "X").await;
	h.seed_account(2, "Y").await;

	let held_x = h.ctx.locks.lock(account(1)).await;
	let lifecycle = h.ctx.lifecycle.clone();
	let deleting = tokio::spawn(async move { lifecycle.delete(account(1)).await });
	tokio::time::sleep(Duration::from_millis(20)).await;

	// The relation appears after the delete picked its lock set.
	let c = h.link(1, 2).await;
	let held_y = h.ctx.locks.lock(account(2)).await;
	drop(held_x);

	tokio::time::sleep(Duration::from_millis(30)).await;
	assert!(!deleting.is_finished(), "cascade ran without the contact's lock");
	assert!(h.store.find_account(account(1)).await.unwrap().is_some());

	drop(held_y);
	let report = tokio::time::timeout(Duration::from_secs(1), deleting)
		.await
		.expect("delete finishes once the lock is free")
		.unwrap()
		.unwrap();
	assert!(report.is_complete(), "{report:?}");
	assert_eq!(report.contacts, vec![account(2)]);
	let y = h.store.find_account(account(2)).await.unwrap().unwrap();
	assert!(y.contacts.is_empty());
	assert!(h.store.find_chats(&[c]).await.unwrap().is_empty());
}
