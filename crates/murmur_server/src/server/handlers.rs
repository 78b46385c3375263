#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::slice;

use murmur_domain::{
	AccountId, AccountRecord, ChatId, ChatMessage, ContactRef, DEFAULT_GROUP_IMAGE_URL, DEFAULT_PROFILE_IMAGE_URL,
	Group, GroupId, MessageId, MessageKind,
};
use murmur_protocol::inbound::{
	AccountRef, ChatRef, DeleteGroupMessage, DeleteMessage, GroupMemberChange, GroupRef, GroupUpload, IsTyping,
	NewGroup, SignUp, UpdateInfo, UpdatePassword, Upload,
};
use murmur_protocol::outbound::{DirectMessageEvent, GroupMessageEvent};
use murmur_protocol::{Event, InboundMessage, MessageType, Response, ResponseData};
use tracing::{debug, info, warn};

use crate::blob::BlobKey;
use crate::server::ServerContext;
use crate::server::error::HandlerError;
use crate::server::hydrator::hydrated_group;
use crate::server::locks::LockKey;
use crate::server::rebinder::{self, ACCOUNT_MISSING};
use crate::server::registry::SessionHandle;
use crate::store::{NewGroupRecord, StoreError};

pub const NEW_CONVERSATION: &str = "Server: New Conversation";
pub const SIGNED_UP: &str = "Account Created Successfully";
pub const DELETE_INCOMPLETE: &str = "account deletion incomplete; retry";

type Handled = Result<Option<Response>, HandlerError>;

/// Run the handler for `msg` on behalf of `session`.
///
/// Returns the reply for the sender, if the message has one. Failures are turned
/// into the `{type, status:false, message}` envelope here.
pub async fn handle(ctx: &ServerContext, session: &SessionHandle, msg: InboundMessage) -> Option<Response> {
	let kind = msg.message_type();
	match route(ctx, session, msg).await {
		Ok(resp) => resp,
		Err(err) => {
			match &err {
				HandlerError::NotLoggedIn | HandlerError::Rejected(_) => {
					debug!(session_id = %session.id(), %kind, error = %err, "request rejected");
				}
				_ => warn!(session_id = %session.id(), %kind, error = %err, "request failed"),
			}
			metrics::counter!("murmur_server_request_failures_total", "kind" => err.kind()).increment(1);
			Some(Response::failure(kind, err.to_string()))
		}
	}
}

async fn route(ctx: &ServerContext, session: &SessionHandle, msg: InboundMessage) -> Handled {
	let bound = ctx.registry.account_of(session.id());
	if bound.is_none() && !msg.message_type().allowed_before_login() {
		return Err(HandlerError::NotLoggedIn);
	}
	let me = || bound.ok_or(HandlerError::NotLoggedIn);

	match msg {
		InboundMessage::SignUp(m) => sign_up(ctx, m).await,
		InboundMessage::LoginRequest(m) => {
			rebinder::login(ctx, session, &m).await?;
			Ok(None)
		}
		InboundMessage::UpdatePassword(m) => update_password(ctx, m).await,
		InboundMessage::RetrieveQuestion(m) => retrieve_question(ctx, m).await,

		InboundMessage::LookupFriend(m) => lookup_friend(ctx, me()?, m).await,
		InboundMessage::Text(m) => {
			let content = Content::Text(m.message);
			send_direct(ctx, me()?, m.receiver, m.chat_id, MessageKind::Text, content, m.time).await
		}
		InboundMessage::File(m) => {
			let content = Content::attachment(m.file_name, m.file_data);
			send_direct(ctx, me()?, m.receiver, m.chat_id, MessageKind::File, content, m.time).await
		}
		InboundMessage::Audio(m) => {
			let content = Content::attachment(m.file_name, m.file_data);
			send_direct(ctx, me()?, m.receiver, m.chat_id, MessageKind::Audio, content, m.time).await
		}
		InboundMessage::IsTyping(m) => is_typing(ctx, me()?, m).await,
		InboundMessage::ProfileImage(m) => profile_image(ctx, me()?, m).await,
		InboundMessage::ProfileImageDeleted => profile_image_deleted(ctx, me()?).await,
		InboundMessage::UpdateInfo(m) => update_info(ctx, me()?, m).await,
		InboundMessage::NewGroup(m) => new_group(ctx, me()?, m).await,
		InboundMessage::GroupText(m) => {
			let content = Content::Text(m.message);
			send_group(ctx, me()?, m.group_id, MessageKind::Text, content, m.time).await
		}
		InboundMessage::GroupFile(m) => {
			let content = Content::attachment(m.file_name, m.file_data);
			send_group(ctx, me()?, m.group_id, MessageKind::File, content, m.time).await
		}
		InboundMessage::GroupAudio(m) => {
			let content = Content::attachment(m.file_name, m.file_data);
			send_group(ctx, me()?, m.group_id, MessageKind::Audio, content, m.time).await
		}
		InboundMessage::GroupIsTyping(m) => group_is_typing(ctx, me()?, m).await,
		InboundMessage::GroupProfileImage(m) => group_profile_image(ctx, me()?, m).await,
		InboundMessage::AddGroupMember(m) => add_group_member(ctx, me()?, m).await,
		InboundMessage::RemoveGroupMember(m) => remove_group_member(ctx, me()?, m).await,
		InboundMessage::DeleteMessage(m) => delete_message(ctx, me()?, m).await,
		InboundMessage::DeleteGroupMessage(m) => delete_group_message(ctx, me()?, m).await,
		InboundMessage::UpdateUnreadMessage(m) => update_unread_message(ctx, me()?, m).await,
		InboundMessage::UpdateGroupUnreadMessage(m) => update_group_unread_message(ctx, me()?, m).await,
		InboundMessage::DeleteAccount => delete_account(ctx, session, me()?).await,
	}
}

fn now_hhmm() -> String {
	chrono::Local::now().format("%H:%M").to_string()
}

async fn load_account(ctx: &ServerContext, id: AccountId) -> Result<AccountRecord, HandlerError> {
	ctx.timed(ctx.store.find_account(id))
		.await?
		.ok_or_else(|| HandlerError::rejected(ACCOUNT_MISSING))
}

async fn load_group(ctx: &ServerContext, id: GroupId) -> Result<Group, HandlerError> {
	ctx.timed(ctx.store.find_groups(&[id]))
		.await?
		.into_iter()
		.next()
		.ok_or_else(|| HandlerError::rejected("group does not exist"))
}

fn others(group: &Group, me: AccountId) -> Vec<AccountId> {
	group.members.iter().copied().filter(|m| *m != me).collect()
}

async fn sign_up(ctx: &ServerContext, m: SignUp) -> Handled {
	let id = m.phone_number;
	if ctx.timed(ctx.store.find_account(id)).await?.is_some() {
		return Err(HandlerError::rejected("account already exists"));
	}

	let mut record = AccountRecord::new(id, m.first_name.trim(), m.last_name.trim(), ctx.hash_secret(m.password).await?);
	record.secret_question = m.secret_question.trim().to_string();
	let answer = m.secret_answer.trim();
	if !answer.is_empty() {
		record.secret_answer = ctx.hash_secret(answer.to_string()).await?;
	}

	match ctx.timed(ctx.store.insert_account(&record)).await {
		Ok(()) => {}
		Err(StoreError::AlreadyExists(_)) => return Err(HandlerError::rejected("account already exists")),
		Err(e) => return Err(e.into()),
	}

	info!(account_id = %id, "account created");
	Ok(Some(Response::ok(MessageType::SignUp, SIGNED_UP)))
}

async fn retrieve_question(ctx: &ServerContext, m: AccountRef) -> Handled {
	let record = load_account(ctx, m.phone_number).await?;
	if record.secret_question.is_empty() {
		return Err(HandlerError::rejected("no secret question set"));
	}
	Ok(Some(
		Response::ok(MessageType::RetrieveQuestion, "secret question").with_data(ResponseData::SecretQuestion {
			secret_question: record.secret_question,
		}),
	))
}

async fn update_password(ctx: &ServerContext, m: UpdatePassword) -> Handled {
	let id = m.phone_number;
	let _held = ctx.locks.lock(id).await;

	let record = load_account(ctx, id).await?;
	if record.secret_answer.is_empty() {
		return Err(HandlerError::rejected("no secret answer set"));
	}
	if !ctx
		.verify_secret(m.secret_answer.trim().to_string(), record.secret_answer)
		.await
	{
		return Err(HandlerError::rejected("secret answer incorrect"));
	}

	let hashed = ctx.hash_secret(m.new_password).await?;
	if !ctx.timed(ctx.store.set_password(id, &hashed)).await? {
		return Err(HandlerError::rejected(ACCOUNT_MISSING));
	}

	info!(account_id = %id, "password updated");
	Ok(Some(Response::ok(MessageType::UpdatePassword, "password updated")))
}

async fn profile_image(ctx: &ServerContext, me: AccountId, m: Upload) -> Handled {
	let key = BlobKey::profile_image(me, &m.file_name)?;
	let url = ctx.blobs.put(&key, &m.file_data).await?;
	set_profile_image(ctx, me, MessageType::ProfileImage, url).await
}

async fn profile_image_deleted(ctx: &ServerContext, me: AccountId) -> Handled {
	set_profile_image(ctx, me, MessageType::ProfileImageDeleted, DEFAULT_PROFILE_IMAGE_URL.to_string()).await
}

async fn set_profile_image(ctx: &ServerContext, me: AccountId, kind: MessageType, image_url: String) -> Handled {
	if !ctx.timed(ctx.store.set_image_url(me, &image_url)).await? {
		return Err(HandlerError::rejected(ACCOUNT_MISSING));
	}
	let record = load_account(ctx, me).await?;
	ctx.presence.fan_out(
		Event::ClientProfileImage {
			phone_number: me,
			image_url: image_url.clone(),
		},
		&record.contact_ids(),
	);
	Ok(Some(
		Response::ok(kind, "profile image updated").with_data(ResponseData::Image { image_url }),
	))
}

async fn update_info(ctx: &ServerContext, me: AccountId, m: UpdateInfo) -> Handled {
	let first_name = m.first_name.trim();
	let last_name = m.last_name.trim();
	if !ctx.timed(ctx.store.set_names(me, first_name, last_name)).await? {
		return Err(HandlerError::rejected(ACCOUNT_MISSING));
	}
	let record = load_account(ctx, me).await?;
	ctx.presence.fan_out(
		Event::ContactInfoUpdated {
			phone_number: me,
			first_name: first_name.to_string(),
			last_name: last_name.to_string(),
		},
		&record.contact_ids(),
	);
	Ok(Some(Response::ok(MessageType::UpdateInfo, "contact info updated")))
}

async fn delete_account(ctx: &ServerContext, session: &SessionHandle, me: AccountId) -> Handled {
	let report = ctx.lifecycle.delete(me).await?;
	if !report.is_complete() {
		return Err(HandlerError::rejected(DELETE_INCOMPLETE));
	}

	ctx.presence
		.fan_out(Event::ContactDeleted { phone_number: me }, &report.contacts);
	ctx.registry.unbind(session.id());
	info!(session_id = %session.id(), account_id = %me, existed = report.existed, "account deleted");
	Ok(Some(Response::ok(MessageType::DeleteAccount, "account deleted")))
}

async fn lookup_friend(ctx: &ServerContext, me: AccountId, m: AccountRef) -> Handled {
	let peer = m.phone_number;
	if peer == me {
		return Err(HandlerError::rejected("you cannot add yourself"));
	}

	let _held = ctx.locks.lock_many([LockKey::Account(me), LockKey::Account(peer)]).await;

	let mine = load_account(ctx, me).await?;
	if mine.contact(peer).is_some() {
		return Err(HandlerError::rejected(format!("{peer} is already your contact")));
	}
	let theirs = ctx
		.timed(ctx.store.find_account(peer))
		.await?
		.ok_or_else(|| HandlerError::rejected(format!("The Account: {peer} doesn't exist in our Database")))?;

	let seed = ChatMessage::text(me, NEW_CONVERSATION, now_hhmm());
	let chat_id = ctx.timed(ctx.store.create_chat(slice::from_ref(&seed))).await?;

	let my_entry = ContactRef {
		contact_id: peer,
		chat_id,
		unread_messages: 0,
	};
	let their_entry = ContactRef {
		contact_id: me,
		chat_id,
		unread_messages: 0,
	};

	ctx.timed(ctx.store.push_contact(me, &my_entry)).await?;
	if let Err(e) = ctx.timed(ctx.store.push_contact(peer, &their_entry)).await {
		// Keep the relation mirrored: undo our side before failing.
		if let Err(undo) = ctx.timed(ctx.store.remove_contact(me, chat_id)).await {
			warn!(account_id = %me, %chat_id, error = %undo, "could not undo half-added contact");
		}
		if let Err(undo) = ctx.timed(ctx.store.delete_chat(chat_id)).await {
			warn!(%chat_id, error = %undo, "could not remove chat of half-added contact");
		}
		return Err(e.into());
	}

	let for_me = ctx.hydrator.contacts(slice::from_ref(&my_entry)).await?;
	let for_peer = ctx.hydrator.contacts(slice::from_ref(&their_entry)).await?;

	ctx.presence.send_to(
		peer,
		Event::AddedYou {
			message: format!("{me} added You"),
			json_array: for_peer,
		},
	);

	info!(account_id = %me, contact_id = %peer, %chat_id, "contact added");
	Ok(Some(
		Response::ok(
			MessageType::LookupFriend,
			format!("{peer} also known as {} is now Your friend", theirs.first_name),
		)
		.with_data(ResponseData::Contacts { json_array: for_me }),
	))
}

/// Message body before persistence.
enum Content {
	Text(String),
	Attachment { file_name: String, file_data: Vec<u8> },
}

impl Content {
	fn attachment(file_name: String, file_data: Vec<u8>) -> Self {
		Content::Attachment { file_name, file_data }
	}

	/// Upload attachments under `key` and build the stored message.
	async fn into_message(
		self,
		ctx: &ServerContext,
		message_id: MessageId,
		sender: AccountId,
		kind: MessageKind,
		time: String,
		key: impl FnOnce(&str) -> Result<BlobKey, crate::blob::BlobError>,
	) -> Result<(ChatMessage, Option<String>), HandlerError> {
		let time = if time.trim().is_empty() { now_hhmm() } else { time };
		match self {
			Content::Text(body) => Ok((
				ChatMessage {
					message_id,
					sender,
					kind,
					body,
					file_name: None,
					time,
				},
				None,
			)),
			Content::Attachment { file_name, file_data } => {
				let key = key(&file_name)?;
				let url = ctx.blobs.put(&key, &file_data).await?;
				Ok((
					ChatMessage {
						message_id,
						sender,
						kind,
						body: url.clone(),
						file_name: Some(file_name),
						time,
					},
					Some(url),
				))
			}
		}
	}
}

fn direct_type(kind: MessageKind) -> MessageType {
	match kind {
		MessageKind::Text => MessageType::Text,
		MessageKind::File => MessageType::File,
		MessageKind::Audio => MessageType::Audio,
	}
}

fn group_type(kind: MessageKind) -> MessageType {
	match kind {
		MessageKind::Text => MessageType::GroupText,
		MessageKind::File => MessageType::GroupFile,
		MessageKind::Audio => MessageType::GroupAudio,
	}
}

async fn send_direct(
	ctx: &ServerContext,
	me: AccountId,
	receiver: AccountId,
	chat_id: ChatId,
	kind: MessageKind,
	content: Content,
	time: String,
) -> Handled {
	let mine = load_account(ctx, me).await?;
	if mine.contact(receiver).map(|c| c.chat_id) != Some(chat_id) {
		return Err(HandlerError::rejected("receiver is not your contact in this chat"));
	}

	let message_id = MessageId::new_v4();
	let (message, url) = content
		.into_message(ctx, message_id, me, kind, time, |file| {
			BlobKey::chat_attachment(me, chat_id, message_id, file)
		})
		.await?;

	if !ctx.timed(ctx.store.push_chat_message(chat_id, &message)).await? {
		return Err(HandlerError::rejected("chat does not exist"));
	}

	{
		let _held = ctx.locks.lock(receiver).await;
		if let Err(e) = ctx.timed(ctx.store.increment_contact_unread(receiver, chat_id)).await {
			warn!(account_id = %receiver, %chat_id, error = %e, "unread counter not updated");
		}
	}

	let event = DirectMessageEvent { chat_id, message };
	let event = match kind {
		MessageKind::Text => Event::Text(event),
		MessageKind::File => Event::File(event),
		MessageKind::Audio => Event::Audio(event),
	};
	ctx.presence.send_to(receiver, event);

	Ok(Some(
		Response::ok(direct_type(kind), "message sent").with_data(ResponseData::Sent { message_id, url }),
	))
}

async fn is_typing(ctx: &ServerContext, me: AccountId, m: IsTyping) -> Handled {
	let mine = load_account(ctx, me).await?;
	if mine.contact(m.receiver).is_some() {
		ctx.presence.send_to(m.receiver, Event::IsTyping { phone_number: me });
	}
	Ok(None)
}

async fn delete_message(ctx: &ServerContext, me: AccountId, m: DeleteMessage) -> Handled {
	let mine = load_account(ctx, me).await?;
	let peer = mine
		.contact_by_chat(m.chat_id)
		.map(|c| c.contact_id)
		.ok_or_else(|| HandlerError::rejected("you are not part of this chat"))?;

	if !ctx
		.timed(ctx.store.remove_chat_message(m.chat_id, m.message_id, me))
		.await?
	{
		return Err(HandlerError::rejected("message not found or not sent by you"));
	}

	ctx.presence.send_to(
		peer,
		Event::MessageDeleted {
			chat_id: m.chat_id,
			message_id: m.message_id,
		},
	);
	Ok(Some(Response::ok(MessageType::DeleteMessage, "message deleted")))
}

async fn update_unread_message(ctx: &ServerContext, me: AccountId, m: ChatRef) -> Handled {
	let _held = ctx.locks.lock(me).await;
	let mine = load_account(ctx, me).await?;
	if mine.contact_by_chat(m.chat_id).is_none() {
		return Err(HandlerError::rejected("you are not part of this chat"));
	}
	ctx.timed(ctx.store.set_contact_unread(me, m.chat_id, 0)).await?;
	Ok(None)
}

async fn new_group(ctx: &ServerContext, me: AccountId, m: NewGroup) -> Handled {
	let mut seen = HashSet::from([me]);
	let requested: Vec<AccountId> = m.group_members.into_iter().filter(|a| seen.insert(*a)).collect();

	let existing: HashSet<AccountId> = ctx
		.timed(ctx.store.find_accounts(&requested))
		.await?
		.into_iter()
		.map(|a| a.id)
		.collect();

	let mut members = vec![me];
	for a in requested {
		if existing.contains(&a) {
			members.push(a);
		} else {
			debug!(account_id = %a, "new group: skipping unknown member");
		}
	}

	let name = m.group_name.trim().to_string();
	let record = NewGroupRecord {
		name: name.clone(),
		admin: me,
		image_url: DEFAULT_GROUP_IMAGE_URL.to_string(),
		members: members.clone(),
	};
	let group_id = ctx.timed(ctx.store.insert_group(&record)).await?;

	{
		let _held = ctx.locks.lock_many(members.iter().map(|a| LockKey::Account(*a))).await;
		for member in &members {
			if let Err(e) = ctx.timed(ctx.store.add_membership(*member, group_id)).await {
				warn!(account_id = %member, %group_id, error = %e, "group membership not recorded");
			}
		}
	}

	let group = Group {
		id: group_id,
		name,
		admin: me,
		image_url: record.image_url,
		members,
		messages: Vec::new(),
	};
	let targets = others(&group, me);
	let hydrated = hydrated_group(group, 0);
	ctx.presence.fan_out(
		Event::AddedToGroup {
			groups: vec![hydrated.clone()],
		},
		&targets,
	);

	info!(account_id = %me, %group_id, members = targets.len() + 1, "group created");
	Ok(Some(
		Response::ok(MessageType::NewGroup, "group created").with_data(ResponseData::Groups { groups: vec![hydrated] }),
	))
}

async fn send_group(
	ctx: &ServerContext,
	me: AccountId,
	group_id: GroupId,
	kind: MessageKind,
	content: Content,
	time: String,
) -> Handled {
	let group = load_group(ctx, group_id).await?;
	if !group.has_member(me) {
		return Err(HandlerError::rejected("you are not a member of this group"));
	}

	let message_id = MessageId::new_v4();
	let (message, url) = content
		.into_message(ctx, message_id, me, kind, time, |file| {
			BlobKey::group_attachment(group_id, me, message_id, file)
		})
		.await?;

	if !ctx.timed(ctx.store.push_group_message(group_id, &message)).await? {
		return Err(HandlerError::rejected("group does not exist"));
	}

	let targets = others(&group, me);
	for member in &targets {
		let _held = ctx.locks.lock(*member).await;
		if let Err(e) = ctx.timed(ctx.store.increment_group_unread(*member, group_id)).await {
			warn!(account_id = %member, %group_id, error = %e, "group unread counter not updated");
		}
	}

	let event = GroupMessageEvent { group_id, message };
	let event = match kind {
		MessageKind::Text => Event::GroupText(event),
		MessageKind::File => Event::GroupFile(event),
		MessageKind::Audio => Event::GroupAudio(event),
	};
	ctx.presence.fan_out(event, &targets);

	Ok(Some(
		Response::ok(group_type(kind), "message sent").with_data(ResponseData::Sent { message_id, url }),
	))
}

async fn group_is_typing(ctx: &ServerContext, me: AccountId, m: GroupRef) -> Handled {
	let group = load_group(ctx, m.group_id).await?;
	if group.has_member(me) {
		ctx.presence.fan_out(
			Event::GroupIsTyping {
				group_id: m.group_id,
				phone_number: me,
			},
			&others(&group, me),
		);
	}
	Ok(None)
}

async fn group_profile_image(ctx: &ServerContext, me: AccountId, m: GroupUpload) -> Handled {
	let _held = ctx.locks.lock(m.group_id).await;
	let group = load_group(ctx, m.group_id).await?;
	if group.admin != me {
		return Err(HandlerError::rejected("only the group admin can change the group image"));
	}

	let key = BlobKey::group_image(m.group_id, &m.file_name)?;
	let url = ctx.blobs.put(&key, &m.file_data).await?;
	if !ctx.timed(ctx.store.set_group_image(m.group_id, &url)).await? {
		return Err(HandlerError::rejected("group does not exist"));
	}

	ctx.presence.fan_out(
		Event::GroupProfileImage {
			group_id: m.group_id,
			group_image_url: url.clone(),
		},
		&others(&group, me),
	);
	Ok(Some(
		Response::ok(MessageType::GroupProfileImage, "group image updated")
			.with_data(ResponseData::Image { image_url: url }),
	))
}

async fn add_group_member(ctx: &ServerContext, me: AccountId, m: GroupMemberChange) -> Handled {
	let (group_id, target) = (m.group_id, m.phone_number);
	let _held = ctx
		.locks
		.lock_many([LockKey::Group(group_id), LockKey::Account(target)])
		.await;

	let mut group = load_group(ctx, group_id).await?;
	if group.admin != me {
		return Err(HandlerError::rejected("only the group admin can add members"));
	}
	if group.has_member(target) {
		return Err(HandlerError::rejected(format!("{target} is already a member")));
	}
	load_account(ctx, target).await?;

	ctx.timed(ctx.store.add_group_member(group_id, target)).await?;
	if let Err(e) = ctx.timed(ctx.store.add_membership(target, group_id)).await {
		if let Err(undo) = ctx.timed(ctx.store.remove_group_member(group_id, target)).await {
			warn!(%group_id, account_id = %target, error = %undo, "could not undo half-added member");
		}
		return Err(e.into());
	}

	let existing = others(&group, target);
	ctx.presence.fan_out(
		Event::GroupMemberAdded {
			group_id,
			phone_number: target,
		},
		&existing,
	);
	group.members.push(target);
	ctx.presence.send_to(
		target,
		Event::AddedToGroup {
			groups: vec![hydrated_group(group, 0)],
		},
	);

	info!(%group_id, account_id = %target, by = %me, "group member added");
	Ok(Some(Response::ok(MessageType::AddGroupMember, "member added")))
}

async fn remove_group_member(ctx: &ServerContext, me: AccountId, m: GroupMemberChange) -> Handled {
	let (group_id, target) = (m.group_id, m.phone_number);
	let _held = ctx
		.locks
		.lock_many([LockKey::Group(group_id), LockKey::Account(target)])
		.await;

	let group = load_group(ctx, group_id).await?;
	if group.admin != me && target != me {
		return Err(HandlerError::rejected("only the group admin can remove members"));
	}
	if !group.has_member(target) {
		return Err(HandlerError::rejected(format!("{target} is not a member")));
	}

	ctx.timed(ctx.store.remove_group_member(group_id, target)).await?;
	ctx.timed(ctx.store.remove_membership(target, group_id)).await?;

	ctx.presence.fan_out(
		Event::GroupMemberRemoved {
			group_id,
			phone_number: target,
		},
		&others(&group, target),
	);
	if target != me {
		ctx.presence.send_to(target, Event::RemovedFromGroup { group_id });
	}

	info!(%group_id, account_id = %target, by = %me, "group member removed");
	Ok(Some(Response::ok(MessageType::RemoveGroupMember, "member removed")))
}

async fn delete_group_message(ctx: &ServerContext, me: AccountId, m: DeleteGroupMessage) -> Handled {
	let group = load_group(ctx, m.group_id).await?;
	if !group.has_member(me) {
		return Err(HandlerError::rejected("you are not a member of this group"));
	}
	if !ctx
		.timed(ctx.store.remove_group_message(m.group_id, m.message_id, me))
		.await?
	{
		return Err(HandlerError::rejected("message not found or not sent by you"));
	}

	ctx.presence.fan_out(
		Event::GroupMessageDeleted {
			group_id: m.group_id,
			message_id: m.message_id,
		},
		&others(&group, me),
	);
	Ok(Some(Response::ok(MessageType::DeleteGroupMessage, "message deleted")))
}

async fn update_group_unread_message(ctx: &ServerContext, me: AccountId, m: GroupRef) -> Handled {
	let _held = ctx.locks.lock(me).await;
	let mine = load_account(ctx, me).await?;
	if !mine.is_member_of(m.group_id) {
		return Err(HandlerError::rejected("you are not a member of this group"));
	}
	ctx.timed(ctx.store.set_group_unread(me, m.group_id, 0)).await?;
	Ok(None)
}
