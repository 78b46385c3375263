#![forbid(unsafe_code)]

use murmur_protocol::inbound::LoginRequest;
use murmur_protocol::outbound::{AccountProfile, LoginSnapshot};
use murmur_protocol::{MessageType, Response, ResponseData};
use tracing::{debug, info, warn};

use crate::server::ServerContext;
use crate::server::error::HandlerError;
use crate::server::presence::PresenceKind;
use crate::server::registry::{RegistryError, SessionHandle};

pub const LOGIN_OK_MESSAGE: &str = "loading your data...";
pub const ACCOUNT_MISSING: &str = "account does not exist";
pub const PASSWORD_INCORRECT: &str = "password incorrect";
pub const ALREADY_CONNECTED: &str = "already connected elsewhere";
pub const SESSION_TAKEN: &str = "already logged in as another account";

/// How a login that bound the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
	/// Snapshot delivered.
	Hydrated,
	/// Bound, but the snapshot could not be built; a failure frame was sent instead.
	Unhydrated,
}

impl LoginOutcome {
	fn as_str(self) -> &'static str {
		match self {
			LoginOutcome::Hydrated => "ok",
			LoginOutcome::Unhydrated => "unhydrated",
		}
	}
}

/// Promote `session` to the account named in `req`.
///
/// Order: verify credentials, lock the account, bind, persist online status,
/// hydrate, send the snapshot, announce presence. Errors are returned before
/// anything is bound, or after the binding was rolled back.
pub async fn login(
	ctx: &ServerContext,
	session: &SessionHandle,
	req: &LoginRequest,
) -> Result<LoginOutcome, HandlerError> {
	let res = bind_and_hydrate(ctx, session, req).await;
	let outcome = match &res {
		Ok(o) => o.as_str(),
		Err(e) => e.kind(),
	};
	metrics::counter!("murmur_server_logins_total", "outcome" => outcome).increment(1);
	res
}

async fn bind_and_hydrate(
	ctx: &ServerContext,
	session: &SessionHandle,
	req: &LoginRequest,
) -> Result<LoginOutcome, HandlerError> {
	let account = req.phone_number;
	let session_id = session.id();

	let record = ctx
		.timed(ctx.store.find_account(account))
		.await?
		.ok_or_else(|| HandlerError::rejected(ACCOUNT_MISSING))?;

	if !ctx.verify_secret(req.password.clone(), record.hashed_password.clone()).await {
		debug!(%session_id, account_id = %account, "login rejected: bad password");
		return Err(HandlerError::rejected(PASSWORD_INCORRECT));
	}

	// Serializes with `disconnect` of the same account from rebind through the presence notice.
	let _held = ctx.locks.lock(account).await;

	let was_bound = ctx.registry.account_of(session_id) == Some(account);
	match ctx.registry.rebind(session_id, account) {
		Ok(()) => {}
		Err(RegistryError::Conflict { holder, .. }) => {
			warn!(%session_id, account_id = %account, %holder, "login rejected: account bound to another session");
			return Err(HandlerError::rejected(ALREADY_CONNECTED));
		}
		Err(RegistryError::SessionBound { account: current, .. }) => {
			debug!(%session_id, account_id = %account, current = %current, "login rejected: session already bound");
			return Err(HandlerError::rejected(SESSION_TAKEN));
		}
		Err(e @ RegistryError::UnknownSession(_)) => {
			return Err(HandlerError::rejected(e.to_string()));
		}
	}

	if let Err(e) = ctx.timed(ctx.store.set_status(account, true)).await {
		if !was_bound {
			ctx.registry.unbind(session_id);
		}
		warn!(%session_id, account_id = %account, error = %e, "login rolled back: status write failed");
		return Err(e.into());
	}

	let (outcome, contacts) = match ctx.hydrator.hydrate(account).await {
		Ok((fresh, hydrated)) => {
			let snapshot = LoginSnapshot {
				my_info: AccountProfile::from(&fresh),
				contacts: hydrated.contacts,
				groups: hydrated.groups,
			};
			let resp = Response::ok(MessageType::LoginRequest, LOGIN_OK_MESSAGE)
				.with_data(ResponseData::Login(Box::new(snapshot)));
			if let Err(e) = session.try_send(resp) {
				warn!(%session_id, account_id = %account, error = %e, "login snapshot not delivered");
			}
			(LoginOutcome::Hydrated, fresh.contact_ids())
		}
		Err(e) => {
			warn!(%session_id, account_id = %account, error = %e, "login hydration failed; session stays bound");
			let resp = Response::failure(MessageType::LoginRequest, HandlerError::from(e).to_string());
			if let Err(e) = session.try_send(resp) {
				warn!(%session_id, account_id = %account, error = %e, "login failure frame not delivered");
			}
			(LoginOutcome::Unhydrated, record.contact_ids())
		}
	};

	let report = ctx.presence.notify(account, PresenceKind::Connected, &contacts);
	info!(
		%session_id,
		account_id = %account,
		outcome = outcome.as_str(),
		notified = report.delivered,
		"login complete"
	);

	Ok(outcome)
}
