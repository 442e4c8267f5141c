//! Room join, host election and call teardown.
//!
//! These functions sit between the signaling socket and the two stores: the
//! realtime [`RoomStore`](crate::store::RoomStore) and the sqlite session
//! records. Store errors on the teardown paths are logged and swallowed.

use booth_common::{
    access_code, ids, push_id, AgentInfo, ChatMessage, EndReason, Error, PresenceRecord, Result,
    Role, SessionStatus,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditContext, AuditEvent};
use crate::db::{self, NewSession};
use crate::security;
use crate::state::AppState;
use crate::store::{HostClaim, RoomEvent};

pub const MAX_USER_AGENT_CHARS: usize = 100;
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;
pub const MAX_CHAT_CHARS: usize = 2000;
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub access_code: String,
    pub display_name: String,
    pub user_agent: String,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub role: Role,
}

/// A participant that completed the join sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub participant_id: String,
    pub session_id: String,
    pub access_code: String,
    pub display_name: String,
    pub role: Role,
    pub is_host: bool,
    pub host_id: String,
    pub start_time: i64,
}

pub struct Joined {
    pub member: Member,
    pub events: broadcast::Receiver<RoomEvent>,
    /// Presence records of everyone else already in the room.
    pub others: Vec<PresenceRecord>,
    pub chat: Vec<ChatMessage>,
}

/// Resolve the agent an access code belongs to.
///
/// Demo codes always map to the demo agent. Any other code must have been
/// issued and must not have expired. Redemption is left to the validate
/// endpoint so a single-use code can still be joined with after validation.
pub async fn authorize(state: &AppState, code: &str, now_ms: i64) -> Result<AgentInfo> {
    if state.config.is_demo_code(code) {
        return Ok(AgentInfo::demo());
    }
    let record = db::get_access_code(&state.pool, code)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| Error::not_found("Invalid access code"))?;
    if record.is_expired(now_ms) {
        return Err(Error::validation("Access code has expired"));
    }
    db::agent_for_code(&state.pool, &record)
        .await
        .map_err(Error::internal)
}

fn default_display_name(role: Role, participant_id: &str) -> String {
    match role {
        Role::Agent => "Banking Agent".to_string(),
        Role::Customer => {
            let short: String = participant_id.chars().take(4).collect();
            format!("Customer ({short})")
        }
    }
}

pub async fn join_room(state: &AppState, req: JoinRequest, now_ms: i64) -> Result<Joined> {
    let code = access_code::parse(&req.access_code)?;
    let agent = match authorize(state, &code, now_ms).await {
        Ok(agent) => agent,
        Err(err) => {
            audit::record(
                &state.pool,
                AuditEvent::AccessCodeRejected,
                AuditContext::room(&code).with_details(&err.to_string()),
            )
            .await;
            return Err(err);
        }
    };

    let participant_id = push_id(now_ms, &mut rand::thread_rng());

    if state
        .rooms
        .remove_if_stale(&code, now_ms, state.config.room_stale)
        .await
    {
        audit::record(
            &state.pool,
            AuditEvent::RoomReaped,
            AuditContext::room(&code).with_details("stale on join"),
        )
        .await;
    }

    let display_name = match security::sanitize_text(&req.display_name, MAX_DISPLAY_NAME_CHARS) {
        name if name.is_empty() => default_display_name(req.role, &participant_id),
        name => name,
    };
    let customer_id = req
        .customer_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("guest_{now_ms}"));
    let customer_name = req
        .customer_name
        .map(|name| security::sanitize_text(&name, MAX_DISPLAY_NAME_CHARS))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| display_name.clone());

    let session_id = ids::session_id(now_ms, &mut rand::thread_rng());
    db::create_session(
        &state.pool,
        &NewSession {
            participant_id: &participant_id,
            session_id: &session_id,
            access_code: &code,
            agent: &agent,
            customer_id: &customer_id,
            customer_name: &customer_name,
            start_time: now_ms,
            expires_at: now_ms + state.config.session_max.as_millis() as i64,
        },
    )
    .await
    .map_err(Error::internal)?;
    audit::record(
        &state.pool,
        AuditEvent::SessionStarted,
        AuditContext::participant(&code, &participant_id).with_details(&session_id),
    )
    .await;

    let presence = PresenceRecord {
        participant_id: participant_id.clone(),
        display_name: display_name.clone(),
        joined_at: now_ms,
        user_agent: req.user_agent.chars().take(MAX_USER_AGENT_CHARS).collect(),
        connection_id: now_ms,
    };

    let mut last_err = Error::internal("join did not run");
    for attempt in 1..=JOIN_ATTEMPTS {
        match enter_room(state, &code, &presence, now_ms).await {
            Ok((claim, events, others, chat)) => {
                let (is_host, host_id) = match claim {
                    HostClaim::Elected => {
                        audit::record(
                            &state.pool,
                            AuditEvent::HostElected,
                            AuditContext::participant(&code, &participant_id),
                        )
                        .await;
                        (true, participant_id.clone())
                    }
                    HostClaim::Existing(host) => (false, host),
                };
                info!(
                    "participant {} joined room {} (host: {})",
                    participant_id, code, is_host
                );
                return Ok(Joined {
                    member: Member {
                        participant_id,
                        session_id,
                        access_code: code,
                        display_name,
                        role: req.role,
                        is_host,
                        host_id,
                        start_time: now_ms,
                    },
                    events,
                    others,
                    chat,
                });
            }
            Err(err) => {
                debug!("join attempt {} for room {} failed: {}", attempt, code, err);
                last_err = err;
            }
        }
    }

    close_record(state, &participant_id, SessionStatus::Ended, now_ms).await;
    Err(last_err)
}

type Entered = (
    HostClaim,
    broadcast::Receiver<RoomEvent>,
    Vec<PresenceRecord>,
    Vec<ChatMessage>,
);

/// Touch, elect, clear the mailbox, subscribe and announce presence.
///
/// Fails with `NotFound` if the room is deleted part way through.
async fn enter_room(
    state: &AppState,
    code: &str,
    presence: &PresenceRecord,
    now_ms: i64,
) -> Result<Entered> {
    let rooms = &state.rooms;
    rooms.touch(code, now_ms).await?;
    let claim = rooms.claim_host(code, &presence.participant_id).await?;
    rooms.clear_mailbox(code, &presence.participant_id).await?;
    let (events, snapshot) = rooms
        .subscribe_with_snapshot(code)
        .await
        .ok_or_else(|| Error::not_found(format!("room {code} was deleted")))?;
    rooms.put_presence(code, presence.clone(), now_ms).await?;
    let others = snapshot
        .users
        .into_iter()
        .filter(|user| user.participant_id != presence.participant_id)
        .collect();
    Ok((claim, events, others, snapshot.chat))
}

async fn close_record(
    state: &AppState,
    participant_id: &str,
    status: SessionStatus,
    now_ms: i64,
) -> Option<db::SessionRecord> {
    match db::close_session(&state.pool, participant_id, status, now_ms).await {
        Ok(record) => record,
        Err(err) => {
            warn!("failed to close session for {}: {}", participant_id, err);
            None
        }
    }
}

/// End the call for `member`. The host deletes the whole room; anyone else
/// only removes their own presence and mailbox.
///
/// Returns the final status and the call duration.
pub async fn end_call(
    state: &AppState,
    member: &Member,
    reason: EndReason,
    now_ms: i64,
) -> (SessionStatus, i64) {
    let status = reason.status();
    let record = close_record(state, &member.participant_id, status, now_ms).await;
    let duration_ms = record
        .and_then(|record| record.duration_ms)
        .unwrap_or_else(|| (now_ms - member.start_time).max(0));

    let event = match status {
        SessionStatus::Expired => AuditEvent::SessionExpired,
        _ => AuditEvent::SessionEnded,
    };
    let details = format!("{reason:?} after {duration_ms}ms");
    audit::record(
        &state.pool,
        event,
        AuditContext::participant(&member.access_code, &member.participant_id)
            .with_details(&details),
    )
    .await;

    if member.is_host {
        if state.rooms.remove_room(&member.access_code).await {
            info!("host {} closed room {}", member.participant_id, member.access_code);
        }
    } else {
        state
            .rooms
            .remove_participant(&member.access_code, &member.participant_id, now_ms)
            .await;
    }
    (status, duration_ms)
}

/// Socket dropped without an `END`. Presence and mailbox are removed and the
/// session closed, but the room is left for the reaper even when the host
/// leaves this way.
pub async fn leave(state: &AppState, member: &Member, now_ms: i64) {
    state
        .rooms
        .remove_participant(&member.access_code, &member.participant_id, now_ms)
        .await;
    if let Some(record) = close_record(state, &member.participant_id, SessionStatus::Ended, now_ms).await {
        audit::record(
            &state.pool,
            AuditEvent::SessionEnded,
            AuditContext::participant(&member.access_code, &member.participant_id)
                .with_details("disconnected"),
        )
        .await;
        debug!(
            "session {} closed after disconnect ({:?}ms)",
            record.session_id, record.duration_ms
        );
    }
}

pub async fn heartbeat(state: &AppState, member: &Member, now_ms: i64) {
    if let Err(err) = state.rooms.refresh(&member.access_code, now_ms).await {
        debug!("heartbeat for {} ignored: {}", member.participant_id, err);
    }
    if let Err(err) = db::touch_session(&state.pool, &member.participant_id, now_ms).await {
        warn!("failed to touch session {}: {}", member.participant_id, err);
    }
}

pub async fn report_participants(state: &AppState, member: &Member, count: u32, now_ms: i64) {
    if let Err(err) =
        db::update_participants(&state.pool, &member.participant_id, count as i64, now_ms).await
    {
        warn!(
            "failed to update participant count for {}: {}",
            member.participant_id, err
        );
    }
}

pub async fn post_chat(state: &AppState, member: &Member, text: &str, now_ms: i64) -> Result<ChatMessage> {
    if text.chars().count() > MAX_CHAT_CHARS {
        return Err(Error::validation("chat message too long"));
    }
    let text = security::sanitize_text(text, MAX_CHAT_CHARS);
    if text.is_empty() {
        return Err(Error::validation("chat message is empty"));
    }
    let message = ChatMessage {
        message_id: push_id(now_ms, &mut rand::thread_rng()),
        text,
        sender: member.display_name.clone(),
        sender_id: member.participant_id.clone(),
        sender_type: member.role,
        timestamp: now_ms,
    };
    state
        .rooms
        .append_chat(&member.access_code, message.clone())
        .await?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::db::AccessCodeRecord;

    async fn test_state() -> AppState {
        let pool = db::connect("sqlite::memory:", 1).await.unwrap();
        AppState::new(pool, GatewayConfig::default())
    }

    fn request(code: &str, name: &str) -> JoinRequest {
        JoinRequest {
            access_code: code.to_string(),
            display_name: name.to_string(),
            user_agent: "x".repeat(150),
            customer_id: None,
            customer_name: None,
            role: Role::Customer,
        }
    }

    #[tokio::test]
    async fn test_first_joiner_becomes_host() {
        let state = test_state().await;
        let first = join_room(&state, request(" demo01 ", "Ada"), 1_000).await.unwrap();
        let second = join_room(&state, request("DEMO01", "Bob"), 2_000).await.unwrap();

        assert!(first.member.is_host);
        assert_eq!(first.member.access_code, "DEMO01");
        assert!(first.others.is_empty());
        assert!(!second.member.is_host);
        assert_eq!(second.member.host_id, first.member.participant_id);
        assert_eq!(second.others.len(), 1);
        assert_eq!(second.others[0].display_name, "Ada");

        let session = db::get_session(&state.pool, &second.member.participant_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status(), Some(SessionStatus::Active));
        assert_eq!(session.expires_at, 2_000 + 30 * 60 * 1000);
        assert_eq!(session.agent_id, "demo_agent");
        assert!(session.session_id.starts_with("VS-"));
    }

    #[tokio::test]
    async fn test_presence_is_truncated_and_defaulted() {
        let state = test_state().await;
        let joined = join_room(&state, request("DEMO01", "  "), 1_000).await.unwrap();
        let snapshot = state.rooms.snapshot("DEMO01").await.unwrap();
        let me = &snapshot.users[0];
        assert_eq!(me.user_agent.len(), MAX_USER_AGENT_CHARS);
        assert!(me.display_name.starts_with("Customer ("));
        assert_eq!(me.participant_id, joined.member.participant_id);
    }

    #[tokio::test]
    async fn test_invalid_code_rejected_before_store() {
        let state = test_state().await;
        let result = join_room(&state, request("AB-123", "Ada"), 1_000).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(state.rooms.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_and_expired_codes() {
        let state = test_state().await;
        let result = join_room(&state, request("ZZZZZZ", "Ada"), 1_000).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        db::insert_access_code(
            &state.pool,
            &AccessCodeRecord {
                code: "OLD123".into(),
                agent_id: "agent_7".into(),
                agent_name: "Grace Hopper".into(),
                created_at: 0,
                expires_at: 500,
                used: false,
                used_at: None,
                single_use: false,
                status: "active".into(),
            },
        )
        .await
        .unwrap();
        let result = join_room(&state, request("OLD123", "Ada"), 1_000).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        let agent = authorize(&state, "OLD123", 100).await.unwrap();
        assert_eq!(agent.avatar, "GH");
    }

    #[tokio::test]
    async fn test_stale_room_is_replaced_on_join() {
        let state = test_state().await;
        let old = join_room(&state, request("DEMO01", "Ada"), 0).await.unwrap();
        let fresh = join_room(&state, request("DEMO01", "Bob"), 301_000).await.unwrap();
        assert!(fresh.member.is_host);
        assert!(fresh.others.is_empty());
        assert_ne!(fresh.member.host_id, old.member.participant_id);
    }

    #[tokio::test]
    async fn test_guest_end_keeps_room() {
        let state = test_state().await;
        let host = join_room(&state, request("DEMO01", "Ada"), 1_000).await.unwrap();
        let guest = join_room(&state, request("DEMO01", "Bob"), 2_000).await.unwrap();

        let (status, duration) = end_call(&state, &guest.member, EndReason::Hangup, 5_000).await;
        assert_eq!(status, SessionStatus::Ended);
        assert_eq!(duration, 3_000);

        let snapshot = state.rooms.snapshot("DEMO01").await.unwrap();
        assert_eq!(snapshot.host_id, Some(host.member.participant_id.clone()));
        assert_eq!(snapshot.users.len(), 1);
    }

    #[tokio::test]
    async fn test_host_end_deletes_room() {
        let state = test_state().await;
        let host = join_room(&state, request("DEMO01", "Ada"), 1_000).await.unwrap();
        let mut guest = join_room(&state, request("DEMO01", "Bob"), 2_000).await.unwrap();

        let (status, _) = end_call(&state, &host.member, EndReason::Expired, 9_000).await;
        assert_eq!(status, SessionStatus::Expired);
        assert!(state.rooms.snapshot("DEMO01").await.is_none());

        loop {
            match guest.events.recv().await.unwrap() {
                RoomEvent::RoomDeleted => break,
                _ => continue,
            }
        }
        let record = db::get_session(&state.pool, &host.member.participant_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status(), Some(SessionStatus::Expired));
    }

    #[tokio::test]
    async fn test_joins_racing_host_end_elect_one_host() {
        let state = test_state().await;
        let host = join_room(&state, request("DEMO01", "Ada"), 1_000).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                join_room(&state, request("DEMO01", &format!("guest {i}")), 2_000).await
            }));
        }
        end_call(&state, &host.member, EndReason::Hangup, 2_000).await;

        let mut members = Vec::new();
        for handle in handles {
            if let Ok(joined) = handle.await.unwrap() {
                members.push(joined.member);
            }
        }

        if let Some(snapshot) = state.rooms.snapshot("DEMO01").await {
            let present: Vec<&Member> = members
                .iter()
                .filter(|m| snapshot.users.iter().any(|u| u.participant_id == m.participant_id))
                .collect();
            let hosts: Vec<&&Member> = present.iter().filter(|m| m.is_host).collect();
            assert_eq!(hosts.len(), 1);
            assert_eq!(snapshot.host_id.as_deref(), Some(hosts[0].participant_id.as_str()));
            assert!(present.iter().all(|m| m.host_id == hosts[0].participant_id));
        }
    }

    #[tokio::test]
    async fn test_heartbeat_after_close_does_not_revive_room() {
        let state = test_state().await;
        let host = join_room(&state, request("DEMO01", "Ada"), 1_000).await.unwrap();
        let guest = join_room(&state, request("DEMO01", "Bob"), 2_000).await.unwrap();
        end_call(&state, &host.member, EndReason::Hangup, 3_000).await;

        heartbeat(&state, &guest.member, 4_000).await;
        assert!(state.rooms.snapshot("DEMO01").await.is_none());

        let next = join_room(&state, request("DEMO01", "Cy"), 5_000).await.unwrap();
        assert!(next.member.is_host);
    }

    #[tokio::test]
    async fn test_host_disconnect_keeps_host_id() {
        let state = test_state().await;
        let host = join_room(&state, request("DEMO01", "Ada"), 1_000).await.unwrap();
        leave(&state, &host.member, 2_000).await;

        let guest = join_room(&state, request("DEMO01", "Bob"), 3_000).await.unwrap();
        assert!(!guest.member.is_host);
        assert_eq!(guest.member.host_id, host.member.participant_id);
    }

    #[tokio::test]
    async fn test_chat_is_validated() {
        let state = test_state().await;
        let joined = join_room(&state, request("DEMO01", "Ada"), 1_000).await.unwrap();
        let message = post_chat(&state, &joined.member, " hello ", 2_000).await.unwrap();
        assert_eq!(message.text, "hello");
        assert_eq!(message.sender, "Ada");
        assert_eq!(message.sender_type, Role::Customer);
        assert!(post_chat(&state, &joined.member, "   ", 2_000).await.is_err());
        assert!(post_chat(&state, &joined.member, &"a".repeat(MAX_CHAT_CHARS + 1), 2_000)
            .await
            .is_err());

        let late = join_room(&state, request("DEMO01", "Bob"), 3_000).await.unwrap();
        assert_eq!(late.chat, vec![message]);
    }
}
