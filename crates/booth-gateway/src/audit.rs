//! Audit trail for call and access-code lifecycle events.
//!
//! Every event is logged through `tracing` with structured fields and then
//! persisted to `audit_log`. Persistence is best effort: a failed insert is
//! logged and never fails the caller.

use booth_common::now_ms;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    SessionStarted,
    HostElected,
    SessionEnded,
    SessionExpired,
    /// Stale room deleted on join or by the reaper.
    RoomReaped,
    AccessCodeIssued,
    AccessCodeRedeemed,
    AccessCodeRejected,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "SESSION_STARTED",
            Self::HostElected => "HOST_ELECTED",
            Self::SessionEnded => "SESSION_ENDED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::RoomReaped => "ROOM_REAPED",
            Self::AccessCodeIssued => "ACCESS_CODE_ISSUED",
            Self::AccessCodeRedeemed => "ACCESS_CODE_REDEEMED",
            Self::AccessCodeRejected => "ACCESS_CODE_REJECTED",
        }
    }
}

/// Fields attached to an audit entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditContext<'a> {
    pub access_code: Option<&'a str>,
    pub participant_id: Option<&'a str>,
    pub actor_ip_hash: Option<&'a str>,
    pub details: Option<&'a str>,
}

impl<'a> AuditContext<'a> {
    pub fn room(access_code: &'a str) -> Self {
        Self {
            access_code: Some(access_code),
            ..Self::default()
        }
    }

    pub fn participant(access_code: &'a str, participant_id: &'a str) -> Self {
        Self {
            access_code: Some(access_code),
            participant_id: Some(participant_id),
            ..Self::default()
        }
    }

    pub fn with_details(mut self, details: &'a str) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_actor(mut self, actor_ip_hash: &'a str) -> Self {
        self.actor_ip_hash = Some(actor_ip_hash);
        self
    }
}

pub fn log_event(event: AuditEvent, ctx: &AuditContext<'_>) {
    let event_str = event.as_str();
    match event {
        AuditEvent::AccessCodeRejected => warn!(
            event = event_str,
            access_code = ctx.access_code,
            actor = ctx.actor_ip_hash,
            details = ctx.details,
            "access code rejected"
        ),
        AuditEvent::SessionExpired => warn!(
            event = event_str,
            access_code = ctx.access_code,
            participant_id = ctx.participant_id,
            "session hit its time limit"
        ),
        _ => info!(
            event = event_str,
            access_code = ctx.access_code,
            participant_id = ctx.participant_id,
            details = ctx.details,
            "booth event"
        ),
    }
}

/// Log and persist an audit event.
pub async fn record(pool: &SqlitePool, event: AuditEvent, ctx: AuditContext<'_>) {
    log_event(event, &ctx);
    if let Err(err) = db::insert_audit(
        pool,
        event.as_str(),
        ctx.access_code,
        ctx.participant_id,
        ctx.actor_ip_hash,
        ctx.details,
        now_ms(),
    )
    .await
    {
        warn!("failed to persist audit event {}: {}", event.as_str(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_strings() {
        assert_eq!(AuditEvent::HostElected.as_str(), "HOST_ELECTED");
        assert_eq!(AuditEvent::RoomReaped.as_str(), "ROOM_REAPED");
        assert_eq!(
            AuditEvent::AccessCodeRejected.as_str(),
            "ACCESS_CODE_REJECTED"
        );
    }

    #[tokio::test]
    async fn test_record_persists() {
        let pool = db::connect("sqlite::memory:", 1).await.unwrap();
        record(
            &pool,
            AuditEvent::SessionStarted,
            AuditContext::participant("DEMO01", "p1").with_details("demo"),
        )
        .await;
        assert_eq!(
            db::count_audit_events(&pool, "SESSION_STARTED").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_record_survives_closed_pool() {
        let pool = db::connect("sqlite::memory:", 1).await.unwrap();
        pool.close().await;
        record(&pool, AuditEvent::RoomReaped, AuditContext::room("DEMO01")).await;
    }
}
