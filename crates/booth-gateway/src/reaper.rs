use booth_common::now_ms;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditContext, AuditEvent};
use crate::db;
use crate::state::AppState;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub rooms_reaped: Vec<String>,
    pub signals_purged: usize,
    pub sessions_expired: usize,
    pub codes_expired: u64,
}

/// One cleanup pass over rooms, mailboxes, session records and access codes.
pub async fn sweep(state: &AppState, now_ms: i64) -> SweepReport {
    let mut report = SweepReport {
        rooms_reaped: state
            .rooms
            .reap_idle_rooms(now_ms, state.config.room_stale)
            .await,
        signals_purged: state
            .rooms
            .purge_stale_signals(now_ms, state.config.mailbox_ttl)
            .await,
        ..SweepReport::default()
    };
    for code in &report.rooms_reaped {
        audit::record(
            &state.pool,
            AuditEvent::RoomReaped,
            AuditContext::room(code).with_details("idle"),
        )
        .await;
    }

    match db::expire_overdue_sessions(&state.pool, now_ms).await {
        Ok(expired) => {
            report.sessions_expired = expired.len();
            for record in &expired {
                audit::record(
                    &state.pool,
                    AuditEvent::SessionExpired,
                    AuditContext::participant(&record.access_code, &record.participant_id)
                        .with_details("reaper"),
                )
                .await;
            }
        }
        Err(err) => warn!("failed to expire overdue sessions: {}", err),
    }

    match db::expire_access_codes(&state.pool, now_ms).await {
        Ok(count) => report.codes_expired = count,
        Err(err) => warn!("failed to expire access codes: {}", err),
    }

    report
}

pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.reaper_interval);
        loop {
            interval.tick().await;
            let report = sweep(&state, now_ms()).await;
            if report == SweepReport::default() {
                debug!("reaper pass found nothing to clean");
            } else {
                info!(
                    "reaper: {} rooms, {} signals, {} sessions, {} codes",
                    report.rooms_reaped.len(),
                    report.signals_purged,
                    report.sessions_expired,
                    report.codes_expired
                );
            }
        }
    })
}
