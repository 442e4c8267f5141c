use anyhow::Context;
use booth_common::{AgentInfo, SessionStatus};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Open the pool and bring the schema up to date.
///
/// `sqlite::memory:` gives every connection its own database, so callers
/// using it should pass `max_connections = 1`.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .with_context(|| format!("failed to connect to {database_url}"))?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    Ok(pool)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub participant_id: String,
    pub session_id: String,
    pub access_code: String,
    pub agent_id: String,
    pub agent_name: String,
    pub customer_id: String,
    pub customer_name: String,
    pub start_time: i64,
    pub status: String,
    pub participants: i64,
    pub last_activity: i64,
    pub expires_at: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl SessionRecord {
    pub fn status(&self) -> Option<SessionStatus> {
        SessionStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub participant_id: &'a str,
    pub session_id: &'a str,
    pub access_code: &'a str,
    pub agent: &'a AgentInfo,
    pub customer_id: &'a str,
    pub customer_name: &'a str,
    pub start_time: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AccessCodeRecord {
    pub code: String,
    pub agent_id: String,
    pub agent_name: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
    pub used_at: Option<i64>,
    pub single_use: bool,
    pub status: String,
}

impl AccessCodeRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.status == "expired" || now_ms > self.expires_at
    }
}

// Session records

pub async fn create_session(pool: &SqlitePool, new: &NewSession<'_>) -> anyhow::Result<SessionRecord> {
    let record = sqlx::query_as::<_, SessionRecord>(
        r#"
        INSERT INTO sessions (
            participant_id, session_id, access_code, agent_id, agent_name,
            customer_id, customer_name, start_time, status, participants,
            last_activity, expires_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', 1, ?, ?)
        RETURNING *
        "#,
    )
    .bind(new.participant_id)
    .bind(new.session_id)
    .bind(new.access_code)
    .bind(&new.agent.id)
    .bind(&new.agent.name)
    .bind(new.customer_id)
    .bind(new.customer_name)
    .bind(new.start_time)
    .bind(new.start_time)
    .bind(new.expires_at)
    .fetch_one(pool)
    .await?;
    Ok(record)
}

pub async fn get_session(
    pool: &SqlitePool,
    participant_id: &str,
) -> anyhow::Result<Option<SessionRecord>> {
    let record = sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE participant_id = ?")
        .bind(participant_id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn update_participants(
    pool: &SqlitePool,
    participant_id: &str,
    count: i64,
    now_ms: i64,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sessions SET participants = ?, last_activity = ?
        WHERE participant_id = ? AND status = 'active'
        "#,
    )
    .bind(count)
    .bind(now_ms)
    .bind(participant_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_session(pool: &SqlitePool, participant_id: &str, now_ms: i64) -> anyhow::Result<bool> {
    let result = sqlx::query(
        "UPDATE sessions SET last_activity = ? WHERE participant_id = ? AND status = 'active'",
    )
    .bind(now_ms)
    .bind(participant_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Close an active session. Returns `None` when it was already closed.
pub async fn close_session(
    pool: &SqlitePool,
    participant_id: &str,
    status: SessionStatus,
    now_ms: i64,
) -> anyhow::Result<Option<SessionRecord>> {
    let record = sqlx::query_as::<_, SessionRecord>(
        r#"
        UPDATE sessions
        SET status = ?, end_time = ?, duration_ms = MAX(? - start_time, 0), last_activity = ?
        WHERE participant_id = ? AND status = 'active'
        RETURNING *
        "#,
    )
    .bind(status.as_str())
    .bind(now_ms)
    .bind(now_ms)
    .bind(now_ms)
    .bind(participant_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Mark active sessions past their hard cap as expired.
pub async fn expire_overdue_sessions(pool: &SqlitePool, now_ms: i64) -> anyhow::Result<Vec<SessionRecord>> {
    let records = sqlx::query_as::<_, SessionRecord>(
        r#"
        UPDATE sessions
        SET status = 'expired', end_time = expires_at, duration_ms = expires_at - start_time
        WHERE status = 'active' AND expires_at <= ?
        RETURNING *
        "#,
    )
    .bind(now_ms)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn count_active_sessions(pool: &SqlitePool) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE status = 'active'")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// Agents

pub async fn upsert_agent(pool: &SqlitePool, agent: &AgentInfo) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO agents (id, name, title, avatar)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            title = excluded.title,
            avatar = excluded.avatar
        "#,
    )
    .bind(&agent.id)
    .bind(&agent.name)
    .bind(&agent.title)
    .bind(&agent.avatar)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_agent(pool: &SqlitePool, agent_id: &str) -> anyhow::Result<Option<AgentInfo>> {
    let row: Option<(String, String, String, String)> =
        sqlx::query_as("SELECT id, name, title, avatar FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(id, name, title, avatar)| AgentInfo {
        id,
        name,
        title,
        avatar,
    }))
}

/// Agent behind an issued code, falling back to the name stored on the code.
pub async fn agent_for_code(pool: &SqlitePool, record: &AccessCodeRecord) -> anyhow::Result<AgentInfo> {
    let agent = get_agent(pool, &record.agent_id).await?;
    Ok(agent.unwrap_or_else(|| AgentInfo {
        id: record.agent_id.clone(),
        avatar: AgentInfo::initials(&record.agent_name),
        name: record.agent_name.clone(),
        title: AgentInfo::demo().title,
    }))
}

// Access codes

/// Insert a freshly issued code. Returns `false` if the code already exists.
pub async fn insert_access_code(pool: &SqlitePool, record: &AccessCodeRecord) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO access_codes (
            code, agent_id, agent_name, created_at, expires_at, used, used_at, single_use, status
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.code)
    .bind(&record.agent_id)
    .bind(&record.agent_name)
    .bind(record.created_at)
    .bind(record.expires_at)
    .bind(record.used)
    .bind(record.used_at)
    .bind(record.single_use)
    .bind(&record.status)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_access_code(pool: &SqlitePool, code: &str) -> anyhow::Result<Option<AccessCodeRecord>> {
    let record = sqlx::query_as::<_, AccessCodeRecord>("SELECT * FROM access_codes WHERE code = ?")
        .bind(code)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Record a redemption. A single-use code can only be redeemed once, so
/// `false` means another caller got there first.
pub async fn mark_access_code_used(pool: &SqlitePool, code: &str, now_ms: i64) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE access_codes SET used = 1, used_at = ?
        WHERE code = ? AND status = 'active' AND NOT (used = 1 AND single_use = 1)
        "#,
    )
    .bind(now_ms)
    .bind(code)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_active_access_codes(
    pool: &SqlitePool,
    agent_id: &str,
    now_ms: i64,
) -> anyhow::Result<Vec<AccessCodeRecord>> {
    let records = sqlx::query_as::<_, AccessCodeRecord>(
        r#"
        SELECT * FROM access_codes
        WHERE agent_id = ? AND status = 'active' AND expires_at > ?
        ORDER BY created_at DESC
        "#,
    )
    .bind(agent_id)
    .bind(now_ms)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn expire_access_codes(pool: &SqlitePool, now_ms: i64) -> anyhow::Result<u64> {
    let result =
        sqlx::query("UPDATE access_codes SET status = 'expired' WHERE status = 'active' AND expires_at <= ?")
            .bind(now_ms)
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

// Audit log

pub async fn insert_audit(
    pool: &SqlitePool,
    event: &str,
    access_code: Option<&str>,
    participant_id: Option<&str>,
    actor_ip_hash: Option<&str>,
    details: Option<&str>,
    now_ms: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (event, access_code, participant_id, actor_ip_hash, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event)
    .bind(access_code)
    .bind(participant_id)
    .bind(actor_ip_hash)
    .bind(details)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_audit_events(pool: &SqlitePool, event: &str) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE event = ?")
        .bind(event)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
