use super::{ClaimOutcome, FailureDisposition, IdempotencyStore, StoreSettings};
use crate::error::{Result, WebhookError};
use crate::types::{IdempotencyRecord, ProcessingStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

type DbPool = Pool<SqliteConnectionManager>;
type DbConn = PooledConnection<SqliteConnectionManager>;

/// Idempotency store backed by a SQLite file, shared across restarts.
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    pool: DbPool,
    settings: StoreSettings,
}

impl SqliteIdempotencyStore {
    pub fn open(path: impl AsRef<Path>, pool_size: u32, settings: StoreSettings) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| WebhookError::store(format!("create {}: {e}", parent.display())))?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA journal_mode=WAL;")
        });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        let conn = pool.get()?;
        run_migrations(&conn)?;

        tracing::info!(path = %path.display(), "Opened idempotency store");
        Ok(Self { pool, settings })
    }

    /// Run `f` on a pooled connection off the async executor.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DbConn) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| WebhookError::store(format!("store task panicked: {e}")))?
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let migrations: Vec<(i32, &str)> = vec![(1, include_str!("migrations/001_webhook_events.sql"))];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!(version, "Running store migration");
            conn.execute_batch(sql)?;
            conn.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [version])?;
        }
    }

    Ok(())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
    let status: String = row.get("status")?;
    let processing_status = ProcessingStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown status {status:?}").into(),
        )
    })?;

    Ok(IdempotencyRecord {
        event_id: row.get("event_id")?,
        event_type: row.get("event_type")?,
        first_seen_at: from_millis(row.get("first_seen_at")?),
        updated_at: from_millis(row.get("updated_at")?),
        processing_status,
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
        dead_lettered: row.get("dead_lettered")?,
    })
}

const SELECT_RECORD: &str = "SELECT event_id, event_type, status, attempts, last_error, \
     dead_lettered, first_seen_at, updated_at FROM webhook_events WHERE event_id = ?1";

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn claim(&self, event_id: &str, event_type: &str) -> Result<ClaimOutcome> {
        let event_id = event_id.to_string();
        let event_type = event_type.to_string();
        let claim_timeout_ms = i64::try_from(self.settings.claim_timeout.as_millis()).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let now = Utc::now().timestamp_millis();
            let stale_before = now.saturating_sub(claim_timeout_ms);

            // Insert, or take over a reclaimable row, in one statement. No
            // row comes back when the existing record is not reclaimable.
            let claimed: Option<u32> = conn
                .query_row(
                    "INSERT INTO webhook_events
                        (event_id, event_type, status, attempts, dead_lettered, first_seen_at, updated_at)
                     VALUES (?1, ?2, 'pending', 1, 0, ?3, ?3)
                     ON CONFLICT (event_id) DO UPDATE SET
                        status = 'pending',
                        attempts = webhook_events.attempts + 1,
                        updated_at = excluded.updated_at
                     WHERE (webhook_events.status = 'failed' AND webhook_events.dead_lettered = 0)
                        OR (webhook_events.status = 'pending' AND webhook_events.updated_at < ?4)
                     RETURNING attempts",
                    params![event_id, event_type, now, stale_before],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(attempt) = claimed {
                if attempt > 1 {
                    tracing::debug!(event_id = %event_id, attempt, "Reclaimed event");
                }
                return Ok(ClaimOutcome::Claimed { attempt });
            }

            let existing = conn
                .query_row(SELECT_RECORD, [&event_id], record_from_row)
                .optional()?;
            Ok(match existing {
                Some(r) if r.processing_status == ProcessingStatus::Completed => {
                    ClaimOutcome::AlreadyCompleted
                }
                Some(r) if r.dead_lettered => ClaimOutcome::DeadLettered,
                _ => ClaimOutcome::AlreadyClaimed,
            })
        })
        .await
    }

    async fn complete(&self, event_id: &str, attempt: u32) -> Result<()> {
        let event_id = event_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE webhook_events
                 SET status = 'completed', last_error = NULL, updated_at = ?3
                 WHERE event_id = ?1 AND status = 'pending' AND attempts = ?2",
                params![event_id, attempt, Utc::now().timestamp_millis()],
            )?;
            if updated == 0 {
                tracing::warn!(event_id = %event_id, attempt, "complete() from a caller that no longer owns the claim");
            }
            Ok(())
        })
        .await
    }

    async fn fail(&self, event_id: &str, attempt: u32, reason: &str) -> Result<FailureDisposition> {
        let event_id = event_id.to_string();
        let reason = reason.to_string();
        let max_attempts = self.settings.max_attempts;
        self.with_conn(move |conn| {
            let dead: Option<bool> = conn
                .query_row(
                    "UPDATE webhook_events
                     SET status = 'failed',
                         last_error = ?3,
                         updated_at = ?4,
                         dead_lettered = CASE WHEN attempts >= ?5 THEN 1 ELSE 0 END
                     WHERE event_id = ?1 AND status = 'pending' AND attempts = ?2
                     RETURNING dead_lettered",
                    params![event_id, attempt, reason, Utc::now().timestamp_millis(), max_attempts],
                    |row| row.get(0),
                )
                .optional()?;

            Ok(match dead {
                Some(true) => FailureDisposition::DeadLettered,
                Some(false) => FailureDisposition::Retry,
                None => {
                    tracing::warn!(event_id = %event_id, attempt, "fail() from a caller that no longer owns the claim");
                    FailureDisposition::Retry
                }
            })
        })
        .await
    }

    async fn dead_letter(&self, event_id: &str, attempt: u32, reason: &str) -> Result<bool> {
        let event_id = event_id.to_string();
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE webhook_events
                 SET status = 'failed', dead_lettered = 1, last_error = ?3, updated_at = ?4
                 WHERE event_id = ?1 AND status = 'pending' AND attempts = ?2",
                params![event_id, attempt, reason, Utc::now().timestamp_millis()],
            )?;
            if updated == 0 {
                tracing::warn!(event_id = %event_id, attempt, "dead_letter() from a caller that no longer owns the claim");
            }
            Ok(updated > 0)
        })
        .await
    }

    async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>> {
        let event_id = event_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(SELECT_RECORD, [&event_id], record_from_row)
                .optional()?)
        })
        .await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = cutoff.timestamp_millis();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM webhook_events WHERE first_seen_at < ?1 AND status != 'pending'",
                [cutoff],
            )?)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
