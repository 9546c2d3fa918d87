use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

use crate::{is_unavailable, parse_rfc3339, to_rfc3339, Transient};

/// Data required to append a notification.
#[derive(Debug, Clone, Copy)]
pub struct NewEvent<'a> {
    pub user_id: &'a str,
    pub event_type: &'a str,
    /// Provider message id; redeliveries share it.
    pub message_id: &'a str,
    pub payload: &'a str,
    pub received_at: DateTime<Utc>,
}

/// A notification waiting to be delivered to its user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: i64,
    pub user_id: String,
    pub event_type: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl StoredEvent {
    fn from_row(row: &SqliteRow) -> Result<Self, EventError> {
        let received_at: String = row.get("received_at");
        Ok(Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            received_at: parse_rfc3339(&received_at)
                .map_err(|_| EventError::InvalidTimestamp(received_at.clone()))?,
        })
    }
}

/// Result of attempting to append a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Duplicate,
}

impl AppendOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("stored timestamp '{0}' is not RFC 3339")]
    InvalidTimestamp(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Transient for EventError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => is_unavailable(err),
            Self::InvalidTimestamp(_) => false,
        }
    }
}

/// Repository for the `eventsub_events` table.
#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a notification unless its message id is already pending or was
    /// delivered within the retention window.
    pub async fn append(&self, event: NewEvent<'_>) -> Result<AppendOutcome, EventError> {
        let result = sqlx::query(
            "INSERT INTO eventsub_events \
             (user_id, event_type, message_id, payload, received_at) \
             SELECT ?, ?, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM eventsub_delivered WHERE message_id = ?)",
        )
        .bind(event.user_id)
        .bind(event.event_type)
        .bind(event.message_id)
        .bind(event.payload)
        .bind(to_rfc3339(event.received_at))
        .bind(event.message_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(AppendOutcome::Duplicate),
            Ok(_) => Ok(AppendOutcome::Inserted),
            // SQLITE_CONSTRAINT_UNIQUE on message_id
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("2067") => {
                Ok(AppendOutcome::Duplicate)
            }
            Err(err) => Err(EventError::Database(err)),
        }
    }

    /// Earliest undelivered event for `user_id`.
    pub async fn peek_oldest(&self, user_id: &str) -> Result<Option<StoredEvent>, EventError> {
        let row = sqlx::query(
            "SELECT id, user_id, event_type, payload, received_at \
             FROM eventsub_events \
             WHERE user_id = ? \
             ORDER BY received_at ASC, id ASC \
             LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(StoredEvent::from_row).transpose()
    }

    /// Deletes a delivered event and remembers its message id so a late
    /// redelivery is not stored again. Returns whether it was still present.
    pub async fn delete(&self, event: &StoredEvent) -> Result<bool, EventError> {
        let received_at = to_rfc3339(event.received_at);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR IGNORE INTO eventsub_delivered (message_id, received_at) \
             SELECT message_id, received_at FROM eventsub_events \
             WHERE id = ? AND user_id = ? AND received_at = ?",
        )
        .bind(event.id)
        .bind(&event.user_id)
        .bind(&received_at)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "DELETE FROM eventsub_events WHERE id = ? AND user_id = ? AND received_at = ?",
        )
        .bind(event.id)
        .bind(&event.user_id)
        .bind(&received_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes events received strictly before `threshold`, `batch_size` rows
    /// per statement. Returns the total removed.
    pub async fn purge_older_than(
        &self,
        threshold: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64, EventError> {
        let threshold = to_rfc3339(threshold);
        let batch_size = batch_size.max(1);
        let mut total = 0;
        loop {
            let result = sqlx::query(
                "DELETE FROM eventsub_events WHERE id IN ( \
                     SELECT id FROM eventsub_events \
                     WHERE received_at < ? \
                     ORDER BY received_at \
                     LIMIT ? \
                 )",
            )
            .bind(&threshold)
            .bind(i64::from(batch_size))
            .execute(&self.pool)
            .await?;

            let removed = result.rows_affected();
            total += removed;
            if removed < u64::from(batch_size) {
                return Ok(total);
            }
        }
    }

    /// Forgets delivered message ids whose event was received strictly before
    /// `threshold`. Returns how many were removed.
    pub async fn purge_delivered_before(&self, threshold: DateTime<Utc>) -> Result<u64, EventError> {
        let result = sqlx::query("DELETE FROM eventsub_delivered WHERE received_at < ?")
            .bind(to_rfc3339(threshold))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_for_user(&self, user_id: &str) -> Result<i64, EventError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM eventsub_events WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
