use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

use crate::{is_unavailable, to_rfc3339, Transient};

/// A user who authorised EventSub access, with the scopes their token carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub user_id: String,
    pub scopes: String,
    /// Pending re-reconciliation.
    pub updated: bool,
}

impl StoredUser {
    fn from_row(row: &SqliteRow) -> Self {
        let updated: i64 = row.get("updated");
        Self {
            user_id: row.get("user_id"),
            scopes: row.get("scopes"),
            updated: updated != 0,
        }
    }
}

/// What [`UserRepository::upsert`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    ScopesChanged,
    Unchanged,
}

impl UpsertOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ScopesChanged => "scopes_changed",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Transient for UserError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => is_unavailable(err),
        }
    }
}

/// Repository for the `eventsub_users` table.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts the user or records new scopes. Both paths flag the row for the
    /// next incremental reconciliation; identical scopes leave it untouched.
    pub async fn upsert(
        &self,
        user_id: &str,
        scopes: &str,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, UserError> {
        let now = to_rfc3339(now);

        let inserted = sqlx::query(
            "INSERT INTO eventsub_users (user_id, scopes, updated, created_at, updated_at) \
             VALUES (?, ?, 1, ?, ?) \
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(scopes)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(UpsertOutcome::Created);
        }

        let changed = sqlx::query(
            "UPDATE eventsub_users \
             SET scopes = ?, updated = 1, updated_at = ? \
             WHERE user_id = ? AND scopes <> ?",
        )
        .bind(scopes)
        .bind(&now)
        .bind(user_id)
        .bind(scopes)
        .execute(&self.pool)
        .await?;

        Ok(if changed.rows_affected() == 1 {
            UpsertOutcome::ScopesChanged
        } else {
            UpsertOutcome::Unchanged
        })
    }

    /// Returns every user and clears all pending flags in the same statement.
    pub async fn take_all(&self) -> Result<Vec<StoredUser>, UserError> {
        let rows = sqlx::query(
            "UPDATE eventsub_users SET updated = 0 \
             RETURNING user_id, scopes, updated",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sorted(rows.iter().map(StoredUser::from_row).collect()))
    }

    /// Returns only users flagged since the last take, clearing their flags.
    pub async fn take_updated(&self) -> Result<Vec<StoredUser>, UserError> {
        let rows = sqlx::query(
            "UPDATE eventsub_users SET updated = 0 \
             WHERE updated = 1 \
             RETURNING user_id, scopes, updated",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sorted(rows.iter().map(StoredUser::from_row).collect()))
    }

    /// Flags the user again so the next incremental cycle retries it.
    pub async fn mark_updated(&self, user_id: &str) -> Result<bool, UserError> {
        let result = sqlx::query("UPDATE eventsub_users SET updated = 1 WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes the user. Returns whether a row existed.
    pub async fn delete(&self, user_id: &str) -> Result<bool, UserError> {
        let result = sqlx::query("DELETE FROM eventsub_users WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fetch(&self, user_id: &str) -> Result<Option<StoredUser>, UserError> {
        let row = sqlx::query("SELECT user_id, scopes, updated FROM eventsub_users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(StoredUser::from_row))
    }
}

fn sorted(mut users: Vec<StoredUser>) -> Vec<StoredUser> {
    users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    users
}
