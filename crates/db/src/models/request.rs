use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use tracing::error;

use super::tags::Tags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(type_name = "request_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Requested,
    Pickme,
    Added,
    Onstage,
    Live,
    Discarded,
}

impl RequestState {
    /// Selected for a release (directly or taken into it).
    pub fn is_pickme(&self) -> bool {
        matches!(self, RequestState::Pickme | RequestState::Added)
    }

    /// Still a live branch that may move before it ships.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RequestState::Requested | RequestState::Pickme | RequestState::Added
        )
    }
}

/// A change request as stored in `push_requests`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub user: String,
    pub state: RequestState,
    pub repo: String,
    pub branch: String,
    /// Last observed commit id on `branch`; empty until first verification.
    pub revision: String,
    pub tags: Tags,
    /// HTML fragment describing current conflicts; empty when none.
    pub conflicts: String,
    pub title: String,
    pub reviewid: Option<i64>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Field updates applied by [`Request::update`]. `None` leaves the stored
/// value untouched.
#[derive(Debug, Clone, Default)]
pub struct RequestChanges {
    pub tags: Option<Tags>,
    pub conflicts: Option<String>,
    pub revision: Option<String>,
}

const SELECT_COLUMNS: &str = "id, user, state, repo, branch, revision, tags, conflicts, title, \
     reviewid, created, modified";

impl Request {
    pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Request>(&format!(
            "SELECT {SELECT_COLUMNS} FROM push_requests WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_revision(
        pool: &SqlitePool,
        revision: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Request>(&format!(
            "SELECT {SELECT_COLUMNS} FROM push_requests WHERE revision = ?"
        ))
        .bind(revision)
        .fetch_optional(pool)
        .await
    }

    /// Requests whose branches are still subject to change.
    pub async fn find_active(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Request>(&format!(
            "SELECT {SELECT_COLUMNS} FROM push_requests \
             WHERE state IN ('requested', 'pickme', 'added') ORDER BY id"
        ))
        .fetch_all(pool)
        .await
    }

    /// Apply `changes` and re-read the row inside one transaction, so the
    /// caller observes a consistent post-write view. A failed update is
    /// logged and reported as `None`.
    pub async fn update(pool: &SqlitePool, id: i64, changes: RequestChanges) -> Option<Self> {
        match Self::update_tx(pool, id, &changes).await {
            Ok(updated) => {
                if updated.is_none() {
                    error!("git-queue worker failed to update request (id {id}): no such row");
                    error!("updated request values were: {changes:?}");
                }
                updated
            }
            Err(err) => {
                error!("git-queue worker failed to update request (id {id}): {err}");
                error!("updated request values were: {changes:?}");
                None
            }
        }
    }

    async fn update_tx(
        pool: &SqlitePool,
        id: i64,
        changes: &RequestChanges,
    ) -> Result<Option<Self>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            "UPDATE push_requests SET \
                 tags = COALESCE(?, tags), \
                 conflicts = COALESCE(?, conflicts), \
                 revision = COALESCE(?, revision), \
                 modified = CURRENT_TIMESTAMP \
             WHERE id = ?",
        )
        .bind(changes.tags.as_ref().map(Tags::as_str))
        .bind(changes.conflicts.as_deref())
        .bind(changes.revision.as_deref())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let updated = sqlx::query_as::<_, Request>(&format!(
            "SELECT {SELECT_COLUMNS} FROM push_requests WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }
}
