// Index store: content identity -> backend locations
use crate::db::Database;
use crate::error::StoreError;
use crate::hash::Blake3Hash;
use crate::identity::ContentIdentity;
use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

const SELECT_COLUMNS: &str =
    "SELECT seq, content_hash, content_size, backend_id, remote_ref, link, created_at FROM index_entries";

const SELECT_ALL: &str =
    "SELECT seq, content_hash, content_size, backend_id, remote_ref, link, created_at FROM index_entries ORDER BY seq";

/// A completed upload: where a piece of content lives and how to share it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub identity: ContentIdentity,
    pub backend_id: String,
    pub remote_ref: String,
    pub link: String,
    pub created_at: DateTime<Utc>,
}

impl IndexEntry {
    /// New entry stamped with the current time (millisecond precision, as stored)
    pub fn new(
        identity: ContentIdentity,
        backend_id: impl Into<String>,
        remote_ref: impl Into<String>,
        link: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            backend_id: backend_id.into(),
            remote_ref: remote_ref.into(),
            link: link.into(),
            created_at: Utc::now().trunc_subsecs(3),
        }
    }
}

/// Persistent, append-only record of completed uploads
///
/// Entries are unique per (identity, backend id); inserting again is a no-op
/// and the first recorded location wins.
#[derive(Clone)]
pub struct IndexStore {
    db: Database,
}

impl IndexStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// All known locations of the content, oldest first; empty means a miss
    pub async fn lookup(&self, identity: &ContentIdentity) -> Result<Vec<IndexEntry>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE content_hash = ? AND content_size = ? ORDER BY seq");
        let rows = sqlx::query(&sql)
            .bind(identity.hash.to_string_prefixed())
            .bind(size_to_sql(identity.size)?)
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows.iter().filter_map(entry_from_row).collect())
    }

    /// The entry for this content on one backend, if any
    pub async fn lookup_on(
        &self,
        identity: &ContentIdentity,
        backend_id: &str,
    ) -> Result<Option<IndexEntry>, StoreError> {
        Ok(self
            .lookup(identity)
            .await?
            .into_iter()
            .find(|entry| entry.backend_id == backend_id))
    }

    /// Record a completed upload
    ///
    /// Returns false when the content was already recorded for that backend.
    /// The row is written inside SQLite's atomic commit, so readers never see
    /// a partial entry.
    pub async fn insert(&self, entry: &IndexEntry) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO index_entries
                (content_hash, content_size, backend_id, remote_ref, link, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (content_hash, content_size, backend_id) DO NOTHING",
        )
        .bind(entry.identity.hash.to_string_prefixed())
        .bind(size_to_sql(entry.identity.size)?)
        .bind(&entry.backend_id)
        .bind(&entry.remote_ref)
        .bind(&entry.link)
        .bind(entry.created_at.timestamp_millis())
        .execute(self.db.pool())
        .await?;

        let recorded = result.rows_affected() > 0;
        if recorded {
            tracing::debug!(
                identity = %entry.identity,
                backend = %entry.backend_id,
                "Recorded index entry"
            );
        } else {
            tracing::debug!(
                identity = %entry.identity,
                backend = %entry.backend_id,
                "Index entry already present"
            );
        }
        Ok(recorded)
    }

    /// Every entry in insertion order
    ///
    /// Lazy; each call re-reads the database, so the sequence can be restarted.
    /// Records that fail to decode are skipped.
    pub fn all(&self) -> BoxStream<'_, Result<IndexEntry, StoreError>> {
        sqlx::query(SELECT_ALL)
            .fetch(self.db.pool())
            .filter_map(|row| async move {
                match row {
                    Ok(row) => entry_from_row(&row).map(Ok),
                    Err(e) => Some(Err(StoreError::from(e))),
                }
            })
            .boxed()
    }
}

fn size_to_sql(size: u64) -> Result<i64, StoreError> {
    i64::try_from(size).map_err(|_| StoreError::Record(format!("size {size} exceeds storable range")))
}

fn entry_from_row(row: &SqliteRow) -> Option<IndexEntry> {
    match decode_row(row) {
        Ok(entry) => Some(entry),
        Err(reason) => {
            let seq: i64 = row.try_get("seq").unwrap_or(-1);
            tracing::warn!(seq, "Skipping unreadable index record: {}", reason);
            None
        }
    }
}

fn decode_row(row: &SqliteRow) -> Result<IndexEntry, String> {
    let hash: String = row.try_get("content_hash").map_err(|e| e.to_string())?;
    let size: i64 = row.try_get("content_size").map_err(|e| e.to_string())?;
    let created_at: i64 = row.try_get("created_at").map_err(|e| e.to_string())?;

    let hash = Blake3Hash::from_str(&hash).map_err(|e| e.to_string())?;
    let size = u64::try_from(size)
        .ok()
        .filter(|s| *s > 0)
        .ok_or_else(|| format!("invalid content size {size}"))?;
    let created_at = DateTime::from_timestamp_millis(created_at)
        .ok_or_else(|| format!("invalid timestamp {created_at}"))?;

    Ok(IndexEntry {
        identity: ContentIdentity::new(hash, size),
        backend_id: row.try_get("backend_id").map_err(|e| e.to_string())?,
        remote_ref: row.try_get("remote_ref").map_err(|e| e.to_string())?,
        link: row.try_get("link").map_err(|e| e.to_string())?,
        created_at,
    })
}
