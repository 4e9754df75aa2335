// Resume tokens for interrupted uploads to resumable backends
use crate::db::Database;
use crate::error::StoreError;
use crate::identity::ContentIdentity;
use crate::provider::UploadHandle;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Upload state kept across process restarts
///
/// Kept apart from the index, which only records completed uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSession {
    pub handle: UploadHandle,
    pub chunk_size: u64,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

impl SavedSession {
    pub fn new(handle: UploadHandle, chunk_size: u64, attempt: u32) -> Self {
        Self {
            handle,
            chunk_size,
            attempt,
            updated_at: Utc::now().trunc_subsecs(3),
        }
    }

    pub fn identity(&self) -> &ContentIdentity {
        &self.handle.identity
    }

    pub fn backend_id(&self) -> &str {
        &self.handle.backend_id
    }
}

/// Resume tokens keyed by (content identity, backend id)
#[derive(Clone)]
pub struct ResumeStore {
    db: Database,
}

impl ResumeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create or replace the token for the session's identity and backend
    pub async fn save(&self, session: &SavedSession) -> Result<(), StoreError> {
        let handle = serde_json::to_string(&session.handle)
            .map_err(|e| StoreError::Record(format!("cannot encode upload handle: {e}")))?;

        sqlx::query(
            "INSERT INTO transfer_sessions
                (content_hash, content_size, backend_id, handle, chunk_size, attempt, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (content_hash, content_size, backend_id) DO UPDATE SET
                handle = excluded.handle,
                chunk_size = excluded.chunk_size,
                attempt = excluded.attempt,
                updated_at = excluded.updated_at",
        )
        .bind(session.identity().hash.to_string_prefixed())
        .bind(to_sql(session.identity().size)?)
        .bind(session.backend_id())
        .bind(handle)
        .bind(to_sql(session.chunk_size)?)
        .bind(i64::from(session.attempt))
        .bind(session.updated_at.timestamp_millis())
        .execute(self.db.pool())
        .await?;

        tracing::debug!(
            identity = %session.identity(),
            backend = %session.backend_id(),
            attempt = session.attempt,
            "Saved resume token"
        );
        Ok(())
    }

    /// Token for this content on this backend, if an upload was interrupted
    pub async fn load(
        &self,
        identity: &ContentIdentity,
        backend_id: &str,
    ) -> Result<Option<SavedSession>, StoreError> {
        let row = sqlx::query(
            "SELECT handle, chunk_size, attempt, updated_at FROM transfer_sessions
             WHERE content_hash = ? AND content_size = ? AND backend_id = ?",
        )
        .bind(identity.hash.to_string_prefixed())
        .bind(to_sql(identity.size)?)
        .bind(backend_id)
        .fetch_optional(self.db.pool())
        .await?;

        match row.as_ref().map(decode_row) {
            None => Ok(None),
            Some(Ok(session)) => Ok(Some(session)),
            Some(Err(reason)) => {
                tracing::warn!(identity = %identity, backend = backend_id, "Ignoring unreadable resume token: {}", reason);
                Ok(None)
            }
        }
    }

    pub async fn remove(&self, identity: &ContentIdentity, backend_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM transfer_sessions
             WHERE content_hash = ? AND content_size = ? AND backend_id = ?",
        )
        .bind(identity.hash.to_string_prefixed())
        .bind(to_sql(identity.size)?)
        .bind(backend_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Every interrupted upload, most recently touched first
    pub async fn list(&self) -> Result<Vec<SavedSession>, StoreError> {
        let rows = sqlx::query(
            "SELECT handle, chunk_size, attempt, updated_at FROM transfer_sessions
             ORDER BY updated_at DESC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match decode_row(row) {
                Ok(session) => Some(session),
                Err(reason) => {
                    tracing::warn!("Skipping unreadable resume token: {}", reason);
                    None
                }
            })
            .collect())
    }
}

fn to_sql(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Record(format!("{value} exceeds storable range")))
}

fn decode_row(row: &SqliteRow) -> Result<SavedSession, String> {
    let handle: String = row.try_get("handle").map_err(|e| e.to_string())?;
    let chunk_size: i64 = row.try_get("chunk_size").map_err(|e| e.to_string())?;
    let attempt: i64 = row.try_get("attempt").map_err(|e| e.to_string())?;
    let updated_at: i64 = row.try_get("updated_at").map_err(|e| e.to_string())?;

    Ok(SavedSession {
        handle: serde_json::from_str(&handle).map_err(|e| e.to_string())?,
        chunk_size: u64::try_from(chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| format!("invalid chunk size {chunk_size}"))?,
        attempt: u32::try_from(attempt).map_err(|e| e.to_string())?,
        updated_at: DateTime::from_timestamp_millis(updated_at)
            .ok_or_else(|| format!("invalid timestamp {updated_at}"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(data: &[u8], backend: &str) -> UploadHandle {
        let identity = ContentIdentity::of_bytes(data);
        UploadHandle {
            backend_id: backend.to_string(),
            remote_ref: format!("objects/{}", identity.hash.to_hex()),
            upload_id: identity.hash.to_hex(),
            identity,
        }
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let store = ResumeStore::new(Database::in_memory().await.unwrap());
        let saved = SavedSession::new(handle(b"partial", "disk"), 4096, 1);

        store.save(&saved).await.unwrap();
        assert_eq!(
            store.load(saved.identity(), "disk").await.unwrap(),
            Some(saved.clone())
        );
        assert_eq!(store.load(saved.identity(), "other").await.unwrap(), None);

        store.remove(saved.identity(), "disk").await.unwrap();
        assert_eq!(store.load(saved.identity(), "disk").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_token() {
        let store = ResumeStore::new(Database::in_memory().await.unwrap());
        let first = SavedSession::new(handle(b"partial", "disk"), 4096, 1);
        let mut second = first.clone();
        second.attempt = 3;
        second.handle.upload_id = "fresh".to_string();

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![second]);
    }

    #[tokio::test]
    async fn test_unreadable_token_is_ignored() {
        let store = ResumeStore::new(Database::in_memory().await.unwrap());
        let saved = SavedSession::new(handle(b"garbled", "disk"), 4096, 1);
        store.save(&saved).await.unwrap();

        sqlx::query("UPDATE transfer_sessions SET handle = '{\"backend_id\": \"di'")
            .execute(store.db.pool())
            .await
            .unwrap();

        assert_eq!(store.load(saved.identity(), "disk").await.unwrap(), None);
        assert!(store.list().await.unwrap().is_empty());
    }
}
