use chrono::Utc;
use sqlx::Row;

use super::SqliteRepository;
use crate::repository::{ProgressCache, ProgressSnapshot, StorageError};

fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

#[async_trait::async_trait]
impl ProgressCache for SqliteRepository {
    async fn load(&self) -> Result<Option<ProgressSnapshot>, StorageError> {
        let row = sqlx::query("SELECT payload FROM progress_cache WHERE cache_key = ?1")
            .bind(&self.cache_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.try_get("payload").map_err(conn)?;
        ProgressSnapshot::from_json(&payload).map(Some)
    }

    async fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), StorageError> {
        let payload = snapshot.to_json()?;
        sqlx::query(
            r"
            INSERT INTO progress_cache (cache_key, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(cache_key) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&self.cache_key)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM progress_cache WHERE cache_key = ?1")
            .bind(&self.cache_key)
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(())
    }
}
