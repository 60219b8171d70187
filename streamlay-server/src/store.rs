use crate::schema::{OverlayPatch, OverlayRecord, OverlayRow};
use crate::ServerError;
use parking_lot::Mutex;

/// Document store holding overlays keyed by name.
///
/// Counts follow document-store conventions: `insert_one` returns 0 when the name is taken,
/// `update_one` returns the number of matched documents.
#[async_trait::async_trait]
pub(crate) trait OverlayStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), ServerError>;
    async fn insert_one(&self, record: &OverlayRecord) -> Result<u64, ServerError>;
    async fn find_all(&self) -> Result<Vec<OverlayRecord>, ServerError>;
    async fn find_one(&self, name: &str) -> Result<Option<OverlayRecord>, ServerError>;
    async fn update_one(&self, name: &str, patch: &OverlayPatch) -> Result<u64, ServerError>;
    async fn delete_one(&self, name: &str) -> Result<u64, ServerError>;
}

pub(crate) struct PgOverlayStore {
    pool: sqlx::Pool<sqlx::Postgres>,
}

impl PgOverlayStore {
    pub(crate) fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        PgOverlayStore { pool }
    }
}

#[async_trait::async_trait]
impl OverlayStore for PgOverlayStore {
    async fn ensure_schema(&self) -> Result<(), ServerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS overlay (
                name TEXT PRIMARY KEY,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_one(&self, record: &OverlayRecord) -> Result<u64, ServerError> {
        let resp =
            sqlx::query("INSERT INTO overlay (name, doc) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING")
                .bind(&record.name)
                .bind(sqlx::types::Json(record))
                .execute(&self.pool)
                .await?;
        Ok(resp.rows_affected())
    }

    async fn find_all(&self) -> Result<Vec<OverlayRecord>, ServerError> {
        let rows: Vec<OverlayRow> =
            sqlx::query_as("SELECT doc FROM overlay ORDER BY created_at, name")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|row| row.doc.0).collect())
    }

    async fn find_one(&self, name: &str) -> Result<Option<OverlayRecord>, ServerError> {
        let row: Option<OverlayRow> = sqlx::query_as("SELECT doc FROM overlay WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.doc.0))
    }

    async fn update_one(&self, name: &str, patch: &OverlayPatch) -> Result<u64, ServerError> {
        // jsonb concatenation merges the patch's keys over the stored document
        let resp = sqlx::query("UPDATE overlay SET doc = doc || $2 WHERE name = $1")
            .bind(name)
            .bind(sqlx::types::Json(patch))
            .execute(&self.pool)
            .await?;
        Ok(resp.rows_affected())
    }

    async fn delete_one(&self, name: &str) -> Result<u64, ServerError> {
        let resp = sqlx::query("DELETE FROM overlay WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(resp.rows_affected())
    }
}

/// Process-local store, used with `server --memory-store` and in tests
#[derive(Default)]
pub(crate) struct MemOverlayStore {
    records: Mutex<Vec<OverlayRecord>>,
}

#[async_trait::async_trait]
impl OverlayStore for MemOverlayStore {
    async fn ensure_schema(&self) -> Result<(), ServerError> {
        Ok(())
    }

    async fn insert_one(&self, record: &OverlayRecord) -> Result<u64, ServerError> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.name == record.name) {
            return Ok(0);
        }
        records.push(record.clone());
        Ok(1)
    }

    async fn find_all(&self) -> Result<Vec<OverlayRecord>, ServerError> {
        Ok(self.records.lock().clone())
    }

    async fn find_one(&self, name: &str) -> Result<Option<OverlayRecord>, ServerError> {
        Ok(self.records.lock().iter().find(|r| r.name == name).cloned())
    }

    async fn update_one(&self, name: &str, patch: &OverlayPatch) -> Result<u64, ServerError> {
        match self.records.lock().iter_mut().find(|r| r.name == name) {
            Some(record) => {
                patch.apply(record);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_one(&self, name: &str) -> Result<u64, ServerError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.name != name);
        Ok((before - records.len()) as u64)
    }
}
