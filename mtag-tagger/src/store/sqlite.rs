//! SQLite item store
//!
//! `tag_items` holds one row per item; its status column only ever holds
//! `pending`, `failed` or `tagged`. `tag_item_jobs` links items to the
//! asynchronous jobs still covering them.

use async_trait::async_trait;
use mtag_common::Result;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use super::{group_jobs, ItemStore};
use crate::types::{AsyncJob, ItemStatus};

/// Open (or create) the database and ensure the schema exists
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create the `tag_items` and `tag_item_jobs` tables
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_items (
            item_id TEXT PRIMARY KEY,
            payload_ref TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'failed', 'tagged')),
            tags TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_item_jobs (
            item_id TEXT NOT NULL REFERENCES tag_items(item_id) ON DELETE CASCADE,
            job_id TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (item_id, job_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tag_item_jobs_job ON tag_item_jobs (job_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database tables initialized (tag_items, tag_item_jobs)");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteItemStore {
    pool: SqlitePool,
}

impl SqliteItemStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn register(&self, item_id: &str, payload_ref: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO tag_items (item_id, payload_ref, status)
            VALUES (?, ?, 'pending')
            ON CONFLICT(item_id) DO UPDATE SET
                payload_ref = excluded.payload_ref,
                status = 'pending',
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(item_id)
        .bind(payload_ref)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tag_item_jobs WHERE item_id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_status(&self, item_ids: &[String], status: ItemStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in item_ids {
            sqlx::query(
                "UPDATE tag_items SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE item_id = ?",
            )
            .bind(status.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_tagged(&self, item_id: &str, tags: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tag_items
            SET status = 'tagged', tags = ?, updated_at = CURRENT_TIMESTAMP
            WHERE item_id = ?
            "#,
        )
        .bind(serde_json::to_string(tags)?)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_job(&self, item_ids: &[String], job_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in item_ids {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO tag_item_jobs (item_id, job_id)
                SELECT item_id, ? FROM tag_items WHERE item_id = ?
                "#,
            )
            .bind(job_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<Vec<AsyncJob>> {
        let rows = sqlx::query(
            r#"
            SELECT j.item_id, j.job_id FROM tag_item_jobs j
            JOIN tag_items i ON i.item_id = j.item_id
            WHERE i.status = 'pending'
            ORDER BY i.rowid, j.rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(group_jobs(rows.into_iter().map(|row| {
            (
                row.get::<String, _>("item_id"),
                row.get::<String, _>("job_id"),
            )
        })))
    }

    async fn complete_job(&self, job_id: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let linked: Vec<String> = sqlx::query("SELECT item_id FROM tag_item_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| row.get("item_id"))
            .collect();

        sqlx::query("DELETE FROM tag_item_jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        let mut resolved = Vec::new();
        for item_id in linked {
            // Still covered by another job, or no longer pending
            let updated = sqlx::query(
                r#"
                UPDATE tag_items
                SET status = 'tagged', updated_at = CURRENT_TIMESTAMP
                WHERE item_id = ? AND status = 'pending'
                  AND NOT EXISTS (SELECT 1 FROM tag_item_jobs WHERE item_id = tag_items.item_id)
                "#,
            )
            .bind(&item_id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() > 0 {
                resolved.push(item_id);
            }
        }

        tx.commit().await?;
        Ok(resolved)
    }

    async fn release_job(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tag_item_jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn status(&self, item_id: &str) -> Result<Option<ItemStatus>> {
        let row = sqlx::query("SELECT status FROM tag_items WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row.get::<String, _>("status").parse())
            .transpose()
    }

    async fn tags(&self, item_id: &str) -> Result<Option<Vec<String>>> {
        let row = sqlx::query("SELECT tags FROM tag_items WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("tags");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }
}
