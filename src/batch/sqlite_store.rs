//! SQLite implementation of BatchStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::client::{BatchClient, BatchError};
use super::store::{truncate_error, BatchStore, ClaimedUnit};
use super::unit::{BatchId, BatchStatus, ContinuationTrigger, InitialState, UnitId, WorkUnit};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mapflow_batches (
    id INTEGER PRIMARY KEY,
    parent_id INTEGER REFERENCES mapflow_batches(id),
    awaiting_id INTEGER REFERENCES mapflow_batches(id),
    status TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS mapflow_units (
    id INTEGER PRIMARY KEY,
    batch_id INTEGER NOT NULL REFERENCES mapflow_batches(id),
    mapper TEXT NOT NULL,
    label TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_mapflow_units_status ON mapflow_units(status, batch_id);
CREATE INDEX IF NOT EXISTS idx_mapflow_units_batch ON mapflow_units(batch_id, status);
CREATE INDEX IF NOT EXISTS idx_mapflow_batches_awaiting ON mapflow_batches(awaiting_id, status);
"#;

fn storage(e: sqlx::Error) -> BatchError {
    BatchError::StorageError(e.to_string())
}

/// SQLite-backed batch store.
pub struct SqliteBatchStore {
    pool: SqlitePool,
    trigger: ContinuationTrigger,
}

impl SqliteBatchStore {
    /// Create a new SqliteBatchStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            trigger: ContinuationTrigger::default(),
        }
    }

    /// Choose which terminal states release continuations.
    pub fn with_continuation_trigger(mut self, trigger: ContinuationTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Run migrations to create the batch and unit tables.
    pub async fn run_migrations(&self) -> Result<(), BatchError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
            }
        }
        Ok(())
    }

    async fn finish(&self, id: UnitId, status: &str, error: Option<&str>) -> Result<(), BatchError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT batch_id, status FROM mapflow_units WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage)?;
        let (batch_id, current) =
            row.ok_or_else(|| BatchError::StorageError(format!("unknown unit {}", id.0)))?;

        if current == "completed" || current == "failed" {
            tx.commit().await.map_err(storage)?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE mapflow_units
            SET status = ?, error_message = ?, completed_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(error)
        .bind(id.0)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        let remaining = unfinished_units(&mut tx, batch_id).await?;
        let batch_status = batch_status(&mut tx, batch_id).await?;
        if remaining == 0 && batch_status == Some(BatchStatus::Started) {
            settle(&mut tx, batch_id, self.trigger).await?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(())
    }
}

async fn insert_batch(
    conn: &mut SqliteConnection,
    units: &[WorkUnit],
    parent: Option<BatchId>,
    awaiting: Option<BatchId>,
) -> Result<BatchId, BatchError> {
    for referenced in parent.iter().chain(awaiting.iter()) {
        if batch_status(conn, referenced.0).await?.is_none() {
            return Err(BatchError::UnknownBatch(*referenced));
        }
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO mapflow_batches (parent_id, awaiting_id, status)
        VALUES (?, ?, 'awaiting')
        RETURNING id
        "#,
    )
    .bind(parent.map(|p| p.0))
    .bind(awaiting.map(|a| a.0))
    .fetch_one(&mut *conn)
    .await
    .map_err(storage)?;

    for unit in units {
        let payload = serde_json::to_string(unit)
            .map_err(|e| BatchError::SerializationError(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO mapflow_units (batch_id, mapper, label, payload)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&unit.mapper)
        .bind(&unit.label)
        .bind(payload)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    }

    Ok(BatchId(id))
}

async fn batch_status(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<BatchStatus>, BatchError> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM mapflow_batches WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage)?;

    status
        .map(|s| {
            BatchStatus::parse(&s)
                .ok_or_else(|| BatchError::DeserializationError(format!("batch status '{}'", s)))
        })
        .transpose()
}

async fn unfinished_units(conn: &mut SqliteConnection, batch_id: i64) -> Result<i64, BatchError> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM mapflow_units WHERE batch_id = ? AND status IN ('pending', 'running')",
    )
    .bind(batch_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(storage)
}

/// Start an awaiting batch, settling it right away when it has no units.
async fn activate(
    conn: &mut SqliteConnection,
    id: i64,
    trigger: ContinuationTrigger,
) -> Result<(), BatchError> {
    let result = sqlx::query(
        "UPDATE mapflow_batches SET status = 'started' WHERE id = ? AND status = 'awaiting'",
    )
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;

    if result.rows_affected() == 1 && unfinished_units(conn, id).await? == 0 {
        settle(conn, id, trigger).await?;
    }
    Ok(())
}

/// Make a finished batch terminal and release its continuations.
async fn settle(
    conn: &mut SqliteConnection,
    id: i64,
    trigger: ContinuationTrigger,
) -> Result<(), BatchError> {
    let mut pending = vec![id];

    while let Some(id) = pending.pop() {
        let failed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mapflow_units WHERE batch_id = ? AND status = 'failed'",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(storage)?;

        let status = if failed > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Succeeded
        };

        sqlx::query(
            "UPDATE mapflow_batches SET status = ?, completed_at = datetime('now') WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;

        if !trigger.fires_on(status) {
            continue;
        }

        let continuations: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM mapflow_batches WHERE awaiting_id = ? AND status = 'awaiting' ORDER BY id",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage)?;

        for next in continuations {
            sqlx::query("UPDATE mapflow_batches SET status = 'started' WHERE id = ?")
                .bind(next)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;

            if unfinished_units(conn, next).await? == 0 {
                pending.push(next);
            }
        }
    }

    Ok(())
}

#[async_trait]
impl BatchClient for SqliteBatchStore {
    async fn create_batch(
        &self,
        units: Vec<WorkUnit>,
        initial_state: InitialState,
        parent: Option<BatchId>,
    ) -> Result<BatchId, BatchError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let id = insert_batch(&mut tx, &units, parent, None).await?;
        if initial_state == InitialState::Started {
            activate(&mut tx, id.0, self.trigger).await?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(id)
    }

    async fn continue_with(
        &self,
        batch: BatchId,
        units: Vec<WorkUnit>,
    ) -> Result<BatchId, BatchError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let id = insert_batch(&mut tx, &units, None, Some(batch)).await?;

        // The source may already be terminal; release right away in that case.
        let source = batch_status(&mut tx, batch.0).await?;
        if source.is_some_and(|s| self.trigger.fires_on(s)) {
            activate(&mut tx, id.0, self.trigger).await?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(id)
    }

    async fn start_batch(&self, batch: BatchId) -> Result<(), BatchError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        if batch_status(&mut tx, batch.0).await?.is_none() {
            return Err(BatchError::UnknownBatch(batch));
        }
        activate(&mut tx, batch.0, self.trigger).await?;

        tx.commit().await.map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl BatchStore for SqliteBatchStore {
    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedUnit>, BatchError> {
        // SQLite doesn't support UPDATE ... LIMIT with RETURNING directly,
        // so we do it in two steps within a transaction
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT u.id FROM mapflow_units u
            JOIN mapflow_batches b ON b.id = u.batch_id
            WHERE u.status = 'pending' AND b.status = 'started'
            ORDER BY u.id
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        if ids.is_empty() {
            tx.commit().await.map_err(storage)?;
            return Ok(vec![]);
        }

        let placeholders: Vec<String> = ids.iter().map(|_| "?".to_string()).collect();
        let in_clause = placeholders.join(",");

        let update_query = format!(
            "UPDATE mapflow_units SET status = 'running', started_at = datetime('now') WHERE id IN ({})",
            in_clause
        );
        let mut update = sqlx::query(&update_query);
        for id in &ids {
            update = update.bind(id);
        }
        update.execute(&mut *tx).await.map_err(storage)?;

        let select_query = format!(
            "SELECT id, batch_id, payload, created_at FROM mapflow_units WHERE id IN ({}) ORDER BY id",
            in_clause
        );
        let mut select = sqlx::query_as::<_, (i64, i64, String, String)>(&select_query);
        for id in &ids {
            select = select.bind(id);
        }
        let rows = select.fetch_all(&mut *tx).await.map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        rows.into_iter()
            .map(|(id, batch_id, payload, created_at)| {
                let unit: WorkUnit = serde_json::from_str(&payload)
                    .map_err(|e| BatchError::DeserializationError(e.to_string()))?;
                let created =
                    DateTime::parse_from_rfc3339(&format!("{}Z", created_at.replace(' ', "T")))
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());
                Ok(ClaimedUnit {
                    id: UnitId(id),
                    batch_id: BatchId(batch_id),
                    unit,
                    created_at: created,
                })
            })
            .collect()
    }

    async fn complete(&self, id: UnitId) -> Result<(), BatchError> {
        self.finish(id, "completed", None).await
    }

    async fn fail(&self, id: UnitId, error: &str) -> Result<(), BatchError> {
        self.finish(id, "failed", Some(truncate_error(error))).await
    }

    async fn recover_orphans(&self) -> Result<usize, BatchError> {
        let result = sqlx::query(
            r#"
            UPDATE mapflow_units
            SET status = 'pending', started_at = NULL
            WHERE status = 'running'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() as usize)
    }

    async fn batch_status(&self, id: BatchId) -> Result<Option<BatchStatus>, BatchError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        batch_status(&mut conn, id.0).await
    }
}
