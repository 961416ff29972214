use caw_core::error::{Error, Result};
use caw_core::models::{Checkpoint, CheckpointFilter, NewCheckpoint};
use caw_core::{ids, IdKind};
use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use crate::common::{
    db_err, fetch_task, json_map_to_string, row_to_checkpoint, string_vec_to_string,
    CHECKPOINT_COLUMNS,
};
use crate::store::Store;

/// Append-only per-task progress ledger.
#[derive(Clone)]
pub struct CheckpointService {
    store: Store,
}

impl CheckpointService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append a checkpoint at the next sequence for the task
    pub async fn add(&self, task_id: &str, input: NewCheckpoint) -> Result<Checkpoint> {
        if input.summary.trim().is_empty() {
            return Err(Error::empty_field("summary"));
        }

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        fetch_task(&mut tx, task_id).await?;
        let checkpoint = append_checkpoint_tx(&mut tx, task_id, &input).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(checkpoint)
    }

    /// List checkpoints by ascending sequence. Filters combine with AND;
    /// an explicit empty type set matches nothing.
    pub async fn list(&self, task_id: &str, filter: CheckpointFilter) -> Result<Vec<Checkpoint>> {
        if matches!(&filter.types, Some(types) if types.is_empty()) {
            return Ok(Vec::new());
        }

        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_task(&mut conn, task_id).await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE task_id = "
        ));
        builder.push_bind(task_id);
        if let Some(types) = &filter.types {
            builder.push(" AND checkpoint_type IN (");
            let mut separated = builder.separated(", ");
            for checkpoint_type in types {
                separated.push_bind(checkpoint_type.as_str());
            }
            builder.push(")");
        }
        if let Some(since_sequence) = filter.since_sequence {
            builder.push(" AND sequence > ");
            builder.push_bind(since_sequence);
        }
        builder.push(" ORDER BY sequence");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_checkpoint).collect()
    }
}

/// Insert a checkpoint inside an open transaction, computing the next
/// sequence. The caller must have verified the task exists.
pub(crate) async fn append_checkpoint_tx(
    conn: &mut SqliteConnection,
    task_id: &str,
    input: &NewCheckpoint,
) -> Result<Checkpoint> {
    let sequence: i64 = sqlx::query(
        "SELECT COALESCE(MAX(sequence), 0) + 1 AS next_sequence FROM checkpoints WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?
    .get("next_sequence");

    let checkpoint = Checkpoint {
        id: ids::generate(IdKind::Checkpoint),
        task_id: task_id.to_string(),
        sequence,
        checkpoint_type: input.checkpoint_type,
        summary: input.summary.clone(),
        detail: input.detail.clone(),
        files_changed: input.files_changed.clone(),
        tokens_used: input.tokens_used,
        created_at: Utc::now(),
    };
    sqlx::query(
        "INSERT INTO checkpoints (id, task_id, sequence, checkpoint_type, summary, detail, \
         files_changed, tokens_used, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&checkpoint.id)
    .bind(&checkpoint.task_id)
    .bind(checkpoint.sequence)
    .bind(checkpoint.checkpoint_type.as_str())
    .bind(&checkpoint.summary)
    .bind(checkpoint.detail.as_ref().map(json_map_to_string))
    .bind(checkpoint.files_changed.as_deref().map(string_vec_to_string))
    .bind(checkpoint.tokens_used)
    .bind(checkpoint.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(checkpoint)
}

/// The most recent `limit` checkpoints (all when `limit` is none), returned
/// in ascending sequence order.
pub(crate) async fn load_recent_checkpoints(
    conn: &mut SqliteConnection,
    task_id: &str,
    limit: Option<i64>,
) -> Result<Vec<Checkpoint>> {
    let mut checkpoints = match limit {
        Some(limit) => {
            let sql = format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE task_id = ? \
                 ORDER BY sequence DESC LIMIT ?"
            );
            let rows = sqlx::query(&sql)
                .bind(task_id)
                .bind(limit)
                .fetch_all(&mut *conn)
                .await
                .map_err(db_err)?;
            rows.iter()
                .map(row_to_checkpoint)
                .collect::<Result<Vec<_>>>()?
        }
        None => {
            let sql = format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE task_id = ? ORDER BY sequence"
            );
            let rows = sqlx::query(&sql)
                .bind(task_id)
                .fetch_all(&mut *conn)
                .await
                .map_err(db_err)?;
            return rows.iter().map(row_to_checkpoint).collect();
        }
    };
    checkpoints.sort_by_key(|c| c.sequence);
    Ok(checkpoints)
}
