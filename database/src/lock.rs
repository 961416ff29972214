use caw_core::error::{Error, Result};
use caw_core::models::{LockInfo, LockOutcome};
use chrono::{Duration, Utc};
use sqlx::Row;

use crate::common::{db_err, fetch_session, fetch_session_opt, fetch_workflow};
use crate::store::Store;

/// Advisory workflow locks bound to sessions.
///
/// Locks keep two tooling sessions from mutating the same workflow; they
/// are not the mutual exclusion for task work (claims are).
#[derive(Clone)]
pub struct LockService {
    store: Store,
}

impl LockService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Acquire the workflow lock for a session.
    ///
    /// Idempotent for the current holder (the original `locked_at` is
    /// preserved). A holder whose session row has since been deregistered
    /// is taken over; a live foreign holder is reported without error.
    pub async fn lock(&self, workflow_id: &str, session_id: &str) -> Result<LockOutcome> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let workflow = fetch_workflow(&mut tx, workflow_id).await?;
        fetch_session(&mut tx, session_id).await?;

        if let Some(holder) = &workflow.locked_by_session_id {
            if holder == session_id {
                return Ok(LockOutcome {
                    success: true,
                    locked_by: Some(session_id.to_string()),
                    locked_at: workflow.locked_at,
                });
            }
            // A holder with a live session row keeps the lock; a dangling
            // holder is taken over below.
            if fetch_session_opt(&mut tx, holder).await?.is_some() {
                return Ok(LockOutcome {
                    success: false,
                    locked_by: Some(holder.clone()),
                    locked_at: workflow.locked_at,
                });
            }
            tracing::info!(
                workflow_id,
                stale_holder = %holder,
                new_holder = session_id,
                "taking over lock from deregistered session"
            );
        }

        let now = Utc::now();
        sqlx::query("UPDATE workflows SET locked_by_session_id = ?, locked_at = ? WHERE id = ?")
            .bind(session_id)
            .bind(now)
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(LockOutcome {
            success: true,
            locked_by: Some(session_id.to_string()),
            locked_at: Some(now),
        })
    }

    /// Release the workflow lock. Unlocking an unlocked workflow succeeds;
    /// releasing another session's lock is a conflict.
    pub async fn unlock(&self, workflow_id: &str, session_id: &str) -> Result<()> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let workflow = fetch_workflow(&mut tx, workflow_id).await?;

        match &workflow.locked_by_session_id {
            None => return Ok(()),
            Some(holder) if holder == session_id => {}
            Some(holder) => {
                return Err(Error::Conflict(format!(
                    "workflow is locked by session '{holder}'"
                )));
            }
        }

        sqlx::query(
            "UPDATE workflows SET locked_by_session_id = NULL, locked_at = NULL WHERE id = ?",
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Current holder information; the pid survives a dangling holder id
    /// thanks to the LEFT JOIN.
    pub async fn get_lock_info(&self, workflow_id: &str) -> Result<LockInfo> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let row = sqlx::query(
            "SELECT w.locked_by_session_id, w.locked_at, s.pid
             FROM workflows w
             LEFT JOIN sessions s ON s.id = w.locked_by_session_id
             WHERE w.id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found("workflow", workflow_id))?;

        let session_id: Option<String> = row.get("locked_by_session_id");
        Ok(LockInfo {
            locked: session_id.is_some(),
            session_id,
            locked_at: row.get("locked_at"),
            session_pid: row.get("pid"),
        })
    }

    /// Clear locks whose holding session has stopped heartbeating.
    /// Returns the number of locks released.
    pub async fn release_stale_workflow_locks(&self, timeout_ms: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::milliseconds(timeout_ms.max(0));
        let result = sqlx::query(
            "UPDATE workflows SET locked_by_session_id = NULL, locked_at = NULL
             WHERE locked_by_session_id IN (
                 SELECT id FROM sessions WHERE last_heartbeat < ?
             )",
        )
        .bind(cutoff)
        .execute(self.store.pool())
        .await
        .map_err(db_err)?;

        let cleared = result.rows_affected();
        if cleared > 0 {
            tracing::info!(cleared, "released stale workflow locks");
        }
        Ok(cleared)
    }
}
