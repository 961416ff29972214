use caw_core::error::{Error, Result};
use caw_core::models::{NewSession, Session};
use caw_core::{ids, IdKind};
use chrono::Utc;
use sqlx::Row;

use crate::common::{db_err, fetch_session, json_map_to_string};
use crate::store::Store;

/// Process identities used for workflow locking.
#[derive(Clone)]
pub struct SessionService {
    store: Store,
}

impl SessionService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn register(&self, input: NewSession) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: ids::generate(IdKind::Session),
            pid: input.pid,
            is_daemon: input.is_daemon,
            metadata: input.metadata.unwrap_or_default(),
            last_heartbeat: now,
            created_at: now,
        };
        sqlx::query(
            "INSERT INTO sessions (id, pid, is_daemon, metadata, last_heartbeat, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(session.pid)
        .bind(session.is_daemon)
        .bind(json_map_to_string(&session.metadata))
        .bind(session.last_heartbeat)
        .bind(session.created_at)
        .execute(self.store.pool())
        .await
        .map_err(db_err)?;

        tracing::info!(session_id = %session.id, pid = session.pid, "session registered");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_session(&mut conn, session_id).await
    }

    /// Remove the session row. Workflow locks it held become stale; the
    /// next lock attempt by another session takes them over.
    pub async fn deregister(&self, session_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("session", session_id));
        }
        tracing::info!(session_id, "session deregistered");
        Ok(())
    }

    pub async fn heartbeat(&self, session_id: &str) -> Result<Session> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut session = fetch_session(&mut tx, session_id).await?;
        let now = Utc::now();
        sqlx::query("UPDATE sessions SET last_heartbeat = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        session.last_heartbeat = now;
        Ok(session)
    }

    /// All registered sessions, oldest first
    pub async fn list(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT id, pid, is_daemon, metadata, last_heartbeat, created_at FROM sessions \
             ORDER BY created_at, id",
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(Session {
                    id: row.get("id"),
                    pid: row.get("pid"),
                    is_daemon: row.get("is_daemon"),
                    metadata: crate::common::read_json_map(row.get("metadata")),
                    last_heartbeat: row.get("last_heartbeat"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}
