use caw_core::error::{Error, Result};
use caw_core::events::{Event, EventType};
use caw_core::models::{
    Agent, AgentFilter, AgentStatus, AgentUpdate, NewAgent, UnregisterOutcome,
};
use caw_core::{ids, IdKind, Validate};
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::common::{
    db_err, fetch_agent, fetch_workflow, json_map_to_string, merge_json, row_to_agent,
    string_vec_to_string, AGENT_COLUMNS,
};
use crate::store::Store;

/// Agent registration, heartbeats, and stale detection.
#[derive(Clone)]
pub struct AgentService {
    store: Store,
}

impl AgentService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Register a new executor in status `online`
    pub async fn register(&self, input: NewAgent) -> Result<Agent> {
        Validate::non_empty("name", &input.name)?;
        Validate::non_empty("runtime", &input.runtime)?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        if let Some(workflow_id) = &input.workflow_id {
            fetch_workflow(&mut tx, workflow_id).await?;
        }

        let now = Utc::now();
        let agent = Agent {
            id: ids::generate(IdKind::Agent),
            workflow_id: input.workflow_id.clone(),
            name: input.name.clone(),
            runtime: input.runtime.clone(),
            role: input.role.unwrap_or(caw_core::AgentRole::Worker),
            status: AgentStatus::Online,
            capabilities: input.capabilities.clone(),
            current_task_id: None,
            workspace_path: input.workspace_path.clone(),
            last_heartbeat: now,
            metadata: input.metadata.clone().unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO agents (id, workflow_id, name, runtime, role, status, capabilities, \
             workspace_path, last_heartbeat, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&agent.id)
        .bind(&agent.workflow_id)
        .bind(&agent.name)
        .bind(&agent.runtime)
        .bind(agent.role.as_str())
        .bind(agent.status.as_str())
        .bind(string_vec_to_string(&agent.capabilities))
        .bind(&agent.workspace_path)
        .bind(agent.last_heartbeat)
        .bind(json_map_to_string(&agent.metadata))
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        self.store.events().emit(Event::new(
            EventType::AgentRegistered,
            json!({ "agent_id": agent.id, "name": agent.name, "workflow_id": agent.workflow_id }),
        ));
        tracing::info!(agent_id = %agent.id, name = %agent.name, "agent registered");
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> Result<Agent> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_agent(&mut conn, agent_id).await
    }

    /// Refresh the agent's liveness, optionally updating its current task
    /// and availability. Offline agents must re-register instead.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        current_task_id: Option<&str>,
        status: Option<AgentStatus>,
    ) -> Result<Agent> {
        if status == Some(AgentStatus::Offline) {
            return Err(Error::Validation(
                "a heartbeat cannot take an agent offline; unregister it".to_string(),
            ));
        }

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut agent = fetch_agent(&mut tx, agent_id).await?;
        if agent.status == AgentStatus::Offline {
            return Err(Error::InvalidState(
                "agent is offline; register a new agent".to_string(),
            ));
        }

        let now = Utc::now();
        agent.last_heartbeat = now;
        if let Some(task_id) = current_task_id {
            agent.current_task_id = Some(task_id.to_string());
        }
        if let Some(new_status) = status {
            agent.status = new_status;
        }
        sqlx::query(
            "UPDATE agents SET last_heartbeat = ?, current_task_id = ?, status = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(agent.last_heartbeat)
        .bind(&agent.current_task_id)
        .bind(agent.status.as_str())
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        agent.updated_at = now;
        self.store.events().emit(Event::new(
            EventType::AgentHeartbeat,
            json!({ "agent_id": agent_id, "status": agent.status.as_str() }),
        ));
        Ok(agent)
    }

    /// Partial update. `metadata` shallow-merges (later keys overwrite);
    /// `capabilities` replaces.
    pub async fn update(&self, agent_id: &str, update: AgentUpdate) -> Result<Agent> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut agent = fetch_agent(&mut tx, agent_id).await?;

        if let Some(name) = &update.name {
            Validate::non_empty("name", name)?;
            agent.name = name.clone();
        }
        if let Some(status) = update.status {
            agent.status = status;
        }
        if let Some(capabilities) = &update.capabilities {
            agent.capabilities = capabilities.clone();
        }
        if let Some(current_task_id) = &update.current_task_id {
            agent.current_task_id = current_task_id.clone();
        }
        if let Some(workspace_path) = &update.workspace_path {
            agent.workspace_path = Some(workspace_path.clone());
        }
        if let Some(patch) = &update.metadata {
            merge_json(&mut agent.metadata, patch);
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE agents SET name = ?, status = ?, capabilities = ?, current_task_id = ?, \
             workspace_path = ?, metadata = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&agent.name)
        .bind(agent.status.as_str())
        .bind(string_vec_to_string(&agent.capabilities))
        .bind(&agent.current_task_id)
        .bind(&agent.workspace_path)
        .bind(json_map_to_string(&agent.metadata))
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        agent.updated_at = now;
        Ok(agent)
    }

    /// List agents; an explicit empty status set matches nothing.
    pub async fn list(&self, filter: AgentFilter) -> Result<Vec<Agent>> {
        if matches!(&filter.status, Some(statuses) if statuses.is_empty()) {
            return Ok(Vec::new());
        }

        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {AGENT_COLUMNS} FROM agents WHERE 1 = 1"));
        if let Some(statuses) = &filter.status {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            builder.push(")");
        }
        if let Some(role) = filter.role {
            builder.push(" AND role = ");
            builder.push_bind(role.as_str());
        }
        if let Some(runtime) = &filter.runtime {
            builder.push(" AND runtime = ");
            builder.push_bind(runtime.clone());
        }
        if let Some(workflow_id) = &filter.workflow_id {
            builder.push(" AND workflow_id = ");
            builder.push_bind(workflow_id.clone());
        }
        builder.push(" ORDER BY created_at, id");

        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_agent).collect()
    }

    /// Take an agent offline and release every claim it still holds on
    /// non-terminal tasks.
    pub async fn unregister(&self, agent_id: &str) -> Result<UnregisterOutcome> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        fetch_agent(&mut tx, agent_id).await?;

        let held: Vec<(String, String)> = sqlx::query(
            "SELECT id, workflow_id FROM tasks \
             WHERE assigned_agent_id = ? AND status NOT IN ('completed', 'skipped')",
        )
        .bind(agent_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .iter()
        .map(|row| (row.get("id"), row.get("workflow_id")))
        .collect();

        let now = Utc::now();
        let released = sqlx::query(
            "UPDATE tasks SET assigned_agent_id = NULL, claimed_at = NULL, updated_at = ? \
             WHERE assigned_agent_id = ? AND status NOT IN ('completed', 'skipped')",
        )
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();
        sqlx::query(
            "UPDATE agents SET status = ?, current_task_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(AgentStatus::Offline.as_str())
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        let mut events = vec![Event::new(
            EventType::AgentUnregistered,
            json!({ "agent_id": agent_id, "tasks_released": released }),
        )];
        events.extend(held.into_iter().map(|(task_id, workflow_id)| {
            Event::new(
                EventType::TaskUpdated,
                json!({ "workflow_id": workflow_id, "task_id": task_id, "assigned_agent_id": null }),
            )
        }));
        self.store.events().emit_all(events);
        tracing::info!(agent_id, tasks_released = released, "agent unregistered");
        Ok(UnregisterOutcome {
            success: true,
            tasks_released: released,
        })
    }

    /// Online or busy agents whose heartbeat is older than the timeout
    pub async fn get_stale(&self, timeout_ms: i64) -> Result<Vec<Agent>> {
        let cutoff = Utc::now() - Duration::milliseconds(timeout_ms.max(0));
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents \
             WHERE status IN ('online', 'busy') AND last_heartbeat < ? \
             ORDER BY last_heartbeat"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_agent).collect()
    }
}
