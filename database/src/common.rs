//! Row mappers, enum converters, and shared query helpers.
//!
//! Everything here operates on a `&mut SqliteConnection` so services can
//! compose multiple helpers inside one transaction.

use caw_core::error::{Error, Result};
use caw_core::models::{
    Agent, Checkpoint, JsonMap, Message, Repository, Session, Task, Workflow, WorkflowTemplate,
    Workspace,
};
use caw_core::{ids, IdKind, Validate};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

// ---------------------------------------------------------------------------
// Error and value conversion
// ---------------------------------------------------------------------------

/// Convert a sqlx error into the core taxonomy
pub(crate) fn db_err(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("UNIQUE constraint failed") {
                Error::Conflict(format!("unique constraint violated: {message}"))
            } else if message.contains("FOREIGN KEY constraint failed") {
                Error::Validation("operation references a row that does not exist".to_string())
            } else {
                Error::Database(format!("database constraint error: {message}"))
            }
        }
        sqlx::Error::PoolTimedOut => Error::Database("connection pool timeout".to_string()),
        sqlx::Error::Io(io_err) => Error::Database(format!("database I/O error: {io_err}")),
        _ => Error::Database(format!("database operation failed: {err}")),
    }
}

/// Parse an enum column, reporting corrupt values as database errors
pub(crate) fn db_parse<T>(value: &str, what: &str) -> Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    value
        .parse()
        .map_err(|_| Error::Database(format!("invalid {what} in database: '{value}'")))
}

pub(crate) fn read_json_map(raw: Option<String>) -> JsonMap {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

pub(crate) fn read_opt_json_map(raw: Option<String>) -> Option<JsonMap> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn json_map_to_string(map: &JsonMap) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn read_opt_string_vec(raw: Option<String>) -> Option<Vec<String>> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn read_string_vec(raw: Option<String>) -> Vec<String> {
    read_opt_string_vec(raw).unwrap_or_default()
}

pub(crate) fn string_vec_to_string(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Shallow-merge `patch` into `base`; later keys overwrite
pub(crate) fn merge_json(base: &mut JsonMap, patch: &JsonMap) {
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

pub(crate) const WORKFLOW_COLUMNS: &str = "id, name, source_type, source_ref, source_content, \
     status, plan_summary, initial_plan, max_parallel_tasks, auto_create_workspaces, config, \
     locked_by_session_id, locked_at, created_at, updated_at";

pub(crate) const TASK_COLUMNS: &str = "id, workflow_id, name, description, status, sequence, \
     parallel_group, assigned_agent_id, claimed_at, plan, outcome, outcome_detail, workspace_id, \
     repository_id, context, created_at, updated_at";

pub(crate) const CHECKPOINT_COLUMNS: &str =
    "id, task_id, sequence, checkpoint_type, summary, detail, files_changed, tokens_used, \
     created_at";

pub(crate) const AGENT_COLUMNS: &str = "id, workflow_id, name, runtime, role, status, \
     capabilities, current_task_id, workspace_path, last_heartbeat, metadata, created_at, \
     updated_at";

pub(crate) const SESSION_COLUMNS: &str =
    "id, pid, is_daemon, metadata, last_heartbeat, created_at";

pub(crate) const WORKSPACE_COLUMNS: &str = "id, workflow_id, repository_id, path, branch, \
     base_branch, status, merge_commit, pr_url, config, created_at, updated_at";

pub(crate) const MESSAGE_COLUMNS: &str = "id, sender_id, recipient_id, message_type, subject, \
     body, priority, status, thread_id, reply_to_id, workflow_id, task_id, created_at, read_at, \
     expires_at";

pub(crate) const TEMPLATE_COLUMNS: &str =
    "id, name, description, template, version, created_at, updated_at";

pub(crate) const REPOSITORY_COLUMNS: &str = "id, path, name, created_at, updated_at";

pub(crate) fn row_to_workflow(row: &SqliteRow) -> Result<Workflow> {
    let status: String = row.get("status");
    let initial_plan: Option<String> = row.get("initial_plan");

    Ok(Workflow {
        id: row.get("id"),
        name: row.get("name"),
        source_type: row.get("source_type"),
        source_ref: row.get("source_ref"),
        source_content: row.get("source_content"),
        status: db_parse(&status, "workflow status")?,
        plan_summary: row.get("plan_summary"),
        initial_plan: initial_plan.and_then(|s| serde_json::from_str(&s).ok()),
        max_parallel_tasks: row.get("max_parallel_tasks"),
        auto_create_workspaces: row.get("auto_create_workspaces"),
        config: read_json_map(row.get("config")),
        locked_by_session_id: row.get("locked_by_session_id"),
        locked_at: row.get("locked_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");

    Ok(Task {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        name: row.get("name"),
        description: row.get("description"),
        status: db_parse(&status, "task status")?,
        sequence: row.get("sequence"),
        parallel_group: row.get("parallel_group"),
        assigned_agent_id: row.get("assigned_agent_id"),
        claimed_at: row.get("claimed_at"),
        plan: row.get("plan"),
        outcome: row.get("outcome"),
        outcome_detail: row.get("outcome_detail"),
        workspace_id: row.get("workspace_id"),
        repository_id: row.get("repository_id"),
        context: read_json_map(row.get("context")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint> {
    let checkpoint_type: String = row.get("checkpoint_type");

    Ok(Checkpoint {
        id: row.get("id"),
        task_id: row.get("task_id"),
        sequence: row.get("sequence"),
        checkpoint_type: db_parse(&checkpoint_type, "checkpoint type")?,
        summary: row.get("summary"),
        detail: read_opt_json_map(row.get("detail")),
        files_changed: read_opt_string_vec(row.get("files_changed")),
        tokens_used: row.get("tokens_used"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn row_to_agent(row: &SqliteRow) -> Result<Agent> {
    let role: String = row.get("role");
    let status: String = row.get("status");

    Ok(Agent {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        name: row.get("name"),
        runtime: row.get("runtime"),
        role: db_parse(&role, "agent role")?,
        status: db_parse(&status, "agent status")?,
        capabilities: read_string_vec(row.get("capabilities")),
        current_task_id: row.get("current_task_id"),
        workspace_path: row.get("workspace_path"),
        last_heartbeat: row.get("last_heartbeat"),
        metadata: read_json_map(row.get("metadata")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn row_to_session(row: &SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.get("id"),
        pid: row.get("pid"),
        is_daemon: row.get("is_daemon"),
        metadata: read_json_map(row.get("metadata")),
        last_heartbeat: row.get("last_heartbeat"),
        created_at: row.get("created_at"),
    })
}

pub(crate) fn row_to_workspace(row: &SqliteRow) -> Result<Workspace> {
    let status: String = row.get("status");

    Ok(Workspace {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        repository_id: row.get("repository_id"),
        path: row.get("path"),
        branch: row.get("branch"),
        base_branch: row.get("base_branch"),
        status: db_parse(&status, "workspace status")?,
        merge_commit: row.get("merge_commit"),
        pr_url: row.get("pr_url"),
        config: read_json_map(row.get("config")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let priority: String = row.get("priority");
    let status: String = row.get("status");

    Ok(Message {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        recipient_id: row.get("recipient_id"),
        message_type: row.get("message_type"),
        subject: row.get("subject"),
        body: row.get("body"),
        priority: db_parse(&priority, "message priority")?,
        status: db_parse(&status, "message status")?,
        thread_id: row.get("thread_id"),
        reply_to_id: row.get("reply_to_id"),
        workflow_id: row.get("workflow_id"),
        task_id: row.get("task_id"),
        created_at: row.get("created_at"),
        read_at: row.get("read_at"),
        expires_at: row.get("expires_at"),
    })
}

pub(crate) fn row_to_template(row: &SqliteRow) -> Result<WorkflowTemplate> {
    let template: String = row.get("template");

    Ok(WorkflowTemplate {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        template: serde_json::from_str(&template)
            .map_err(|e| Error::Database(format!("invalid template definition in database: {e}")))?,
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn row_to_repository(row: &SqliteRow) -> Result<Repository> {
    Ok(Repository {
        id: row.get("id"),
        path: row.get("path"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ---------------------------------------------------------------------------
// Entity fetchers
// ---------------------------------------------------------------------------

macro_rules! fetchers {
    ($opt_name:ident, $name:ident, $table:literal, $entity:literal, $columns:ident, $mapper:ident, $model:ty) => {
        pub(crate) async fn $opt_name(
            conn: &mut SqliteConnection,
            id: &str,
        ) -> Result<Option<$model>> {
            let sql = format!("SELECT {} FROM {} WHERE id = ?", $columns, $table);
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_err)?;
            row.as_ref().map($mapper).transpose()
        }

        pub(crate) async fn $name(conn: &mut SqliteConnection, id: &str) -> Result<$model> {
            $opt_name(conn, id)
                .await?
                .ok_or_else(|| Error::not_found($entity, id))
        }
    };
}

fetchers!(
    fetch_workflow_opt,
    fetch_workflow,
    "workflows",
    "workflow",
    WORKFLOW_COLUMNS,
    row_to_workflow,
    Workflow
);
fetchers!(
    fetch_task_opt,
    fetch_task,
    "tasks",
    "task",
    TASK_COLUMNS,
    row_to_task,
    Task
);
fetchers!(
    fetch_agent_opt,
    fetch_agent,
    "agents",
    "agent",
    AGENT_COLUMNS,
    row_to_agent,
    Agent
);
fetchers!(
    fetch_session_opt,
    fetch_session,
    "sessions",
    "session",
    SESSION_COLUMNS,
    row_to_session,
    Session
);
fetchers!(
    fetch_workspace_opt,
    fetch_workspace,
    "workspaces",
    "workspace",
    WORKSPACE_COLUMNS,
    row_to_workspace,
    Workspace
);
fetchers!(
    fetch_message_opt,
    fetch_message,
    "messages",
    "message",
    MESSAGE_COLUMNS,
    row_to_message,
    Message
);
fetchers!(
    fetch_template_opt,
    fetch_template,
    "workflow_templates",
    "template",
    TEMPLATE_COLUMNS,
    row_to_template,
    WorkflowTemplate
);
fetchers!(
    fetch_repository_opt,
    fetch_repository,
    "repositories",
    "repository",
    REPOSITORY_COLUMNS,
    row_to_repository,
    Repository
);

pub(crate) async fn fetch_repository_by_path(
    conn: &mut SqliteConnection,
    path: &str,
) -> Result<Option<Repository>> {
    let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE path = ?");
    let row = sqlx::query(&sql)
        .bind(path)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    row.as_ref().map(row_to_repository).transpose()
}

/// Look up a repository by path, registering it when absent. Idempotent by
/// the unique path constraint.
pub(crate) async fn ensure_repository(
    conn: &mut SqliteConnection,
    path: &str,
) -> Result<Repository> {
    Validate::non_empty("repository path", path)?;
    if let Some(existing) = fetch_repository_by_path(conn, path).await? {
        return Ok(existing);
    }

    let now = Utc::now();
    let repository = Repository {
        id: ids::generate(IdKind::Repository),
        path: path.to_string(),
        name: std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        created_at: now,
        updated_at: now,
    };
    sqlx::query("INSERT INTO repositories (id, path, name, created_at, updated_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&repository.id)
        .bind(&repository.path)
        .bind(&repository.name)
        .bind(repository.created_at)
        .bind(repository.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(repository)
}

// ---------------------------------------------------------------------------
// Task graph helpers
// ---------------------------------------------------------------------------

/// All tasks of a workflow ordered by (sequence, name)
pub(crate) async fn load_workflow_tasks(
    conn: &mut SqliteConnection,
    workflow_id: &str,
) -> Result<Vec<Task>> {
    let sql =
        format!("SELECT {TASK_COLUMNS} FROM tasks WHERE workflow_id = ? ORDER BY sequence, name");
    let rows = sqlx::query(&sql)
        .bind(workflow_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    rows.iter().map(row_to_task).collect()
}

/// All `blocks` edges between tasks of a workflow as (task_id, depends_on_id)
pub(crate) async fn load_blocking_edges(
    conn: &mut SqliteConnection,
    workflow_id: &str,
) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        "SELECT d.task_id, d.depends_on_id
         FROM task_dependencies d
         JOIN tasks t ON t.id = d.task_id
         WHERE t.workflow_id = ? AND d.dependency_type = 'blocks'",
    )
    .bind(workflow_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(rows
        .iter()
        .map(|row| (row.get("task_id"), row.get("depends_on_id")))
        .collect())
}

/// A task is blocked while any `blocks` predecessor is non-terminal.
/// Failed and paused predecessors count as incomplete.
pub(crate) async fn task_is_blocked(
    conn: &mut SqliteConnection,
    task_id: &str,
) -> Result<bool> {
    let row = sqlx::query(
        "SELECT EXISTS(
             SELECT 1 FROM task_dependencies d
             JOIN tasks p ON p.id = d.depends_on_id
             WHERE d.task_id = ? AND d.dependency_type = 'blocks'
               AND p.status NOT IN ('completed', 'skipped')
         ) AS blocked",
    )
    .bind(task_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(row.get("blocked"))
}

/// Resolve a task reference (id or name) within a workflow.
///
/// An id lookup is tried first when the reference is shaped like a task id;
/// otherwise the reference is treated as a name.
pub(crate) async fn resolve_task_ref(
    conn: &mut SqliteConnection,
    workflow_id: &str,
    reference: &str,
) -> Result<Task> {
    if ids::is_valid_kind(reference, IdKind::Task) {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ? AND workflow_id = ?");
        if let Some(row) = sqlx::query(&sql)
            .bind(reference)
            .bind(workflow_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?
        {
            return row_to_task(&row);
        }
    }
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE workflow_id = ? AND name = ?");
    let row = sqlx::query(&sql)
        .bind(workflow_id)
        .bind(reference)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    match row {
        Some(row) => row_to_task(&row),
        None => Err(Error::not_found("task", reference)),
    }
}

/// Insert a dependency edge, ignoring duplicates. Returns whether a new row
/// was written.
pub(crate) async fn insert_dependency(
    conn: &mut SqliteConnection,
    task_id: &str,
    depends_on_id: &str,
    dependency_type: caw_core::DependencyType,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id, dependency_type, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(depends_on_id)
    .bind(dependency_type.as_str())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_helpers_tolerate_garbage() {
        assert!(read_json_map(None).is_empty());
        assert!(read_json_map(Some("not json".to_string())).is_empty());
        assert_eq!(read_string_vec(Some("[\"a\",\"b\"]".to_string())), vec!["a", "b"]);
        assert!(read_opt_json_map(Some("{}".to_string())).is_some());
        assert!(read_opt_json_map(None).is_none());
    }

    #[test]
    fn test_merge_json_overwrites() {
        let mut base: JsonMap = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let patch: JsonMap = serde_json::from_str(r#"{"b": 3, "c": 4}"#).unwrap();
        merge_json(&mut base, &patch);
        assert_eq!(base.get("a").unwrap(), 1);
        assert_eq!(base.get("b").unwrap(), 3);
        assert_eq!(base.get("c").unwrap(), 4);
    }

    #[test]
    fn test_db_err_classifies_constraints() {
        // Only the string classification can be exercised without a live
        // connection; constraint mapping is covered by integration tests.
        let err = db_err(sqlx::Error::PoolTimedOut);
        assert_eq!(err.status_code(), 500);
    }
}
