use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use caw_core::error::{Error, Result};
use caw_core::events::EventBus;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::common::db_err;
use crate::{
    AgentService, CheckpointService, ContextLoader, LockService, MessageService,
    OrchestrationService, SessionService, TaskService, TemplateService, WorkflowService,
    WorkspaceService,
};

/// Handle to the persistent store and the process-wide event bus.
///
/// Cloning is cheap; every clone shares the same pool and bus.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    events: Arc<EventBus>,
}

impl Store {
    /// Open (or create) a store at the given location.
    ///
    /// `path` is either `:memory:` or a filesystem path; a missing parent
    /// directory is created. File-backed stores run in WAL mode with
    /// foreign keys enforced and a 5 second busy wait; in-memory stores use
    /// the memory journal and a single pooled connection so every handle
    /// sees the same database.
    pub async fn connect(path: &str) -> Result<Self> {
        let path = path.strip_prefix("sqlite://").unwrap_or(path);
        let in_memory = path.starts_with(":memory:");

        let connect_options = if in_memory {
            SqliteConnectOptions::new()
                .filename(":memory:")
                .journal_mode(SqliteJournalMode::Memory)
                .busy_timeout(Duration::from_secs(5))
                .foreign_keys(true)
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::Database(format!(
                            "failed to create database directory {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .foreign_keys(true)
        };

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(db_err)?;

        Ok(Self {
            pool,
            events: Arc::new(EventBus::new()),
        })
    }

    /// Apply pending schema migrations in numeric order. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;

        tracing::info!("database migrations completed");
        Ok(())
    }

    /// Access the underlying pool, primarily for tests
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The event bus shared by all services on this store
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn workflows(&self) -> WorkflowService {
        WorkflowService::new(self.clone())
    }

    pub fn tasks(&self) -> TaskService {
        TaskService::new(self.clone())
    }

    pub fn checkpoints(&self) -> CheckpointService {
        CheckpointService::new(self.clone())
    }

    pub fn orchestration(&self) -> OrchestrationService {
        OrchestrationService::new(self.clone())
    }

    pub fn agents(&self) -> AgentService {
        AgentService::new(self.clone())
    }

    pub fn messages(&self) -> MessageService {
        MessageService::new(self.clone())
    }

    pub fn locks(&self) -> LockService {
        LockService::new(self.clone())
    }

    pub fn sessions(&self) -> SessionService {
        SessionService::new(self.clone())
    }

    pub fn workspaces(&self) -> WorkspaceService {
        WorkspaceService::new(self.clone())
    }

    pub fn templates(&self) -> TemplateService {
        TemplateService::new(self.clone())
    }

    pub fn context(&self) -> ContextLoader {
        ContextLoader::new(self.clone())
    }

    /// Simple connectivity probe for health endpoints
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
