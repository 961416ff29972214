use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::plan::PlanInput;

/// Free-form JSON object stored on entities (`config`, `context`, `metadata`).
///
/// The core never inspects these beyond the keys it owns
/// (`last_status_reason`, `replan_history`, `estimated_complexity`,
/// `files_likely_affected`).
pub type JsonMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Status enums and lifecycle tables
// ---------------------------------------------------------------------------

/// Workflow lifecycle states.
///
/// A workflow is created in `planning`, becomes `ready` when its plan is
/// applied, then moves between `in_progress` and `paused` until it reaches a
/// terminal state. `failed -> in_progress` is the retry arc; `abandoned` is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Planning,
    Ready,
    InProgress,
    Paused,
    Completed,
    Failed,
    Abandoned,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Ready => "ready",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Abandoned)
    }

    /// Check if the workflow may transition to the given status
    pub fn can_transition_to(self, new_status: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        match (self, new_status) {
            (current, new) if current == new => false,
            (Planning, Ready | Abandoned) => true,
            (Ready, InProgress | Abandoned) => true,
            (InProgress, Paused | Completed | Failed | Abandoned) => true,
            (Paused, InProgress | Abandoned) => true,
            (Failed, InProgress | Abandoned) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(WorkflowStatus::Planning),
            "ready" => Ok(WorkflowStatus::Ready),
            "in_progress" => Ok(WorkflowStatus::InProgress),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "abandoned" => Ok(WorkflowStatus::Abandoned),
            _ => Err(Error::Validation(format!("unknown workflow status: {s}"))),
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle states.
///
/// `pending -> planning -> in_progress -> completed` is the happy path; a
/// task in `planning` may also complete directly. `failed` tasks retry to
/// `pending` or are written off as `skipped`. `completed` and `skipped` are
/// terminal and count as satisfied for blocking purposes.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Planning,
    InProgress,
    Paused,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Planning => "planning",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }

    /// Check if the task may transition to the given status.
    ///
    /// The dependency guard (`pending|blocked -> planning` requires no
    /// incomplete blocking predecessor) and the outcome/error requirements
    /// are layered on top by the task service; this table only encodes the
    /// shape of the lifecycle.
    pub fn can_transition_to(self, new_status: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, new_status) {
            (current, new) if current == new => false,
            (Pending, Planning | Blocked) => true,
            (Blocked, Planning | Pending) => true,
            (Planning, InProgress | Completed) => true,
            (InProgress, Completed | Paused | Failed) => true,
            (Paused, InProgress) => true,
            (Failed, Pending | Skipped) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "blocked" => Ok(TaskStatus::Blocked),
            "planning" => Ok(TaskStatus::Planning),
            "in_progress" => Ok(TaskStatus::InProgress),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            _ => Err(Error::Validation(format!("unknown task status: {s}"))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependency edge kinds. Only `blocks` edges gate scheduling; `informs`
/// edges surface context without blocking.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    Informs,
}

impl DependencyType {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::Informs => "informs",
        }
    }
}

impl std::str::FromStr for DependencyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(DependencyType::Blocks),
            "informs" => Ok(DependencyType::Informs),
            _ => Err(Error::Validation(format!("unknown dependency type: {s}"))),
        }
    }
}

/// Checkpoint entry kinds in a task's progress ledger
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Plan,
    Progress,
    Decision,
    Error,
    Replan,
    Complete,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::Plan => "plan",
            CheckpointType::Progress => "progress",
            CheckpointType::Decision => "decision",
            CheckpointType::Error => "error",
            CheckpointType::Replan => "replan",
            CheckpointType::Complete => "complete",
        }
    }
}

impl std::str::FromStr for CheckpointType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(CheckpointType::Plan),
            "progress" => Ok(CheckpointType::Progress),
            "decision" => Ok(CheckpointType::Decision),
            "error" => Ok(CheckpointType::Error),
            "replan" => Ok(CheckpointType::Replan),
            "complete" => Ok(CheckpointType::Complete),
            _ => Err(Error::Validation(format!("unknown checkpoint type: {s}"))),
        }
    }
}

/// Agent roles
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    Worker,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Worker => "worker",
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(AgentRole::Coordinator),
            "worker" => Ok(AgentRole::Worker),
            _ => Err(Error::Validation(format!("unknown agent role: {s}"))),
        }
    }
}

/// Agent availability states. `offline` is terminal; re-entering the system
/// is a new registration.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            _ => Err(Error::Validation(format!("unknown agent status: {s}"))),
        }
    }
}

/// Workspace lifecycle states. `merged` and `abandoned` are terminal.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Merged,
    Abandoned,
}

impl WorkspaceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Merged => "merged",
            WorkspaceStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkspaceStatus::Active)
    }

    pub fn can_transition_to(self, new_status: WorkspaceStatus) -> bool {
        matches!(
            (self, new_status),
            (WorkspaceStatus::Active, WorkspaceStatus::Merged)
                | (WorkspaceStatus::Active, WorkspaceStatus::Abandoned)
        )
    }
}

impl std::str::FromStr for WorkspaceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkspaceStatus::Active),
            "merged" => Ok(WorkspaceStatus::Merged),
            "abandoned" => Ok(WorkspaceStatus::Abandoned),
            _ => Err(Error::Validation(format!("unknown workspace status: {s}"))),
        }
    }
}

/// Message urgency levels
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for MessagePriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(MessagePriority::Low),
            "normal" => Ok(MessagePriority::Normal),
            "high" => Ok(MessagePriority::High),
            "urgent" => Ok(MessagePriority::Urgent),
            _ => Err(Error::Validation(format!("unknown message priority: {s}"))),
        }
    }
}

/// Message read states
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Read,
    Archived,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Unread => "unread",
            MessageStatus::Read => "read",
            MessageStatus::Archived => "archived",
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(MessageStatus::Unread),
            "read" => Ok(MessageStatus::Read),
            "archived" => Ok(MessageStatus::Archived),
            _ => Err(Error::Validation(format!("unknown message status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// The unit of planning: a named plan owning a DAG of tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    /// Where the workflow came from (`issue`, `prompt`, `template`, ...)
    pub source_type: String,
    pub source_ref: Option<String>,
    pub source_content: Option<String>,
    pub status: WorkflowStatus,
    pub plan_summary: Option<String>,
    /// Snapshot of the plan applied by `set_plan`, kept for templating
    pub initial_plan: Option<PlanInput>,
    pub max_parallel_tasks: i64,
    pub auto_create_workspaces: bool,
    pub config: JsonMap,
    /// Advisory lock holder; may dangle after the session deregisters
    pub locked_by_session_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single unit of work inside a workflow.
///
/// `assigned_agent_id` and `claimed_at` are either both null or both set;
/// the claim is the authoritative mutual exclusion for task work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub workflow_id: String,
    /// Unique within the workflow
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    /// 1-based, contiguous within the workflow at every transaction boundary
    pub sequence: i64,
    pub parallel_group: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub plan: Option<String>,
    pub outcome: Option<String>,
    pub outcome_detail: Option<String>,
    pub workspace_id: Option<String>,
    pub repository_id: Option<String>,
    pub context: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Directed dependency edge: `task_id` depends on `depends_on_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDependency {
    pub task_id: String,
    pub depends_on_id: String,
    pub dependency_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

/// Append-only progress record attached to a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    /// Monotonic per task, 1-based, contiguous
    pub sequence: i64,
    pub checkpoint_type: CheckpointType,
    pub summary: String,
    pub detail: Option<JsonMap>,
    pub files_changed: Option<Vec<String>>,
    pub tokens_used: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A connected executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub workflow_id: Option<String>,
    pub name: String,
    /// Opaque runtime tag (e.g. which coding agent binary is driving)
    pub runtime: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub current_task_id: Option<String>,
    pub workspace_path: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A process identity; the only thing that may hold a workflow lock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub pid: i64,
    pub is_daemon: bool,
    pub metadata: JsonMap,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A branch-scoped working area tasks check their changes into
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: String,
    pub workflow_id: String,
    pub repository_id: Option<String>,
    pub path: String,
    pub branch: String,
    pub base_branch: String,
    pub status: WorkspaceStatus,
    /// Required once status is `merged`
    pub merge_commit: Option<String>,
    pub pr_url: Option<String>,
    pub config: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An inter-agent communication. `sender_id` is null for system messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender_id: Option<String>,
    pub recipient_id: String,
    pub message_type: String,
    pub subject: Option<String>,
    pub body: String,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    /// Correlation id shared by a message and all its replies
    pub thread_id: String,
    pub reply_to_id: Option<String>,
    pub workflow_id: Option<String>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Reusable plan prototype
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTemplate {
    pub id: String,
    /// Unique across the store
    pub name: String,
    pub description: Option<String>,
    pub template: crate::plan::TemplateDefinition,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registered source location, keyed by path
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: String,
    pub path: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Service inputs
// ---------------------------------------------------------------------------

/// Parameters for creating a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateWorkflow {
    pub name: String,
    pub source_type: String,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub source_content: Option<String>,
    #[serde(default)]
    pub max_parallel_tasks: Option<i64>,
    #[serde(default)]
    pub auto_create_workspaces: Option<bool>,
    #[serde(default)]
    pub config: Option<JsonMap>,
    /// Paths auto-registered (idempotently) and joined to the workflow
    #[serde(default)]
    pub repository_paths: Vec<String>,
}

/// Filter for listing workflows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFilter {
    #[serde(default)]
    pub repository_id: Option<String>,
    /// One or more statuses; an explicit empty set matches nothing
    #[serde(default)]
    pub statuses: Option<Vec<WorkflowStatus>>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// Parameters for inserting a task into an existing plan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddTaskInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parallel_group: Option<String>,
    /// Task ids or names within the same workflow
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Insert after this task (id or name); appended when absent
    #[serde(default)]
    pub after_task: Option<String>,
    #[serde(default)]
    pub context: Option<JsonMap>,
}

/// Parameters for registering an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub runtime: String,
    #[serde(default)]
    pub role: Option<AgentRole>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
}

/// Partial agent update. `metadata` shallow-merges; `capabilities` replaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    /// `Some(None)` clears the current task reference
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Option<String>>,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
}

/// Filter for listing agents; an explicit empty status set matches nothing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    #[serde(default)]
    pub status: Option<Vec<AgentStatus>>,
    #[serde(default)]
    pub role: Option<AgentRole>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

/// Parameters for sending a message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub sender_id: Option<String>,
    pub recipient_id: String,
    pub message_type: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub priority: Option<MessagePriority>,
    /// Thread is inherited from this message when set
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Recipient selection for a broadcast; an explicit empty status set
/// resolves to zero recipients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientFilter {
    #[serde(default)]
    pub role: Option<AgentRole>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub status: Option<Vec<AgentStatus>>,
}

/// Parameters for broadcasting one message to many agents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastInput {
    pub sender_id: String,
    #[serde(default)]
    pub recipient_filter: RecipientFilter,
    pub message_type: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub priority: Option<MessagePriority>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// Filter for a recipient's message list; explicit empty sets match nothing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFilter {
    #[serde(default)]
    pub status: Option<Vec<MessageStatus>>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub priority: Option<Vec<MessagePriority>>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Parameters for appending a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCheckpoint {
    pub checkpoint_type: CheckpointType,
    pub summary: String,
    #[serde(default)]
    pub detail: Option<JsonMap>,
    #[serde(default)]
    pub files_changed: Option<Vec<String>>,
    #[serde(default)]
    pub tokens_used: Option<i64>,
}

/// Filter for listing checkpoints; an explicit empty type set matches nothing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointFilter {
    #[serde(default)]
    pub types: Option<Vec<CheckpointType>>,
    #[serde(default)]
    pub since_sequence: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Parameters for creating a workspace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewWorkspace {
    pub workflow_id: String,
    pub path: String,
    pub branch: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Tasks to assign to the new workspace; a missing task aborts
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub repository_id: Option<String>,
    /// Alternative to `repository_id`; registered idempotently by path
    #[serde(default)]
    pub repository_path: Option<String>,
    #[serde(default)]
    pub config: Option<JsonMap>,
}

/// Partial workspace update; moving to `merged` requires a merge commit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceUpdate {
    #[serde(default)]
    pub status: Option<WorkspaceStatus>,
    #[serde(default)]
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub config: Option<JsonMap>,
}

/// Parameters for registering a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    pub pid: i64,
    #[serde(default)]
    pub is_daemon: bool,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
}

/// Parameters for creating a template: exactly one source must be provided
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub from_workflow_id: Option<String>,
    #[serde(default)]
    pub template: Option<crate::plan::TemplateDefinition>,
}

/// Parameters for instantiating a template into a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyTemplate {
    pub workflow_name: String,
    #[serde(default)]
    pub variables: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<i64>,
}

/// Output format for workflow summaries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryFormat {
    Json,
    #[default]
    Markdown,
}

// ---------------------------------------------------------------------------
// Service outputs
// ---------------------------------------------------------------------------

/// A workflow together with its (optionally included) tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub workflow: Workflow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
}

/// Summary projection used by workflow listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub source_type: String,
    pub status: WorkflowStatus,
    pub plan_summary: Option<String>,
    pub max_parallel_tasks: i64,
    pub task_count: i64,
    pub completed_task_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Page of workflow summaries plus the pre-pagination row count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowList {
    pub workflows: Vec<WorkflowSummary>,
    pub total: i64,
}

/// Result of applying a plan to a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanApplied {
    pub tasks_created: usize,
    /// Distinct non-null parallel group tags in the plan
    pub parallelizable_groups: Vec<String>,
    pub status: WorkflowStatus,
}

/// Rendered workflow summary plus its token estimate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummaryDoc {
    pub summary: String,
    pub token_estimate: usize,
}

/// Result of removing a task from a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveTaskOutcome {
    pub removed_task_id: String,
    pub dependencies_rewired: usize,
    pub tasks_renumbered: usize,
}

/// Result of a workflow replan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanOutcome {
    pub tasks_added: usize,
    pub tasks_removed: usize,
    pub tasks_preserved: usize,
    pub new_status: WorkflowStatus,
}

/// A task plus its (optionally included) checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoints: Option<Vec<Checkpoint>>,
}

/// A dependency edge endpoint enriched with the peer task's name and status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRef {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub dependency_type: DependencyType,
}

/// Both directions of a task's dependency edges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDependencies {
    pub dependencies: Vec<DependencyRef>,
    pub dependents: Vec<DependencyRef>,
}

/// Partition of a task's blocking predecessors by completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyCheck {
    pub satisfied: bool,
    pub pending: Vec<DependencyRef>,
    pub completed: Vec<DependencyRef>,
}

/// Result of a claim attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_claimed_by: Option<String>,
}

/// Result of replanning a single task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReplanOutcome {
    pub task: Task,
    pub checkpoint_id: String,
}

/// A schedulable task enriched for agent consumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextTask {
    #[serde(flatten)]
    pub task: Task,
    pub can_parallelize: bool,
    /// Ids of other tasks sharing the same non-null parallel group
    pub parallel_with: Vec<String>,
    /// Names of completed or skipped blocking predecessors
    pub dependencies_completed: Vec<String>,
}

/// The scheduler's answer to "what's next?"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextTasks {
    pub tasks: Vec<NextTask>,
    pub max_parallel: i64,
    pub recommended_count: usize,
    pub workflow_status: WorkflowStatus,
    pub all_complete: bool,
}

/// A blocked task with the names of the predecessors it waits on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: String,
    pub name: String,
    pub sequence: i64,
    pub waiting_on: Vec<String>,
}

/// Completion rollup for one parallel group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroupProgress {
    pub task_count: i64,
    pub completed: i64,
}

/// Workflow progress report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub total_tasks: i64,
    pub by_status: std::collections::BTreeMap<String, i64>,
    /// Highest sequence S with every task at sequence <= S completed/skipped
    pub completed_sequence: i64,
    /// Lowest sequence with any non-terminal task, 0 when none
    pub current_sequence: i64,
    pub blocked_tasks: Vec<BlockedTask>,
    pub parallel_groups: std::collections::BTreeMap<String, ParallelGroupProgress>,
    /// Count of non-terminal tasks
    pub estimated_remaining: i64,
}

/// Result of unregistering an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterOutcome {
    pub success: bool,
    pub tasks_released: u64,
}

/// Result of a broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    pub sent_count: usize,
    pub thread_id: String,
    pub message_ids: Vec<String>,
}

/// Unread message counts for an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCount {
    pub count: i64,
    pub by_priority: std::collections::BTreeMap<String, i64>,
}

/// Result of a lock attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
}

/// Current lock holder information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub locked: bool,
    pub session_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Looked up via LEFT JOIN so it survives a dangling holder id
    pub session_pid: Option<i64>,
}

/// Result of instantiating a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub workflow_id: String,
}

// ---------------------------------------------------------------------------
// Context loader types
// ---------------------------------------------------------------------------

/// Section toggles for the context loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInclude {
    #[serde(default = "default_true")]
    pub workflow: bool,
    #[serde(default = "default_true")]
    pub current_task: bool,
    #[serde(default = "default_true")]
    pub prior_tasks: bool,
    #[serde(default = "default_true")]
    pub siblings: bool,
    #[serde(default = "default_true")]
    pub dependencies: bool,
    /// Keep detail on every checkpoint, exempting them from compression
    #[serde(default)]
    pub all_checkpoints: bool,
}

impl Default for ContextInclude {
    fn default() -> Self {
        Self {
            workflow: true,
            current_task: true,
            prior_tasks: true,
            siblings: true,
            dependencies: true,
            all_checkpoints: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Options for assembling a task context bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOptions {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub include: ContextInclude,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            include: ContextInclude::default(),
        }
    }
}

fn default_max_tokens() -> usize {
    8000
}

/// Workflow section of a context bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    /// Possibly-truncated `source_content`
    pub source_summary: Option<String>,
    pub plan_summary: Option<String>,
}

/// A completed task summarized for context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorTaskContext {
    pub task_id: String,
    pub name: String,
    pub sequence: i64,
    pub outcome: Option<String>,
}

/// A parallel-group sibling summarized for context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingTaskContext {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<String>,
}

/// A completed blocking predecessor with its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyOutcome {
    pub task_id: String,
    pub name: String,
    pub outcome: Option<String>,
}

/// Token-bounded context bundle for an agent opening a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_tasks: Option<Vec<PriorTaskContext>>,
    /// Absent when the task has no parallel group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sibling_tasks: Option<Vec<SiblingTaskContext>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_outcomes: Option<Vec<DependencyOutcome>>,
    pub token_estimate: usize,
}

// Serde helper distinguishing "absent" from "explicitly null" for fields
// like `current_task_id` where null means "clear".
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
