//! Workflow Orchestration Core Library
//!
//! This crate provides the foundational domain models, status machines, and
//! shared utilities for the workflow orchestration system. All other crates
//! depend on the types defined here.
//!
//! # Architecture
//!
//! - [`models`] - Core domain models (Workflow, Task, Agent, Message, ...)
//! - [`plan`] - Plan and template definitions shared by planning operations
//! - [`error`] - Error taxonomy and result handling
//! - [`ids`] - Prefixed opaque identifier generation and validation
//! - [`events`] - Process-wide event bus with after-commit emission
//! - [`tokens`] - Token estimation for agent-facing summaries
//! - [`validation`] - Field and plan validation utilities

pub mod error;
pub mod events;
pub mod ids;
pub mod models;
pub mod plan;
pub mod tokens;
pub mod validation;

// Re-export commonly used types at the crate root for convenience
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventType};
pub use ids::IdKind;
pub use models::{
    Agent, AgentRole, AgentStatus, Checkpoint, CheckpointType, DependencyType, Message,
    MessagePriority, MessageStatus, Repository, Session, Task, TaskDependency, TaskStatus,
    Workflow, WorkflowStatus, WorkflowTemplate, Workspace, WorkspaceStatus,
};
pub use plan::{PlanInput, PlanTask, TemplateDefinition, TemplateTask};
pub use validation::Validate;

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_re_exports() {
        let status = TaskStatus::Pending;
        assert_eq!(status.as_str(), "pending");

        let error = Error::not_found("workflow", "wf_000000000000");
        assert!(error.is_not_found());
    }
}
