use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the orchestration core.
///
/// Services raise these directly; the HTTP adapter maps each kind to a
/// status code via [`Error::status_code`]. Transactions roll back whenever a
/// service call returns an error, so partial mutations are never visible.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Required field missing, out of range, malformed, duplicate name in a
    /// plan, unknown dependency name, or self-dependency
    #[error("validation error: {0}")]
    Validation(String),

    /// Illegal lifecycle transition or an operation applied in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Lock held by another live session, or a unique-constraint collision
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage-level failure or aborted transaction
    #[error("database error: {0}")]
    Database(String),
}

impl Error {
    /// Create a not found error for an entity kind and identifier
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{entity} '{id}' not found"))
    }

    /// Create a validation error for an empty required field
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("field '{field}' cannot be empty"))
    }

    /// Create an invalid-transition error
    pub fn invalid_transition(entity: &str, from: &str, to: &str) -> Self {
        Self::InvalidState(format!("{entity} cannot transition from {from} to {to}"))
    }

    /// Check if this error indicates a not found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error indicates a validation problem
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Check if this error indicates a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Stable machine-readable code used in HTTP error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Validation(_) => "validation",
            Error::InvalidState(_) => "invalid_state",
            Error::Conflict(_) => "conflict",
            Error::Database(_) => "internal",
        }
    }

    /// HTTP status code for this error kind
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Validation(_) => 400,
            Error::InvalidState(_) => 400,
            Error::Conflict(_) => 409,
            Error::Database(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = Error::not_found("task", "tk_0123456789ab");
        assert_eq!(
            error,
            Error::NotFound("task 'tk_0123456789ab' not found".to_string())
        );
        assert!(error.is_not_found());
        assert_eq!(error.status_code(), 404);

        let error = Error::empty_field("name");
        assert!(error.is_validation());
        assert_eq!(error.status_code(), 400);

        let error = Error::invalid_transition("workflow", "completed", "in_progress");
        assert_eq!(error.status_code(), 400);
        assert_eq!(error.code(), "invalid_state");
    }

    #[test]
    fn test_error_display() {
        let error = Error::Validation("max_parallel_tasks must be >= 1".to_string());
        assert_eq!(
            format!("{error}"),
            "validation error: max_parallel_tasks must be >= 1"
        );

        let error = Error::Conflict("template name already exists: deploy".to_string());
        assert_eq!(error.status_code(), 409);
        assert_eq!(error.code(), "conflict");
    }
}
