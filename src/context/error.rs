// src/context/error.rs
// Typed errors for context operations. Boundary layers map these onto
// protocol-level failures (HTTP status codes, MCP tool errors).

use thiserror::Error;

use crate::context::types::ContextLevel;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContextError {
    #[error("Context not found: {level} '{context_id}'")]
    NotFound {
        level: ContextLevel,
        context_id: String,
    },

    #[error("Context already exists: {level} '{context_id}'")]
    AlreadyExists {
        level: ContextLevel,
        context_id: String,
    },

    #[error("Invalid context level: '{0}'")]
    InvalidLevel(String),

    #[error("Invalid delegation target: cannot delegate from {from_level} to {target}")]
    InvalidDelegationTarget {
        from_level: ContextLevel,
        target: ContextLevel,
    },

    #[error("Inheritance cycle detected at {level} '{context_id}'")]
    InheritanceCycle {
        level: ContextLevel,
        context_id: String,
    },

    #[error("Concurrent modification of {level} '{context_id}' (expected version {expected})")]
    ConcurrentModification {
        level: ContextLevel,
        context_id: String,
        expected: i64,
    },

    #[error("Unknown batch operation type: '{0}'")]
    UnknownOperationType(String),

    #[error("Context operation failed: {0}")]
    Operation(String),
}

impl From<sqlx::Error> for ContextError {
    fn from(e: sqlx::Error) -> Self {
        ContextError::Operation(e.to_string())
    }
}

impl From<serde_json::Error> for ContextError {
    fn from(e: serde_json::Error) -> Self {
        ContextError::Operation(e.to_string())
    }
}

pub type ContextResult<T> = Result<T, ContextError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ContextError::NotFound {
            level: ContextLevel::Task,
            context_id: "t-1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("task"));
        assert!(msg.contains("t-1"));
    }

    #[test]
    fn test_concurrent_modification_display() {
        let err = ContextError::ConcurrentModification {
            level: ContextLevel::Project,
            context_id: "p-1".into(),
            expected: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("Concurrent modification"));
        assert!(msg.contains("version 4"));
    }

    #[test]
    fn test_delegation_target_display() {
        let err = ContextError::InvalidDelegationTarget {
            from_level: ContextLevel::Branch,
            target: ContextLevel::Task,
        };
        let msg = err.to_string();
        assert!(msg.contains("branch"));
        assert!(msg.contains("task"));
    }
}
