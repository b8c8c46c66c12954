// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runplane-core.
//!
//! Every error carries a stable code so callers (API layers, workers) can
//! react without matching on message text, and a transient classification so
//! background loops know whether to retry.

use thiserror::Error;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the run state machine, services, and storage.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found in storage.
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Workspace was not found in storage.
    #[error("Workspace '{workspace_id}' not found")]
    WorkspaceNotFound {
        /// The workspace ID that was not found.
        workspace_id: String,
    },

    /// Requested state change is not reachable from the run's current status.
    #[error("Run '{run_id}' cannot move from '{from}' to '{to}': {reason}")]
    InvalidTransition {
        /// The run ID.
        run_id: String,
        /// Current status of the run.
        from: String,
        /// Requested target status.
        to: String,
        /// Human readable explanation.
        reason: String,
    },

    /// Another actor changed the resource first.
    #[error("Conflict on {resource} '{id}': {reason}")]
    Conflict {
        /// Resource type ("run" or "workspace").
        resource: &'static str,
        /// Resource ID.
        id: String,
        /// What collided.
        reason: String,
    },

    /// Workspace is locked by a different holder.
    #[error("Workspace '{workspace_id}' is locked by {holder}")]
    WorkspaceLocked {
        /// The workspace ID.
        workspace_id: String,
        /// Description of the current lock holder.
        holder: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A hook listener refused the operation.
    #[error("Rejected by hook: {0}")]
    HookRejected(String),

    /// Storage could not be reached. Callers should retry.
    #[error("Storage unavailable during '{operation}': {details}")]
    StorageUnavailable {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::WorkspaceNotFound { .. } => "WORKSPACE_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Conflict { .. } => "CONFLICT",
            Self::WorkspaceLocked { .. } => "WORKSPACE_LOCKED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::HookRejected(_) => "HOOK_REJECTED",
            Self::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }

    /// Whether this is a benign race with another actor.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub(crate) fn unavailable(operation: &str, details: impl ToString) -> Self {
        Self::StorageUnavailable {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => CoreError::StorageUnavailable {
                operation: "query".to_string(),
                details: err.to_string(),
            },
            other => CoreError::Database {
                operation: "query".to_string(),
                details: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
