// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runplane-scheduler.

use runplane_core::CoreError;
use thiserror::Error;

/// Scheduler errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Workspace lock could not be queried or changed.
    #[error("Lock error for workspace '{workspace_id}': {details}")]
    Lock {
        /// Workspace the lock belongs to.
        workspace_id: String,
        /// Error details.
        details: String,
    },
}

impl Error {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Core(err) => err.error_code(),
            Self::Lock { .. } => "LOCK_ERROR",
        }
    }

    /// Whether the failure is expected to clear up on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(_) | Self::Lock { .. } => true,
            Self::Core(err) => err.is_transient(),
            Self::Config(_) | Self::Json(_) => false,
        }
    }
}

/// Result type using the scheduler Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_keep_their_code() {
        let err: Error = CoreError::RunNotFound {
            run_id: "run-1".to_string(),
        }
        .into();
        assert_eq!(err.error_code(), "RUN_NOT_FOUND");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let lock = Error::Lock {
            workspace_id: "ws-1".to_string(),
            details: "connection reset".to_string(),
        };
        assert!(lock.is_transient());
        assert!(Error::from(sqlx::Error::PoolTimedOut).is_transient());
    }
}
