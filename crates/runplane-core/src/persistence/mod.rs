// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for runplane-core.
//!
//! Storage is the only owner of durable run and workspace state. Everything
//! the scheduler keeps in memory must be rebuildable from these operations.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::run::{Run, RunStatus};
use crate::workspace::{LockHolder, Workspace};

/// Change applied to the owning workspace in the same transaction as a run update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceEffect {
    /// Leave the workspace untouched.
    None,
    /// Make the run the workspace's current run.
    ///
    /// Fails with a conflict when another run is already current. With
    /// `take_lock`, the run also takes the workspace lock, which must be free.
    Dispatch {
        /// Take the workspace lock for the run.
        take_lock: bool,
    },
    /// Clear the current-run reference and run lock if they point at this run.
    Release,
}

/// Storage collaborator used by the services and the scheduler.
///
/// Every method may fail with [`CoreError::StorageUnavailable`](crate::CoreError::StorageUnavailable),
/// which callers treat as transient.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new workspace. Names are unique.
    async fn create_workspace(&self, workspace: &Workspace) -> Result<Workspace>;

    /// Fetch a workspace by ID.
    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace>;

    /// Replace the workspace lock if it still equals `expected`.
    async fn update_workspace_lock(
        &self,
        workspace_id: &str,
        expected: Option<&LockHolder>,
        lock: Option<&LockHolder>,
    ) -> Result<Workspace>;

    /// Delete a workspace and its finished runs.
    ///
    /// Fails with a conflict while the workspace has non-terminal runs.
    async fn delete_workspace(&self, workspace_id: &str) -> Result<()>;

    /// Overwrite the current-run reference.
    async fn set_workspace_current_run(
        &self,
        workspace_id: &str,
        run_id: Option<&str>,
    ) -> Result<Workspace>;

    /// Clear the current-run reference and run lock if they still point at `run_id`.
    ///
    /// Leaves a workspace that has moved on to another run untouched and
    /// returns it as stored.
    async fn release_workspace_run(&self, workspace_id: &str, run_id: &str) -> Result<Workspace>;

    /// Insert a new run. The workspace must exist.
    async fn create_run(&self, run: &Run) -> Result<Run>;

    /// Fetch a run by ID.
    async fn get_run(&self, run_id: &str) -> Result<Run>;

    /// Non-terminal runs of a workspace, oldest first (creation time, then ID).
    async fn load_non_terminal_runs(&self, workspace_id: &str) -> Result<Vec<Run>>;

    /// IDs of workspaces with at least one non-terminal run.
    async fn list_active_workspaces(&self) -> Result<Vec<String>>;

    /// Persist `run` if its stored status is still `expected`, applying `effect`
    /// to the workspace in the same transaction.
    async fn update_run(
        &self,
        run: &Run,
        expected: RunStatus,
        effect: WorkspaceEffect,
    ) -> Result<Run>;
}
