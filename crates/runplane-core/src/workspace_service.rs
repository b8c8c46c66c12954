// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace operations, including the manual lock.

use std::sync::Arc;

use tracing::info;

use crate::error::{CoreError, Result};
use crate::event::{Event, EventAction, EventBus};
use crate::hooks::{Hook, HookListener};
use crate::persistence::Store;
use crate::subject::Subject;
use crate::workspace::{LockHolder, Workspace};

/// Performs state-changing workspace operations and publishes their events.
pub struct WorkspaceService {
    store: Arc<dyn Store>,
    bus: EventBus,
    create_hook: Hook<Workspace>,
}

impl WorkspaceService {
    /// Create a service writing to `store` and publishing on `bus`.
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            create_hook: Hook::default(),
        }
    }

    /// Register a listener around workspace creation.
    pub fn with_create_listener(mut self, listener: Arc<dyn HookListener<Workspace>>) -> Self {
        self.create_hook.register(listener);
        self
    }

    /// Create an unlocked workspace.
    pub async fn create_workspace(&self, subject: &Subject, name: &str) -> Result<Workspace> {
        let store = Arc::clone(&self.store);
        let workspace = self
            .create_hook
            .dispatch(Workspace::new(name)?, |ws| async move {
                store.create_workspace(&ws).await
            })
            .await?;

        info!(workspace_id = %workspace.id, name = %workspace.name, subject = %subject, "Workspace created");
        self.publish(EventAction::Created, &workspace);
        Ok(workspace)
    }

    /// Fetch a workspace.
    pub async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.store.get_workspace(workspace_id).await
    }

    /// Take the manual lock for `subject`.
    ///
    /// Locking a workspace the subject already holds is a no-op.
    pub async fn lock_workspace(&self, subject: &Subject, workspace_id: &str) -> Result<Workspace> {
        let ws = self.store.get_workspace(workspace_id).await?;
        let holder = ws.lock_for(LockHolder::for_subject(subject))?;
        if ws.lock.as_ref() == Some(&holder) {
            return Ok(ws);
        }

        let ws = self
            .store
            .update_workspace_lock(workspace_id, ws.lock.as_ref(), Some(&holder))
            .await?;
        info!(workspace_id, subject = %subject, "Workspace locked");
        self.publish(EventAction::Updated, &ws);
        Ok(ws)
    }

    /// Remove the manual lock.
    ///
    /// `force` removes a lock held by a different user. A lock held by a run
    /// can never be removed this way.
    pub async fn unlock_workspace(
        &self,
        subject: &Subject,
        workspace_id: &str,
        force: bool,
    ) -> Result<Workspace> {
        let ws = self.store.get_workspace(workspace_id).await?;
        ws.check_unlock(&LockHolder::for_subject(subject), force)?;
        if ws.lock.is_none() {
            return Ok(ws);
        }

        let ws = self
            .store
            .update_workspace_lock(workspace_id, ws.lock.as_ref(), None)
            .await?;
        info!(workspace_id, subject = %subject, force, "Workspace unlocked");
        self.publish(EventAction::Updated, &ws);
        Ok(ws)
    }

    /// Overwrite the current-run reference.
    ///
    /// Administrative escape hatch; the run queue normally owns this field.
    pub async fn set_current_run(
        &self,
        subject: &Subject,
        workspace_id: &str,
        run_id: Option<&str>,
    ) -> Result<Workspace> {
        if let Some(run_id) = run_id {
            let run = self.store.get_run(run_id).await?;
            if run.workspace_id != workspace_id {
                return Err(CoreError::Validation {
                    field: "run_id".to_string(),
                    message: format!(
                        "run '{}' belongs to workspace '{}'",
                        run_id, run.workspace_id
                    ),
                });
            }
        }

        let ws = self
            .store
            .set_workspace_current_run(workspace_id, run_id)
            .await?;
        info!(workspace_id, run_id = ?run_id, subject = %subject, "Workspace current run set");
        self.publish(EventAction::Updated, &ws);
        Ok(ws)
    }

    /// Delete a workspace without unfinished runs.
    pub async fn delete_workspace(&self, subject: &Subject, workspace_id: &str) -> Result<()> {
        let ws = self.store.get_workspace(workspace_id).await?;
        self.store.delete_workspace(workspace_id).await?;
        info!(workspace_id, subject = %subject, "Workspace deleted");
        self.publish(EventAction::Deleted, &ws);
        Ok(())
    }

    fn publish(&self, action: EventAction, workspace: &Workspace) {
        self.bus.publish(Event::workspace(action, workspace.clone()));
    }
}
