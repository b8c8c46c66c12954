// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Store, WorkspaceEffect};
use crate::error::{CoreError, Result};
use crate::ids;
use crate::run::{Run, RunStatus};
use crate::workspace::{LockHolder, Workspace};

#[derive(Default)]
struct State {
    workspaces: HashMap<String, Workspace>,
    runs: HashMap<String, Run>,
}

/// [`Store`] kept entirely in process memory.
///
/// [`MemoryStore::set_unavailable`] makes every call fail with
/// `StorageUnavailable`, standing in for a database outage.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`true`) or recovery (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::unavailable(operation, "store is offline"));
        }
        Ok(())
    }
}

fn workspace_not_found(workspace_id: &str) -> CoreError {
    CoreError::WorkspaceNotFound {
        workspace_id: workspace_id.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_workspace(&self, workspace: &Workspace) -> Result<Workspace> {
        self.check("create_workspace")?;
        let mut state = self.state.lock().await;
        if state
            .workspaces
            .values()
            .any(|ws| ws.name == workspace.name || ws.id == workspace.id)
        {
            return Err(CoreError::Conflict {
                resource: "workspace",
                id: workspace.id.clone(),
                reason: format!("workspace name '{}' already taken", workspace.name),
            });
        }
        state
            .workspaces
            .insert(workspace.id.clone(), workspace.clone());
        Ok(workspace.clone())
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.check("get_workspace")?;
        let state = self.state.lock().await;
        state
            .workspaces
            .get(workspace_id)
            .cloned()
            .ok_or_else(|| workspace_not_found(workspace_id))
    }

    async fn update_workspace_lock(
        &self,
        workspace_id: &str,
        expected: Option<&LockHolder>,
        lock: Option<&LockHolder>,
    ) -> Result<Workspace> {
        self.check("update_workspace_lock")?;
        let mut state = self.state.lock().await;
        let ws = state
            .workspaces
            .get_mut(workspace_id)
            .ok_or_else(|| workspace_not_found(workspace_id))?;
        if ws.lock.as_ref() != expected {
            return Err(CoreError::Conflict {
                resource: "workspace",
                id: workspace_id.to_string(),
                reason: "lock changed concurrently".to_string(),
            });
        }
        ws.lock = lock.cloned();
        ws.updated_at = ids::current_timestamp();
        Ok(ws.clone())
    }

    async fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        self.check("delete_workspace")?;
        let mut state = self.state.lock().await;
        if !state.workspaces.contains_key(workspace_id) {
            return Err(workspace_not_found(workspace_id));
        }
        if state
            .runs
            .values()
            .any(|run| run.workspace_id == workspace_id && !run.status.is_terminal())
        {
            return Err(CoreError::Conflict {
                resource: "workspace",
                id: workspace_id.to_string(),
                reason: "workspace has unfinished runs".to_string(),
            });
        }
        state.workspaces.remove(workspace_id);
        state.runs.retain(|_, run| run.workspace_id != workspace_id);
        Ok(())
    }

    async fn set_workspace_current_run(
        &self,
        workspace_id: &str,
        run_id: Option<&str>,
    ) -> Result<Workspace> {
        self.check("set_workspace_current_run")?;
        let mut state = self.state.lock().await;
        let ws = state
            .workspaces
            .get_mut(workspace_id)
            .ok_or_else(|| workspace_not_found(workspace_id))?;
        ws.current_run_id = run_id.map(str::to_string);
        ws.updated_at = ids::current_timestamp();
        Ok(ws.clone())
    }

    async fn release_workspace_run(&self, workspace_id: &str, run_id: &str) -> Result<Workspace> {
        self.check("release_workspace_run")?;
        let mut state = self.state.lock().await;
        let ws = state
            .workspaces
            .get_mut(workspace_id)
            .ok_or_else(|| workspace_not_found(workspace_id))?;
        let mut changed = false;
        if ws.current_run_id.as_deref() == Some(run_id) {
            ws.current_run_id = None;
            changed = true;
        }
        if ws.lock == Some(LockHolder::Run(run_id.to_string())) {
            ws.lock = None;
            changed = true;
        }
        if changed {
            ws.updated_at = ids::current_timestamp();
        }
        Ok(ws.clone())
    }

    async fn create_run(&self, run: &Run) -> Result<Run> {
        self.check("create_run")?;
        let mut state = self.state.lock().await;
        if !state.workspaces.contains_key(&run.workspace_id) {
            return Err(workspace_not_found(&run.workspace_id));
        }
        if state.runs.contains_key(&run.id) {
            return Err(CoreError::Conflict {
                resource: "run",
                id: run.id.clone(),
                reason: "run already exists".to_string(),
            });
        }
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run.clone())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.check("get_run")?;
        let state = self.state.lock().await;
        state
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn load_non_terminal_runs(&self, workspace_id: &str) -> Result<Vec<Run>> {
        self.check("load_non_terminal_runs")?;
        let state = self.state.lock().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|run| run.workspace_id == workspace_id && !run.status.is_terminal())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn list_active_workspaces(&self) -> Result<Vec<String>> {
        self.check("list_active_workspaces")?;
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .map(|run| run.workspace_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn update_run(
        &self,
        run: &Run,
        expected: RunStatus,
        effect: WorkspaceEffect,
    ) -> Result<Run> {
        self.check("update_run")?;
        let mut state = self.state.lock().await;

        let stored = state
            .runs
            .get(&run.id)
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run.id.clone(),
            })?;
        if stored.status != expected {
            return Err(CoreError::Conflict {
                resource: "run",
                id: run.id.clone(),
                reason: format!(
                    "expected status '{}' but found '{}'",
                    expected, stored.status
                ),
            });
        }

        // Validate the workspace change before touching anything.
        let mut ws = state
            .workspaces
            .get(&run.workspace_id)
            .cloned()
            .ok_or_else(|| workspace_not_found(&run.workspace_id))?;
        match effect {
            WorkspaceEffect::None => {}
            WorkspaceEffect::Dispatch { take_lock } => {
                if let Some(current) = ws.current_run_id.as_deref().filter(|id| *id != run.id) {
                    return Err(CoreError::Conflict {
                        resource: "workspace",
                        id: ws.id.clone(),
                        reason: format!("run '{}' is already current", current),
                    });
                }
                let own_lock = LockHolder::Run(run.id.clone());
                if take_lock {
                    match ws.lock.clone() {
                        None => ws.lock = Some(own_lock),
                        Some(holder) if holder == own_lock => {}
                        Some(holder) => {
                            return Err(CoreError::Conflict {
                                resource: "workspace",
                                id: ws.id.clone(),
                                reason: format!("workspace is locked by {}", holder),
                            });
                        }
                    }
                }
                ws.current_run_id = Some(run.id.clone());
                ws.updated_at = ids::current_timestamp();
            }
            WorkspaceEffect::Release => {
                if ws.current_run_id.as_deref() == Some(run.id.as_str()) {
                    ws.current_run_id = None;
                }
                if ws.lock == Some(LockHolder::Run(run.id.clone())) {
                    ws.lock = None;
                }
                ws.updated_at = ids::current_timestamp();
            }
        }

        state.workspaces.insert(ws.id.clone(), ws);
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Advance, CreateRunOptions, RunInput};
    use crate::subject::Subject;

    async fn seeded() -> (MemoryStore, Workspace) {
        let store = MemoryStore::new();
        let ws = store
            .create_workspace(&Workspace::new("dev").unwrap())
            .await
            .unwrap();
        (store, ws)
    }

    async fn new_run(store: &MemoryStore, ws: &Workspace, speculative: bool) -> Run {
        let run = Run::new(
            CreateRunOptions {
                workspace_id: ws.id.clone(),
                speculative,
                ..Default::default()
            },
            &Subject::user("alice"),
        );
        store.create_run(&run).await.unwrap()
    }

    fn dispatched(run: &Run) -> Run {
        match run.advance(&RunInput::Dispatch, ids::current_timestamp()).unwrap() {
            Advance::Moved(next) => next,
            Advance::Unchanged => panic!("dispatch did not move run"),
        }
    }

    #[tokio::test]
    async fn test_second_dispatch_conflicts() {
        let (store, ws) = seeded().await;
        let a = new_run(&store, &ws, false).await;
        let b = new_run(&store, &ws, false).await;

        store
            .update_run(
                &dispatched(&a),
                RunStatus::Pending,
                WorkspaceEffect::Dispatch { take_lock: true },
            )
            .await
            .unwrap();
        let err = store
            .update_run(
                &dispatched(&b),
                RunStatus::Pending,
                WorkspaceEffect::Dispatch { take_lock: true },
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let ws = store.get_workspace(&ws.id).await.unwrap();
        assert_eq!(ws.current_run_id.as_deref(), Some(a.id.as_str()));
        assert_eq!(ws.lock, Some(LockHolder::Run(a.id.clone())));
        assert_eq!(
            store.get_run(&b.id).await.unwrap().status,
            RunStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_stale_expected_status_conflicts() {
        let (store, ws) = seeded().await;
        let run = new_run(&store, &ws, true).await;
        let err = store
            .update_run(&dispatched(&run), RunStatus::Planning, WorkspaceEffect::None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_release_clears_only_own_reference() {
        let (store, ws) = seeded().await;
        let run = new_run(&store, &ws, true).await;
        let run = store
            .update_run(
                &dispatched(&run),
                RunStatus::Pending,
                WorkspaceEffect::Dispatch { take_lock: false },
            )
            .await
            .unwrap();
        let ws_now = store.get_workspace(&ws.id).await.unwrap();
        assert!(ws_now.lock.is_none());
        assert_eq!(ws_now.current_run_id.as_deref(), Some(run.id.as_str()));

        let mut canceled = run.clone();
        canceled.status = RunStatus::Canceled;
        store
            .update_run(&canceled, RunStatus::PlanQueued, WorkspaceEffect::Release)
            .await
            .unwrap();
        assert!(
            store
                .get_workspace(&ws.id)
                .await
                .unwrap()
                .current_run_id
                .is_none()
        );
        assert!(store.list_active_workspaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_workspace_run_requires_matching_run() {
        let (store, ws) = seeded().await;
        let a = new_run(&store, &ws, false).await;
        let b = new_run(&store, &ws, false).await;
        store
            .update_run(
                &dispatched(&b),
                RunStatus::Pending,
                WorkspaceEffect::Dispatch { take_lock: true },
            )
            .await
            .unwrap();

        // A different run is current now; the clear must not touch it.
        let untouched = store.release_workspace_run(&ws.id, &a.id).await.unwrap();
        assert_eq!(untouched.current_run_id.as_deref(), Some(b.id.as_str()));
        assert_eq!(untouched.lock, Some(LockHolder::Run(b.id.clone())));

        let cleared = store.release_workspace_run(&ws.id, &b.id).await.unwrap();
        assert!(cleared.current_run_id.is_none());
        assert!(cleared.lock.is_none());
        assert!(cleared.updated_at > untouched.updated_at);
    }

    #[tokio::test]
    async fn test_dispatch_refused_while_user_locked() {
        let (store, ws) = seeded().await;
        let alice = LockHolder::User("user:alice".to_string());
        store
            .update_workspace_lock(&ws.id, None, Some(&alice))
            .await
            .unwrap();
        let run = new_run(&store, &ws, false).await;
        let err = store
            .update_run(
                &dispatched(&run),
                RunStatus::Pending,
                WorkspaceEffect::Dispatch { take_lock: true },
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_non_terminal_runs_sorted_by_creation() {
        let (store, ws) = seeded().await;
        let first = new_run(&store, &ws, false).await;
        let second = new_run(&store, &ws, false).await;
        let third = new_run(&store, &ws, true).await;
        let ids: Vec<String> = store
            .load_non_terminal_runs(&ws.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
        assert_eq!(store.list_active_workspaces().await.unwrap(), vec![ws.id]);
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let (store, ws) = seeded().await;
        store.set_unavailable(true);
        let err = store.get_workspace(&ws.id).await.unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert!(store.get_workspace(&ws.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_rejected_with_active_runs() {
        let (store, ws) = seeded().await;
        new_run(&store, &ws, false).await;
        assert!(store.delete_workspace(&ws.id).await.unwrap_err().is_conflict());
    }
}
