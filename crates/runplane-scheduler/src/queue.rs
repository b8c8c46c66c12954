// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-workspace run queue.
//!
//! The queue caches the workspace's non-terminal runs in creation order and
//! decides which one becomes the current run. The cache is never trusted on
//! its own: [`RunQueue::reconcile`] rebuilds it from storage, and every
//! dispatch goes through a guarded store write that rejects a second
//! current run.
//!
//! Reconciliation also records an automatic post-plan step (discard or
//! auto-apply) that a crash or outage left unwritten, so a finished plan
//! never keeps the workspace occupied.

use std::sync::Arc;

use runplane_core::{
    CoreError, Event, EventAction, LockHolder, Run, RunService, RunStatus, Workspace,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Run currently occupying the workspace.
    pub current_run: Option<String>,
    /// Runs waiting for dispatch, oldest first.
    pub pending: Vec<String>,
}

/// Ordered set of non-terminal runs for one workspace.
pub struct RunQueue {
    workspace_id: String,
    runs: Arc<RunService>,
    workspace: Option<Workspace>,
    active: Vec<Run>,
}

impl RunQueue {
    /// Create an empty queue. Call [`RunQueue::reconcile`] to seed it.
    pub fn new(workspace_id: impl Into<String>, runs: Arc<RunService>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            runs,
            workspace: None,
            active: Vec::new(),
        }
    }

    /// Workspace this queue serves.
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Whether the workspace has no non-terminal runs left.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Current run and pending runs.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current_run: self
                .workspace
                .as_ref()
                .and_then(|ws| ws.current_run_id.clone()),
            pending: self
                .active
                .iter()
                .filter(|run| run.status == RunStatus::Pending)
                .map(|run| run.id.clone())
                .collect(),
        }
    }

    /// Reload the workspace and its runs from storage, then dispatch if possible.
    pub async fn reconcile(&mut self) -> Result<Option<Run>> {
        self.seed().await?;
        self.settle_plans().await?;
        self.evaluate().await
    }

    /// Fold an event into the cache, then dispatch if possible.
    ///
    /// Events for other workspaces are ignored. Duplicate or stale
    /// snapshots never move a cached run backwards.
    pub async fn handle_event(&mut self, event: &Event) -> Result<Option<Run>> {
        if event.workspace_id() != self.workspace_id {
            return Ok(None);
        }

        if let Some(run) = event.as_run() {
            self.upsert(run.clone());
        } else if let Some(ws) = event.as_workspace() {
            if event.action == EventAction::Deleted {
                debug!(workspace_id = %self.workspace_id, "Workspace deleted; clearing queue");
                self.workspace = None;
                self.active.clear();
                return Ok(None);
            }
            match self.workspace.as_ref() {
                Some(cached) if cached.updated_at > ws.updated_at => {
                    debug!(
                        workspace_id = %self.workspace_id,
                        "Ignoring stale workspace snapshot"
                    );
                }
                _ => self.workspace = Some(ws.clone()),
            }
        }

        self.evaluate().await
    }

    async fn seed(&mut self) -> Result<()> {
        let store = self.runs.store();
        self.workspace = match store.get_workspace(&self.workspace_id).await {
            Ok(ws) => Some(ws),
            Err(CoreError::WorkspaceNotFound { .. }) => None,
            Err(err) => return Err(err.into()),
        };
        self.active = match self.workspace {
            Some(_) => store.load_non_terminal_runs(&self.workspace_id).await?,
            None => Vec::new(),
        };
        self.sort();
        Ok(())
    }

    /// Take the post-plan step for runs whose plan was saved without it.
    async fn settle_plans(&mut self) -> Result<()> {
        let due: Vec<String> = self
            .active
            .iter()
            .filter(|run| run.post_plan_step_due())
            .map(|run| run.id.clone())
            .collect();
        for run_id in due {
            let run = self.runs.settle_plan(&run_id).await?;
            info!(
                workspace_id = %self.workspace_id,
                run_id = %run.id,
                status = %run.status,
                "Settled finished plan"
            );
            self.upsert(run);
        }
        Ok(())
    }

    fn sort(&mut self) {
        self.active
            .sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    }

    fn upsert(&mut self, run: Run) {
        if run.status.is_terminal() {
            self.active.retain(|r| r.id != run.id);
            if let Some(ws) = self.workspace.as_mut() {
                if ws.current_run_id.as_deref() == Some(run.id.as_str()) {
                    ws.current_run_id = None;
                }
                if ws.lock == Some(LockHolder::Run(run.id.clone())) {
                    ws.lock = None;
                }
            }
            return;
        }

        match self.active.iter_mut().find(|r| r.id == run.id) {
            Some(cached) if run.supersedes(cached) => *cached = run,
            Some(_) => {}
            None => {
                self.active.push(run);
                self.sort();
            }
        }
    }

    /// Mirror a successful dispatch locally.
    fn dispatched(&mut self, run: &Run) {
        if let Some(ws) = self.workspace.as_mut() {
            ws.current_run_id = Some(run.id.clone());
            if !run.speculative && ws.lock.is_none() {
                ws.lock = Some(LockHolder::Run(run.id.clone()));
            }
        }
        self.upsert(run.clone());
    }

    /// Clear a current-run reference that no longer points at an active run.
    ///
    /// Returns `false` when the referenced run is still active and the
    /// workspace stays occupied.
    async fn clear_stale_current(&mut self, run_id: &str) -> Result<bool> {
        match self.runs.get_run(run_id).await {
            Ok(run) if run.workspace_id == self.workspace_id && !run.status.is_terminal() => {
                self.upsert(run);
                return Ok(false);
            }
            Ok(_) | Err(CoreError::RunNotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        warn!(
            workspace_id = %self.workspace_id,
            run_id,
            "Clearing stale current run"
        );
        // Only clears if the reference still points at this run.
        let ws = self
            .runs
            .store()
            .release_workspace_run(&self.workspace_id, run_id)
            .await?;
        self.workspace = Some(ws);
        Ok(true)
    }

    /// Dispatch the next run if the workspace is free.
    async fn evaluate(&mut self) -> Result<Option<Run>> {
        loop {
            let Some(ws) = self.workspace.as_ref() else {
                return Ok(None);
            };

            // A dispatched, unfinished run occupies the workspace.
            if self.active.iter().any(|r| r.status != RunStatus::Pending) {
                return Ok(None);
            }

            let manually_locked = ws.is_manually_locked();
            let candidate = match ws.current_run_id.clone() {
                Some(current) => match self.active.iter().find(|r| r.id == current) {
                    Some(run) => run.clone(),
                    None => {
                        if self.clear_stale_current(&current).await? {
                            continue;
                        }
                        return Ok(None);
                    }
                },
                None => match self
                    .active
                    .iter()
                    .find(|r| r.speculative || !manually_locked)
                {
                    Some(run) => run.clone(),
                    None => return Ok(None),
                },
            };
            if !candidate.speculative && manually_locked {
                debug!(
                    workspace_id = %self.workspace_id,
                    run_id = %candidate.id,
                    "Workspace manually locked; holding run"
                );
                return Ok(None);
            }

            match self.runs.dispatch(&candidate.id).await {
                Ok(run) => {
                    self.dispatched(&run);
                    let ws = self.runs.store().get_workspace(&self.workspace_id).await?;
                    self.workspace = Some(ws);
                    if run.status.is_terminal() {
                        continue;
                    }
                    info!(
                        workspace_id = %self.workspace_id,
                        run_id = %run.id,
                        status = %run.status,
                        "Run dispatched"
                    );
                    return Ok(Some(run));
                }
                Err(err) if err.is_conflict() => {
                    debug!(
                        workspace_id = %self.workspace_id,
                        run_id = %candidate.id,
                        error = %err,
                        "Dispatch lost a race; reloading queue"
                    );
                    self.seed().await?;
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
