// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run operations: creation, worker reports, and user decisions.
//!
//! Each successful transition is persisted first, then published on the
//! event bus. A publish never undoes the write.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::event::{Event, EventAction, EventBus};
use crate::hooks::{Hook, HookListener};
use crate::ids;
use crate::persistence::{Store, WorkspaceEffect};
use crate::run::{Advance, CreateRunOptions, Run, RunInput, RunStatus};
use crate::subject::Subject;

/// How many times an optimistic write is retried after another actor moved the run.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Performs state-changing run operations and publishes their events.
pub struct RunService {
    store: Arc<dyn Store>,
    bus: EventBus,
    create_hook: Hook<Run>,
}

impl RunService {
    /// Create a service writing to `store` and publishing on `bus`.
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            create_hook: Hook::default(),
        }
    }

    /// Register a listener around run creation.
    pub fn with_create_listener(mut self, listener: Arc<dyn HookListener<Run>>) -> Self {
        self.create_hook.register(listener);
        self
    }

    /// Storage collaborator.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Event bus runs are published on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Create a pending run in an existing workspace.
    pub async fn create_run(&self, subject: &Subject, opts: CreateRunOptions) -> Result<Run> {
        self.store.get_workspace(&opts.workspace_id).await?;

        let store = Arc::clone(&self.store);
        let run = self
            .create_hook
            .dispatch(Run::new(opts, subject), |run| async move {
                store.create_run(&run).await
            })
            .await?;

        info!(
            run_id = %run.id,
            workspace_id = %run.workspace_id,
            speculative = run.speculative,
            auto_apply = run.auto_apply,
            subject = %subject,
            "Run created"
        );
        self.bus.publish(Event::run(EventAction::Created, run.clone()));
        Ok(run)
    }

    /// Fetch a run.
    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store.get_run(run_id).await
    }

    /// Make a pending run its workspace's current run.
    ///
    /// Called by the run queue that owns the workspace. Fails with a conflict
    /// when another run is already current.
    pub async fn dispatch(&self, run_id: &str) -> Result<Run> {
        self.apply(&Subject::system(), run_id, RunInput::Dispatch)
            .await
    }

    /// Apply a phase report from an execution agent.
    pub async fn report(&self, subject: &Subject, run_id: &str, input: RunInput) -> Result<Run> {
        if input.is_external_request() || input == RunInput::Dispatch {
            return Err(CoreError::Validation {
                field: "input".to_string(),
                message: format!("{:?} is not a worker report", input),
            });
        }
        self.apply(subject, run_id, input).await
    }

    /// Confirm the apply of a planned run.
    pub async fn confirm_apply(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.apply(subject, run_id, RunInput::ConfirmApply).await
    }

    /// Decline the apply of a planned run.
    pub async fn discard(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.apply(subject, run_id, RunInput::Discard).await
    }

    /// Cancel a run. Advisory to a worker that is still executing it.
    pub async fn cancel(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.apply(subject, run_id, RunInput::Cancel).await
    }

    /// Record the automatic post-plan step (discard or auto-apply) if it is due.
    ///
    /// Normally taken right after the plan completes. The run queue calls this
    /// on reconciliation to finish a run whose plan was saved without it.
    pub async fn settle_plan(&self, run_id: &str) -> Result<Run> {
        let run = self.store.get_run(run_id).await?;
        if !run.post_plan_step_due() {
            return Ok(run);
        }
        self.apply_with_retry(&Subject::system(), run_id, &RunInput::ChecksCompleted)
            .await
    }

    async fn apply(&self, subject: &Subject, run_id: &str, input: RunInput) -> Result<Run> {
        let run = self.apply_with_retry(subject, run_id, &input).await?;

        // Without pending checks the apply decision follows the plan immediately.
        if matches!(input, RunInput::PlanCompleted { .. }) && run.status == RunStatus::Planned {
            return self.settle_plan(run_id).await;
        }
        Ok(run)
    }

    async fn apply_with_retry(
        &self,
        subject: &Subject,
        run_id: &str,
        input: &RunInput,
    ) -> Result<Run> {
        let mut attempt = 0;
        loop {
            let current = self.store.get_run(run_id).await?;
            match self.transition(subject, &current, input).await {
                Err(CoreError::Conflict {
                    resource: "run",
                    reason,
                    ..
                }) if attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(run_id, attempt, %reason, "Run changed concurrently; retrying");
                }
                other => return other,
            }
        }
    }

    async fn transition(&self, subject: &Subject, current: &Run, input: &RunInput) -> Result<Run> {
        let next = match current.advance(input, ids::current_timestamp())? {
            Advance::Unchanged => {
                debug!(
                    run_id = %current.id,
                    status = %current.status,
                    ?input,
                    "Input already applied or not actionable"
                );
                return Ok(current.clone());
            }
            Advance::Moved(next) => next,
        };

        let effect = if *input == RunInput::Dispatch {
            WorkspaceEffect::Dispatch {
                take_lock: !next.speculative,
            }
        } else if next.status.is_terminal() {
            WorkspaceEffect::Release
        } else {
            WorkspaceEffect::None
        };

        let saved = self.store.update_run(&next, current.status, effect).await?;

        info!(
            run_id = %saved.id,
            workspace_id = %saved.workspace_id,
            from = %current.status,
            status = %saved.status,
            subject = %subject,
            "Run status changed"
        );

        self.bus.publish(Event::run(EventAction::Updated, saved.clone()));
        if effect != WorkspaceEffect::None {
            self.publish_workspace(&saved.workspace_id).await;
        }
        if saved.status.is_queued() {
            self.bus.publish(Event::run(EventAction::Ready, saved.clone()));
        }
        Ok(saved)
    }

    /// Announce the workspace after a run took or released it.
    async fn publish_workspace(&self, workspace_id: &str) {
        match self.store.get_workspace(workspace_id).await {
            Ok(ws) => {
                self.bus.publish(Event::workspace(EventAction::Updated, ws));
            }
            Err(e) => warn!(
                workspace_id,
                error = %e,
                "Failed to load workspace for its update event"
            ),
        }
    }
}
