// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run record and its lifecycle state machine.
//!
//! # Status graph
//!
//! ```text
//! pending ─► plan_queued ─► planning ─► planned ─┬─► cost_estimated ─┬─► policy_checking ─┐
//!                                                │                   │                    │
//!                                                ├───────────────────┴────────────────────┤
//!                                                │                                        ▼
//!                                                │                  apply_queued ─► applying ─► applied*
//!                                                └─► discarded*
//!
//! any non-terminal status ─► errored* | canceled*
//! ```
//!
//! Transitions are computed by [`Run::advance`], which is pure: it returns the
//! next version of the run (or reports that nothing changes) and leaves
//! persistence to the caller. Re-applying an input whose target status was
//! already reached is a no-op so that duplicate event delivery is harmless.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::ids;
use crate::subject::Subject;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for the workspace to become free.
    Pending,
    /// Dispatched; waiting for a worker to start planning.
    PlanQueued,
    /// A worker is producing the plan.
    Planning,
    /// Plan finished.
    Planned,
    /// Cost estimation finished.
    CostEstimated,
    /// Policy checks are running.
    PolicyChecking,
    /// Apply confirmed; waiting for a worker to start applying.
    ApplyQueued,
    /// A worker is applying the plan.
    Applying,
    /// Apply finished.
    Applied,
    /// Plan was not applied.
    Discarded,
    /// Execution failed.
    Errored,
    /// Run was canceled.
    Canceled,
}

impl RunStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [RunStatus; 12] = [
        RunStatus::Pending,
        RunStatus::PlanQueued,
        RunStatus::Planning,
        RunStatus::Planned,
        RunStatus::CostEstimated,
        RunStatus::PolicyChecking,
        RunStatus::ApplyQueued,
        RunStatus::Applying,
        RunStatus::Applied,
        RunStatus::Discarded,
        RunStatus::Errored,
        RunStatus::Canceled,
    ];

    /// Statuses from which no further transition occurs.
    pub const TERMINAL: [RunStatus; 4] = [
        RunStatus::Applied,
        RunStatus::Discarded,
        RunStatus::Errored,
        RunStatus::Canceled,
    ];

    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::PlanQueued => "plan_queued",
            RunStatus::Planning => "planning",
            RunStatus::Planned => "planned",
            RunStatus::CostEstimated => "cost_estimated",
            RunStatus::PolicyChecking => "policy_checking",
            RunStatus::ApplyQueued => "apply_queued",
            RunStatus::Applying => "applying",
            RunStatus::Applied => "applied",
            RunStatus::Discarded => "discarded",
            RunStatus::Errored => "errored",
            RunStatus::Canceled => "canceled",
        }
    }

    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Whether the run is waiting for a worker to pick it up.
    pub fn is_queued(&self) -> bool {
        matches!(self, RunStatus::PlanQueued | RunStatus::ApplyQueued)
    }

    /// Whether a worker may be executing (or about to execute) the run.
    pub fn is_executing(&self) -> bool {
        matches!(
            self,
            RunStatus::PlanQueued | RunStatus::Planning | RunStatus::ApplyQueued | RunStatus::Applying
        )
    }

    /// Whether the plan is finished and the apply decision is outstanding.
    pub fn awaits_decision(&self) -> bool {
        matches!(
            self,
            RunStatus::Planned | RunStatus::CostEstimated | RunStatus::PolicyChecking
        )
    }

    /// Whether `to` is an edge of the status graph starting at `self`.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(to, Errored | Canceled) {
            return true;
        }
        matches!(
            (*self, to),
            (Pending, PlanQueued)
                | (PlanQueued, Planning)
                | (Planning, Planned)
                | (Planned, CostEstimated)
                | (Planned, PolicyChecking)
                | (CostEstimated, PolicyChecking)
                | (Planned | CostEstimated | PolicyChecking, ApplyQueued)
                | (Planned | CostEstimated | PolicyChecking, Discarded)
                | (ApplyQueued, Applying)
                | (Applying, Applied)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation {
                field: "status".to_string(),
                message: format!("unknown run status '{}'", s),
            })
    }
}

/// Summary of resource additions, changes, and destructions in a plan or apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    /// Resources to be created.
    pub additions: u32,
    /// Resources to be modified in place.
    pub changes: u32,
    /// Resources to be destroyed.
    pub destructions: u32,
}

impl ResourceReport {
    /// Whether anything would change.
    pub fn has_changes(&self) -> bool {
        self.additions > 0 || self.changes > 0 || self.destructions > 0
    }
}

/// When a run entered a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTimestamp {
    /// Status entered.
    pub status: RunStatus,
    /// When it was entered.
    pub timestamp: DateTime<Utc>,
}

/// Options for creating a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRunOptions {
    /// Workspace the run belongs to.
    pub workspace_id: String,
    /// Plan-only run; never applies.
    pub speculative: bool,
    /// Apply without a separate confirmation when the plan has changes.
    pub auto_apply: bool,
    /// Optional free-form description.
    pub message: Option<String>,
}

/// One plan/apply execution attempt against a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run ID (`run-…`).
    pub id: String,
    /// Owning workspace; immutable after creation.
    pub workspace_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Plan-only run.
    pub speculative: bool,
    /// Apply without confirmation when the plan has changes.
    pub auto_apply: bool,
    /// Set once cancellation was requested.
    pub cancel_requested: bool,
    /// The plan finished with cost or policy checks still to come.
    #[serde(default)]
    pub checks_pending: bool,
    /// Optional free-form description.
    pub message: Option<String>,
    /// Subject that created the run.
    pub created_by: String,
    /// Creation time; dispatch order within a workspace.
    pub created_at: DateTime<Utc>,
    /// Every status entered, oldest first.
    pub status_timestamps: Vec<StatusTimestamp>,
    /// Plan resource summary.
    pub plan_report: Option<ResourceReport>,
    /// Apply resource summary.
    pub apply_report: Option<ResourceReport>,
    /// Error summary reported by the worker.
    pub error: Option<String>,
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunInput {
    /// The queue made this run the workspace's current run.
    Dispatch,
    /// A worker started the plan phase.
    PlanStarted,
    /// A worker finished the plan phase.
    PlanCompleted {
        /// Resource summary of the plan.
        report: ResourceReport,
        /// Cost estimation or policy checks will follow; defer the apply decision.
        checks_pending: bool,
    },
    /// Cost estimation finished.
    CostEstimated,
    /// Policy checks started.
    PolicyCheckStarted,
    /// All post-plan checks finished; take the apply decision.
    ChecksCompleted,
    /// A user confirmed the apply.
    ConfirmApply,
    /// A user declined the apply.
    Discard,
    /// A worker started the apply phase.
    ApplyStarted,
    /// A worker finished the apply phase.
    ApplyCompleted {
        /// Resource summary of the apply.
        report: ResourceReport,
    },
    /// A worker reported an execution failure.
    Failed {
        /// Error summary.
        error: String,
    },
    /// Cancellation was requested.
    Cancel,
}

impl RunInput {
    /// Requests that come from a user rather than from a worker or the queue.
    pub fn is_external_request(&self) -> bool {
        matches!(
            self,
            RunInput::ConfirmApply | RunInput::Discard | RunInput::Cancel
        )
    }

    fn target(&self) -> Option<RunStatus> {
        match self {
            RunInput::Dispatch => Some(RunStatus::PlanQueued),
            RunInput::PlanStarted => Some(RunStatus::Planning),
            RunInput::PlanCompleted { .. } => Some(RunStatus::Planned),
            RunInput::CostEstimated => Some(RunStatus::CostEstimated),
            RunInput::PolicyCheckStarted => Some(RunStatus::PolicyChecking),
            RunInput::ChecksCompleted => None,
            RunInput::ConfirmApply => Some(RunStatus::ApplyQueued),
            RunInput::Discard => Some(RunStatus::Discarded),
            RunInput::ApplyStarted => Some(RunStatus::Applying),
            RunInput::ApplyCompleted { .. } => Some(RunStatus::Applied),
            RunInput::Failed { .. } => Some(RunStatus::Errored),
            RunInput::Cancel => Some(RunStatus::Canceled),
        }
    }
}

/// Outcome of applying an input to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Nothing to do: duplicate delivery, stale report, or no automatic step.
    Unchanged,
    /// The run moves to a new status.
    Moved(Run),
}

impl Run {
    /// Construct a new pending run.
    pub fn new(opts: CreateRunOptions, created_by: &Subject) -> Self {
        let created_at = ids::current_timestamp();
        Self {
            id: ids::new_id("run"),
            workspace_id: opts.workspace_id,
            status: RunStatus::Pending,
            speculative: opts.speculative,
            auto_apply: opts.auto_apply,
            cancel_requested: false,
            checks_pending: false,
            message: opts.message,
            created_by: created_by.to_string(),
            created_at,
            status_timestamps: vec![StatusTimestamp {
                status: RunStatus::Pending,
                timestamp: created_at,
            }],
            plan_report: None,
            apply_report: None,
            error: None,
        }
    }

    /// Whether the run ever entered `status`.
    pub fn reached(&self, status: RunStatus) -> bool {
        self.status_timestamps.iter().any(|st| st.status == status)
    }

    /// When the run entered `status`, if it did.
    pub fn status_timestamp(&self, status: RunStatus) -> Option<DateTime<Utc>> {
        self.status_timestamps
            .iter()
            .find(|st| st.status == status)
            .map(|st| st.timestamp)
    }

    /// Whether this snapshot is at least as recent as `other`.
    ///
    /// Status only moves forward, so the snapshot with the longer history wins.
    pub fn supersedes(&self, other: &Run) -> bool {
        self.status_timestamps.len() >= other.status_timestamps.len()
    }

    /// The automatic step taken once the plan and any checks are done.
    ///
    /// Returns `None` when the run waits for an explicit confirmation.
    pub fn post_plan_target(&self) -> Option<RunStatus> {
        let has_changes = self.plan_report.is_some_and(|r| r.has_changes());
        if self.speculative || !has_changes {
            Some(RunStatus::Discarded)
        } else if self.auto_apply {
            Some(RunStatus::ApplyQueued)
        } else {
            None
        }
    }

    /// Whether the automatic post-plan step is due but not yet recorded.
    ///
    /// True for a finished plan with no checks outstanding whose outcome is
    /// decided without a user (discard, or auto-apply).
    pub fn post_plan_step_due(&self) -> bool {
        self.status.awaits_decision() && !self.checks_pending && self.post_plan_target().is_some()
    }

    /// Compute the effect of `input` on this run.
    pub fn advance(&self, input: &RunInput, now: DateTime<Utc>) -> Result<Advance> {
        let target = match input.target() {
            Some(target) => target,
            None => return self.advance_after_checks(now),
        };

        if self.reached(target) {
            return Ok(Advance::Unchanged);
        }

        if self.status.is_terminal() {
            if input.is_external_request() {
                return Err(self.invalid(target, non_able_reason(input)));
            }
            return Ok(Advance::Unchanged);
        }

        if *input == RunInput::ConfirmApply {
            if self.speculative {
                return Err(self.invalid(target, "speculative runs cannot be applied"));
            }
            if self.status.awaits_decision() && !self.plan_report.is_some_and(|r| r.has_changes())
            {
                return Err(self.invalid(target, "plan has no changes to apply"));
            }
        }

        if !self.status.can_transition_to(target) {
            return Err(self.invalid(target, "not reachable from the current status"));
        }

        let mut next = self.clone();
        next.status = target;
        next.status_timestamps.push(StatusTimestamp {
            status: target,
            timestamp: now,
        });
        match input {
            RunInput::PlanCompleted {
                report,
                checks_pending,
            } => {
                next.plan_report = Some(*report);
                next.checks_pending = *checks_pending;
            }
            RunInput::ApplyCompleted { report } => next.apply_report = Some(*report),
            RunInput::Failed { error } => next.error = Some(error.clone()),
            RunInput::Cancel => next.cancel_requested = true,
            _ => {}
        }
        Ok(Advance::Moved(next))
    }

    fn advance_after_checks(&self, now: DateTime<Utc>) -> Result<Advance> {
        if !self.status.awaits_decision() {
            if self.status.is_terminal() || self.reached(RunStatus::Planned) {
                return Ok(Advance::Unchanged);
            }
            return Err(self.invalid(RunStatus::Planned, "plan has not completed"));
        }
        match self.post_plan_target() {
            Some(RunStatus::Discarded) => self.advance(&RunInput::Discard, now),
            Some(_) => self.advance(&RunInput::ConfirmApply, now),
            None => Ok(Advance::Unchanged),
        }
    }

    fn invalid(&self, to: RunStatus, reason: &str) -> CoreError {
        CoreError::InvalidTransition {
            run_id: self.id.clone(),
            from: self.status.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn non_able_reason(input: &RunInput) -> &'static str {
    match input {
        RunInput::Cancel => "run already has a current, non-cancelable status",
        RunInput::ConfirmApply => "run already has a current, non-confirmable status",
        _ => "run already has a current, non-discardable status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_run(speculative: bool, auto_apply: bool) -> Run {
        Run::new(
            CreateRunOptions {
                workspace_id: "ws-test".to_string(),
                speculative,
                auto_apply,
                message: None,
            },
            &Subject::user("alice"),
        )
    }

    fn step(run: &Run, input: RunInput) -> Run {
        match run.advance(&input, ids::current_timestamp()).unwrap() {
            Advance::Moved(next) => next,
            Advance::Unchanged => panic!("expected {:?} to move run in {}", input, run.status),
        }
    }

    fn planned(run: &Run, report: ResourceReport, checks_pending: bool) -> Run {
        let run = step(run, RunInput::Dispatch);
        let run = step(&run, RunInput::PlanStarted);
        step(
            &run,
            RunInput::PlanCompleted {
                report,
                checks_pending,
            },
        )
    }

    fn changes() -> ResourceReport {
        ResourceReport {
            additions: 2,
            changes: 1,
            destructions: 0,
        }
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses_have_no_edges() {
        for from in RunStatus::TERMINAL {
            for to in RunStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_every_non_terminal_status_can_fail_or_cancel() {
        for from in RunStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(RunStatus::Errored));
            assert!(from.can_transition_to(RunStatus::Canceled));
        }
    }

    #[test]
    fn test_full_confirmed_lifecycle() {
        let run = planned(&pending_run(false, false), changes(), false);
        assert_eq!(run.status, RunStatus::Planned);
        assert_eq!(run.post_plan_target(), None);

        let run = step(&run, RunInput::ConfirmApply);
        let run = step(&run, RunInput::ApplyStarted);
        let run = step(
            &run,
            RunInput::ApplyCompleted {
                report: changes(),
            },
        );
        assert_eq!(run.status, RunStatus::Applied);
        assert_eq!(run.apply_report, Some(changes()));
        let order: Vec<RunStatus> = run.status_timestamps.iter().map(|s| s.status).collect();
        assert_eq!(
            order,
            vec![
                RunStatus::Pending,
                RunStatus::PlanQueued,
                RunStatus::Planning,
                RunStatus::Planned,
                RunStatus::ApplyQueued,
                RunStatus::Applying,
                RunStatus::Applied,
            ]
        );
    }

    #[test]
    fn test_duplicate_input_is_noop() {
        let run = step(&pending_run(false, false), RunInput::Dispatch);
        assert_eq!(
            run.advance(&RunInput::Dispatch, ids::current_timestamp())
                .unwrap(),
            Advance::Unchanged
        );
        let run = step(&run, RunInput::PlanStarted);
        assert_eq!(
            run.advance(&RunInput::Dispatch, ids::current_timestamp())
                .unwrap(),
            Advance::Unchanged
        );
    }

    #[test]
    fn test_out_of_graph_transition_rejected() {
        let run = pending_run(false, false);
        let err = run
            .advance(&RunInput::ApplyStarted, ids::current_timestamp())
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
    }

    #[test]
    fn test_speculative_plan_is_discarded_even_with_auto_apply() {
        let run = planned(&pending_run(true, true), changes(), false);
        assert_eq!(run.post_plan_target(), Some(RunStatus::Discarded));
        let run = step(&run, RunInput::ChecksCompleted);
        assert_eq!(run.status, RunStatus::Discarded);
        assert!(!run.reached(RunStatus::ApplyQueued));
    }

    #[test]
    fn test_speculative_confirm_rejected() {
        let run = planned(&pending_run(true, false), changes(), true);
        assert!(
            run.advance(&RunInput::ConfirmApply, ids::current_timestamp())
                .is_err()
        );
    }

    #[test]
    fn test_auto_apply_with_changes_queues_apply() {
        let run = planned(&pending_run(false, true), changes(), false);
        assert_eq!(run.post_plan_target(), Some(RunStatus::ApplyQueued));
        let run = step(&run, RunInput::ChecksCompleted);
        assert_eq!(run.status, RunStatus::ApplyQueued);
    }

    #[test]
    fn test_no_changes_discards() {
        let run = planned(&pending_run(false, true), ResourceReport::default(), false);
        assert_eq!(run.post_plan_target(), Some(RunStatus::Discarded));
    }

    #[test]
    fn test_optional_check_stages() {
        let run = planned(&pending_run(false, true), changes(), true);
        let run = step(&run, RunInput::CostEstimated);
        let run = step(&run, RunInput::PolicyCheckStarted);
        assert_eq!(run.status, RunStatus::PolicyChecking);
        let run = step(&run, RunInput::ChecksCompleted);
        assert_eq!(run.status, RunStatus::ApplyQueued);
        assert_eq!(
            run.advance(&RunInput::ChecksCompleted, ids::current_timestamp())
                .unwrap(),
            Advance::Unchanged
        );
    }

    #[test]
    fn test_post_plan_step_due() {
        let discard = planned(&pending_run(false, false), ResourceReport::default(), false);
        assert!(discard.post_plan_step_due());
        assert!(planned(&pending_run(false, true), changes(), false).post_plan_step_due());

        // Waits for a user.
        assert!(!planned(&pending_run(false, false), changes(), false).post_plan_step_due());
        // Waits for the checks.
        let checking = planned(&pending_run(false, true), changes(), true);
        assert!(checking.checks_pending);
        assert!(!checking.post_plan_step_due());
        assert!(!step(&checking, RunInput::CostEstimated).post_plan_step_due());

        assert!(!step(&discard, RunInput::ChecksCompleted).post_plan_step_due());
    }

    #[test]
    fn test_cancel_during_planning_then_late_report_is_noop() {
        let run = step(&pending_run(false, false), RunInput::Dispatch);
        let run = step(&run, RunInput::PlanStarted);
        let run = step(&run, RunInput::Cancel);
        assert_eq!(run.status, RunStatus::Canceled);
        assert!(run.cancel_requested);

        let late = run
            .advance(
                &RunInput::PlanCompleted {
                    report: changes(),
                    checks_pending: false,
                },
                ids::current_timestamp(),
            )
            .unwrap();
        assert_eq!(late, Advance::Unchanged);
        assert_eq!(
            run.advance(&RunInput::Cancel, ids::current_timestamp())
                .unwrap(),
            Advance::Unchanged
        );
    }

    #[test]
    fn test_cancel_after_apply_rejected() {
        let run = planned(&pending_run(false, true), changes(), false);
        let run = step(&run, RunInput::ChecksCompleted);
        let run = step(&run, RunInput::ApplyStarted);
        let run = step(
            &run,
            RunInput::ApplyCompleted {
                report: changes(),
            },
        );
        let err = run
            .advance(&RunInput::Cancel, ids::current_timestamp())
            .unwrap_err();
        assert!(err.to_string().contains("non-cancelable"));
    }

    #[test]
    fn test_failure_records_error() {
        let run = step(&pending_run(false, false), RunInput::Dispatch);
        let run = step(
            &run,
            RunInput::Failed {
                error: "provider crashed".to_string(),
            },
        );
        assert_eq!(run.status, RunStatus::Errored);
        assert_eq!(run.error.as_deref(), Some("provider crashed"));
    }

    #[test]
    fn test_supersedes_prefers_longer_history() {
        let old = pending_run(false, false);
        let new = step(&old, RunInput::Dispatch);
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
    }
}
