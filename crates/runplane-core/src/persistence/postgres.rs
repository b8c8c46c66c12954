// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for runs and workspaces.
//!
//! Run updates and their workspace side effects share one transaction, and
//! every run write is guarded by the status the caller read. Two processes
//! racing to dispatch runs of the same workspace therefore serialize on the
//! workspace row and the loser gets a conflict.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use super::{Store, WorkspaceEffect};
use crate::error::{CoreError, Result};
use crate::ids;
use crate::run::{ResourceReport, Run, RunStatus, StatusTimestamp};
use crate::workspace::{LockHolder, Workspace};

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new Postgres-backed store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct WorkspaceRow {
    workspace_id: String,
    name: String,
    current_run_id: Option<String>,
    lock_kind: Option<String>,
    lock_holder: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = CoreError;

    fn try_from(row: WorkspaceRow) -> Result<Self> {
        Ok(Workspace {
            lock: LockHolder::from_parts(row.lock_kind.as_deref(), row.lock_holder.as_deref())?,
            id: row.workspace_id,
            name: row.name,
            current_run_id: row.current_run_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: String,
    workspace_id: String,
    status: String,
    speculative: bool,
    auto_apply: bool,
    cancel_requested: bool,
    checks_pending: bool,
    message: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
    status_timestamps: Json<Vec<StatusTimestamp>>,
    plan_report: Option<Json<ResourceReport>>,
    apply_report: Option<Json<ResourceReport>>,
    error: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Run {
            status: row.status.parse()?,
            id: row.run_id,
            workspace_id: row.workspace_id,
            speculative: row.speculative,
            auto_apply: row.auto_apply,
            cancel_requested: row.cancel_requested,
            checks_pending: row.checks_pending,
            message: row.message,
            created_by: row.created_by,
            created_at: row.created_at,
            status_timestamps: row.status_timestamps.0,
            plan_report: row.plan_report.map(|r| r.0),
            apply_report: row.apply_report.map(|r| r.0),
            error: row.error,
        })
    }
}

fn lock_columns(lock: Option<&LockHolder>) -> (Option<&'static str>, Option<&str>) {
    match lock.map(LockHolder::to_parts) {
        Some((kind, holder)) => (Some(kind), holder),
        None => (None, None),
    }
}

fn map_insert_error(err: sqlx::Error, resource: &'static str, id: &str, parent: &str) -> CoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_foreign_key_violation() {
            return CoreError::WorkspaceNotFound {
                workspace_id: parent.to_string(),
            };
        }
        if db.is_unique_violation() {
            return CoreError::Conflict {
                resource,
                id: id.to_string(),
                reason: db.message().to_string(),
            };
        }
    }
    CoreError::from(err)
}

// ============================================================================
// Workspace Operations
// ============================================================================

/// Insert a new workspace.
pub async fn create_workspace(pool: &PgPool, workspace: &Workspace) -> Result<Workspace> {
    let (lock_kind, lock_holder) = lock_columns(workspace.lock.as_ref());
    sqlx::query(
        r#"
        INSERT INTO workspaces (workspace_id, name, current_run_id, lock_kind, lock_holder, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&workspace.id)
    .bind(&workspace.name)
    .bind(&workspace.current_run_id)
    .bind(lock_kind)
    .bind(lock_holder)
    .bind(workspace.created_at)
    .bind(workspace.updated_at)
    .execute(pool)
    .await
    .map_err(|err| map_insert_error(err, "workspace", &workspace.id, &workspace.id))?;

    Ok(workspace.clone())
}

/// Fetch a workspace by ID.
pub async fn get_workspace(pool: &PgPool, workspace_id: &str) -> Result<Workspace> {
    let row = sqlx::query_as::<_, WorkspaceRow>(
        r#"
        SELECT workspace_id, name, current_run_id, lock_kind, lock_holder, created_at, updated_at
        FROM workspaces
        WHERE workspace_id = $1
        "#,
    )
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;

    row.ok_or_else(|| CoreError::WorkspaceNotFound {
        workspace_id: workspace_id.to_string(),
    })?
    .try_into()
}

async fn workspace_exists(pool: &PgPool, workspace_id: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM workspaces WHERE workspace_id = $1)")
            .bind(workspace_id)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

/// Compare-and-set the workspace lock.
pub async fn update_workspace_lock(
    pool: &PgPool,
    workspace_id: &str,
    expected: Option<&LockHolder>,
    lock: Option<&LockHolder>,
) -> Result<Workspace> {
    let (expected_kind, expected_holder) = lock_columns(expected);
    let (lock_kind, lock_holder) = lock_columns(lock);

    let row = sqlx::query_as::<_, WorkspaceRow>(
        r#"
        UPDATE workspaces
        SET lock_kind = $4,
            lock_holder = $5,
            updated_at = $6
        WHERE workspace_id = $1
          AND lock_kind IS NOT DISTINCT FROM $2
          AND lock_holder IS NOT DISTINCT FROM $3
        RETURNING workspace_id, name, current_run_id, lock_kind, lock_holder, created_at, updated_at
        "#,
    )
    .bind(workspace_id)
    .bind(expected_kind)
    .bind(expected_holder)
    .bind(lock_kind)
    .bind(lock_holder)
    .bind(ids::current_timestamp())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row.try_into(),
        None if workspace_exists(pool, workspace_id).await? => Err(CoreError::Conflict {
            resource: "workspace",
            id: workspace_id.to_string(),
            reason: "lock changed concurrently".to_string(),
        }),
        None => Err(CoreError::WorkspaceNotFound {
            workspace_id: workspace_id.to_string(),
        }),
    }
}

/// Delete a workspace that has no unfinished runs.
pub async fn delete_workspace(pool: &PgPool, workspace_id: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        DELETE FROM workspaces w
        WHERE w.workspace_id = $1
          AND NOT EXISTS (
              SELECT 1 FROM runs r
              WHERE r.workspace_id = w.workspace_id
                AND r.status NOT IN ('applied', 'discarded', 'errored', 'canceled')
          )
        "#,
    )
    .bind(workspace_id)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }
    if workspace_exists(pool, workspace_id).await? {
        return Err(CoreError::Conflict {
            resource: "workspace",
            id: workspace_id.to_string(),
            reason: "workspace has unfinished runs".to_string(),
        });
    }
    Err(CoreError::WorkspaceNotFound {
        workspace_id: workspace_id.to_string(),
    })
}

/// Overwrite the current-run reference.
pub async fn set_workspace_current_run(
    pool: &PgPool,
    workspace_id: &str,
    run_id: Option<&str>,
) -> Result<Workspace> {
    let row = sqlx::query_as::<_, WorkspaceRow>(
        r#"
        UPDATE workspaces
        SET current_run_id = $2,
            updated_at = $3
        WHERE workspace_id = $1
        RETURNING workspace_id, name, current_run_id, lock_kind, lock_holder, created_at, updated_at
        "#,
    )
    .bind(workspace_id)
    .bind(run_id)
    .bind(ids::current_timestamp())
    .fetch_optional(pool)
    .await?;

    row.ok_or_else(|| CoreError::WorkspaceNotFound {
        workspace_id: workspace_id.to_string(),
    })?
    .try_into()
}

/// Clear the current-run reference and run lock if they still point at `run_id`.
pub async fn release_workspace_run(
    pool: &PgPool,
    workspace_id: &str,
    run_id: &str,
) -> Result<Workspace> {
    let row = sqlx::query_as::<_, WorkspaceRow>(
        r#"
        UPDATE workspaces
        SET current_run_id = CASE WHEN current_run_id = $2 THEN NULL ELSE current_run_id END,
            lock_kind = CASE WHEN lock_kind = 'run' AND lock_holder = $2 THEN NULL ELSE lock_kind END,
            lock_holder = CASE WHEN lock_kind = 'run' AND lock_holder = $2 THEN NULL ELSE lock_holder END,
            updated_at = CASE
                WHEN current_run_id = $2 OR (lock_kind = 'run' AND lock_holder = $2) THEN $3
                ELSE updated_at
            END
        WHERE workspace_id = $1
        RETURNING workspace_id, name, current_run_id, lock_kind, lock_holder, created_at, updated_at
        "#,
    )
    .bind(workspace_id)
    .bind(run_id)
    .bind(ids::current_timestamp())
    .fetch_optional(pool)
    .await?;

    row.ok_or_else(|| CoreError::WorkspaceNotFound {
        workspace_id: workspace_id.to_string(),
    })?
    .try_into()
}

// ============================================================================
// Run Operations
// ============================================================================

/// Insert a new run.
pub async fn create_run(pool: &PgPool, run: &Run) -> Result<Run> {
    sqlx::query(
        r#"
        INSERT INTO runs (
            run_id, workspace_id, status, speculative, auto_apply, cancel_requested,
            checks_pending, message, created_by, created_at, status_timestamps,
            plan_report, apply_report, error
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(&run.id)
    .bind(&run.workspace_id)
    .bind(run.status.as_str())
    .bind(run.speculative)
    .bind(run.auto_apply)
    .bind(run.cancel_requested)
    .bind(run.checks_pending)
    .bind(&run.message)
    .bind(&run.created_by)
    .bind(run.created_at)
    .bind(Json(&run.status_timestamps))
    .bind(run.plan_report.map(Json))
    .bind(run.apply_report.map(Json))
    .bind(&run.error)
    .execute(pool)
    .await
    .map_err(|err| map_insert_error(err, "run", &run.id, &run.workspace_id))?;

    Ok(run.clone())
}

/// Fetch a run by ID.
pub async fn get_run(pool: &PgPool, run_id: &str) -> Result<Run> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT run_id, workspace_id, status, speculative, auto_apply, cancel_requested,
               checks_pending, message, created_by, created_at, status_timestamps, plan_report, apply_report, error
        FROM runs
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    row.ok_or_else(|| CoreError::RunNotFound {
        run_id: run_id.to_string(),
    })?
    .try_into()
}

/// Unfinished runs of a workspace, oldest first.
pub async fn load_non_terminal_runs(pool: &PgPool, workspace_id: &str) -> Result<Vec<Run>> {
    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT run_id, workspace_id, status, speculative, auto_apply, cancel_requested,
               checks_pending, message, created_by, created_at, status_timestamps, plan_report, apply_report, error
        FROM runs
        WHERE workspace_id = $1
          AND status NOT IN ('applied', 'discarded', 'errored', 'canceled')
        ORDER BY created_at, run_id
        "#,
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Run::try_from).collect()
}

/// Workspaces with at least one unfinished run.
pub async fn list_active_workspaces(pool: &PgPool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT DISTINCT workspace_id
        FROM runs
        WHERE status NOT IN ('applied', 'discarded', 'errored', 'canceled')
        ORDER BY workspace_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Persist a run transition together with its workspace effect.
pub async fn update_run(
    pool: &PgPool,
    run: &Run,
    expected: RunStatus,
    effect: WorkspaceEffect,
) -> Result<Run> {
    let mut tx = pool.begin().await?;
    let now = ids::current_timestamp();

    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = $2,
            cancel_requested = $3,
            checks_pending = $4,
            status_timestamps = $5,
            plan_report = $6,
            apply_report = $7,
            error = $8
        WHERE run_id = $1 AND status = $9
        "#,
    )
    .bind(&run.id)
    .bind(run.status.as_str())
    .bind(run.cancel_requested)
    .bind(run.checks_pending)
    .bind(Json(&run.status_timestamps))
    .bind(run.plan_report.map(Json))
    .bind(run.apply_report.map(Json))
    .bind(&run.error)
    .bind(expected.as_str())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT status FROM runs WHERE run_id = $1")
                .bind(&run.id)
                .fetch_optional(&mut *tx)
                .await?;
        return Err(match stored {
            Some(status) => CoreError::Conflict {
                resource: "run",
                id: run.id.clone(),
                reason: format!("expected status '{}' but found '{}'", expected, status),
            },
            None => CoreError::RunNotFound {
                run_id: run.id.clone(),
            },
        });
    }

    match effect {
        WorkspaceEffect::None => {}
        WorkspaceEffect::Dispatch { take_lock } => {
            let result = sqlx::query(
                r#"
                UPDATE workspaces
                SET current_run_id = $2,
                    lock_kind = CASE WHEN $3 AND lock_kind IS NULL THEN 'run' ELSE lock_kind END,
                    lock_holder = CASE WHEN $3 AND lock_kind IS NULL THEN $2 ELSE lock_holder END,
                    updated_at = $4
                WHERE workspace_id = $1
                  AND (current_run_id IS NULL OR current_run_id = $2)
                  AND (NOT $3 OR lock_kind IS NULL OR (lock_kind = 'run' AND lock_holder = $2))
                "#,
            )
            .bind(&run.workspace_id)
            .bind(&run.id)
            .bind(take_lock)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                let current: Option<(Option<String>, Option<String>, Option<String>)> =
                    sqlx::query_as(
                        "SELECT current_run_id, lock_kind, lock_holder FROM workspaces WHERE workspace_id = $1",
                    )
                    .bind(&run.workspace_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                return Err(match current {
                    None => CoreError::WorkspaceNotFound {
                        workspace_id: run.workspace_id.clone(),
                    },
                    Some((Some(current), _, _)) if current != run.id => CoreError::Conflict {
                        resource: "workspace",
                        id: run.workspace_id.clone(),
                        reason: format!("run '{}' is already current", current),
                    },
                    Some((_, kind, holder)) => CoreError::Conflict {
                        resource: "workspace",
                        id: run.workspace_id.clone(),
                        reason: format!(
                            "workspace is locked by {}",
                            LockHolder::from_parts(kind.as_deref(), holder.as_deref())?
                                .map(|h| h.to_string())
                                .unwrap_or_else(|| "unknown holder".to_string())
                        ),
                    },
                });
            }
        }
        WorkspaceEffect::Release => {
            sqlx::query(
                r#"
                UPDATE workspaces
                SET current_run_id = CASE WHEN current_run_id = $2 THEN NULL ELSE current_run_id END,
                    lock_kind = CASE WHEN lock_kind = 'run' AND lock_holder = $2 THEN NULL ELSE lock_kind END,
                    lock_holder = CASE WHEN lock_kind = 'run' AND lock_holder = $2 THEN NULL ELSE lock_holder END,
                    updated_at = $3
                WHERE workspace_id = $1
                "#,
            )
            .bind(&run.workspace_id)
            .bind(&run.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(run.clone())
}

// ============================================================================
// Store Implementation
// ============================================================================

#[async_trait]
impl Store for PostgresStore {
    async fn create_workspace(&self, workspace: &Workspace) -> Result<Workspace> {
        create_workspace(&self.pool, workspace).await
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        get_workspace(&self.pool, workspace_id).await
    }

    async fn update_workspace_lock(
        &self,
        workspace_id: &str,
        expected: Option<&LockHolder>,
        lock: Option<&LockHolder>,
    ) -> Result<Workspace> {
        update_workspace_lock(&self.pool, workspace_id, expected, lock).await
    }

    async fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        delete_workspace(&self.pool, workspace_id).await
    }

    async fn set_workspace_current_run(
        &self,
        workspace_id: &str,
        run_id: Option<&str>,
    ) -> Result<Workspace> {
        set_workspace_current_run(&self.pool, workspace_id, run_id).await
    }

    async fn release_workspace_run(&self, workspace_id: &str, run_id: &str) -> Result<Workspace> {
        release_workspace_run(&self.pool, workspace_id, run_id).await
    }

    async fn create_run(&self, run: &Run) -> Result<Run> {
        create_run(&self.pool, run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        get_run(&self.pool, run_id).await
    }

    async fn load_non_terminal_runs(&self, workspace_id: &str) -> Result<Vec<Run>> {
        load_non_terminal_runs(&self.pool, workspace_id).await
    }

    async fn list_active_workspaces(&self) -> Result<Vec<String>> {
        list_active_workspaces(&self.pool).await
    }

    async fn update_run(
        &self,
        run: &Run,
        expected: RunStatus,
        effect: WorkspaceEffect,
    ) -> Result<Run> {
        update_run(&self.pool, run, expected, effect).await
    }
}
