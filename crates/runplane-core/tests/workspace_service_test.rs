// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for workspace operations and the manual lock.

mod common;

use common::*;
use runplane_core::{CoreError, EventAction, LockHolder, ResourceKind, RunStatus, Subject};

#[tokio::test]
async fn test_create_workspace_publishes_created() {
    let (ctx, _) = TestContext::memory();
    let mut sub = ctx.bus.subscribe(&[ResourceKind::Workspace]);
    let ws = ctx
        .workspaces
        .create_workspace(&Subject::user("alice"), "networking")
        .await
        .unwrap();

    let events = drain(&mut sub);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, EventAction::Created);
    assert_eq!(events[0].id, ws.id);

    let duplicate = ctx
        .workspaces
        .create_workspace(&Subject::user("bob"), "networking")
        .await
        .unwrap_err();
    assert!(duplicate.is_conflict());
}

#[tokio::test]
async fn test_manual_lock_and_unlock() {
    let (ctx, _) = TestContext::memory();
    let ws = ctx.workspace().await;
    let alice = Subject::user("alice");
    let bob = Subject::user("bob");

    let locked = ctx.workspaces.lock_workspace(&alice, &ws.id).await.unwrap();
    assert_eq!(locked.lock, Some(LockHolder::User("user:alice".to_string())));

    // Re-locking by the holder is a no-op.
    ctx.workspaces.lock_workspace(&alice, &ws.id).await.unwrap();

    let err = ctx.workspaces.lock_workspace(&bob, &ws.id).await.unwrap_err();
    assert!(matches!(err, CoreError::WorkspaceLocked { .. }));

    assert!(
        ctx.workspaces
            .unlock_workspace(&bob, &ws.id, false)
            .await
            .is_err()
    );
    let unlocked = ctx
        .workspaces
        .unlock_workspace(&bob, &ws.id, true)
        .await
        .unwrap();
    assert!(unlocked.lock.is_none());
}

#[tokio::test]
async fn test_run_lock_cannot_be_removed_manually() {
    let (ctx, _) = TestContext::memory();
    let ws = ctx.workspace().await;
    let run = ctx.run(&ws, false, false).await;
    ctx.runs.dispatch(&run.id).await.unwrap();

    let err = ctx
        .workspaces
        .unlock_workspace(&Subject::user("admin"), &ws.id, true)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "WORKSPACE_LOCKED");
    assert!(
        ctx.workspaces
            .lock_workspace(&Subject::user("alice"), &ws.id)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_user_lock_blocks_non_speculative_dispatch() {
    let (ctx, _) = TestContext::memory();
    let ws = ctx.workspace().await;
    ctx.workspaces
        .lock_workspace(&Subject::user("alice"), &ws.id)
        .await
        .unwrap();

    let run = ctx.run(&ws, false, false).await;
    assert!(ctx.runs.dispatch(&run.id).await.unwrap_err().is_conflict());

    let speculative = ctx.run(&ws, true, false).await;
    assert_eq!(
        ctx.runs.dispatch(&speculative.id).await.unwrap().status,
        RunStatus::PlanQueued
    );
}

#[tokio::test]
async fn test_set_current_run_validates_workspace() {
    let (ctx, _) = TestContext::memory();
    let ws = ctx.workspace().await;
    let other = ctx.workspace().await;
    let run = ctx.run(&other, false, false).await;
    let admin = Subject::user("admin");

    let err = ctx
        .workspaces
        .set_current_run(&admin, &ws.id, Some(&run.id))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    let updated = ctx
        .workspaces
        .set_current_run(&admin, &other.id, Some(&run.id))
        .await
        .unwrap();
    assert_eq!(updated.current_run_id.as_deref(), Some(run.id.as_str()));

    let cleared = ctx
        .workspaces
        .set_current_run(&admin, &other.id, None)
        .await
        .unwrap();
    assert!(cleared.current_run_id.is_none());
}

#[tokio::test]
async fn test_delete_workspace() {
    let (ctx, _) = TestContext::memory();
    let ws = ctx.workspace().await;
    let run = ctx.run(&ws, false, false).await;
    let admin = Subject::user("admin");

    let err = ctx
        .workspaces
        .delete_workspace(&admin, &ws.id)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    ctx.runs.cancel(&admin, &run.id).await.unwrap();
    let mut sub = ctx.bus.subscribe(&[ResourceKind::Workspace]);
    ctx.workspaces.delete_workspace(&admin, &ws.id).await.unwrap();

    let events = drain(&mut sub);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, EventAction::Deleted);
    assert!(matches!(
        ctx.workspaces.get_workspace(&ws.id).await,
        Err(CoreError::WorkspaceNotFound { .. })
    ));
}
