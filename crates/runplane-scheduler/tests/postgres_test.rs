// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advisory lock and relay tests. Require TEST_RUNPLANE_DATABASE_URL.

mod common;

use std::sync::Arc;

use common::*;
use runplane_core::{
    CreateRunOptions, Delivery, EventBus, EventOrigin, PostgresStore, ResourceKind, RunService,
    Store, Subject, Workspace, ids, migrations,
};
use runplane_scheduler::{EventRelay, PgAdvisoryLocker, WorkspaceLocker};
use sqlx::PgPool;

async fn pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_RUNPLANE_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    migrations::run(&pool).await.ok()?;
    Some(pool)
}

#[tokio::test]
async fn test_advisory_lock_excludes_other_sessions() {
    skip_if_no_db!();

    let Some(pool) = pool().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };

    let workspace_id = ids::new_id("ws");
    let a = PgAdvisoryLocker::new(pool.clone());
    let b = PgAdvisoryLocker::new(pool.clone());

    let mut handle = a.try_acquire(&workspace_id).await.unwrap().unwrap();
    assert!(a.is_held(&handle).await);
    assert!(b.try_acquire(&workspace_id).await.unwrap().is_none());

    a.release(&mut handle).await.unwrap();
    a.release(&mut handle).await.unwrap();
    assert!(!a.is_held(&handle).await);

    let mut taken = b.try_acquire(&workspace_id).await.unwrap().unwrap();
    b.release(&mut taken).await.unwrap();
}

#[tokio::test]
async fn test_closed_session_drops_locks() {
    skip_if_no_db!();

    let Some(pool) = pool().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };

    let workspace_id = ids::new_id("ws");
    let a = PgAdvisoryLocker::new(pool.clone());
    let b = PgAdvisoryLocker::new(pool.clone());

    let handle = a.try_acquire(&workspace_id).await.unwrap().unwrap();
    a.close().await;
    assert!(!a.is_held(&handle).await);

    // The server releases session locks once the connection is gone.
    let c = &b;
    let id = workspace_id.as_str();
    wait_for("lock to be released by the server", move || async move {
        match c.try_acquire(id).await {
            Ok(Some(mut handle)) => {
                c.release(&mut handle).await.unwrap();
                true
            }
            _ => false,
        }
    })
    .await;
}

#[tokio::test]
async fn test_relay_republishes_remote_writes() {
    skip_if_no_db!();

    let Some(pool) = pool().await else {
        eprintln!("Skipping test: failed to connect");
        return;
    };

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool.clone()));
    let channel = format!("runplane_test_{}", ids::new_id("ch").replace('-', "_"));
    let local_bus = EventBus::default();
    let remote_bus = EventBus::default();

    let local_relay = EventRelay::new(pool.clone(), local_bus.clone(), store.clone(), &channel);
    let remote_relay = EventRelay::new(pool.clone(), remote_bus.clone(), store.clone(), &channel);
    let local_shutdown = local_relay.shutdown_handle();
    let remote_shutdown = remote_relay.shutdown_handle();
    let local_task = tokio::spawn(local_relay.run());
    let remote_task = tokio::spawn(remote_relay.run());

    let mut remote_events = remote_bus.subscribe(&[ResourceKind::Run]);
    let ws = store
        .create_workspace(&Workspace::new(ids::new_id("relay")).unwrap())
        .await
        .unwrap();
    let runs = RunService::new(store.clone(), local_bus.clone());

    // Keep writing until the listener is up and a notification makes it across.
    let received = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            let run = runs
                .create_run(
                    &Subject::user("tester"),
                    CreateRunOptions {
                        workspace_id: ws.id.clone(),
                        speculative: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let wait = tokio::time::timeout(std::time::Duration::from_millis(500), remote_events.recv());
            if let Ok(Some(Delivery::Event(event))) = wait.await {
                return (run, event);
            }
        }
    })
    .await
    .expect("no relayed event");

    let (_, event) = received;
    assert_eq!(event.origin, EventOrigin::Remote);
    assert_eq!(event.workspace_id(), ws.id);

    local_shutdown.notify_one();
    remote_shutdown.notify_one();
    local_task.await.unwrap();
    remote_task.await.unwrap();
}
