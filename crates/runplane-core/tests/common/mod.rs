// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runplane-core tests.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::PgPool;

use runplane_core::{
    CreateRunOptions, Delivery, Event, EventBus, MemoryStore, PostgresStore, Run, RunService,
    Store, Subject, Subscription, Workspace, WorkspaceService, ids, migrations,
};

/// Services wired to one store and one bus.
pub struct TestContext {
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub runs: RunService,
    pub workspaces: WorkspaceService,
}

impl TestContext {
    /// Context backed by an in-memory store.
    pub fn memory() -> (Self, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        (Self::with_store(memory.clone()), memory)
    }

    /// Context backed by PostgreSQL at TEST_RUNPLANE_DATABASE_URL.
    pub async fn postgres() -> Option<(Self, PgPool)> {
        let database_url = std::env::var("TEST_RUNPLANE_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        migrations::run(&pool).await.ok()?;
        Some((Self::with_store(Arc::new(PostgresStore::new(pool.clone()))), pool))
    }

    fn with_store(store: Arc<dyn Store>) -> Self {
        let bus = EventBus::new(64).expect("valid capacity");
        Self {
            runs: RunService::new(store.clone(), bus.clone()),
            workspaces: WorkspaceService::new(store.clone(), bus.clone()),
            store,
            bus,
        }
    }

    /// Create a workspace with a unique name.
    pub async fn workspace(&self) -> Workspace {
        let name = ids::new_id("test");
        self.workspaces
            .create_workspace(&Subject::user("tester"), &name)
            .await
            .expect("Failed to create workspace")
    }

    /// Create a run in `workspace`.
    pub async fn run(&self, workspace: &Workspace, speculative: bool, auto_apply: bool) -> Run {
        self.runs
            .create_run(
                &Subject::user("tester"),
                CreateRunOptions {
                    workspace_id: workspace.id.clone(),
                    speculative,
                    auto_apply,
                    message: None,
                },
            )
            .await
            .expect("Failed to create run")
    }
}

/// Drain every event already buffered on `sub`.
pub fn drain(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(delivery) = sub.try_recv() {
        match delivery {
            Delivery::Event(event) => events.push(event),
            Delivery::Lagged(n) => panic!("test subscriber lagged by {}", n),
        }
    }
    events
}

/// Helper macro to skip tests if TEST_RUNPLANE_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_RUNPLANE_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_RUNPLANE_DATABASE_URL not set");
            return;
        }
    };
}
