// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runplane-scheduler tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use runplane_core::{
    CreateRunOptions, Delivery, EventAction, EventBus, MemoryStore, ResourceKind, ResourceReport,
    Run, RunInput, RunService, RunStatus, Store, Subject, Workspace, WorkspaceService, ids,
};
use runplane_scheduler::{
    LocalLockService, LocalLocker, QueueSnapshot, Scheduler, SchedulerConfig, SchedulerHandle,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Sweep interval long enough that only the startup sweep runs during a test.
pub const QUIET: Duration = Duration::from_secs(3600);

/// Shared storage, bus, and lock table standing in for one database.
pub struct Cluster {
    pub memory: Arc<MemoryStore>,
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub locks: LocalLockService,
    pub runs: Arc<RunService>,
    pub workspaces: WorkspaceService,
}

/// One scheduler instance with its own locker.
pub struct Node {
    pub locker: Arc<LocalLocker>,
    pub handle: SchedulerHandle,
    task: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Cluster {
    pub fn new() -> Self {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn Store> = memory.clone();
        let bus = EventBus::new(1024).expect("valid capacity");
        Self {
            runs: Arc::new(RunService::new(store.clone(), bus.clone())),
            workspaces: WorkspaceService::new(store.clone(), bus.clone()),
            memory,
            store,
            bus,
            locks: LocalLockService::new(),
        }
    }

    /// Start a scheduler sweeping every `interval`.
    pub fn start(&self, interval: Duration) -> Node {
        let locker = Arc::new(self.locks.locker());
        let scheduler = Scheduler::new(
            self.runs.clone(),
            locker.clone(),
            SchedulerConfig {
                reconcile_interval: interval,
                reconcile_max_backoff: interval * 4,
            },
        );
        let handle = scheduler.handle();
        let shutdown = scheduler.shutdown_handle();
        let task = tokio::spawn(scheduler.run());
        Node {
            locker,
            handle,
            task,
            shutdown,
        }
    }

    pub async fn workspace(&self) -> Workspace {
        self.workspaces
            .create_workspace(&Subject::user("tester"), &ids::new_id("test"))
            .await
            .expect("Failed to create workspace")
    }

    pub async fn run(&self, workspace: &Workspace, speculative: bool) -> Run {
        self.runs
            .create_run(
                &Subject::user("tester"),
                CreateRunOptions {
                    workspace_id: workspace.id.clone(),
                    speculative,
                    ..Default::default()
                },
            )
            .await
            .expect("Failed to create run")
    }

    pub async fn status(&self, run_id: &str) -> RunStatus {
        self.store
            .get_run(run_id)
            .await
            .expect("Failed to get run")
            .status
    }

    /// Play a worker: plan the run and report no changes, which discards it.
    pub async fn complete(&self, run_id: &str) -> Run {
        let agent = Subject::agent("test-agent");
        self.runs
            .report(&agent, run_id, RunInput::PlanStarted)
            .await
            .expect("Failed to start plan");
        self.runs
            .report(
                &agent,
                run_id,
                RunInput::PlanCompleted {
                    report: ResourceReport::default(),
                    checks_pending: false,
                },
            )
            .await
            .expect("Failed to complete plan")
    }

    /// Spawn a worker that completes every run announced as ready.
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let mut ready = self.bus.subscribe(&[ResourceKind::Run]);
        let runs = self.runs.clone();
        tokio::spawn(async move {
            let agent = Subject::agent("burst-agent");
            while let Some(delivery) = ready.recv().await {
                let Delivery::Event(event) = delivery else {
                    continue;
                };
                if event.action != EventAction::Ready {
                    continue;
                }
                let _ = runs.report(&agent, &event.id, RunInput::PlanStarted).await;
                let _ = runs
                    .report(
                        &agent,
                        &event.id,
                        RunInput::PlanCompleted {
                            report: ResourceReport::default(),
                            checks_pending: false,
                        },
                    )
                    .await;
            }
        })
    }

    pub async fn wait_status(&self, run_id: &str, status: RunStatus) {
        wait_for(&format!("{} to reach {}", run_id, status), move || async move {
            self.status(run_id).await == status
        })
        .await;
    }

    /// Wait until no locker holds the workspace lock.
    pub async fn wait_unlocked(&self, workspace_id: &str) {
        let locks = &self.locks;
        wait_for("workspace lock to be released", move || async move {
            locks.holder(workspace_id).await.is_none()
        })
        .await;
    }
}

impl Node {
    /// Stop the scheduler and wait for its queues to release their locks.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        self.task.await.expect("scheduler task panicked");
    }

    /// Wait until the owned queue reports `expected`.
    pub async fn wait_snapshot(&self, workspace_id: &str, expected: &QueueSnapshot) {
        let handle = &self.handle;
        wait_for("queue snapshot", move || async move {
            handle.queue_snapshot(workspace_id).await.as_ref() == Some(expected)
        })
        .await;
    }

    pub fn owns(&self, workspace_id: &str) -> bool {
        self.handle
            .owned_workspaces()
            .iter()
            .any(|id| id == workspace_id)
    }
}

/// Poll `check` until it returns true, failing after five seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll a synchronous condition until it holds, failing after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    wait_for(what, || {
        let ok = check();
        async move { ok }
    })
    .await;
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
