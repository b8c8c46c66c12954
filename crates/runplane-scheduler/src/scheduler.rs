// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler: registry of run queues and the reconciliation sweep.
//!
//! Each owned workspace gets an actor task holding its [`RunQueue`] and
//! its workspace lock. The scheduler routes bus events to those actors and
//! periodically sweeps storage for workspaces with unfinished runs, which
//! covers events that were dropped, lagged, or never relayed.
//!
//! A workspace is adopted only if its lock can be taken without waiting.
//! If another process holds it, this instance ignores the workspace until
//! the lock frees up and a later event or sweep finds it again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use runplane_core::{Delivery, Event, EventAction, RunService, Subscription};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::lock::{LockHandle, WorkspaceLocker};
use crate::queue::{QueueSnapshot, RunQueue};

/// Timing of the reconciliation sweep.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between sweeps while storage is healthy.
    pub reconcile_interval: Duration,
    /// Longest delay between sweeps after repeated failures.
    pub reconcile_max_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            reconcile_max_backoff: Duration::from_secs(300),
        }
    }
}

/// Sweep delay after `failures` consecutive failed sweeps.
pub fn backoff(config: &SchedulerConfig, failures: u32) -> Duration {
    if failures == 0 {
        return config.reconcile_interval;
    }
    let factor = 2u32.saturating_pow(failures.min(16));
    config
        .reconcile_interval
        .saturating_mul(factor)
        .min(config.reconcile_max_backoff)
}

enum Command {
    Event(Event),
    Reconcile,
    Snapshot(oneshot::Sender<QueueSnapshot>),
    Stop,
}

struct QueueEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

struct Inner {
    runs: Arc<RunService>,
    locker: Arc<dyn WorkspaceLocker>,
    queues: Mutex<HashMap<String, QueueEntry>>,
    next_queue_id: AtomicU64,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

/// Routes events to per-workspace run queues.
pub struct Scheduler {
    inner: Arc<Inner>,
    events: Subscription,
}

/// Cloneable view of a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler.
    ///
    /// Subscribes to the bus immediately so no event published after this
    /// call is missed, even before [`Scheduler::run`] is polled.
    pub fn new(
        runs: Arc<RunService>,
        locker: Arc<dyn WorkspaceLocker>,
        config: SchedulerConfig,
    ) -> Self {
        let events = runs.bus().subscribe(&[]);
        Self {
            inner: Arc::new(Inner {
                runs,
                locker,
                queues: Mutex::new(HashMap::new()),
                next_queue_id: AtomicU64::new(0),
                config,
                shutdown: Arc::new(Notify::new()),
            }),
            events,
        }
    }

    /// Introspection and control handle.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.inner.shutdown.clone()
    }

    /// Run until shutdown is signalled or the bus closes.
    ///
    /// The first sweep runs immediately and adopts every workspace with
    /// unfinished runs, which is how queues are recovered after a restart.
    pub async fn run(mut self) {
        info!(
            reconcile_interval_secs = self.inner.config.reconcile_interval.as_secs(),
            reconcile_max_backoff_secs = self.inner.config.reconcile_max_backoff.as_secs(),
            "Scheduler started"
        );

        let mut failures: u32 = 0;
        let sweep_timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(sweep_timer);

        loop {
            tokio::select! {
                biased;

                _ = self.inner.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }

                _ = &mut sweep_timer => {
                    match self.inner.sweep().await {
                        Ok(()) => failures = 0,
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            warn!(
                                error = %e,
                                failures,
                                transient = e.is_transient(),
                                "Reconciliation sweep failed"
                            );
                        }
                    }
                    let delay = backoff(&self.inner.config, failures);
                    sweep_timer.as_mut().reset(Instant::now() + delay);
                }

                delivery = self.events.recv() => match delivery {
                    Some(Delivery::Event(event)) => self.inner.route(event).await,
                    Some(Delivery::Lagged(skipped)) => {
                        warn!(skipped, "Scheduler fell behind the event bus; sweeping now");
                        sweep_timer.as_mut().reset(Instant::now());
                    }
                    None => {
                        warn!("Event bus closed");
                        break;
                    }
                },
            }
        }

        self.inner.stop_all().await;
        info!("Scheduler stopped");
    }
}

impl SchedulerHandle {
    /// Workspaces whose queues this instance currently drives, sorted.
    pub fn owned_workspaces(&self) -> Vec<String> {
        let mut owned: Vec<String> = self.inner.lock_queues().keys().cloned().collect();
        owned.sort();
        owned
    }

    /// Snapshot of one owned queue, or `None` if this instance does not own it.
    pub async fn queue_snapshot(&self, workspace_id: &str) -> Option<QueueSnapshot> {
        let (reply, response) = oneshot::channel();
        {
            let queues = self.inner.lock_queues();
            let entry = queues.get(workspace_id)?;
            entry.tx.send(Command::Snapshot(reply)).ok()?;
        }
        response.await.ok()
    }

    /// Run one reconciliation sweep right away.
    pub async fn reconcile_now(&self) -> Result<()> {
        self.inner.sweep().await
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.inner.shutdown.clone()
    }
}

impl Inner {
    fn lock_queues(&self) -> MutexGuard<'_, HashMap<String, QueueEntry>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn route(self: &Arc<Self>, event: Event) {
        // Ready events are for workers.
        if event.action == EventAction::Ready {
            return;
        }
        let workspace_id = event.workspace_id().to_string();

        {
            let mut queues = self.lock_queues();
            if let Some(entry) = queues.get(&workspace_id) {
                if entry.tx.send(Command::Event(event.clone())).is_ok() {
                    return;
                }
                // The actor died without deregistering.
                queues.remove(&workspace_id);
            }
        }

        // Only unfinished runs make an unowned workspace worth adopting.
        let adopt = event.as_run().is_some_and(|run| !run.status.is_terminal());
        if !adopt {
            return;
        }
        if let Err(e) = self.adopt(&workspace_id).await {
            warn!(workspace_id = %workspace_id, error = %e, "Failed to adopt workspace");
        }
    }

    /// Take ownership of a workspace if its lock is free.
    ///
    /// The new queue seeds itself from storage, so the triggering event
    /// does not need to be forwarded.
    async fn adopt(self: &Arc<Self>, workspace_id: &str) -> Result<bool> {
        if self.lock_queues().contains_key(workspace_id) {
            return Ok(false);
        }

        let Some(handle) = self.locker.try_acquire(workspace_id).await? else {
            debug!(workspace_id, "Workspace owned by another scheduler");
            return Ok(false);
        };

        let duplicate = {
            let mut queues = self.lock_queues();
            if queues.contains_key(workspace_id) {
                Some(handle)
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = self.next_queue_id.fetch_add(1, Ordering::SeqCst);
                let queue = RunQueue::new(workspace_id, Arc::clone(&self.runs));
                let task = tokio::spawn(Arc::clone(self).drive(queue, handle, id, rx));
                queues.insert(workspace_id.to_string(), QueueEntry { id, tx, task });
                None
            }
        };

        match duplicate {
            Some(mut handle) => {
                self.locker.release(&mut handle).await?;
                Ok(false)
            }
            None => {
                info!(workspace_id, "Workspace adopted");
                Ok(true)
            }
        }
    }

    /// Reconcile owned queues and adopt unowned workspaces with unfinished runs.
    async fn sweep(self: &Arc<Self>) -> Result<()> {
        {
            let queues = self.lock_queues();
            for entry in queues.values() {
                let _ = entry.tx.send(Command::Reconcile);
            }
        }

        let active = self.runs.store().list_active_workspaces().await?;
        let mut adopted = 0usize;
        let mut failed = None;
        for workspace_id in &active {
            match self.adopt(workspace_id).await {
                Ok(true) => adopted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(workspace_id = %workspace_id, error = %e, "Failed to adopt workspace");
                    failed = Some(e);
                }
            }
        }
        debug!(active = active.len(), adopted, "Reconciliation sweep finished");

        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove the queue's registry entry if nothing is waiting for it.
    fn retire(&self, workspace_id: &str, id: u64, rx: &mpsc::UnboundedReceiver<Command>) -> bool {
        let mut queues = self.lock_queues();
        if !rx.is_empty() {
            return false;
        }
        self.deregister_locked(&mut queues, workspace_id, id);
        true
    }

    fn deregister(&self, workspace_id: &str, id: u64) {
        let mut queues = self.lock_queues();
        self.deregister_locked(&mut queues, workspace_id, id);
    }

    fn deregister_locked(
        &self,
        queues: &mut HashMap<String, QueueEntry>,
        workspace_id: &str,
        id: u64,
    ) {
        if queues.get(workspace_id).is_some_and(|entry| entry.id == id) {
            queues.remove(workspace_id);
        }
    }

    /// Actor loop owning one workspace's queue and lock.
    async fn drive(
        self: Arc<Self>,
        mut queue: RunQueue,
        mut handle: LockHandle,
        id: u64,
        mut rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let workspace_id = queue.workspace_id().to_string();
        debug!(workspace_id = %workspace_id, "Run queue started");

        let mut healthy = log_outcome(&workspace_id, queue.reconcile().await);
        loop {
            if healthy && queue.is_idle() && self.retire(&workspace_id, id, &rx) {
                info!(workspace_id = %workspace_id, "Run queue idle; retiring");
                break;
            }

            let Some(command) = rx.recv().await else {
                break;
            };
            match command {
                Command::Event(event) => {
                    healthy = log_outcome(&workspace_id, queue.handle_event(&event).await);
                }
                Command::Reconcile => {
                    if !self.locker.is_held(&handle).await {
                        warn!(workspace_id = %workspace_id, "Workspace lock lost; retiring queue");
                        self.deregister(&workspace_id, id);
                        break;
                    }
                    healthy = log_outcome(&workspace_id, queue.reconcile().await);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(queue.snapshot());
                }
                Command::Stop => break,
            }
        }

        if let Err(e) = self.locker.release(&mut handle).await {
            warn!(workspace_id = %workspace_id, error = %e, "Failed to release workspace lock");
        }
        debug!(workspace_id = %workspace_id, "Run queue stopped");
    }

    async fn stop_all(&self) {
        let entries: Vec<(String, QueueEntry)> = self.lock_queues().drain().collect();
        for (_, entry) in &entries {
            let _ = entry.tx.send(Command::Stop);
        }
        for (workspace_id, entry) in entries {
            if let Err(e) = entry.task.await {
                error!(workspace_id = %workspace_id, error = %e, "Run queue task panicked");
            }
        }
    }
}

fn log_outcome<T>(workspace_id: &str, outcome: Result<T>) -> bool {
    match outcome {
        Ok(_) => true,
        Err(e) => {
            warn!(
                workspace_id,
                error = %e,
                transient = e.is_transient(),
                "Run queue evaluation failed; will retry"
            );
            false
        }
    }
}
