// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for runplane-scheduler.
//!
//! [`SchedulerRuntime`] wires the run and workspace services, the
//! scheduler and, when a pool is given, the cross-process event relay into
//! an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runplane_core::PostgresStore;
//! use runplane_scheduler::lock::PgAdvisoryLocker;
//! use runplane_scheduler::runtime::SchedulerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = SchedulerRuntime::builder()
//!         .store(Arc::new(PostgresStore::new(pool.clone())))
//!         .locker(Arc::new(PgAdvisoryLocker::new(pool.clone())))
//!         .relay_pool(pool)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... create workspaces and runs through runtime.runs() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use runplane_core::hooks::HookListener;
use runplane_core::{EventBus, Run, RunService, Store, Workspace, WorkspaceService};
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::lock::WorkspaceLocker;
use crate::relay::EventRelay;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};

/// Builder for creating a [`SchedulerRuntime`].
pub struct SchedulerRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    locker: Option<Arc<dyn WorkspaceLocker>>,
    bus: Option<EventBus>,
    relay_pool: Option<PgPool>,
    notify_channel: String,
    event_buffer: usize,
    reconcile_interval: Duration,
    reconcile_max_backoff: Duration,
    run_listeners: Vec<Arc<dyn HookListener<Run>>>,
    workspace_listeners: Vec<Arc<dyn HookListener<Workspace>>>,
}

impl Default for SchedulerRuntimeBuilder {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            store: None,
            locker: None,
            bus: None,
            relay_pool: None,
            notify_channel: "runplane_events".to_string(),
            event_buffer: runplane_core::event::DEFAULT_CAPACITY,
            reconcile_interval: defaults.reconcile_interval,
            reconcile_max_backoff: defaults.reconcile_max_backoff,
            run_listeners: Vec::new(),
            workspace_listeners: Vec::new(),
        }
    }
}

impl SchedulerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply tuning values from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.notify_channel = config.notify_channel.clone();
        self.event_buffer = config.event_buffer;
        self.reconcile_interval = config.reconcile_interval;
        self.reconcile_max_backoff = config.reconcile_max_backoff;
        self
    }

    /// Set the run and workspace store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the workspace locker (required).
    pub fn locker(mut self, locker: Arc<dyn WorkspaceLocker>) -> Self {
        self.locker = Some(locker);
        self
    }

    /// Share an existing event bus instead of creating one.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Enable the cross-process event relay on this pool.
    pub fn relay_pool(mut self, pool: PgPool) -> Self {
        self.relay_pool = Some(pool);
        self
    }

    /// Set the notification channel used by the relay.
    pub fn notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.notify_channel = channel.into();
        self
    }

    /// Set the per-subscriber buffer of a bus created by the runtime.
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Set the delay between reconciliation sweeps.
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the longest sweep delay after repeated failures.
    pub fn reconcile_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.reconcile_max_backoff = max_backoff;
        self
    }

    /// Register a listener around run creation.
    pub fn run_listener(mut self, listener: Arc<dyn HookListener<Run>>) -> Self {
        self.run_listeners.push(listener);
        self
    }

    /// Register a listener around workspace creation.
    pub fn workspace_listener(mut self, listener: Arc<dyn HookListener<Workspace>>) -> Self {
        self.workspace_listeners.push(listener);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or out of range.
    pub fn build(self) -> Result<SchedulerRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let locker = self
            .locker
            .ok_or_else(|| anyhow::anyhow!("locker is required"))?;
        if self.reconcile_interval.is_zero() {
            anyhow::bail!("reconcile_interval must be positive");
        }
        let bus = match self.bus {
            Some(bus) => bus,
            None => EventBus::new(self.event_buffer)?,
        };

        Ok(SchedulerRuntimeConfig {
            store,
            locker,
            bus,
            relay_pool: self.relay_pool,
            notify_channel: self.notify_channel,
            scheduler: SchedulerConfig {
                reconcile_interval: self.reconcile_interval,
                reconcile_max_backoff: self.reconcile_max_backoff.max(self.reconcile_interval),
            },
            run_listeners: self.run_listeners,
            workspace_listeners: self.workspace_listeners,
        })
    }
}

/// Configuration for a [`SchedulerRuntime`].
pub struct SchedulerRuntimeConfig {
    store: Arc<dyn Store>,
    locker: Arc<dyn WorkspaceLocker>,
    bus: EventBus,
    relay_pool: Option<PgPool>,
    notify_channel: String,
    scheduler: SchedulerConfig,
    run_listeners: Vec<Arc<dyn HookListener<Run>>>,
    workspace_listeners: Vec<Arc<dyn HookListener<Workspace>>>,
}

impl SchedulerRuntimeConfig {
    /// Start the runtime, spawning the scheduler and relay tasks.
    pub async fn start(self) -> Result<SchedulerRuntime> {
        let runs = self
            .run_listeners
            .into_iter()
            .fold(RunService::new(self.store.clone(), self.bus.clone()), |svc, l| {
                svc.with_create_listener(l)
            });
        let runs = Arc::new(runs);
        let workspaces = self.workspace_listeners.into_iter().fold(
            WorkspaceService::new(self.store.clone(), self.bus.clone()),
            |svc, l| svc.with_create_listener(l),
        );
        let workspaces = Arc::new(workspaces);

        // Subscribe both consumers before anything can publish.
        let scheduler = Scheduler::new(runs.clone(), self.locker, self.scheduler);
        let scheduler_handle = scheduler.handle();
        let scheduler_shutdown = scheduler.shutdown_handle();

        let relay = self.relay_pool.map(|pool| {
            EventRelay::new(pool, self.bus.clone(), self.store.clone(), &self.notify_channel)
        });

        let scheduler_task = tokio::spawn(async move {
            scheduler.run().await;
        });

        let relay = match relay {
            Some(relay) => {
                let shutdown = relay.shutdown_handle();
                let task = tokio::spawn(async move {
                    relay.run().await;
                });
                Some((task, shutdown))
            }
            None => {
                debug!("No relay pool configured; events stay in this process");
                None
            }
        };

        info!(relay = relay.is_some(), "SchedulerRuntime started");

        Ok(SchedulerRuntime {
            runs,
            workspaces,
            bus: self.bus,
            scheduler: scheduler_handle,
            scheduler_task,
            scheduler_shutdown,
            relay,
        })
    }
}

/// A running scheduler that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SchedulerRuntime {
    runs: Arc<RunService>,
    workspaces: Arc<WorkspaceService>,
    bus: EventBus,
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
    relay: Option<(JoinHandle<()>, Arc<Notify>)>,
}

impl SchedulerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SchedulerRuntimeBuilder {
        SchedulerRuntimeBuilder::new()
    }

    /// Run operations.
    pub fn runs(&self) -> &Arc<RunService> {
        &self.runs
    }

    /// Workspace operations.
    pub fn workspaces(&self) -> &Arc<WorkspaceService> {
        &self.workspaces
    }

    /// Event bus shared by every component.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Scheduler introspection.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the relay, then the scheduler, which stops every queue and
    /// releases its workspace locks.
    pub async fn shutdown(self) -> Result<()> {
        info!("SchedulerRuntime shutting down...");

        if let Some((task, shutdown)) = self.relay {
            shutdown.notify_one();
            if let Err(e) = task.await {
                error!("Event relay task panicked: {}", e);
            }
        }

        self.scheduler_shutdown.notify_one();
        match self.scheduler_task.await {
            Ok(()) => {
                info!("SchedulerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Scheduler task panicked: {}", e);
                Err(anyhow::anyhow!("scheduler task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let relay_running = self
            .relay
            .as_ref()
            .is_none_or(|(task, _)| !task.is_finished());
        !self.scheduler_task.is_finished() && relay_running
    }
}
