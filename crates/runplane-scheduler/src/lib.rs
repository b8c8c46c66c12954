// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runplane Scheduler - Per-Workspace Run Queues
//!
//! This crate drives runs through their workspaces one at a time. Several
//! scheduler processes may share one PostgreSQL database; each workspace is
//! driven by whichever process holds its advisory lock.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      runplane-scheduler                          │
//! │                                                                  │
//! │  EventBus ──► Scheduler ──┬──► RunQueue actor (ws-a) ─┐          │
//! │     ▲          (router,   ├──► RunQueue actor (ws-b) ─┤ dispatch │
//! │     │           sweep)    └──► ...                    ▼          │
//! │     │                                          RunService        │
//! │  EventRelay ◄─────────── LISTEN/NOTIFY ──────────────┐│          │
//! └──────────────────────────────────────────────────────┼┼──────────┘
//!                                                        │▼
//!                              ┌──────────────────────────────────┐
//!                              │            PostgreSQL            │
//!                              │ workspaces, runs, advisory locks │
//!                              └──────────────────────────────────┘
//! ```
//!
//! Queues are caches. Every queue is seeded from storage when it is
//! created and again on each reconciliation sweep, so a restarted or
//! newly started process recovers exactly the state it would have had.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RUNPLANE_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `RUNPLANE_DB_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `RUNPLANE_RECONCILE_INTERVAL_SECS` | No | `30` | Sweep interval |
//! | `RUNPLANE_RECONCILE_MAX_BACKOFF_SECS` | No | `300` | Sweep delay cap after failures |
//! | `RUNPLANE_EVENT_BUFFER` | No | `256` | Per-subscriber event buffer |
//! | `RUNPLANE_LOCK_RETRY_MS` | No | `500` | Blocking lock retry interval |
//! | `RUNPLANE_NOTIFY_CHANNEL` | No | `runplane_events` | Relay notification channel |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types
//! - [`lock`]: Workspace locks (PostgreSQL advisory and in-process)
//! - [`queue`]: Per-workspace run queue
//! - [`relay`]: Cross-process event relay
//! - [`scheduler`]: Queue registry and reconciliation sweep
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for scheduler operations.
pub mod error;

/// Distributed workspace locks.
pub mod lock;

/// Per-workspace run queue.
pub mod queue;

/// Cross-process event relay over LISTEN/NOTIFY.
pub mod relay;

/// Queue registry, event routing, and reconciliation sweep.
pub mod scheduler;

/// Embeddable runtime wiring services, scheduler, and relay.
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
pub use lock::{LocalLockService, LocalLocker, LockHandle, PgAdvisoryLocker, WorkspaceLocker};
pub use queue::{QueueSnapshot, RunQueue};
pub use relay::EventRelay;
pub use runtime::SchedulerRuntime;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
