// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runplane Core - Runs, Workspaces and Domain Events
//!
//! This crate holds the durable model of the run scheduler: the run state
//! machine, the workspace record with its current-run reference and lock,
//! the storage collaborator, and the services that perform every
//! state-changing write and publish the resulting domain event.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐      ┌─────────────────────────────────┐
//! │  API layer / agents      │─────►│ RunService / WorkspaceService   │
//! │  (already authorized)    │      │  (transition, persist, publish) │
//! └──────────────────────────┘      └─────────────────────────────────┘
//!                                         │                 │
//!                                         ▼                 ▼
//!                               ┌──────────────────┐  ┌───────────┐
//!                               │  Store           │  │ EventBus  │──► runplane-scheduler
//!                               │  (PostgreSQL)    │  └───────────┘
//!                               └──────────────────┘
//! ```
//!
//! # Run Lifecycle
//!
//! ```text
//! pending ─► plan_queued ─► planning ─► planned ─► [cost_estimated] ─► [policy_checking]
//!                                          │                                   │
//!                                          ├──► discarded*                     │
//!                                          ▼                                   │
//!                                   apply_queued ◄─────────────────────────────┘
//!                                          │
//!                                          ▼
//!                                      applying ─► applied*
//!
//! any non-terminal ─► errored* | canceled*
//! ```
//!
//! # Modules
//!
//! - [`run`]: Run record and state machine
//! - [`workspace`]: Workspace record and manual lock rules
//! - [`event`]: Domain event bus
//! - [`hooks`]: Listeners around resource creation
//! - [`persistence`]: Storage collaborator and backends
//! - [`run_service`] / [`workspace_service`]: State-changing operations

#![deny(missing_docs)]

/// Error types for core operations.
pub mod error;

/// Resource identifiers and timestamps.
pub mod ids;

/// Authorized subjects recorded for audit.
pub mod subject;

/// Run record and lifecycle state machine.
pub mod run;

/// Workspace record.
pub mod workspace;

/// Domain event bus.
pub mod event;

/// Hook points around resource creation.
pub mod hooks;

/// Storage collaborator and its PostgreSQL and in-memory backends.
pub mod persistence;

/// Database migrations for runplane-core.
pub mod migrations;

/// Run operations.
pub mod run_service;

/// Workspace operations.
pub mod workspace_service;

pub use error::{CoreError, Result};
pub use event::{Delivery, Event, EventAction, EventBus, EventOrigin, ResourceKind, Subscription};
pub use persistence::{MemoryStore, PostgresStore, Store, WorkspaceEffect};
pub use run::{CreateRunOptions, ResourceReport, Run, RunInput, RunStatus};
pub use run_service::RunService;
pub use subject::Subject;
pub use workspace::{LockHolder, Workspace};
pub use workspace_service::WorkspaceService;
