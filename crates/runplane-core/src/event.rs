// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain event bus.
//!
//! Every state-changing write publishes an [`Event`] carrying a snapshot of
//! the resource after the write. Events are notifications, not a log: the
//! run and workspace records stay the source of truth.
//!
//! The bus is a `tokio::sync::broadcast` channel. Each subscriber reads from
//! its own cursor, so a slow subscriber never blocks the publisher or other
//! subscribers. A subscriber that falls more than `capacity` events behind
//! loses its oldest undelivered events and is told how many it missed via
//! [`Delivery::Lagged`]; it is expected to re-read authoritative state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::ids;
use crate::run::Run;
use crate::workspace::Workspace;

/// Default per-subscriber buffer size.
pub const DEFAULT_CAPACITY: usize = 256;

/// Type of resource an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A run.
    Run,
    /// A workspace.
    Workspace,
}

/// What happened to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Resource was created.
    Created,
    /// Resource was updated.
    Updated,
    /// Resource was deleted.
    Deleted,
    /// A run is ready for a worker to execute its next phase.
    Ready,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
            EventAction::Deleted => "deleted",
            EventAction::Ready => "ready",
        })
    }
}

/// Where an event was first published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Published by a write in this process.
    Local,
    /// Relayed from another process sharing the database.
    Remote,
}

/// Resource snapshot after the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Run snapshot.
    Run(Run),
    /// Workspace snapshot.
    Workspace(Workspace),
}

/// An immutable fact broadcast after a state-changing write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Resource type.
    pub kind: ResourceKind,
    /// Resource ID.
    pub id: String,
    /// What happened.
    pub action: EventAction,
    /// Snapshot after the write.
    pub payload: EventPayload,
    /// Local write or relayed from another process.
    pub origin: EventOrigin,
    /// When the event was published.
    pub published_at: DateTime<Utc>,
}

impl Event {
    /// Event about a run.
    pub fn run(action: EventAction, run: Run) -> Self {
        Self {
            kind: ResourceKind::Run,
            id: run.id.clone(),
            action,
            payload: EventPayload::Run(run),
            origin: EventOrigin::Local,
            published_at: ids::current_timestamp(),
        }
    }

    /// Event about a workspace.
    pub fn workspace(action: EventAction, workspace: Workspace) -> Self {
        Self {
            kind: ResourceKind::Workspace,
            id: workspace.id.clone(),
            action,
            payload: EventPayload::Workspace(workspace),
            origin: EventOrigin::Local,
            published_at: ids::current_timestamp(),
        }
    }

    /// Mark the event as relayed from another process.
    pub fn relayed(mut self) -> Self {
        self.origin = EventOrigin::Remote;
        self
    }

    /// Workspace this event concerns.
    pub fn workspace_id(&self) -> &str {
        match &self.payload {
            EventPayload::Run(run) => &run.workspace_id,
            EventPayload::Workspace(ws) => &ws.id,
        }
    }

    /// Run snapshot, if this is a run event.
    pub fn as_run(&self) -> Option<&Run> {
        match &self.payload {
            EventPayload::Run(run) => Some(run),
            EventPayload::Workspace(_) => None,
        }
    }

    /// Workspace snapshot, if this is a workspace event.
    pub fn as_workspace(&self) -> Option<&Workspace> {
        match &self.payload {
            EventPayload::Workspace(ws) => Some(ws),
            EventPayload::Run(_) => None,
        }
    }
}

/// Result of waiting on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Next matching event.
    Event(Event),
    /// The subscriber fell behind and this many events were dropped.
    Lagged(u64),
}

/// Publish/subscribe fan-out for domain events within one process.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus where each subscriber buffers up to `capacity` events.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CoreError::Validation {
                field: "capacity".to_string(),
                message: "event buffer capacity must be positive".to_string(),
            });
        }
        let (sender, _) = broadcast::channel(capacity);
        Ok(Self { sender })
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// Never blocks. Returns the number of subscribers reached; publishing
    /// with no subscribers is not an error.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind;
        let action = event.action;
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(?kind, %action, "Published event with no subscribers");
                0
            }
        }
    }

    /// Subscribe to events of the given kinds. An empty slice means all kinds.
    pub fn subscribe(&self, kinds: &[ResourceKind]) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kinds: kinds.to_vec(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { sender }
    }
}

/// A live stream of events matching a filter.
///
/// Dropping the subscription cancels it.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    kinds: Vec<ResourceKind>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind)
    }

    /// Wait for the next matching event.
    ///
    /// Returns `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matches(&event) => return Some(Delivery::Event(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged; oldest events dropped");
                    return Some(Delivery::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.matches(&event) => return Some(Delivery::Event(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    return Some(Delivery::Lagged(skipped));
                }
                Err(_) => return None,
            }
        }
    }
}
