// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-process event relay over PostgreSQL `LISTEN/NOTIFY`.
//!
//! Locally published events are announced on a notification channel as a
//! small reference (`kind`, `action`, `id`, `origin`). Every other process
//! listening on the channel re-reads the resource from storage and
//! republishes it on its own bus marked [`EventOrigin::Remote`]. Remote
//! events are never forwarded again.
//!
//! Notifications are best effort. A process that misses one catches up on
//! its next reconciliation sweep.

use std::sync::Arc;
use std::time::Duration;

use runplane_core::{
    CoreError, Delivery, Event, EventAction, EventBus, EventOrigin, ResourceKind, Store,
    Subscription, Workspace,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;

/// Delay before reconnecting a failed listener.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Payload sent on the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Resource type.
    pub kind: ResourceKind,
    /// What happened.
    pub action: EventAction,
    /// Resource ID.
    pub id: String,
    /// Relay instance that sent it.
    pub origin: Uuid,
}

/// Forwards events between processes sharing one database.
pub struct EventRelay {
    pool: PgPool,
    bus: EventBus,
    store: Arc<dyn Store>,
    channel: String,
    origin: Uuid,
    local: Subscription,
    shutdown: Arc<Notify>,
}

impl EventRelay {
    /// Create a relay on `channel`.
    ///
    /// The relay subscribes to `bus` here, so local events published before
    /// [`EventRelay::run`] starts are still forwarded.
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        store: Arc<dyn Store>,
        channel: impl Into<String>,
    ) -> Self {
        let local = bus.subscribe(&[]);
        Self {
            pool,
            bus,
            store,
            channel: channel.into(),
            origin: Uuid::new_v4(),
            local,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Identity stamped on notifications sent by this relay.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Relay until shutdown.
    pub async fn run(mut self) {
        info!(channel = %self.channel, origin = %self.origin, "Event relay started");

        'connect: loop {
            let mut listener = match self.listen().await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "Event relay failed to listen; retrying");
                    if self.pause().await {
                        break 'connect;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    biased;

                    _ = self.shutdown.notified() => {
                        info!("Event relay received shutdown signal");
                        break 'connect;
                    }

                    delivery = self.local.recv() => match delivery {
                        Some(Delivery::Event(event)) if event.origin == EventOrigin::Local => {
                            if let Err(e) = self.forward(&event).await {
                                warn!(
                                    id = %event.id,
                                    action = %event.action,
                                    error = %e,
                                    "Failed to forward event"
                                );
                            }
                        }
                        Some(_) => {}
                        None => break 'connect,
                    },

                    received = listener.try_recv() => match received {
                        Ok(Some(notification)) => {
                            if let Err(e) = self.receive(notification.payload()).await {
                                warn!(error = %e, "Failed to relay notification");
                            }
                        }
                        // Reconnects on the next call.
                        Ok(None) => warn!("Event relay connection lost; reconnecting"),
                        Err(e) => {
                            warn!(error = %e, "Event relay listener failed");
                            break;
                        }
                    },
                }
            }

            if self.pause().await {
                break;
            }
        }

        info!("Event relay stopped");
    }

    async fn listen(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        debug!(channel = %self.channel, "Event relay listening");
        Ok(listener)
    }

    /// Sleep before reconnecting. Returns `true` if shutdown was signalled.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.notified() => true,
            _ = tokio::time::sleep(RECONNECT_DELAY) => false,
        }
    }

    /// Announce a local event to other processes.
    pub async fn forward(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(&Notification {
            kind: event.kind,
            action: event.action,
            id: event.id.clone(),
            origin: self.origin,
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Republish a notification from another process.
    ///
    /// Returns the event published on the local bus, if any.
    pub async fn receive(&self, payload: &str) -> Result<Option<Event>> {
        let notification: Notification = serde_json::from_str(payload)?;
        if notification.origin == self.origin {
            return Ok(None);
        }

        let event = match notification.kind {
            ResourceKind::Run => match self.store.get_run(&notification.id).await {
                Ok(run) => Event::run(notification.action, run),
                Err(CoreError::RunNotFound { .. }) => {
                    debug!(run_id = %notification.id, "Relayed run no longer exists");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            },
            ResourceKind::Workspace => match self.store.get_workspace(&notification.id).await {
                Ok(ws) => Event::workspace(notification.action, ws),
                Err(CoreError::WorkspaceNotFound { .. }) => Event::workspace(
                    notification.action,
                    Workspace::deleted(notification.id.clone()),
                ),
                Err(e) => return Err(e.into()),
            },
        }
        .relayed();

        self.bus.publish(event.clone());
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runplane_core::{CreateRunOptions, MemoryStore, Run, Subject};
    use sqlx::postgres::PgPoolOptions;

    fn relay(store: Arc<dyn Store>, bus: EventBus) -> EventRelay {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/runplane_unused")
            .unwrap();
        EventRelay::new(pool, bus, store, "runplane_events")
    }

    fn payload(kind: ResourceKind, action: EventAction, id: &str, origin: Uuid) -> String {
        serde_json::to_string(&Notification {
            kind,
            action,
            id: id.to_string(),
            origin,
        })
        .unwrap()
    }

    #[test]
    fn test_notification_wire_format() {
        let origin = Uuid::nil();
        let json = payload(ResourceKind::Run, EventAction::Ready, "run-abc", origin);
        assert_eq!(
            json,
            r#"{"kind":"run","action":"ready","id":"run-abc","origin":"00000000-0000-0000-0000-000000000000"}"#
        );
    }

    #[tokio::test]
    async fn test_receive_refetches_and_marks_remote() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ws = store
            .create_workspace(&Workspace::new("relay").unwrap())
            .await
            .unwrap();
        let run = store
            .create_run(&Run::new(
                CreateRunOptions {
                    workspace_id: ws.id.clone(),
                    ..Default::default()
                },
                &Subject::user("alice"),
            ))
            .await
            .unwrap();

        let bus = EventBus::default();
        let mut sub = bus.subscribe(&[]);
        let relay = relay(store, bus);

        let event = relay
            .receive(&payload(
                ResourceKind::Run,
                EventAction::Created,
                &run.id,
                Uuid::new_v4(),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.origin, EventOrigin::Remote);
        assert_eq!(event.as_run(), Some(&run));
        assert_eq!(sub.try_recv(), Some(Delivery::Event(event)));
    }

    #[tokio::test]
    async fn test_receive_skips_own_and_missing() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bus = EventBus::default();
        let mut sub = bus.subscribe(&[]);
        let relay = relay(store, bus);

        let own = payload(ResourceKind::Run, EventAction::Updated, "run-x", relay.origin());
        assert!(relay.receive(&own).await.unwrap().is_none());

        let missing = payload(ResourceKind::Run, EventAction::Updated, "run-x", Uuid::new_v4());
        assert!(relay.receive(&missing).await.unwrap().is_none());
        assert!(sub.try_recv().is_none());

        let deleted = relay
            .receive(&payload(
                ResourceKind::Workspace,
                EventAction::Deleted,
                "ws-gone",
                Uuid::new_v4(),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.action, EventAction::Deleted);
        assert_eq!(deleted.workspace_id(), "ws-gone");
        assert!(deleted.as_workspace().is_some_and(|ws| ws.name.is_empty()));

        assert!(relay.receive("not json").await.is_err());
    }
}
