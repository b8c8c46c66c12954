// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hook points around resource creation.
//!
//! A [`Hook`] wraps a storage write with listener callbacks:
//!
//! 1. every listener's `before` runs first; an error from any of them vetoes
//!    the write and is returned to the caller as [`CoreError::HookRejected`],
//! 2. the write commits,
//! 3. every listener's `after` runs with the stored value; failures are
//!    logged and never undo the write,
//! 4. the caller publishes the domain event only once `dispatch` returns,
//!    so `after` listeners always observe the write before any subscriber.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{CoreError, Result};

/// Observer of resource creation.
#[async_trait]
pub trait HookListener<T: Send + Sync>: Send + Sync {
    /// Called before the write. Returning an error aborts the write.
    async fn before(&self, _value: &T) -> Result<()> {
        Ok(())
    }

    /// Called after the write committed.
    async fn after(&self, _value: &T) -> Result<()> {
        Ok(())
    }
}

/// Ordered set of listeners for one resource type.
pub struct Hook<T: Send + Sync> {
    listeners: Vec<Arc<dyn HookListener<T>>>,
}

impl<T: Send + Sync> Default for Hook<T> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<T: Send + Sync> Hook<T> {
    /// Append a listener. Listeners run in registration order.
    pub fn register(&mut self, listener: Arc<dyn HookListener<T>>) {
        self.listeners.push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Run `write` surrounded by the registered listeners.
    pub async fn dispatch<F, Fut>(&self, value: T, write: F) -> Result<T>
    where
        F: FnOnce(T) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        for listener in &self.listeners {
            listener.before(&value).await.map_err(|err| match err {
                CoreError::HookRejected(_) => err,
                other => CoreError::HookRejected(other.to_string()),
            })?;
        }

        let written = write(value).await?;

        for listener in &self.listeners {
            if let Err(err) = listener.after(&written).await {
                warn!(error = %err, "After-create hook failed");
            }
        }

        Ok(written)
    }
}
