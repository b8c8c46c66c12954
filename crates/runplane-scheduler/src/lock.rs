// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-process workspace ownership.
//!
//! A scheduler instance drives a workspace's run queue only while it holds
//! that workspace's lock. The PostgreSQL implementation uses session-level
//! advisory locks on one dedicated connection, so a crashed process loses
//! every lock as soon as its session ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgPool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default interval between attempts of a blocking [`WorkspaceLocker::acquire`].
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Advisory lock key for a workspace: the first 8 bytes of its SHA-256 digest.
pub fn lock_key(workspace_id: &str) -> i64 {
    let digest = Sha256::digest(workspace_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Proof of ownership of one workspace lock.
#[derive(Debug)]
pub struct LockHandle {
    workspace_id: String,
    key: i64,
    generation: u64,
    released: bool,
}

impl LockHandle {
    fn new(workspace_id: &str, generation: u64) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            key: lock_key(workspace_id),
            generation,
            released: false,
        }
    }

    /// Locked workspace.
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Advisory lock key.
    pub fn key(&self) -> i64 {
        self.key
    }
}

/// Distributed mutual exclusion keyed by workspace ID.
#[async_trait]
pub trait WorkspaceLocker: Send + Sync {
    /// Take the lock if no other process holds it.
    async fn try_acquire(&self, workspace_id: &str) -> Result<Option<LockHandle>>;

    /// Give up the lock. Releasing twice is a no-op.
    async fn release(&self, handle: &mut LockHandle) -> Result<()>;

    /// Whether the lock behind `handle` is still held by this process.
    async fn is_held(&self, handle: &LockHandle) -> bool;

    /// Delay between attempts of [`WorkspaceLocker::acquire`].
    fn retry_interval(&self) -> Duration {
        DEFAULT_RETRY_INTERVAL
    }

    /// Wait until the lock can be taken.
    async fn acquire(&self, workspace_id: &str) -> Result<LockHandle> {
        loop {
            if let Some(handle) = self.try_acquire(workspace_id).await? {
                return Ok(handle);
            }
            debug!(workspace_id, "Workspace lock busy; waiting");
            tokio::time::sleep(self.retry_interval()).await;
        }
    }
}

// ============================================================================
// PostgreSQL advisory locks
// ============================================================================

#[derive(Default)]
struct Session {
    conn: Option<PgConnection>,
    generation: u64,
    held: HashMap<i64, usize>,
}

impl Session {
    async fn connection(&mut self, pool: &PgPool) -> Result<&mut PgConnection> {
        if self.conn.is_none() {
            let conn = pool.acquire().await?.detach();
            self.generation += 1;
            self.held.clear();
            info!(generation = self.generation, "Advisory lock session opened");
            self.conn = Some(conn);
        }
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(Error::Lock {
                workspace_id: String::new(),
                details: "advisory lock session unavailable".to_string(),
            }),
        }
    }

    /// Forget the session. The server releases its locks when the connection closes.
    fn invalidate(&mut self) {
        if self.conn.take().is_some() {
            warn!(
                generation = self.generation,
                held = self.held.len(),
                "Advisory lock session lost; all workspace locks dropped"
            );
        }
        self.held.clear();
    }
}

/// [`WorkspaceLocker`] backed by PostgreSQL session advisory locks.
///
/// All locks of one locker live on a single detached connection. Use one
/// locker per scheduler instance: advisory locks are re-entrant within a
/// session, so two schedulers sharing a locker would not exclude each other.
pub struct PgAdvisoryLocker {
    pool: PgPool,
    session: Mutex<Session>,
    retry_interval: Duration,
}

impl PgAdvisoryLocker {
    /// Create a locker. The session connection is opened on first use.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            session: Mutex::new(Session::default()),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Set the delay between blocking acquisition attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Close the session, dropping every lock at once.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        session.held.clear();
        session.conn = None;
    }
}

fn lock_error(workspace_id: &str, err: impl ToString) -> Error {
    Error::Lock {
        workspace_id: workspace_id.to_string(),
        details: err.to_string(),
    }
}

#[async_trait]
impl WorkspaceLocker for PgAdvisoryLocker {
    async fn try_acquire(&self, workspace_id: &str) -> Result<Option<LockHandle>> {
        let key = lock_key(workspace_id);
        let mut session = self.session.lock().await;

        let result = {
            let conn = session
                .connection(&self.pool)
                .await
                .map_err(|err| lock_error(workspace_id, err))?;
            sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(conn)
                .await
        };

        let acquired = match result {
            Ok(acquired) => acquired,
            Err(err) => {
                session.invalidate();
                return Err(lock_error(workspace_id, err));
            }
        };
        if !acquired {
            return Ok(None);
        }

        *session.held.entry(key).or_insert(0) += 1;
        debug!(workspace_id, key, "Workspace lock acquired");
        Ok(Some(LockHandle::new(workspace_id, session.generation)))
    }

    async fn release(&self, handle: &mut LockHandle) -> Result<()> {
        if handle.released {
            return Ok(());
        }
        handle.released = true;

        let mut session = self.session.lock().await;
        if handle.generation != session.generation || session.conn.is_none() {
            // The session that held it is gone, and with it the lock.
            return Ok(());
        }
        let remaining = match session.held.get_mut(&handle.key) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return Ok(()),
        };
        if remaining == 0 {
            session.held.remove(&handle.key);
        }

        // The server counts re-entrant acquisitions too, so every release unlocks once.
        let result = match session.conn.as_mut() {
            Some(conn) => sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(handle.key)
                .fetch_one(conn)
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        if let Err(err) = result {
            warn!(workspace_id = %handle.workspace_id, error = %err, "Failed to unlock; closing session");
            session.invalidate();
        } else {
            debug!(workspace_id = %handle.workspace_id, "Workspace lock released");
        }
        Ok(())
    }

    async fn is_held(&self, handle: &LockHandle) -> bool {
        if handle.released {
            return false;
        }
        let mut session = self.session.lock().await;
        if handle.generation != session.generation || !session.held.contains_key(&handle.key) {
            return false;
        }
        let ping = match session.conn.as_mut() {
            Some(conn) => sqlx::query("SELECT 1").execute(conn).await.map(|_| ()),
            None => return false,
        };
        if ping.is_err() {
            session.invalidate();
            return false;
        }
        true
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

// ============================================================================
// In-process lock service
// ============================================================================

/// Lock table shared by several [`LocalLocker`]s.
///
/// Each locker behaves like a separate process holding its own session,
/// which lets single-node deployments and tests run several schedulers
/// side by side.
#[derive(Clone, Default)]
pub struct LocalLockService {
    // key -> (owning locker, re-entrant count)
    table: Arc<Mutex<HashMap<i64, (u64, usize)>>>,
    next_locker: Arc<AtomicU64>,
}

impl LocalLockService {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new locker with its own identity.
    pub fn locker(&self) -> LocalLocker {
        LocalLocker {
            id: self.next_locker.fetch_add(1, Ordering::SeqCst) + 1,
            service: self.clone(),
            generation: AtomicU64::new(1),
            retry_interval: Duration::from_millis(10),
        }
    }

    /// ID of the locker currently holding the workspace lock.
    pub async fn holder(&self, workspace_id: &str) -> Option<u64> {
        let table = self.table.lock().await;
        table.get(&lock_key(workspace_id)).map(|(owner, _)| *owner)
    }
}

/// One participant of a [`LocalLockService`].
pub struct LocalLocker {
    id: u64,
    service: LocalLockService,
    generation: AtomicU64,
    retry_interval: Duration,
}

impl LocalLocker {
    /// Identity of this locker within its service.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drop every lock of this locker, as a terminated session would.
    ///
    /// Handles issued before the crash report `is_held == false`.
    pub async fn crash(&self) {
        let mut table = self.service.table.lock().await;
        table.retain(|_, (owner, _)| *owner != self.id);
        self.generation.fetch_add(1, Ordering::SeqCst);
        warn!(locker = self.id, "Local locker crashed; all its locks dropped");
    }
}

#[async_trait]
impl WorkspaceLocker for LocalLocker {
    async fn try_acquire(&self, workspace_id: &str) -> Result<Option<LockHandle>> {
        let key = lock_key(workspace_id);
        let mut table = self.service.table.lock().await;
        let entry = table.entry(key).or_insert((self.id, 0));
        if entry.0 != self.id {
            return Ok(None);
        }
        entry.1 += 1;
        Ok(Some(LockHandle::new(
            workspace_id,
            self.generation.load(Ordering::SeqCst),
        )))
    }

    async fn release(&self, handle: &mut LockHandle) -> Result<()> {
        if handle.released {
            return Ok(());
        }
        handle.released = true;
        if handle.generation != self.generation.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut table = self.service.table.lock().await;
        let remaining = match table.get_mut(&handle.key) {
            Some((owner, count)) if *owner == self.id => {
                *count -= 1;
                *count
            }
            _ => return Ok(()),
        };
        if remaining == 0 {
            table.remove(&handle.key);
        }
        Ok(())
    }

    async fn is_held(&self, handle: &LockHandle) -> bool {
        if handle.released || handle.generation != self.generation.load(Ordering::SeqCst) {
            return false;
        }
        let table = self.service.table.lock().await;
        table
            .get(&handle.key)
            .is_some_and(|(owner, _)| *owner == self.id)
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}
