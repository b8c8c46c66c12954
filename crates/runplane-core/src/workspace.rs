// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace record: the unit that serializes run execution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::ids;
use crate::subject::{Subject, SubjectKind};

/// Whoever holds a workspace's exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LockHolder {
    /// A dispatched non-speculative run.
    Run(String),
    /// A manual lock taken by a user.
    User(String),
    /// The system itself.
    System,
}

impl LockHolder {
    /// Database representation as `(kind, id)`.
    pub fn to_parts(&self) -> (&'static str, Option<&str>) {
        match self {
            LockHolder::Run(id) => ("run", Some(id)),
            LockHolder::User(id) => ("user", Some(id)),
            LockHolder::System => ("system", None),
        }
    }

    /// Inverse of [`LockHolder::to_parts`].
    pub fn from_parts(kind: Option<&str>, id: Option<&str>) -> Result<Option<Self>> {
        match (kind, id) {
            (None, _) => Ok(None),
            (Some("run"), Some(id)) => Ok(Some(LockHolder::Run(id.to_string()))),
            (Some("user"), Some(id)) => Ok(Some(LockHolder::User(id.to_string()))),
            (Some("system"), _) => Ok(Some(LockHolder::System)),
            (Some(kind), _) => Err(CoreError::Validation {
                field: "lock_kind".to_string(),
                message: format!("unknown lock holder '{}'", kind),
            }),
        }
    }

    /// Lock holder representing a subject taking a manual lock.
    pub fn for_subject(subject: &Subject) -> Self {
        match subject.kind {
            SubjectKind::System => LockHolder::System,
            _ => LockHolder::User(subject.to_string()),
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHolder::Run(id) => write!(f, "run {}", id),
            LockHolder::User(id) => write!(f, "{}", id),
            LockHolder::System => f.write_str("system"),
        }
    }
}

/// A workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Unique workspace ID (`ws-…`).
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Run currently occupying the workspace.
    pub current_run_id: Option<String>,
    /// Exclusive lock holder.
    pub lock: Option<LockHolder>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Construct a new, unlocked workspace.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(CoreError::Validation {
                field: "name".to_string(),
                message: format!("'{}' is not a valid workspace name", name),
            });
        }
        let now = ids::current_timestamp();
        Ok(Self {
            id: ids::new_id("ws"),
            name,
            current_run_id: None,
            lock: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Placeholder snapshot for a workspace that no longer exists.
    pub fn deleted(id: impl Into<String>) -> Self {
        let now = ids::current_timestamp();
        Self {
            id: id.into(),
            name: String::new(),
            current_run_id: None,
            lock: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a user (rather than a run) holds the lock.
    pub fn is_manually_locked(&self) -> bool {
        matches!(self.lock, Some(LockHolder::User(_)) | Some(LockHolder::System))
    }

    /// Compute the lock after `holder` requests it.
    ///
    /// Re-locking by the same holder is allowed and leaves the lock unchanged.
    pub fn lock_for(&self, holder: LockHolder) -> Result<LockHolder> {
        match &self.lock {
            None => Ok(holder),
            Some(current) if *current == holder => Ok(holder),
            Some(current) => Err(CoreError::WorkspaceLocked {
                workspace_id: self.id.clone(),
                holder: current.to_string(),
            }),
        }
    }

    /// Check whether `holder` may remove the current lock.
    ///
    /// Run locks are released only by the run reaching a terminal status.
    /// A different user's lock can only be removed with `force`.
    pub fn check_unlock(&self, holder: &LockHolder, force: bool) -> Result<()> {
        match &self.lock {
            None => Ok(()),
            Some(current @ LockHolder::Run(_)) => Err(CoreError::WorkspaceLocked {
                workspace_id: self.id.clone(),
                holder: current.to_string(),
            }),
            Some(current) if current == holder || force => Ok(()),
            Some(current) => Err(CoreError::WorkspaceLocked {
                workspace_id: self.id.clone(),
                holder: current.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_workspace_validates_name() {
        let ws = Workspace::new("prod-network").unwrap();
        assert!(ws.id.starts_with("ws-"));
        assert!(ws.lock.is_none());
        assert!(Workspace::new("").is_err());
        assert!(Workspace::new("bad name!").is_err());
    }

    #[test]
    fn test_lock_holder_parts_round_trip() {
        for holder in [
            LockHolder::Run("run-1".to_string()),
            LockHolder::User("user:alice".to_string()),
            LockHolder::System,
        ] {
            let (kind, id) = holder.to_parts();
            assert_eq!(
                LockHolder::from_parts(Some(kind), id).unwrap(),
                Some(holder.clone())
            );
        }
        assert_eq!(LockHolder::from_parts(None, None).unwrap(), None);
        assert!(LockHolder::from_parts(Some("robot"), Some("x")).is_err());
    }

    #[test]
    fn test_lock_conflicts() {
        let mut ws = Workspace::new("staging").unwrap();
        let alice = LockHolder::for_subject(&Subject::user("alice"));
        let bob = LockHolder::for_subject(&Subject::user("bob"));

        ws.lock = Some(ws.lock_for(alice.clone()).unwrap());
        assert!(ws.is_manually_locked());
        assert_eq!(ws.lock_for(alice.clone()).unwrap(), alice);
        assert_eq!(ws.lock_for(bob.clone()).unwrap_err().error_code(), "WORKSPACE_LOCKED");

        assert!(ws.check_unlock(&bob, false).is_err());
        assert!(ws.check_unlock(&bob, true).is_ok());
        assert!(ws.check_unlock(&alice, false).is_ok());
    }

    #[test]
    fn test_run_lock_cannot_be_removed_manually() {
        let mut ws = Workspace::new("staging").unwrap();
        ws.lock = Some(LockHolder::Run("run-1".to_string()));
        assert!(!ws.is_manually_locked());
        let alice = LockHolder::for_subject(&Subject::user("alice"));
        assert!(ws.check_unlock(&alice, true).is_err());
    }
}
