// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authorized subject attached to externally initiated operations.
//!
//! Permissions are checked before a request reaches this crate; the subject
//! is only recorded for audit alongside each transition.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// A human user.
    User,
    /// An execution agent reporting phase progress.
    Agent,
    /// The scheduler itself.
    System,
}

/// Identity of whoever initiated an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    /// Category of actor.
    pub kind: SubjectKind,
    /// Actor identifier (username, agent ID, or "scheduler").
    pub id: String,
}

impl Subject {
    /// A human user.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::User,
            id: id.into(),
        }
    }

    /// An execution agent.
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::Agent,
            id: id.into(),
        }
    }

    /// The scheduler acting on its own behalf.
    pub fn system() -> Self {
        Self {
            kind: SubjectKind::System,
            id: "scheduler".to_string(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SubjectKind::User => write!(f, "user:{}", self.id),
            SubjectKind::Agent => write!(f, "agent:{}", self.id),
            SubjectKind::System => write!(f, "system:{}", self.id),
        }
    }
}
