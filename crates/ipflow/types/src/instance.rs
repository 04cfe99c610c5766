//! Stage instances: one concrete occurrence of a record being in a stage.
//!
//! Instances are append-only. A record re-entering a stage gets a fresh
//! instance; old ones stay behind as the audit trail of every deadline the
//! record has faced.

use crate::{RecordId, Stage, StageStatus, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Instance Identifier ──────────────────────────────────────────────

/// Unique identifier for a stage instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageInstanceId(pub String);

impl StageInstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for StageInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Responsible Party ────────────────────────────────────────────────

/// Who is on the clock for a stage instance.
///
/// Resolved once when the instance is created, never re-derived during a
/// sweep. An applicant-facing stage with no explicit assignee points back
/// at the record's submitter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Responsible {
    /// An explicitly assigned reviewer owns the deadline.
    AssignedReviewer { user_id: UserId },
    /// The record's submitter owns the deadline.
    Applicant { record_id: RecordId },
}

impl Responsible {
    /// Build the responsible party for a stage: explicit assignee wins,
    /// otherwise the applicant of the owning record.
    pub fn resolve(record_id: &RecordId, assigned_user: Option<UserId>) -> Self {
        match assigned_user {
            Some(user_id) => Responsible::AssignedReviewer { user_id },
            None => Responsible::Applicant {
                record_id: record_id.clone(),
            },
        }
    }
}

// ── Stage Instance ───────────────────────────────────────────────────

/// A record's occupancy of one workflow stage, with its own deadline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageInstance {
    pub id: StageInstanceId,
    /// The owning submission.
    pub record_id: RecordId,
    pub stage: Stage,
    pub status: StageStatus,
    pub responsible: Responsible,
    /// Nominal deadline computed from the SLA policy at creation.
    pub due_at: DateTime<Utc>,
    /// Extension override; supersedes `due_at` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_until: Option<DateTime<Utc>>,
    /// How many extensions have been granted so far.
    pub extension_count: u32,
    /// Last notification timestamp, for the resend cooldown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageInstance {
    /// Open a new ACTIVE instance with the given deadline.
    pub fn open(
        record_id: RecordId,
        stage: Stage,
        responsible: Responsible,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: StageInstanceId::generate(),
            record_id,
            stage,
            status: StageStatus::Active,
            responsible,
            due_at,
            extended_until: None,
            extension_count: 0,
            notified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The deadline that actually governs this instance.
    pub fn effective_due(&self) -> DateTime<Utc> {
        self.extended_until.unwrap_or(self.due_at)
    }

    /// Whole days past the effective deadline (0 when not yet due).
    pub fn days_overdue(&self, now: DateTime<Utc>) -> i64 {
        (now - self.effective_due()).num_days().max(0)
    }

    /// True when the instance can still be acted on.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Notification rate limit: fire only when never notified, or when the
    /// last notification is older than `cooldown`.
    pub fn should_notify(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.notified_at {
            None => true,
            Some(at) => now - at > cooldown,
        }
    }
}
