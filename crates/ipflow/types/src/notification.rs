//! Notification records: one row per alert sent to a user.
//!
//! Created by the engine, never mutated, read by the UI. The dedup key
//! makes dispatch idempotent when sweeps overlap: two sweeps classifying
//! the same instance on the same overdue day compute the same key and only
//! one row (and one delivery) survives.

use crate::{StageInstanceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an alert is about; drives title/message composition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    StageOverdue,
    StageExpired,
}

impl NotificationKind {
    pub fn as_key(&self) -> &'static str {
        match self {
            NotificationKind::StageOverdue => "stage_overdue",
            NotificationKind::StageExpired => "stage_expired",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Unique identifier for a notification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(pub String);

impl NotificationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An alert addressed to one user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// Idempotency key; duplicate keys are dropped by the store.
    pub dedup_key: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        recipient_id: UserId,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        dedup_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NotificationId::generate(),
            recipient_id,
            kind,
            title: title.into(),
            message: message.into(),
            dedup_key: dedup_key.into(),
            metadata: serde_json::Value::Null,
            created_at: now,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Key for sweep alerts: stable within one overdue day for one
    /// instance, distinct across days so the daily resend still goes out.
    pub fn sweep_dedup_key(
        instance_id: &StageInstanceId,
        kind: NotificationKind,
        days_overdue: i64,
    ) -> String {
        format!("{}:{}:{}d", instance_id, kind, days_overdue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_varies_by_day_not_by_sweep() {
        let instance_id = StageInstanceId::new("inst-1");
        let today_a =
            Notification::sweep_dedup_key(&instance_id, NotificationKind::StageOverdue, 3);
        let today_b =
            Notification::sweep_dedup_key(&instance_id, NotificationKind::StageOverdue, 3);
        let tomorrow =
            Notification::sweep_dedup_key(&instance_id, NotificationKind::StageOverdue, 4);

        assert_eq!(today_a, today_b);
        assert_ne!(today_a, tomorrow);
        assert_eq!(today_a, "inst-1:stage_overdue:3d");
    }

    #[test]
    fn metadata_defaults_to_null() {
        let note = Notification::new(
            UserId::new("user-1"),
            NotificationKind::StageExpired,
            "Stage expired",
            "The revision window has closed.",
            "inst-1:stage_expired:5d",
            Utc::now(),
        );
        assert!(note.metadata.is_null());

        let tagged = note.with_metadata(serde_json::json!({"record_id": "rec-1"}));
        assert_eq!(tagged.metadata["record_id"], "rec-1");
    }
}
