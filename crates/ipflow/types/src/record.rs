//! IP records: the submissions that move through the workflow.
//!
//! The engine only needs a summary of the parent record: enough to
//! resolve notification recipients and compose messages. Full disclosure
//! content, attachments, and documents live with external collaborators.

use crate::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for an IP record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user in the external identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Record Summary ───────────────────────────────────────────────────

/// Summary of an IP disclosure record as the engine sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpRecord {
    pub id: RecordId,
    pub title: String,
    /// The submitter. Fallback notification recipient for applicant stages.
    pub applicant_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluator_id: Option<UserId>,
    /// Key of the stage the record currently sits in.
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IpRecord {
    /// Create a new record in the submission stage.
    pub fn new(title: impl Into<String>, applicant_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::generate(),
            title: title.into(),
            applicant_id,
            supervisor_id: None,
            evaluator_id: None,
            status: Stage::Submission.as_key().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_supervisor(mut self, supervisor: UserId) -> Self {
        self.supervisor_id = Some(supervisor);
        self
    }

    pub fn with_evaluator(mut self, evaluator: UserId) -> Self {
        self.evaluator_id = Some(evaluator);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_in_submission() {
        let record = IpRecord::new("Gene sequencing rig", UserId::new("applicant-1"));
        assert_eq!(record.status, "submission");
        assert!(record.supervisor_id.is_none());
    }

    #[test]
    fn builder_assigns_reviewers() {
        let record = IpRecord::new("Compiler patent", UserId::new("applicant-1"))
            .with_supervisor(UserId::new("supervisor-1"))
            .with_evaluator(UserId::new("evaluator-1"));
        assert_eq!(record.supervisor_id.unwrap().0, "supervisor-1");
        assert_eq!(record.evaluator_id.unwrap().0, "evaluator-1");
    }
}
