//! Workflow stages and stage-instance statuses.
//!
//! A stage is a named phase of the IP review workflow. Applicant-facing
//! stages put the submitter on the clock and are the only stages that can
//! hard-expire; reviewer stages stay overdue until a human acts.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// A named phase in the IP submission workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Initial disclosure submission by the applicant.
    Submission,
    /// Review by the applicant's supervisor.
    SupervisorReview,
    /// Formal evaluation by an assigned evaluator.
    Evaluation,
    /// Applicant asked to revise the disclosure.
    RevisionRequested,
    /// Applicant asked to provide academic presentation materials.
    MaterialsRequested,
    /// Terminal stage: certificate/disclosure documents issued.
    Completion,
}

impl Stage {
    /// Stages where the responsible party is the submitter, not a reviewer.
    /// Only these stages can transition to [`StageStatus::Expired`].
    pub fn is_applicant_facing(&self) -> bool {
        matches!(self, Stage::RevisionRequested | Stage::MaterialsRequested)
    }

    /// Stable string key used in the database and API payloads.
    pub fn as_key(&self) -> &'static str {
        match self {
            Stage::Submission => "submission",
            Stage::SupervisorReview => "supervisor_review",
            Stage::Evaluation => "evaluation",
            Stage::RevisionRequested => "revision_requested",
            Stage::MaterialsRequested => "materials_requested",
            Stage::Completion => "completion",
        }
    }

    /// All stages, in workflow order.
    pub fn all() -> &'static [Stage] {
        &[
            Stage::Submission,
            Stage::SupervisorReview,
            Stage::Evaluation,
            Stage::RevisionRequested,
            Stage::MaterialsRequested,
            Stage::Completion,
        ]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

#[derive(Debug, Error)]
#[error("unknown stage '{0}'")]
pub struct ParseStageError(pub String);

impl FromStr for Stage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submission" => Ok(Stage::Submission),
            "supervisor_review" => Ok(Stage::SupervisorReview),
            "evaluation" => Ok(Stage::Evaluation),
            "revision_requested" => Ok(Stage::RevisionRequested),
            "materials_requested" => Ok(Stage::MaterialsRequested),
            "completion" => Ok(Stage::Completion),
            other => Err(ParseStageError(other.to_string())),
        }
    }
}

// ── Stage Status ─────────────────────────────────────────────────────

/// Lifecycle status of one stage instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Within deadline, awaiting action.
    #[default]
    Active,
    /// Past its effective deadline; still actionable.
    Overdue,
    /// Applicant-facing stage past its grace window. Terminal for the
    /// instance; record-level remediation happens outside the engine.
    Expired,
    /// Resolved by an external actor.
    Completed,
}

impl StageStatus {
    /// Terminal statuses are never revisited by the sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Expired | StageStatus::Completed)
    }

    pub fn as_key(&self) -> &'static str {
        match self {
            StageStatus::Active => "active",
            StageStatus::Overdue => "overdue",
            StageStatus::Expired => "expired",
            StageStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

#[derive(Debug, Error)]
#[error("unknown stage status '{0}'")]
pub struct ParseStageStatusError(pub String);

impl FromStr for StageStatus {
    type Err = ParseStageStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(StageStatus::Active),
            "overdue" => Ok(StageStatus::Overdue),
            "expired" => Ok(StageStatus::Expired),
            "completed" => Ok(StageStatus::Completed),
            other => Err(ParseStageStatusError(other.to_string())),
        }
    }
}
