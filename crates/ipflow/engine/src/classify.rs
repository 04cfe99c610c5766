//! Overdue/expired classification.
//!
//! Pure decision logic: given a past-due instance's stage, effective
//! deadline, and grace window, decide the status the sweep should write.
//! The sweep is responsible for acting on the decision.

use chrono::{DateTime, Duration, Utc};
use ipflow_types::{Stage, StageStatus};

/// Classify a stage instance that is past its effective deadline.
///
/// Reviewer stages only ever become overdue; a human reviewer's inaction
/// does not auto-close the record. Applicant-facing stages hard-expire
/// once the grace window (calendar days past the effective deadline) has
/// also passed.
pub fn classify_due(
    stage: Stage,
    effective_due: DateTime<Utc>,
    grace_days: i64,
    now: DateTime<Utc>,
) -> StageStatus {
    if stage.is_applicant_facing() && now > effective_due + Duration::days(grace_days) {
        StageStatus::Expired
    } else {
        StageStatus::Overdue
    }
}
