//! Sweep outcome reporting.

use chrono::{DateTime, Utc};
use ipflow_types::{StageInstanceId, StageStatus};
use serde::Serialize;

/// One candidate the sweep could not process. The rest of the batch is
/// unaffected.
#[derive(Clone, Debug, Serialize)]
pub struct SweepFailure {
    pub instance_id: StageInstanceId,
    pub message: String,
}

/// Summary of one sweep run.
#[derive(Clone, Debug, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    /// Candidates visited, including ones that later failed.
    pub checked: usize,
    pub marked_overdue: usize,
    pub marked_expired: usize,
    pub notifications_sent: usize,
    pub errors: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            checked: 0,
            marked_overdue: 0,
            marked_expired: 0,
            notifications_sent: 0,
            errors: Vec::new(),
        }
    }

    pub(crate) fn record_transition(&mut self, status: StageStatus) {
        match status {
            StageStatus::Overdue => self.marked_overdue += 1,
            StageStatus::Expired => self.marked_expired += 1,
            _ => {}
        }
    }

    pub(crate) fn record_failure(&mut self, instance_id: StageInstanceId, message: String) {
        self.errors.push(SweepFailure {
            instance_id,
            message,
        });
    }

    /// Human-readable one-liner for the API response and the log.
    pub fn summary_message(&self) -> String {
        format!(
            "checked {} stage instance(s): {} overdue, {} expired, {} notification(s) sent, {} error(s)",
            self.checked,
            self.marked_overdue,
            self.marked_expired,
            self.notifications_sent,
            self.errors.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_everything() {
        let mut report = SweepReport::new(Utc::now());
        report.checked = 3;
        report.record_transition(StageStatus::Overdue);
        report.record_transition(StageStatus::Overdue);
        report.record_transition(StageStatus::Expired);
        report.record_failure(StageInstanceId::new("inst-1"), "boom".to_string());

        assert_eq!(report.marked_overdue, 2);
        assert_eq!(report.marked_expired, 1);
        assert_eq!(
            report.summary_message(),
            "checked 3 stage instance(s): 2 overdue, 1 expired, 0 notification(s) sent, 1 error(s)"
        );
    }
}
