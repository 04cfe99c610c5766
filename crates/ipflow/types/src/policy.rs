//! SLA policies: how long a stage may take before it is overdue, and how
//! much grace an applicant gets before hard expiry.
//!
//! One policy model covers every stage, including presentation materials;
//! the duration unit decides whether weekends count. At most one policy per
//! stage is active at a time; inactive policies do not retroactively affect
//! instances already created.

use crate::{add_stage_days, DurationUnit, Stage};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Nominal stage duration used when no policy row exists.
pub const DEFAULT_STAGE_DURATION_DAYS: u32 = 14;
/// Materials requests default to ten business days, the one rule the
/// original workflow hardcoded.
pub const DEFAULT_MATERIALS_BUSINESS_DAYS: u32 = 10;

/// Per-stage service-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlaPolicy {
    pub stage: Stage,
    /// Time budget before the stage is due, counted in `duration_unit`.
    pub duration_days: u32,
    pub duration_unit: DurationUnit,
    /// Calendar days past the effective deadline before an applicant-facing
    /// stage is marked expired. Reviewer stages never expire.
    pub grace_days: i64,
    pub allow_extensions: bool,
    pub max_extensions: u32,
    /// How far each granted extension pushes the deadline, in
    /// `duration_unit` days.
    pub extension_days: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SlaPolicy {
    pub fn new(stage: Stage, duration_days: u32) -> Self {
        let now = Utc::now();
        Self {
            stage,
            duration_days,
            duration_unit: DurationUnit::CalendarDays,
            grace_days: 0,
            allow_extensions: false,
            max_extensions: 0,
            extension_days: 0,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn business_days(mut self) -> Self {
        self.duration_unit = DurationUnit::BusinessDays;
        self
    }

    pub fn with_grace(mut self, grace_days: i64) -> Self {
        self.grace_days = grace_days;
        self
    }

    pub fn with_extensions(mut self, max_extensions: u32, extension_days: u32) -> Self {
        self.allow_extensions = true;
        self.max_extensions = max_extensions;
        self.extension_days = extension_days;
        self
    }

    /// Fail-open policy applied when a stage has no active policy row.
    pub fn default_for(stage: Stage) -> Self {
        match stage {
            Stage::MaterialsRequested => {
                Self::new(stage, DEFAULT_MATERIALS_BUSINESS_DAYS).business_days()
            }
            _ => Self::new(stage, DEFAULT_STAGE_DURATION_DAYS),
        }
    }

    /// Nominal deadline for a stage entered at `start`.
    pub fn due_from(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        add_stage_days(start, self.duration_days, self.duration_unit)
    }

    /// Hard-expiry boundary for applicant-facing stages.
    pub fn grace_deadline(&self, effective_due: DateTime<Utc>) -> DateTime<Utc> {
        effective_due + Duration::days(self.grace_days)
    }
}
