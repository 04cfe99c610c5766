//! Workflow stage engine for the IP submission system.
//!
//! The engine owns the stage lifecycle and the periodic SLA sweep: it
//! detects stage instances past their effective deadline, classifies them
//! overdue or expired, and dispatches rate-limited alerts to whoever is
//! responsible. It coordinates through storage and notifier seams and
//! never talks to a concrete backend or mail system itself.
//!
//! # State machine
//!
//! ```text
//! Active  --(past due, reviewer stage)--------------------> Overdue
//! Active  --(past due, applicant stage, within grace)-----> Overdue
//! Active  --(past due, applicant stage, past grace)-------> Expired
//! Overdue --(re-swept, applicant stage, past grace)-------> Expired
//! Overdue/Expired --(extension granted)-------------------> Active
//! Active/Overdue  --(stage resolved)----------------------> Completed
//! ```

#![deny(unsafe_code)]

pub mod classify;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod report;

pub use classify::classify_due;
pub use engine::StageEngine;
pub use error::{EngineError, EngineResult};
pub use notifier::{LogNotifier, Notifier, NotifyError};
pub use report::{SweepFailure, SweepReport};
