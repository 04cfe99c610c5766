//! Storage seams consumed by the stage engine and the REST surface.
//!
//! Status transitions take an `expected_updated_at` witness: the update
//! only lands if the row has not moved since it was read, so overlapping
//! sweeps cannot silently overwrite each other's transitions.

use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipflow_types::{
    IpRecord, Notification, RecordId, SlaPolicy, Stage, StageInstance, StageInstanceId,
    StageStatus, UserId,
};

/// A due stage instance joined to its parent record, as returned by the
/// sweep candidate query.
#[derive(Clone, Debug)]
pub struct DueCandidate {
    pub instance: StageInstance,
    pub record: IpRecord,
}

/// Storage interface for IP disclosure records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_record(&self, record: IpRecord) -> StorageResult<()>;

    async fn get_record(&self, id: &RecordId) -> StorageResult<Option<IpRecord>>;

    /// Update the record's current-stage key.
    async fn set_record_status(
        &self,
        id: &RecordId,
        status: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()>;
}

/// Storage interface for workflow stage instances.
#[async_trait]
pub trait StageInstanceStore: Send + Sync {
    /// Persist a freshly opened instance.
    ///
    /// Fails with `InvariantViolation` if the record already has an open
    /// (active or overdue) instance: one record, one deadline at a time.
    async fn open_instance(&self, instance: StageInstance) -> StorageResult<()>;

    async fn get_instance(&self, id: &StageInstanceId) -> StorageResult<Option<StageInstance>>;

    /// Instances past their effective deadline that a sweep should visit
    /// (status active or overdue), joined to the parent record, ordered by
    /// effective due date ascending, earliest overdue first.
    async fn list_due_instances(&self, now: DateTime<Utc>) -> StorageResult<Vec<DueCandidate>>;

    /// Conditionally transition an instance's status. Fails with
    /// `Conflict` when the row's `updated_at` no longer matches
    /// `expected_updated_at`.
    async fn mark_status(
        &self,
        id: &StageInstanceId,
        status: StageStatus,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Record that a notification went out. Best-effort from the engine's
    /// perspective; no concurrency witness.
    async fn stamp_notified(&self, id: &StageInstanceId, now: DateTime<Utc>)
        -> StorageResult<()>;

    /// Push the deadline and reopen the instance: sets `extended_until`,
    /// increments the extension count, and flips status back to active.
    async fn apply_extension(
        &self,
        id: &StageInstanceId,
        extended_until: DateTime<Utc>,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Resolve an open instance. Fails with `InvariantViolation` on an
    /// instance that is already terminal.
    async fn complete_instance(
        &self,
        id: &StageInstanceId,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;
}

/// Storage interface for SLA policies.
#[async_trait]
pub trait SlaPolicyStore: Send + Sync {
    /// The single active policy for a stage, if any. Absence is a valid
    /// state, never an error: the engine fails open.
    async fn active_policy(&self, stage: Stage) -> StorageResult<Option<SlaPolicy>>;

    /// Install a policy as the active one for its stage, retiring any
    /// previously active policy. Retired policies are kept for audit.
    async fn upsert_policy(&self, policy: SlaPolicy) -> StorageResult<()>;

    async fn list_policies(&self) -> StorageResult<Vec<SlaPolicy>>;
}

/// Storage interface for the append-only notification trail.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Append a notification. Returns `false` (and stores nothing) when a
    /// row with the same dedup key already exists.
    async fn append_notification(&self, notification: Notification) -> StorageResult<bool>;

    async fn list_notifications_for(
        &self,
        recipient: &UserId,
    ) -> StorageResult<Vec<Notification>>;
}

/// Unified storage bundle used by the service bootstrap.
pub trait IpStore:
    RecordStore + StageInstanceStore + SlaPolicyStore + NotificationStore + Send + Sync
{
}

impl<T> IpStore for T where
    T: RecordStore + StageInstanceStore + SlaPolicyStore + NotificationStore + Send + Sync
{
}
