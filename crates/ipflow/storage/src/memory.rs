//! In-memory reference implementation of the storage seams.
//!
//! This adapter is deterministic and test-friendly. Production deployments
//! should use the PostgreSQL adapter for source-of-truth data.

use crate::traits::{
    DueCandidate, NotificationStore, RecordStore, SlaPolicyStore, StageInstanceStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipflow_types::{
    IpRecord, Notification, RecordId, SlaPolicy, Stage, StageInstance, StageInstanceId,
    StageStatus, UserId,
};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory storage adapter.
#[derive(Default)]
pub struct InMemoryIpStore {
    records: RwLock<HashMap<RecordId, IpRecord>>,
    instances: RwLock<HashMap<StageInstanceId, StageInstance>>,
    policies: RwLock<Vec<SlaPolicy>>,
    notifications: RwLock<Vec<Notification>>,
}

impl InMemoryIpStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryIpStore {
    async fn create_record(&self, record: IpRecord) -> StorageResult<()> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| StorageError::Backend("records lock poisoned".to_string()))?;
        if guard.contains_key(&record.id) {
            return Err(StorageError::Conflict(format!(
                "record {} already exists",
                record.id
            )));
        }
        guard.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_record(&self, id: &RecordId) -> StorageResult<Option<IpRecord>> {
        let guard = self
            .records
            .read()
            .map_err(|_| StorageError::Backend("records lock poisoned".to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn set_record_status(
        &self,
        id: &RecordId,
        status: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| StorageError::Backend("records lock poisoned".to_string()))?;
        let record = guard
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("record {} not found", id)))?;
        record.status = status.to_string();
        record.updated_at = updated_at;
        Ok(())
    }
}

#[async_trait]
impl StageInstanceStore for InMemoryIpStore {
    async fn open_instance(&self, instance: StageInstance) -> StorageResult<()> {
        let mut guard = self
            .instances
            .write()
            .map_err(|_| StorageError::Backend("instances lock poisoned".to_string()))?;

        let open_exists = guard.values().any(|existing| {
            existing.record_id == instance.record_id
                && matches!(
                    existing.status,
                    StageStatus::Active | StageStatus::Overdue
                )
        });
        if open_exists {
            return Err(StorageError::InvariantViolation(format!(
                "record {} already has an open stage instance",
                instance.record_id
            )));
        }

        guard.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get_instance(&self, id: &StageInstanceId) -> StorageResult<Option<StageInstance>> {
        let guard = self
            .instances
            .read()
            .map_err(|_| StorageError::Backend("instances lock poisoned".to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn list_due_instances(&self, now: DateTime<Utc>) -> StorageResult<Vec<DueCandidate>> {
        let instances = self
            .instances
            .read()
            .map_err(|_| StorageError::Backend("instances lock poisoned".to_string()))?;
        let records = self
            .records
            .read()
            .map_err(|_| StorageError::Backend("records lock poisoned".to_string()))?;

        let mut due = Vec::new();
        for instance in instances.values() {
            let sweepable = matches!(
                instance.status,
                StageStatus::Active | StageStatus::Overdue
            );
            if !sweepable || instance.effective_due() >= now {
                continue;
            }
            let record = records.get(&instance.record_id).ok_or_else(|| {
                StorageError::InvariantViolation(format!(
                    "stage instance {} references missing record {}",
                    instance.id, instance.record_id
                ))
            })?;
            due.push(DueCandidate {
                instance: instance.clone(),
                record: record.clone(),
            });
        }

        due.sort_by_key(|candidate| candidate.instance.effective_due());
        Ok(due)
    }

    async fn mark_status(
        &self,
        id: &StageInstanceId,
        status: StageStatus,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut guard = self
            .instances
            .write()
            .map_err(|_| StorageError::Backend("instances lock poisoned".to_string()))?;
        let instance = guard
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("stage instance {} not found", id)))?;

        if instance.updated_at != expected_updated_at {
            return Err(StorageError::Conflict(format!(
                "stage instance {} changed since it was read",
                id
            )));
        }

        instance.status = status;
        instance.updated_at = now;
        Ok(())
    }

    async fn stamp_notified(
        &self,
        id: &StageInstanceId,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut guard = self
            .instances
            .write()
            .map_err(|_| StorageError::Backend("instances lock poisoned".to_string()))?;
        let instance = guard
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("stage instance {} not found", id)))?;
        instance.notified_at = Some(now);
        instance.updated_at = now;
        Ok(())
    }

    async fn apply_extension(
        &self,
        id: &StageInstanceId,
        extended_until: DateTime<Utc>,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut guard = self
            .instances
            .write()
            .map_err(|_| StorageError::Backend("instances lock poisoned".to_string()))?;
        let instance = guard
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("stage instance {} not found", id)))?;

        if instance.updated_at != expected_updated_at {
            return Err(StorageError::Conflict(format!(
                "stage instance {} changed since it was read",
                id
            )));
        }

        instance.extended_until = Some(extended_until);
        instance.extension_count += 1;
        instance.status = StageStatus::Active;
        instance.updated_at = now;
        Ok(())
    }

    async fn complete_instance(
        &self,
        id: &StageInstanceId,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut guard = self
            .instances
            .write()
            .map_err(|_| StorageError::Backend("instances lock poisoned".to_string()))?;
        let instance = guard
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("stage instance {} not found", id)))?;

        if instance.status.is_terminal() {
            return Err(StorageError::InvariantViolation(format!(
                "stage instance {} is already {}",
                id, instance.status
            )));
        }

        instance.status = StageStatus::Completed;
        instance.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl SlaPolicyStore for InMemoryIpStore {
    async fn active_policy(&self, stage: Stage) -> StorageResult<Option<SlaPolicy>> {
        let guard = self
            .policies
            .read()
            .map_err(|_| StorageError::Backend("policies lock poisoned".to_string()))?;
        Ok(guard
            .iter()
            .find(|policy| policy.stage == stage && policy.is_active)
            .cloned())
    }

    async fn upsert_policy(&self, mut policy: SlaPolicy) -> StorageResult<()> {
        let mut guard = self
            .policies
            .write()
            .map_err(|_| StorageError::Backend("policies lock poisoned".to_string()))?;
        for existing in guard.iter_mut() {
            if existing.stage == policy.stage && existing.is_active {
                existing.is_active = false;
                existing.updated_at = policy.updated_at;
            }
        }
        policy.is_active = true;
        guard.push(policy);
        Ok(())
    }

    async fn list_policies(&self) -> StorageResult<Vec<SlaPolicy>> {
        let guard = self
            .policies
            .read()
            .map_err(|_| StorageError::Backend("policies lock poisoned".to_string()))?;
        let mut policies = guard.clone();
        policies.sort_by_key(|policy| (policy.stage.as_key(), !policy.is_active));
        Ok(policies)
    }
}

#[async_trait]
impl NotificationStore for InMemoryIpStore {
    async fn append_notification(&self, notification: Notification) -> StorageResult<bool> {
        let mut guard = self
            .notifications
            .write()
            .map_err(|_| StorageError::Backend("notifications lock poisoned".to_string()))?;
        if guard
            .iter()
            .any(|existing| existing.dedup_key == notification.dedup_key)
        {
            return Ok(false);
        }
        guard.push(notification);
        Ok(true)
    }

    async fn list_notifications_for(
        &self,
        recipient: &UserId,
    ) -> StorageResult<Vec<Notification>> {
        let guard = self
            .notifications
            .read()
            .map_err(|_| StorageError::Backend("notifications lock poisoned".to_string()))?;
        let mut notes: Vec<Notification> = guard
            .iter()
            .filter(|note| &note.recipient_id == recipient)
            .cloned()
            .collect();
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notes)
    }
}
