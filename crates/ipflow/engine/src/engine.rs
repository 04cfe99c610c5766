//! The stage engine: deadline sweeps and stage lifecycle operations.
//!
//! The engine coordinates, it never delivers anything itself. It reads due
//! candidates, decides transitions, persists them through the storage
//! seams, and hands composed alerts to the notifier. One sweep owns the
//! batch at a time; individual candidate failures never abort the rest.

use crate::classify::classify_due;
use crate::notifier::Notifier;
use crate::report::SweepReport;
use crate::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use ipflow_storage::{
    DueCandidate, NotificationStore, RecordStore, SlaPolicyStore, StageInstanceStore,
};
use ipflow_types::{
    add_stage_days, DurationUnit, Notification, NotificationKind, RecordId, Responsible,
    SlaPolicy, Stage, StageInstance, StageInstanceId, StageStatus, UserId,
};
use std::sync::Arc;

/// Coordinates the workflow stage lifecycle and the SLA sweep.
pub struct StageEngine {
    records: Arc<dyn RecordStore>,
    instances: Arc<dyn StageInstanceStore>,
    policies: Arc<dyn SlaPolicyStore>,
    notifications: Arc<dyn NotificationStore>,
    notifier: Arc<dyn Notifier>,
    /// Minimum gap between alerts for the same instance.
    cooldown: Duration,
    /// One sweeper owns the batch; concurrent sweeps fail fast.
    sweep_gate: tokio::sync::Mutex<()>,
}

impl StageEngine {
    pub fn new(
        records: Arc<dyn RecordStore>,
        instances: Arc<dyn StageInstanceStore>,
        policies: Arc<dyn SlaPolicyStore>,
        notifications: Arc<dyn NotificationStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            records,
            instances,
            policies,
            notifications,
            notifier,
            cooldown: Duration::hours(24),
            sweep_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    // ── Stage Lifecycle ──────────────────────────────────────────────

    /// Open a stage for a record.
    ///
    /// The responsible party is resolved once, here: an explicit assignee
    /// wins, reviewer stages fall back to the reviewer named on the
    /// record, and everything else lands on the applicant. The deadline
    /// comes from the stage's active SLA policy, or the fail-open default
    /// when none exists.
    pub async fn open_stage(
        &self,
        record_id: &RecordId,
        stage: Stage,
        assigned_user: Option<UserId>,
        now: DateTime<Utc>,
    ) -> EngineResult<StageInstance> {
        let record = self
            .records
            .get_record(record_id)
            .await?
            .ok_or_else(|| EngineError::RecordNotFound(record_id.clone()))?;

        let assignee = assigned_user.or(match stage {
            Stage::SupervisorReview => record.supervisor_id.clone(),
            Stage::Evaluation => record.evaluator_id.clone(),
            _ => None,
        });
        let responsible = Responsible::resolve(record_id, assignee);

        let policy = self
            .policies
            .active_policy(stage)
            .await?
            .unwrap_or_else(|| SlaPolicy::default_for(stage));
        let due_at = policy.due_from(now);

        let instance = StageInstance::open(record_id.clone(), stage, responsible, due_at, now);
        self.instances.open_instance(instance.clone()).await?;
        self.records
            .set_record_status(record_id, stage.as_key(), now)
            .await?;

        tracing::info!(
            instance_id = %instance.id,
            record_id = %record_id,
            stage = %stage,
            due_at = %due_at,
            "stage opened"
        );
        Ok(instance)
    }

    /// Resolve an open stage instance. The next stage, if any, is opened
    /// by a subsequent [`StageEngine::open_stage`] call.
    pub async fn complete_stage(
        &self,
        instance_id: &StageInstanceId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.instances.complete_instance(instance_id, now).await?;
        tracing::info!(instance_id = %instance_id, "stage completed");
        Ok(())
    }

    /// Push an instance's deadline and reopen it, within the policy's
    /// extension budget. Overdue and even expired instances come back to
    /// active immediately; the reversal is explicit, not left for the
    /// next sweep to infer.
    pub async fn grant_extension(
        &self,
        instance_id: &StageInstanceId,
        granted_by: &UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<StageInstance> {
        let instance = self
            .instances
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))?;
        if instance.status == StageStatus::Completed {
            return Err(EngineError::AlreadyResolved(instance_id.clone()));
        }

        let policy = self
            .policies
            .active_policy(instance.stage)
            .await?
            .ok_or_else(|| {
                EngineError::ExtensionNotAllowed(format!(
                    "no active policy for stage {}",
                    instance.stage
                ))
            })?;
        if !policy.allow_extensions {
            return Err(EngineError::ExtensionNotAllowed(format!(
                "policy for stage {} does not allow extensions",
                instance.stage
            )));
        }
        if instance.extension_count >= policy.max_extensions {
            return Err(EngineError::ExtensionNotAllowed(format!(
                "extension budget of {} exhausted",
                policy.max_extensions
            )));
        }

        let base = instance.effective_due().max(now);
        let extended_until = add_stage_days(base, policy.extension_days, policy.duration_unit);
        self.instances
            .apply_extension(instance_id, extended_until, instance.updated_at, now)
            .await?;

        tracing::info!(
            instance_id = %instance_id,
            granted_by = %granted_by,
            extended_until = %extended_until,
            "extension granted"
        );

        self.instances
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))
    }

    // ── Materials Sub-workflow ───────────────────────────────────────

    /// Ask the applicant for presentation materials. Same policy model as
    /// every other stage; the ten-business-day rule survives only as the
    /// fail-open default for this stage.
    pub async fn request_materials(
        &self,
        record_id: &RecordId,
        now: DateTime<Utc>,
    ) -> EngineResult<StageInstance> {
        self.open_stage(record_id, Stage::MaterialsRequested, None, now)
            .await
    }

    /// Accept submitted materials and resolve the request.
    pub async fn submit_materials(
        &self,
        instance_id: &StageInstanceId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let instance = self
            .instances
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))?;
        if instance.stage != Stage::MaterialsRequested {
            return Err(EngineError::StageMismatch {
                id: instance_id.clone(),
                expected: Stage::MaterialsRequested,
                found: instance.stage,
            });
        }
        self.complete_stage(instance_id, now).await
    }

    // ── Sweep ────────────────────────────────────────────────────────

    /// Run one deadline sweep at the current time.
    pub async fn sweep(&self) -> EngineResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one deadline sweep at an explicit time.
    ///
    /// Fetching the candidate set is the only fatal failure; everything
    /// after that is absorbed per candidate into the report.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let _gate = self
            .sweep_gate
            .try_lock()
            .map_err(|_| EngineError::SweepInProgress)?;

        let candidates = self.instances.list_due_instances(now).await?;
        let mut report = SweepReport::new(now);

        for candidate in &candidates {
            report.checked += 1;
            match self.process_candidate(candidate, now).await {
                Ok((status, notified)) => {
                    report.record_transition(status);
                    if notified {
                        report.notifications_sent += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        instance_id = %candidate.instance.id,
                        error = %err,
                        "sweep candidate failed"
                    );
                    report.record_failure(candidate.instance.id.clone(), err.to_string());
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            marked_overdue = report.marked_overdue,
            marked_expired = report.marked_expired,
            notifications_sent = report.notifications_sent,
            errors = report.errors.len(),
            "sweep completed"
        );
        Ok(report)
    }

    /// Classify one due candidate, persist the transition, and maybe
    /// notify. Returns the written status and whether an alert went out.
    async fn process_candidate(
        &self,
        candidate: &DueCandidate,
        now: DateTime<Utc>,
    ) -> EngineResult<(StageStatus, bool)> {
        let instance = &candidate.instance;
        let effective_due = instance.effective_due();

        let policy = self.policies.active_policy(instance.stage).await?;
        // Missing policy fails open: no grace, but the sweep still runs.
        let grace_days = policy.as_ref().map(|p| p.grace_days).unwrap_or(0);

        let status = classify_due(instance.stage, effective_due, grace_days, now);
        self.instances
            .mark_status(&instance.id, status, instance.updated_at, now)
            .await?;

        let mut notified = false;
        if instance.should_notify(now, self.cooldown) {
            if let Some(sent) = self
                .dispatch_alert(candidate, status, policy.as_ref(), now)
                .await
            {
                notified = sent;
                if let Err(err) = self.instances.stamp_notified(&instance.id, now).await {
                    tracing::warn!(
                        instance_id = %instance.id,
                        error = %err,
                        "failed to stamp notified_at"
                    );
                }
            }
        }

        Ok((status, notified))
    }

    /// Compose, record, and deliver one alert. Returns `None` when the
    /// dedup key shows another sweep already recorded this alert, or when
    /// the notification row could not be written; `Some(delivered)`
    /// otherwise. Delivery failures are logged, never propagated.
    async fn dispatch_alert(
        &self,
        candidate: &DueCandidate,
        status: StageStatus,
        policy: Option<&SlaPolicy>,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        let instance = &candidate.instance;
        let record = &candidate.record;
        let days_overdue = instance.days_overdue(now);

        let recipient = match &instance.responsible {
            Responsible::AssignedReviewer { user_id } => user_id.clone(),
            Responsible::Applicant { .. } => record.applicant_id.clone(),
        };

        let sla_detail = match policy {
            Some(p) => {
                let unit = match p.duration_unit {
                    DurationUnit::CalendarDays => "calendar day(s)",
                    DurationUnit::BusinessDays => "business day(s)",
                };
                format!(
                    "SLA: {} {}, {} grace day(s)",
                    p.duration_days, unit, p.grace_days
                )
            }
            None => "no active SLA policy".to_string(),
        };

        let (kind, title, message) = match status {
            StageStatus::Expired => (
                NotificationKind::StageExpired,
                format!("Action window closed: {}", record.title),
                format!(
                    "The {} window for '{}' has expired, {} day(s) past its deadline ({}).",
                    instance.stage, record.title, days_overdue, sla_detail
                ),
            ),
            _ => (
                NotificationKind::StageOverdue,
                format!("Stage overdue: {}", record.title),
                format!(
                    "'{}' has been in {} for {} day(s) past its deadline ({}).",
                    record.title, instance.stage, days_overdue, sla_detail
                ),
            ),
        };

        let dedup_key = Notification::sweep_dedup_key(&instance.id, kind, days_overdue);
        let notification = Notification::new(recipient, kind, title, message, dedup_key, now)
            .with_metadata(serde_json::json!({
                "record_id": instance.record_id,
                "stage_instance_id": instance.id,
                "stage": instance.stage,
                "status": status,
                "days_overdue": days_overdue,
            }));

        match self.notifications.append_notification(notification.clone()).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                tracing::warn!(
                    instance_id = %instance.id,
                    error = %err,
                    "failed to record notification"
                );
                return None;
            }
        }

        match self.notifier.deliver(&notification).await {
            Ok(()) => Some(true),
            Err(err) => {
                tracing::warn!(
                    instance_id = %instance.id,
                    recipient = %notification.recipient_id,
                    error = %err,
                    "notification delivery failed"
                );
                Some(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotifyError;
    use async_trait::async_trait;
    use ipflow_storage::{InMemoryIpStore, StorageError, StorageResult};
    use ipflow_types::{add_business_days, IpRecord};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: StdMutex<Vec<Notification>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn failing() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                fail: true,
            }
        }

        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Delivery("smtp unreachable".to_string()));
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    /// Policy seam that errors for one stage, to exercise per-candidate
    /// failure isolation.
    struct FailingPolicyStore {
        inner: Arc<InMemoryIpStore>,
        fail_stage: Stage,
    }

    #[async_trait]
    impl SlaPolicyStore for FailingPolicyStore {
        async fn active_policy(&self, stage: Stage) -> StorageResult<Option<SlaPolicy>> {
            if stage == self.fail_stage {
                return Err(StorageError::Backend("policy table unavailable".to_string()));
            }
            self.inner.active_policy(stage).await
        }

        async fn upsert_policy(&self, policy: SlaPolicy) -> StorageResult<()> {
            self.inner.upsert_policy(policy).await
        }

        async fn list_policies(&self) -> StorageResult<Vec<SlaPolicy>> {
            self.inner.list_policies().await
        }
    }

    /// Instance seam whose candidate query always fails, to exercise the
    /// fatal path.
    struct BrokenInstanceStore;

    #[async_trait]
    impl StageInstanceStore for BrokenInstanceStore {
        async fn open_instance(&self, _instance: StageInstance) -> StorageResult<()> {
            Ok(())
        }
        async fn get_instance(
            &self,
            _id: &StageInstanceId,
        ) -> StorageResult<Option<StageInstance>> {
            Ok(None)
        }
        async fn list_due_instances(
            &self,
            _now: DateTime<Utc>,
        ) -> StorageResult<Vec<DueCandidate>> {
            Err(StorageError::Backend("connection refused".to_string()))
        }
        async fn mark_status(
            &self,
            _id: &StageInstanceId,
            _status: StageStatus,
            _expected_updated_at: DateTime<Utc>,
            _now: DateTime<Utc>,
        ) -> StorageResult<()> {
            Ok(())
        }
        async fn stamp_notified(
            &self,
            _id: &StageInstanceId,
            _now: DateTime<Utc>,
        ) -> StorageResult<()> {
            Ok(())
        }
        async fn apply_extension(
            &self,
            _id: &StageInstanceId,
            _extended_until: DateTime<Utc>,
            _expected_updated_at: DateTime<Utc>,
            _now: DateTime<Utc>,
        ) -> StorageResult<()> {
            Ok(())
        }
        async fn complete_instance(
            &self,
            _id: &StageInstanceId,
            _now: DateTime<Utc>,
        ) -> StorageResult<()> {
            Ok(())
        }
    }

    struct Harness {
        store: Arc<InMemoryIpStore>,
        notifier: Arc<RecordingNotifier>,
        engine: StageEngine,
    }

    fn harness() -> Harness {
        harness_with_notifier(RecordingNotifier::default())
    }

    fn harness_with_notifier(notifier: RecordingNotifier) -> Harness {
        let store = Arc::new(InMemoryIpStore::new());
        let notifier = Arc::new(notifier);
        let engine = StageEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            notifier.clone(),
        );
        Harness {
            store,
            notifier,
            engine,
        }
    }

    async fn seed_instance(
        store: &InMemoryIpStore,
        stage: Stage,
        due_at: DateTime<Utc>,
        assigned: Option<&str>,
        now: DateTime<Utc>,
    ) -> StageInstance {
        let record = IpRecord::new("Gene sequencing rig", UserId::new("applicant-1"));
        store.create_record(record.clone()).await.unwrap();
        let responsible =
            Responsible::resolve(&record.id, assigned.map(UserId::new));
        let instance = StageInstance::open(record.id.clone(), stage, responsible, due_at, now);
        store.open_instance(instance.clone()).await.unwrap();
        instance
    }

    async fn status_of(store: &InMemoryIpStore, id: &StageInstanceId) -> StageStatus {
        store.get_instance(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn past_due_instances_never_stay_active() {
        let h = harness();
        let now = Utc::now();
        let instance = seed_instance(
            &h.store,
            Stage::SupervisorReview,
            now - Duration::days(3),
            Some("supervisor-7"),
            now,
        )
        .await;

        let report = h.engine.sweep_at(now).await.unwrap();

        assert_eq!(report.checked, 1);
        assert_eq!(report.marked_overdue, 1);
        assert_eq!(report.marked_expired, 0);
        assert!(report.errors.is_empty());
        assert_ne!(status_of(&h.store, &instance.id).await, StageStatus::Active);
    }

    #[tokio::test]
    async fn applicant_stage_within_grace_goes_overdue() {
        let h = harness();
        let now = Utc::now();
        h.store
            .upsert_policy(SlaPolicy::new(Stage::MaterialsRequested, 10).with_grace(2))
            .await
            .unwrap();
        let instance = seed_instance(
            &h.store,
            Stage::MaterialsRequested,
            now - Duration::days(1),
            None,
            now,
        )
        .await;

        h.engine.sweep_at(now).await.unwrap();

        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Overdue);
    }

    #[tokio::test]
    async fn applicant_stage_past_grace_expires() {
        let h = harness();
        let now = Utc::now();
        h.store
            .upsert_policy(SlaPolicy::new(Stage::MaterialsRequested, 10).with_grace(2))
            .await
            .unwrap();
        let instance = seed_instance(
            &h.store,
            Stage::MaterialsRequested,
            now - Duration::days(5),
            None,
            now,
        )
        .await;

        let report = h.engine.sweep_at(now).await.unwrap();

        assert_eq!(report.marked_expired, 1);
        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Expired);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::StageExpired);
        assert!(sent[0].message.contains("5 day(s)"));
    }

    #[tokio::test]
    async fn reviewer_stage_stays_overdue_forever() {
        let h = harness();
        let now = Utc::now();
        let instance = seed_instance(
            &h.store,
            Stage::Evaluation,
            now - Duration::days(300),
            Some("evaluator-2"),
            now,
        )
        .await;

        h.engine.sweep_at(now).await.unwrap();

        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Overdue);
    }

    #[tokio::test]
    async fn missing_policy_fails_open() {
        let h = harness();
        let now = Utc::now();
        // No policy rows at all: grace defaults to 0 and the sweep
        // proceeds instead of erroring.
        let instance = seed_instance(
            &h.store,
            Stage::SupervisorReview,
            now - Duration::days(3),
            Some("supervisor-7"),
            now,
        )
        .await;

        let report = h.engine.sweep_at(now).await.unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Overdue);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, UserId::new("supervisor-7"));
        assert!(sent[0].message.contains("3 day(s)"));
        assert!(sent[0].message.contains("no active SLA policy"));
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let h = harness();
        let now = Utc::now();
        let instance = seed_instance(
            &h.store,
            Stage::SupervisorReview,
            now - Duration::days(2),
            Some("supervisor-7"),
            now,
        )
        .await;

        let first = h.engine.sweep_at(now).await.unwrap();
        let second = h.engine.sweep_at(now).await.unwrap();

        assert_eq!(first.marked_overdue, 1);
        assert_eq!(second.marked_overdue, 1);
        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Overdue);
        // The redundant re-write is the only second-sweep side effect:
        // the cooldown suppresses a second alert.
        assert_eq!(first.notifications_sent, 1);
        assert_eq!(second.notifications_sent, 0);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn overdue_applicant_stage_expires_on_later_sweep() {
        let h = harness();
        let now = Utc::now();
        h.store
            .upsert_policy(SlaPolicy::new(Stage::RevisionRequested, 7).with_grace(2))
            .await
            .unwrap();
        let instance = seed_instance(
            &h.store,
            Stage::RevisionRequested,
            now - Duration::days(1),
            None,
            now,
        )
        .await;

        h.engine.sweep_at(now).await.unwrap();
        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Overdue);

        let later = now + Duration::days(3);
        let report = h.engine.sweep_at(later).await.unwrap();
        assert_eq!(report.marked_expired, 1);
        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Expired);
    }

    #[tokio::test]
    async fn notification_cooldown_suppresses_resend() {
        let h = harness();
        let now = Utc::now();
        let record = IpRecord::new("Compiler patent", UserId::new("applicant-1"));
        h.store.create_record(record.clone()).await.unwrap();

        let notified_at = now - Duration::hours(1);
        let mut instance = StageInstance::open(
            record.id.clone(),
            Stage::SupervisorReview,
            Responsible::resolve(&record.id, Some(UserId::new("supervisor-7"))),
            now - Duration::days(2),
            now,
        );
        instance.notified_at = Some(notified_at);
        h.store.open_instance(instance.clone()).await.unwrap();

        let report = h.engine.sweep_at(now).await.unwrap();

        // Still classified, but no alert and no fresh stamp.
        assert_eq!(report.marked_overdue, 1);
        assert_eq!(report.notifications_sent, 0);
        assert!(h.notifier.sent().is_empty());
        let reread = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(reread.notified_at, Some(notified_at));
    }

    #[tokio::test]
    async fn per_instance_failure_is_isolated() {
        let store = Arc::new(InMemoryIpStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let policies = Arc::new(FailingPolicyStore {
            inner: store.clone(),
            fail_stage: Stage::MaterialsRequested,
        });
        let engine = StageEngine::new(
            store.clone(),
            store.clone(),
            policies,
            store.clone(),
            notifier.clone(),
        );

        let now = Utc::now();
        let doomed = seed_instance(
            &store,
            Stage::MaterialsRequested,
            now - Duration::days(4),
            None,
            now,
        )
        .await;
        let healthy = seed_instance(
            &store,
            Stage::SupervisorReview,
            now - Duration::days(2),
            Some("supervisor-7"),
            now,
        )
        .await;

        let report = engine.sweep_at(now).await.unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].instance_id, doomed.id);
        // The failing candidate is untouched; the healthy one proceeds.
        assert_eq!(status_of(&store, &doomed.id).await, StageStatus::Active);
        assert_eq!(status_of(&store, &healthy.id).await, StageStatus::Overdue);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_block_transition() {
        let h = harness_with_notifier(RecordingNotifier::failing());
        let now = Utc::now();
        let instance = seed_instance(
            &h.store,
            Stage::SupervisorReview,
            now - Duration::days(2),
            Some("supervisor-7"),
            now,
        )
        .await;

        let report = h.engine.sweep_at(now).await.unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(report.marked_overdue, 1);
        assert_eq!(report.notifications_sent, 0);
        // The attempt still stamps the cooldown so a broken mailer does
        // not get hammered every sweep.
        let reread = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(reread.notified_at, Some(now));
    }

    #[tokio::test]
    async fn duplicate_alerts_are_deduped_across_sweepers() {
        let h = harness();
        let now = Utc::now();
        let instance = seed_instance(
            &h.store,
            Stage::SupervisorReview,
            now - Duration::days(3),
            Some("supervisor-7"),
            now,
        )
        .await;

        // Another sweeper already recorded today's alert for this
        // instance.
        let existing_key = Notification::sweep_dedup_key(
            &instance.id,
            NotificationKind::StageOverdue,
            3,
        );
        h.store
            .append_notification(Notification::new(
                UserId::new("supervisor-7"),
                NotificationKind::StageOverdue,
                "Stage overdue",
                "already recorded",
                existing_key,
                now,
            ))
            .await
            .unwrap();

        let report = h.engine.sweep_at(now).await.unwrap();

        assert_eq!(report.marked_overdue, 1);
        assert_eq!(report.notifications_sent, 0);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn fatal_candidate_fetch_propagates() {
        let store = Arc::new(InMemoryIpStore::new());
        let engine = StageEngine::new(
            store.clone(),
            Arc::new(BrokenInstanceStore),
            store.clone(),
            store,
            Arc::new(RecordingNotifier::default()),
        );

        let result = engine.sweep_at(Utc::now()).await;
        assert!(matches!(
            result,
            Err(EngineError::Storage(StorageError::Backend(_)))
        ));
    }

    #[tokio::test]
    async fn concurrent_sweep_is_rejected() {
        let h = harness();
        let _held = h.engine.sweep_gate.try_lock().unwrap();

        let result = h.engine.sweep_at(Utc::now()).await;
        assert!(matches!(result, Err(EngineError::SweepInProgress)));
    }

    #[tokio::test]
    async fn open_stage_uses_policy_deadline_and_auto_assignment() {
        let h = harness();
        let now = Utc::now();
        h.store
            .upsert_policy(SlaPolicy::new(Stage::Evaluation, 21))
            .await
            .unwrap();

        let record = IpRecord::new("Compiler patent", UserId::new("applicant-1"))
            .with_evaluator(UserId::new("evaluator-2"));
        h.store.create_record(record.clone()).await.unwrap();

        let instance = h
            .engine
            .open_stage(&record.id, Stage::Evaluation, None, now)
            .await
            .unwrap();

        assert_eq!(instance.due_at, now + Duration::days(21));
        assert_eq!(
            instance.responsible,
            Responsible::AssignedReviewer {
                user_id: UserId::new("evaluator-2")
            }
        );
        let reread = h.store.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(reread.status, "evaluation");
    }

    #[tokio::test]
    async fn second_open_stage_requires_resolution_first() {
        let h = harness();
        let now = Utc::now();
        let record = IpRecord::new("Compiler patent", UserId::new("applicant-1"));
        h.store.create_record(record.clone()).await.unwrap();

        let first = h
            .engine
            .open_stage(&record.id, Stage::SupervisorReview, None, now)
            .await
            .unwrap();
        let second = h
            .engine
            .open_stage(&record.id, Stage::Evaluation, None, now)
            .await;
        assert!(matches!(
            second,
            Err(EngineError::Storage(StorageError::InvariantViolation(_)))
        ));

        h.engine.complete_stage(&first.id, now).await.unwrap();
        h.engine
            .open_stage(&record.id, Stage::Evaluation, None, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn extension_reopens_and_is_bounded() {
        let h = harness();
        let now = Utc::now();
        h.store
            .upsert_policy(
                SlaPolicy::new(Stage::RevisionRequested, 7)
                    .with_grace(2)
                    .with_extensions(1, 7),
            )
            .await
            .unwrap();
        let instance = seed_instance(
            &h.store,
            Stage::RevisionRequested,
            now - Duration::days(1),
            None,
            now,
        )
        .await;

        h.engine.sweep_at(now).await.unwrap();
        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Overdue);

        let admin = UserId::new("admin-1");
        let extended = h
            .engine
            .grant_extension(&instance.id, &admin, now)
            .await
            .unwrap();
        assert_eq!(extended.status, StageStatus::Active);
        assert_eq!(extended.extended_until, Some(now + Duration::days(7)));
        assert_eq!(extended.extension_count, 1);

        // Budget of one is now spent.
        let denied = h.engine.grant_extension(&instance.id, &admin, now).await;
        assert!(matches!(denied, Err(EngineError::ExtensionNotAllowed(_))));
    }

    #[tokio::test]
    async fn extension_requires_a_policy_that_allows_it() {
        let h = harness();
        let now = Utc::now();
        let instance = seed_instance(
            &h.store,
            Stage::SupervisorReview,
            now - Duration::days(2),
            Some("supervisor-7"),
            now,
        )
        .await;

        // No policy at all.
        let admin = UserId::new("admin-1");
        let denied = h.engine.grant_extension(&instance.id, &admin, now).await;
        assert!(matches!(denied, Err(EngineError::ExtensionNotAllowed(_))));

        // Policy present but extensions disabled.
        h.store
            .upsert_policy(SlaPolicy::new(Stage::SupervisorReview, 14))
            .await
            .unwrap();
        let denied = h.engine.grant_extension(&instance.id, &admin, now).await;
        assert!(matches!(denied, Err(EngineError::ExtensionNotAllowed(_))));
    }

    #[tokio::test]
    async fn expired_instance_can_be_extended_back_to_active() {
        let h = harness();
        let now = Utc::now();
        h.store
            .upsert_policy(
                SlaPolicy::new(Stage::MaterialsRequested, 10)
                    .with_grace(2)
                    .with_extensions(2, 5),
            )
            .await
            .unwrap();
        let instance = seed_instance(
            &h.store,
            Stage::MaterialsRequested,
            now - Duration::days(6),
            None,
            now,
        )
        .await;

        h.engine.sweep_at(now).await.unwrap();
        assert_eq!(status_of(&h.store, &instance.id).await, StageStatus::Expired);

        let extended = h
            .engine
            .grant_extension(&instance.id, &UserId::new("admin-1"), now)
            .await
            .unwrap();
        assert_eq!(extended.status, StageStatus::Active);
        assert_eq!(extended.extended_until, Some(now + Duration::days(5)));
    }

    #[tokio::test]
    async fn materials_request_defaults_to_ten_business_days() {
        let h = harness();
        let now = Utc::now();
        let record = IpRecord::new("Gene sequencing rig", UserId::new("applicant-1"));
        h.store.create_record(record.clone()).await.unwrap();

        let instance = h.engine.request_materials(&record.id, now).await.unwrap();

        assert_eq!(instance.stage, Stage::MaterialsRequested);
        assert_eq!(instance.due_at, add_business_days(now, 10));
        assert_eq!(
            instance.responsible,
            Responsible::Applicant {
                record_id: record.id.clone()
            }
        );

        h.engine.submit_materials(&instance.id, now).await.unwrap();
        assert_eq!(
            status_of(&h.store, &instance.id).await,
            StageStatus::Completed
        );
    }

    #[tokio::test]
    async fn submit_materials_rejects_other_stages() {
        let h = harness();
        let now = Utc::now();
        let instance = seed_instance(
            &h.store,
            Stage::SupervisorReview,
            now + Duration::days(7),
            Some("supervisor-7"),
            now,
        )
        .await;

        let result = h.engine.submit_materials(&instance.id, now).await;
        assert!(matches!(result, Err(EngineError::StageMismatch { .. })));
    }

    #[tokio::test]
    async fn sweep_visits_candidates_earliest_overdue_first() {
        let h = harness();
        let now = Utc::now();
        let newest = seed_instance(
            &h.store,
            Stage::SupervisorReview,
            now - Duration::days(1),
            Some("supervisor-7"),
            now,
        )
        .await;
        let oldest = seed_instance(
            &h.store,
            Stage::Evaluation,
            now - Duration::days(9),
            Some("evaluator-2"),
            now,
        )
        .await;

        h.engine.sweep_at(now).await.unwrap();

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        let first_instance: String =
            sent[0].metadata["stage_instance_id"].as_str().unwrap().to_string();
        assert_eq!(first_instance, oldest.id.0);
        let second_instance: String =
            sent[1].metadata["stage_instance_id"].as_str().unwrap().to_string();
        assert_eq!(second_instance, newest.id.0);
    }
}
