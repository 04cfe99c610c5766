//! PostgreSQL adapter for the workflow storage seams.
//!
//! The single-open-instance invariant lives in a partial unique index, the
//! conditional status transition in a `WHERE updated_at = $n` clause, and
//! notification idempotency in a unique dedup-key index with
//! `ON CONFLICT DO NOTHING`: the database enforces what the in-memory
//! adapter checks in process.

use crate::traits::{
    DueCandidate, NotificationStore, RecordStore, SlaPolicyStore, StageInstanceStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipflow_types::{
    IpRecord, Notification, NotificationId, NotificationKind, RecordId, SlaPolicy, Stage,
    StageInstance, StageInstanceId, StageStatus, UserId,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresIpStore {
    pool: PgPool,
}

impl PostgresIpStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS ip_records (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                applicant_id TEXT NOT NULL,
                supervisor_id TEXT,
                evaluator_id TEXT,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ip_stage_instances (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL REFERENCES ip_records (id),
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                responsible JSONB NOT NULL,
                due_at TIMESTAMPTZ NOT NULL,
                extended_until TIMESTAMPTZ,
                extension_count INT NOT NULL DEFAULT 0,
                notified_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ip_stage_instances_one_open
                ON ip_stage_instances (record_id)
                WHERE status IN ('active', 'overdue')
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ip_sla_policies (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                stage TEXT NOT NULL,
                duration_days INT NOT NULL,
                duration_unit TEXT NOT NULL,
                grace_days BIGINT NOT NULL,
                allow_extensions BOOLEAN NOT NULL,
                max_extensions INT NOT NULL,
                extension_days INT NOT NULL,
                is_active BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ip_sla_policies_one_active
                ON ip_sla_policies (stage)
                WHERE is_active
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ip_notifications (
                id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                metadata JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ip_notifications_dedup
                ON ip_notifications (dedup_key)
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

fn parse_stage(value: &str) -> StorageResult<Stage> {
    value
        .parse()
        .map_err(|e| StorageError::Serialization(format!("{e}")))
}

fn parse_status(value: &str) -> StorageResult<StageStatus> {
    value
        .parse()
        .map_err(|e| StorageError::Serialization(format!("{e}")))
}

fn record_from_row(row: &PgRow, prefix: &str) -> StorageResult<IpRecord> {
    let col = |name: &str| format!("{prefix}{name}");
    Ok(IpRecord {
        id: RecordId::new(
            row.try_get::<String, _>(col("id").as_str())
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        title: row
            .try_get(col("title").as_str())
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        applicant_id: UserId::new(
            row.try_get::<String, _>(col("applicant_id").as_str())
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        supervisor_id: row
            .try_get::<Option<String>, _>(col("supervisor_id").as_str())
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .map(UserId::new),
        evaluator_id: row
            .try_get::<Option<String>, _>(col("evaluator_id").as_str())
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .map(UserId::new),
        status: row
            .try_get(col("status").as_str())
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: row
            .try_get(col("created_at").as_str())
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        updated_at: row
            .try_get(col("updated_at").as_str())
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn instance_from_row(row: &PgRow) -> StorageResult<StageInstance> {
    let stage: String = row
        .try_get("stage")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let responsible: serde_json::Value = row
        .try_get("responsible")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let extension_count: i32 = row
        .try_get("extension_count")
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    Ok(StageInstance {
        id: StageInstanceId::new(
            row.try_get::<String, _>("id")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        record_id: RecordId::new(
            row.try_get::<String, _>("record_id")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        stage: parse_stage(&stage)?,
        status: parse_status(&status)?,
        responsible: serde_json::from_value(responsible)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        due_at: row
            .try_get("due_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        extended_until: row
            .try_get("extended_until")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        extension_count: extension_count.max(0) as u32,
        notified_at: row
            .try_get("notified_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn policy_from_row(row: &PgRow) -> StorageResult<SlaPolicy> {
    let stage: String = row
        .try_get("stage")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let unit: String = row
        .try_get("duration_unit")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let duration_days: i32 = row
        .try_get("duration_days")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let max_extensions: i32 = row
        .try_get("max_extensions")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let extension_days: i32 = row
        .try_get("extension_days")
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    Ok(SlaPolicy {
        stage: parse_stage(&stage)?,
        duration_days: duration_days.max(0) as u32,
        duration_unit: serde_json::from_value(serde_json::Value::String(unit))
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        grace_days: row
            .try_get("grace_days")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        allow_extensions: row
            .try_get("allow_extensions")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        max_extensions: max_extensions.max(0) as u32,
        extension_days: extension_days.max(0) as u32,
        is_active: row
            .try_get("is_active")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn notification_from_row(row: &PgRow) -> StorageResult<Notification> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let kind: NotificationKind =
        serde_json::from_value(serde_json::Value::String(kind))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

    Ok(Notification {
        id: NotificationId(
            row.try_get::<String, _>("id")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        recipient_id: UserId::new(
            row.try_get::<String, _>("recipient_id")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        kind,
        title: row
            .try_get("title")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        message: row
            .try_get("message")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        dedup_key: row
            .try_get("dedup_key")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        metadata: row
            .try_get("metadata")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

#[async_trait]
impl RecordStore for PostgresIpStore {
    async fn create_record(&self, record: IpRecord) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO ip_records
                (id, title, applicant_id, supervisor_id, evaluator_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id.0)
        .bind(&record.title)
        .bind(&record.applicant_id.0)
        .bind(record.supervisor_id.as_ref().map(|u| u.0.clone()))
        .bind(record.evaluator_id.as_ref().map(|u| u.0.clone()))
        .bind(&record.status)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("create record failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "record {} already exists",
                record.id
            )));
        }
        Ok(())
    }

    async fn get_record(&self, id: &RecordId) -> StorageResult<Option<IpRecord>> {
        let row = sqlx::query(
            "SELECT id, title, applicant_id, supervisor_id, evaluator_id, status, created_at, updated_at
             FROM ip_records WHERE id = $1",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("get record failed: {e}")))?;

        row.as_ref().map(|r| record_from_row(r, "")).transpose()
    }

    async fn set_record_status(
        &self,
        id: &RecordId,
        status: &str,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result =
            sqlx::query("UPDATE ip_records SET status = $1, updated_at = $2 WHERE id = $3")
                .bind(status)
                .bind(updated_at)
                .bind(&id.0)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("set record status failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("record {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl StageInstanceStore for PostgresIpStore {
    async fn open_instance(&self, instance: StageInstance) -> StorageResult<()> {
        let responsible = serde_json::to_value(&instance.responsible)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO ip_stage_instances
                (id, record_id, stage, status, responsible, due_at, extended_until,
                 extension_count, notified_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&instance.id.0)
        .bind(&instance.record_id.0)
        .bind(instance.stage.as_key())
        .bind(instance.status.as_key())
        .bind(responsible)
        .bind(instance.due_at)
        .bind(instance.extended_until)
        .bind(instance.extension_count as i32)
        .bind(instance.notified_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::InvariantViolation(format!(
                    "record {} already has an open stage instance",
                    instance.record_id
                )))
            }
            Err(e) => Err(StorageError::Backend(format!(
                "open instance failed: {e}"
            ))),
        }
    }

    async fn get_instance(&self, id: &StageInstanceId) -> StorageResult<Option<StageInstance>> {
        let row = sqlx::query("SELECT * FROM ip_stage_instances WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("get instance failed: {e}")))?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn list_due_instances(&self, now: DateTime<Utc>) -> StorageResult<Vec<DueCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT i.id, i.record_id, i.stage, i.status, i.responsible, i.due_at,
                   i.extended_until, i.extension_count, i.notified_at,
                   i.created_at, i.updated_at,
                   r.id AS r_id, r.title AS r_title, r.applicant_id AS r_applicant_id,
                   r.supervisor_id AS r_supervisor_id, r.evaluator_id AS r_evaluator_id,
                   r.status AS r_status, r.created_at AS r_created_at,
                   r.updated_at AS r_updated_at
            FROM ip_stage_instances i
            JOIN ip_records r ON r.id = i.record_id
            WHERE i.status IN ('active', 'overdue')
              AND COALESCE(i.extended_until, i.due_at) < $1
            ORDER BY COALESCE(i.extended_until, i.due_at) ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("due instance query failed: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(DueCandidate {
                    instance: instance_from_row(row)?,
                    record: record_from_row(row, "r_")?,
                })
            })
            .collect()
    }

    async fn mark_status(
        &self,
        id: &StageInstanceId,
        status: StageStatus,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE ip_stage_instances SET status = $1, updated_at = $2
             WHERE id = $3 AND updated_at = $4",
        )
        .bind(status.as_key())
        .bind(now)
        .bind(&id.0)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("mark status failed: {e}")))?;

        if result.rows_affected() == 0 {
            return match self.get_instance(id).await? {
                Some(_) => Err(StorageError::Conflict(format!(
                    "stage instance {} changed since it was read",
                    id
                ))),
                None => Err(StorageError::NotFound(format!(
                    "stage instance {} not found",
                    id
                ))),
            };
        }
        Ok(())
    }

    async fn stamp_notified(
        &self,
        id: &StageInstanceId,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE ip_stage_instances SET notified_at = $1, updated_at = $1 WHERE id = $2",
        )
        .bind(now)
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("stamp notified failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "stage instance {} not found",
                id
            )));
        }
        Ok(())
    }

    async fn apply_extension(
        &self,
        id: &StageInstanceId,
        extended_until: DateTime<Utc>,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE ip_stage_instances
            SET extended_until = $1,
                extension_count = extension_count + 1,
                status = 'active',
                updated_at = $2
            WHERE id = $3 AND updated_at = $4
            "#,
        )
        .bind(extended_until)
        .bind(now)
        .bind(&id.0)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("apply extension failed: {e}")))?;

        if result.rows_affected() == 0 {
            return match self.get_instance(id).await? {
                Some(_) => Err(StorageError::Conflict(format!(
                    "stage instance {} changed since it was read",
                    id
                ))),
                None => Err(StorageError::NotFound(format!(
                    "stage instance {} not found",
                    id
                ))),
            };
        }
        Ok(())
    }

    async fn complete_instance(
        &self,
        id: &StageInstanceId,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE ip_stage_instances SET status = 'completed', updated_at = $1
             WHERE id = $2 AND status IN ('active', 'overdue')",
        )
        .bind(now)
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("complete instance failed: {e}")))?;

        if result.rows_affected() == 0 {
            return match self.get_instance(id).await? {
                Some(instance) => Err(StorageError::InvariantViolation(format!(
                    "stage instance {} is already {}",
                    id, instance.status
                ))),
                None => Err(StorageError::NotFound(format!(
                    "stage instance {} not found",
                    id
                ))),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl SlaPolicyStore for PostgresIpStore {
    async fn active_policy(&self, stage: Stage) -> StorageResult<Option<SlaPolicy>> {
        let row = sqlx::query(
            "SELECT stage, duration_days, duration_unit, grace_days, allow_extensions,
                    max_extensions, extension_days, is_active, created_at, updated_at
             FROM ip_sla_policies WHERE stage = $1 AND is_active",
        )
        .bind(stage.as_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("active policy query failed: {e}")))?;

        row.as_ref().map(policy_from_row).transpose()
    }

    async fn upsert_policy(&self, policy: SlaPolicy) -> StorageResult<()> {
        let unit = serde_json::to_value(policy.duration_unit)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let unit = unit
            .as_str()
            .ok_or_else(|| StorageError::Serialization("duration unit".to_string()))?
            .to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(format!("begin failed: {e}")))?;

        sqlx::query(
            "UPDATE ip_sla_policies SET is_active = FALSE, updated_at = $1
             WHERE stage = $2 AND is_active",
        )
        .bind(policy.updated_at)
        .bind(policy.stage.as_key())
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(format!("retire policy failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO ip_sla_policies
                (stage, duration_days, duration_unit, grace_days, allow_extensions,
                 max_extensions, extension_days, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9)
            "#,
        )
        .bind(policy.stage.as_key())
        .bind(policy.duration_days as i32)
        .bind(unit)
        .bind(policy.grace_days)
        .bind(policy.allow_extensions)
        .bind(policy.max_extensions as i32)
        .bind(policy.extension_days as i32)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(format!("insert policy failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(format!("commit failed: {e}")))
    }

    async fn list_policies(&self) -> StorageResult<Vec<SlaPolicy>> {
        let rows = sqlx::query(
            "SELECT stage, duration_days, duration_unit, grace_days, allow_extensions,
                    max_extensions, extension_days, is_active, created_at, updated_at
             FROM ip_sla_policies ORDER BY stage, is_active DESC, updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("list policies failed: {e}")))?;

        rows.iter().map(policy_from_row).collect()
    }
}

#[async_trait]
impl NotificationStore for PostgresIpStore {
    async fn append_notification(&self, notification: Notification) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ip_notifications
                (id, recipient_id, kind, title, message, dedup_key, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(&notification.id.0)
        .bind(&notification.recipient_id.0)
        .bind(notification.kind.as_key())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.dedup_key)
        .bind(&notification.metadata)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("append notification failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_notifications_for(
        &self,
        recipient: &UserId,
    ) -> StorageResult<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT id, recipient_id, kind, title, message, dedup_key, metadata, created_at
             FROM ip_notifications WHERE recipient_id = $1 ORDER BY created_at DESC",
        )
        .bind(&recipient.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("list notifications failed: {e}")))?;

        rows.iter().map(notification_from_row).collect()
    }
}
