use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::instance::{SagaInstance, StateBag};
use crate::record::{Direction, StepExecutionRecord};
use crate::status::SagaStatus;
use crate::store::SagaStore;
use crate::version::Version;
use crate::{Result, StoreError};

/// PostgreSQL-backed saga store implementation.
///
/// One row per instance keyed by id with a secondary index on the
/// correlation id; execution records live in an append-only table with
/// a partial unique index enforcing one successful execution per
/// `(saga, step, direction)`.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the schema if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saga_instances (
                id UUID PRIMARY KEY,
                saga_type TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                initiator_id TEXT,
                current_step_index INT NOT NULL,
                status TEXT NOT NULL,
                state_bag JSONB NOT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_saga_instances_correlation
             ON saga_instances (correlation_id)",
        )
        .execute(&self.pool)
        .await?;

        // At most one active instance per correlation id.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS unique_active_correlation
             ON saga_instances (correlation_id)
             WHERE status NOT IN ('Completed', 'Compensated', 'Failed', 'CompensationFailed')",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saga_executions (
                seq BIGSERIAL PRIMARY KEY,
                saga_id UUID NOT NULL,
                step_index INT NOT NULL,
                direction TEXT NOT NULL,
                attempt INT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ NOT NULL,
                outcome TEXT NOT NULL,
                error_detail TEXT,
                output JSONB,
                UNIQUE (saga_id, step_index, direction, attempt)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS unique_step_success
             ON saga_executions (saga_id, step_index, direction)
             WHERE outcome = 'Success'",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        let status: String = row.try_get("status")?;
        let status: SagaStatus = status.parse().map_err(StoreError::Decode)?;
        let state_bag: StateBag = serde_json::from_value(row.try_get("state_bag")?)?;

        Ok(SagaInstance {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            correlation_id: CorrelationId::new(row.try_get::<String, _>("correlation_id")?),
            initiator_id: row.try_get("initiator_id")?,
            current_step_index: row.try_get("current_step_index")?,
            status,
            state_bag,
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn row_to_record(row: PgRow) -> Result<StepExecutionRecord> {
        let direction: String = row.try_get("direction")?;
        let outcome: String = row.try_get("outcome")?;

        Ok(StepExecutionRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            step_index: row.try_get("step_index")?,
            direction: direction.parse().map_err(StoreError::Decode)?,
            attempt: row.try_get::<i32, _>("attempt")? as u32,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            outcome: outcome.parse().map_err(StoreError::Decode)?,
            error_detail: row.try_get("error_detail")?,
            output: row.try_get("output")?,
        })
    }

    async fn stored_version(&self, saga_id: SagaId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(Version::new))
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn load(&self, id: SagaId) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, saga_type, correlation_id, initiator_id, current_step_index,
                   status, state_bag, version, created_at, updated_at
            FROM saga_instances
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn load_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(
            r#"
            SELECT id, saga_type, correlation_id, initiator_id, current_step_index,
                   status, state_bag, version, created_at, updated_at
            FROM saga_instances
            WHERE correlation_id = $1
              AND status NOT IN ('Completed', 'Compensated', 'Failed', 'CompensationFailed')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn save(&self, instance: &SagaInstance, expected_version: Version) -> Result<Version> {
        let state_bag = serde_json::Value::Object(instance.state_bag.clone());

        let rows_affected = if expected_version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO saga_instances
                    (id, saga_type, correlation_id, initiator_id, current_step_index,
                     status, state_bag, version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(instance.id.as_uuid())
            .bind(&instance.saga_type)
            .bind(instance.correlation_id.as_str())
            .bind(&instance.initiator_id)
            .bind(instance.current_step_index)
            .bind(instance.status.as_str())
            .bind(&state_bag)
            .bind(instance.version.as_i64())
            .bind(instance.created_at)
            .bind(instance.updated_at)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances
                SET current_step_index = $3, status = $4, state_bag = $5,
                    version = $6, updated_at = $7
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(instance.id.as_uuid())
            .bind(expected_version.as_i64())
            .bind(instance.current_step_index)
            .bind(instance.status.as_str())
            .bind(&state_bag)
            .bind(instance.version.as_i64())
            .bind(instance.updated_at)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if rows_affected == 0 {
            let actual = self.stored_version(instance.id).await?;
            // An insert that conflicted without leaving a row under our
            // id lost on the active-correlation index, not the CAS.
            if expected_version == Version::initial() && actual.is_none() {
                return Err(StoreError::DuplicateCorrelation(
                    instance.correlation_id.clone(),
                ));
            }
            return Err(StoreError::ConcurrencyConflict {
                saga_id: instance.id,
                expected: expected_version,
                actual: actual.unwrap_or_else(Version::initial),
            });
        }

        Ok(instance.version)
    }

    async fn append_record(&self, record: StepExecutionRecord) -> Result<bool> {
        // Both the per-attempt uniqueness and the partial success index
        // are absorbed by ON CONFLICT DO NOTHING: a duplicate simply
        // does not append.
        let result = sqlx::query(
            r#"
            INSERT INTO saga_executions
                (saga_id, step_index, direction, attempt, started_at,
                 completed_at, outcome, error_detail, output)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(record.step_index)
        .bind(record.direction.as_str())
        .bind(record.attempt as i32)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.outcome.as_str())
        .bind(&record.error_detail)
        .bind(&record.output)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn records_for(&self, saga_id: SagaId) -> Result<Vec<StepExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT saga_id, step_index, direction, attempt, started_at,
                   completed_at, outcome, error_detail, output
            FROM saga_executions
            WHERE saga_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn success_record(
        &self,
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
    ) -> Result<Option<StepExecutionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT saga_id, step_index, direction, attempt, started_at,
                   completed_at, outcome, error_detail, output
            FROM saga_executions
            WHERE saga_id = $1 AND step_index = $2 AND direction = $3
              AND outcome = 'Success'
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(step_index)
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn has_succeeded(
        &self,
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM saga_executions
                WHERE saga_id = $1 AND step_index = $2 AND direction = $3
                  AND outcome = 'Success'
            )
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(step_index)
        .bind(direction.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn attempts(
        &self,
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM saga_executions
            WHERE saga_id = $1 AND step_index = $2 AND direction = $3
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(step_index)
        .bind(direction.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u32)
    }
}
