//! PostgreSQL 事件仓储（PgEventRepository）
//!
//! 基于 sqlx 的 `EventRepository` 实现，表 `bus_events`。
//! - `claim_batch`：子查询 `FOR UPDATE SKIP LOCKED` 锁定候选行，外层 `UPDATE` 再次校验
//!   领取条件（条件更新），多进程并发领取互不重叠；
//! - 标记类操作在事务内 `SELECT ... FOR UPDATE` 读出行，复用 `EventRecord` 的状态机
//!   计算迁移结果后写回，避免在 SQL 中重复实现退避与终态规则；写回再以
//!   `attempts` 做条件更新，旧领取者的结果不会覆盖重新领取后的行；
//! - 时间以数据库的 `NOW()` 为准（领取），或以应用时钟为准（标记），部署时需保证时钟同步。
//!
use super::{EventQuery, EventRepository};
use crate::error::{EventingError, EventingResult};
use crate::event::{EventId, EventRecord, EventStatus, NewEvent};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

const COLUMNS: &str = "id, event_type, payload, correlation_id, dedup_key, status, attempts, \
     available_at, lease_expiry, claimed_at, last_error, created_at, updated_at";

#[derive(FromRow, Debug, Clone)]
struct EventRow {
    id: Uuid,
    event_type: String,
    payload: sqlx::types::Json<serde_json::Value>,
    correlation_id: Option<String>,
    dedup_key: Option<String>,
    status: String,
    attempts: i32,
    available_at: DateTime<Utc>,
    lease_expiry: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = EventingError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EventRecord::builder()
            .id(EventId::from(row.id))
            .event_type(row.event_type)
            .payload(row.payload.0)
            .maybe_correlation_id(row.correlation_id)
            .maybe_dedup_key(row.dedup_key)
            .status(row.status.parse()?)
            .attempts(u32::try_from(row.attempts).unwrap_or_default())
            .available_at(row.available_at)
            .maybe_lease_expiry(row.lease_expiry)
            .maybe_claimed_at(row.claimed_at)
            .maybe_last_error(row.last_error)
            .created_at(row.created_at)
            .updated_at(row.updated_at)
            .build())
    }
}

#[derive(Debug, Clone)]
pub struct PgEventRepository {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgEventRepository {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// 建表与索引（幂等）
    pub async fn run_migrations(&self) -> EventingResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bus_events (
                id UUID PRIMARY KEY,
                event_type VARCHAR(128) NOT NULL,
                payload JSONB NOT NULL,
                correlation_id VARCHAR(256),
                dedup_key VARCHAR(512) UNIQUE,
                status VARCHAR(16) NOT NULL DEFAULT 'PENDING'
                    CHECK (status IN ('PENDING', 'RUNNING', 'COMPLETED', 'FAILED')),
                attempts INTEGER NOT NULL DEFAULT 0,
                available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                lease_expiry TIMESTAMPTZ,
                claimed_at TIMESTAMPTZ,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bus_events_claimable
            ON bus_events(status, available_at)
            WHERE status IN ('PENDING', 'RUNNING')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bus_events_correlation
            ON bus_events(correlation_id, event_type, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        id: &EventId,
    ) -> EventingResult<EventRecord> {
        let sql = format!("SELECT {COLUMNS} FROM bus_events WHERE id = $1 FOR UPDATE");
        let row: Option<EventRow> = sqlx::query_as::<_, EventRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?;
        row.ok_or(EventingError::NotFound { id: *id })?.try_into()
    }

    async fn write_back(
        tx: &mut Transaction<'_, Postgres>,
        record: &EventRecord,
    ) -> EventingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE bus_events
            SET status = $2,
                available_at = $3,
                lease_expiry = $4,
                last_error = $5,
                updated_at = $6
            WHERE id = $1 AND attempts = $7
            "#,
        )
        .bind(record.id().as_uuid())
        .bind(record.status().as_str())
        .bind(record.available_at())
        .bind(record.lease_expiry())
        .bind(record.last_error())
        .bind(record.updated_at())
        .bind(i32::try_from(record.attempts()).unwrap_or(i32::MAX))
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(EventingError::repository(format!(
                "event {} changed concurrently",
                record.id()
            )));
        }
        Ok(())
    }

    /// 在事务内读出、迁移并写回一行
    async fn transition<T, F>(&self, id: &EventId, f: F) -> EventingResult<T>
    where
        F: FnOnce(&mut EventRecord, DateTime<Utc>) -> EventingResult<(T, bool)> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::lock_row(&mut tx, id).await?;
        let (out, changed) = f(&mut record, Utc::now())?;
        if changed {
            Self::write_back(&mut tx, &record).await?;
        }
        tx.commit().await?;
        Ok(out)
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn enqueue(&self, event: NewEvent) -> EventingResult<EventId> {
        let record = EventRecord::pending(event, Utc::now());
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO bus_events
                (id, event_type, payload, correlation_id, dedup_key, status, attempts,
                 available_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, $7, $7)
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id().as_uuid())
        .bind(record.event_type())
        .bind(sqlx::types::Json(record.payload().clone()))
        .bind(record.correlation_id())
        .bind(record.dedup_key())
        .bind(record.available_at())
        .bind(record.created_at())
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(EventId::from(id));
        }

        // 去重键冲突：返回已存在的事件
        let existing: (Uuid,) = sqlx::query_as("SELECT id FROM bus_events WHERE dedup_key = $1")
            .bind(record.dedup_key())
            .fetch_one(&self.pool)
            .await?;
        Ok(EventId::from(existing.0))
    }

    async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> EventingResult<Vec<EventRecord>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let max_retries = i32::try_from(self.policy.max_retries).unwrap_or(i32::MAX);

        // 最后一次尝试的租约过期：直接判定失败，不再领取
        sqlx::query(
            r#"
            UPDATE bus_events
            SET status = 'FAILED',
                lease_expiry = NULL,
                last_error = 'lease expired after final attempt',
                updated_at = NOW()
            WHERE status = 'RUNNING' AND lease_expiry < NOW() AND attempts >= $1
            "#,
        )
        .bind(max_retries)
        .execute(&self.pool)
        .await?;

        let sql = format!(
            r#"
            UPDATE bus_events AS e
            SET status = 'RUNNING',
                attempts = e.attempts + 1,
                claimed_at = NOW(),
                lease_expiry = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE e.id IN (
                SELECT id FROM bus_events
                WHERE ((status = 'PENDING' AND available_at <= NOW())
                    OR (status = 'RUNNING' AND lease_expiry < NOW()))
                  AND attempts < $3
                ORDER BY available_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            AND ((e.status = 'PENDING' AND e.available_at <= NOW())
                OR (e.status = 'RUNNING' AND e.lease_expiry < NOW()))
            RETURNING {COLUMNS}
            "#
        );

        let rows: Vec<EventRow> = sqlx::query_as::<_, EventRow>(&sql)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .bind(lease.as_secs_f64())
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    async fn renew_lease(
        &self,
        id: &EventId,
        attempt: u32,
        lease: Duration,
    ) -> EventingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bus_events
            SET lease_expiry = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING' AND attempts = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, id: &EventId, attempt: u32) -> EventingResult<()> {
        self.transition(id, move |record, now| {
            Ok(((), record.complete(attempt, now)?))
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: &EventId,
        attempt: u32,
        error: &str,
    ) -> EventingResult<EventStatus> {
        let policy = self.policy;
        self.transition(id, move |record, now| {
            Ok((record.fail(attempt, now, error, &policy)?, true))
        })
        .await
    }

    async fn mark_failed_permanently(
        &self,
        id: &EventId,
        attempt: u32,
        error: &str,
    ) -> EventingResult<()> {
        self.transition(id, move |record, now| {
            record.fail_permanently(attempt, now, error)?;
            Ok(((), true))
        })
        .await
    }

    async fn cancel(&self, id: &EventId, reason: &str) -> EventingResult<bool> {
        self.transition(id, move |record, now| {
            let cancelled = record.cancel(now, reason);
            Ok((cancelled, cancelled))
        })
        .await
    }

    async fn search(&self, query: &EventQuery) -> EventingResult<Vec<EventRecord>> {
        let mut builder = sqlx::QueryBuilder::<Postgres>::new(format!(
            "SELECT {COLUMNS} FROM bus_events WHERE TRUE"
        ));

        if !query.event_types().is_empty() {
            builder.push(" AND event_type = ANY(");
            builder.push_bind(query.event_types().to_vec());
            builder.push(")");
        }
        if !query.statuses().is_empty() {
            let statuses: Vec<String> = query
                .statuses()
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            builder.push(" AND status = ANY(");
            builder.push_bind(statuses);
            builder.push(")");
        }
        if let Some(correlation_id) = query.correlation_id() {
            builder.push(" AND correlation_id = ");
            builder.push_bind(correlation_id.to_string());
        }
        builder.push(" ORDER BY created_at ASC");

        let rows: Vec<EventRow> = builder
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    async fn get(&self, id: &EventId) -> EventingResult<Option<EventRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM bus_events WHERE id = $1");
        let row: Option<EventRow> = sqlx::query_as::<_, EventRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(EventRecord::try_from).transpose()
    }
}
