//! Database layer: migrations and the append-only journal.

use serde::Serialize;
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use tracing::info;

use crate::batch::{BatchReport, ItemOutcome};
use crate::deployment::PhaseRecord;
use crate::errors::Result;
use crate::types::CircleId;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let url = if url.contains(":memory:") || url.contains("mode=") {
        url
    } else if url.contains('?') {
        format!("{url}&mode=rwc")
    } else {
        format!("{url}?mode=rwc")
    };

    // Every connection to an in-memory database gets its own empty copy.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OperationRecord {
    pub id: i64,
    pub circle_id: i64,
    pub workflow: String,
    pub cycle: i64,
    pub member: Option<String>,
    pub status: String,
    pub detail: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PhaseLogRecord {
    pub id: i64,
    pub circle_id: i64,
    pub from_phase: i64,
    pub to_phase: i64,
    pub tx_hash: String,
    pub attempts: i64,
    pub created_at: i64,
}

fn db_id(circle_id: CircleId) -> i64 {
    circle_id as i64
}

// ─────────────────────────────────────────────────────────
// Journal writes
// ─────────────────────────────────────────────────────────

/// One row per batch item, in batch order.
pub async fn record_batch(
    pool: &SqlitePool,
    circle_id: CircleId,
    report: &BatchReport<Value>,
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for item in &report.items {
        let (status, detail) = match &item.outcome {
            ItemOutcome::Done(value) => ("done", value.clone()),
            ItemOutcome::Failed(failure) => ("failed", serde_json::to_value(failure)?),
            ItemOutcome::Skipped(reason) => ("skipped", serde_json::to_value(reason)?),
        };
        sqlx::query(
            r#"
            INSERT INTO operation_log (circle_id, workflow, cycle, member, status, detail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(db_id(circle_id))
        .bind(report.workflow.as_str())
        .bind(i64::from(report.cycle))
        .bind(item.member.as_str())
        .bind(status)
        .bind(detail.to_string())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(report.items.len())
}

/// Circle-wide operations such as payouts and cycle advances.
pub async fn record_operation(
    pool: &SqlitePool,
    circle_id: CircleId,
    workflow: &str,
    cycle: u32,
    status: &str,
    detail: &impl Serialize,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO operation_log (circle_id, workflow, cycle, member, status, detail)
        VALUES (?1, ?2, ?3, NULL, ?4, ?5)
        "#,
    )
    .bind(db_id(circle_id))
    .bind(workflow)
    .bind(i64::from(cycle))
    .bind(status)
    .bind(serde_json::to_string(detail)?)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_phase(pool: &SqlitePool, record: &PhaseRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO phase_log (circle_id, from_phase, to_phase, tx_hash, attempts)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(db_id(record.circle_id))
    .bind(i64::from(record.from.number()))
    .bind(i64::from(record.to.number()))
    .bind(&record.tx_hash)
    .bind(i64::from(record.attempts))
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Journal reads
// ─────────────────────────────────────────────────────────

pub async fn operations_for_circle(
    pool: &SqlitePool,
    circle_id: CircleId,
) -> Result<Vec<OperationRecord>> {
    let rows = sqlx::query_as::<_, OperationRecord>(
        r#"
        SELECT id, circle_id, workflow, cycle, member, status, detail, created_at
        FROM   operation_log
        WHERE  circle_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(db_id(circle_id))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn phases_for_circle(pool: &SqlitePool, circle_id: CircleId) -> Result<Vec<PhaseLogRecord>> {
    let rows = sqlx::query_as::<_, PhaseLogRecord>(
        r#"
        SELECT id, circle_id, from_phase, to_phase, tx_hash, attempts, created_at
        FROM   phase_log
        WHERE  circle_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(db_id(circle_id))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
