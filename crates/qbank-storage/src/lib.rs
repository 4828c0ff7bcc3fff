//! Postgres persistence for qbank: pools, migrations, row upserts and bulk-copy helpers.

mod bulk;

use std::collections::BTreeSet;
use std::time::Duration;

use qbank_core::{ProblemRecord, TimeframeTag, Window};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgExecutor;
use thiserror::Error;
use tracing::debug;

pub use bulk::{
    CopyLine, CopyRecord, ReplicatedRow, TableSpec, COMPANIES,
    COMPANY_PROBLEMS, PROBLEMS, PROBLEM_TAGS,
};

pub const CRATE_NAME: &str = "qbank-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub max_lifetime: Option<Duration>,
}

impl PoolConfig {
    pub fn primary() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: None,
        }
    }

    pub fn replica() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
        }
    }
}

pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.acquire_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Insert the company if its name is new and return its id either way.
pub async fn upsert_company<'e, E>(executor: E, name: &str) -> Result<i64, StoreError>
where
    E: PgExecutor<'e>,
{
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO companies (name)
        VALUES ($1)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(name)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

/// Last-writer-wins upsert of a problem's metadata; `updated_at` always moves to `now()`.
pub async fn upsert_problem<'e, E>(executor: E, record: &ProblemRecord) -> Result<(), StoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO problems (id, url, title, difficulty, acceptance, frequency, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, now())
        ON CONFLICT (id) DO UPDATE
           SET url = EXCLUDED.url,
               title = EXCLUDED.title,
               difficulty = EXCLUDED.difficulty,
               acceptance = EXCLUDED.acceptance,
               frequency = EXCLUDED.frequency,
               updated_at = now()
        "#,
    )
    .bind(record.id)
    .bind(&record.url)
    .bind(&record.title)
    .bind(&record.difficulty)
    .bind(record.acceptance)
    .bind(record.frequency)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn upsert_company_problem<'e, E>(
    executor: E,
    company_id: i64,
    problem_id: i64,
    source: Window,
    timeframe: Option<TimeframeTag>,
) -> Result<(), StoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO company_problems (company_id, problem_id, source_file, timeframe_tag, last_seen)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (company_id, problem_id) DO UPDATE
           SET source_file = EXCLUDED.source_file,
               timeframe_tag = EXCLUDED.timeframe_tag,
               last_seen = now()
        "#,
    )
    .bind(company_id)
    .bind(problem_id)
    .bind(source.label())
    .bind(timeframe.map(TimeframeTag::as_str))
    .execute(executor)
    .await?;
    Ok(())
}

/// Replace every tag of `problem_id` with `tags` in one transaction. An empty
/// set clears the problem's tags. Returns the number of tags inserted.
pub async fn replace_problem_tags(
    pool: &PgPool,
    problem_id: i64,
    tags: &BTreeSet<String>,
) -> Result<usize, StoreError> {
    let mut tx = pool.begin().await?;

    let removed = sqlx::query("DELETE FROM problem_tags WHERE problem_id = $1")
        .bind(problem_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let mut inserted = 0usize;
    for tag in tags {
        let result = sqlx::query(
            r#"
            INSERT INTO problem_tags (problem_id, tag)
            VALUES ($1, $2)
            ON CONFLICT (problem_id, tag) DO NOTHING
            "#,
        )
        .bind(problem_id)
        .bind(tag)
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected() as usize;
    }

    tx.commit().await?;
    debug!(problem_id, removed, inserted, "replaced problem tags");
    Ok(inserted)
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProblemUrl {
    pub id: i64,
    pub url: String,
}

pub async fn load_problem_urls(pool: &PgPool) -> Result<Vec<ProblemUrl>, StoreError> {
    let rows = sqlx::query_as::<_, ProblemUrl>(
        "SELECT id, url FROM problems WHERE url IS NOT NULL ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
