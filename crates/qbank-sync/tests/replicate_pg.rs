// Runs only when QBANK_TEST_DATABASE_URL and QBANK_TEST_REPLICA_DATABASE_URL
// point at two disposable Postgres databases.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use qbank_core::{ProblemRecord, TimeframeTag, Window};
use qbank_storage::{
    connect, migrate, replace_problem_tags, upsert_company, upsert_company_problem, upsert_problem,
    PoolConfig,
};
use qbank_sync::{
    PgReplicator, ReplicatedTable, ReplicationEngine, ReplicationError, ReplicationStage,
};
use sqlx::PgPool;

// Every test truncates the same two databases.
static DATABASES: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    DATABASES.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn fresh(var: &str, config: PoolConfig) -> Option<PgPool> {
    let url = std::env::var(var).ok()?;
    let pool = connect(&url, &config).await.unwrap();
    migrate(&pool).await.unwrap();
    // Undo schema changes made by the failure tests.
    for sql in [
        "ALTER TABLE problems DROP CONSTRAINT IF EXISTS problems_no_hard",
        "ALTER TABLE problems ALTER COLUMN title TYPE TEXT",
    ] {
        sqlx::query(sql).execute(&pool).await.unwrap();
    }
    sqlx::query("TRUNCATE company_problems, problem_tags, problems, companies RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await
        .unwrap();
    Some(pool)
}

async fn seed(pool: &PgPool) {
    for name in ["acme", "globex", "initech"] {
        upsert_company(pool, name).await.unwrap();
    }
    for id in [1_i64, 2, 79] {
        let record = ProblemRecord {
            id,
            url: format!("https://leetcode.com/problems/p-{id}"),
            title: format!("Tab\tand\nnewline {id}"),
            difficulty: "Hard".to_string(),
            acceptance: Some(33.3),
            frequency: (id != 2).then_some(12.5),
        };
        upsert_problem(pool, &record).await.unwrap();
    }
    upsert_company_problem(pool, 1, 1, Window::ThirtyDays, Some(TimeframeTag::ThirtyDays))
        .await
        .unwrap();
    upsert_company_problem(pool, 2, 79, Window::All, None).await.unwrap();
    upsert_company_problem(pool, 3, 2, Window::SixMonths, Some(TimeframeTag::SixMonths))
        .await
        .unwrap();
    let tags = BTreeSet::from(["Array".to_string(), "Backtracking".to_string()]);
    replace_problem_tags(pool, 79, &tags).await.unwrap();
}

#[derive(Debug, PartialEq)]
struct Contents {
    companies: Vec<(i64, String)>,
    problems: Vec<(i64, Option<String>, Option<String>, Option<f64>, Option<f64>, DateTime<Utc>)>,
    tags: Vec<(i64, String, DateTime<Utc>)>,
    associations: Vec<(i64, i64, Option<String>, Option<String>, DateTime<Utc>)>,
}

async fn contents(pool: &PgPool) -> Contents {
    Contents {
        companies: sqlx::query_as("SELECT id, name FROM companies ORDER BY id")
            .fetch_all(pool)
            .await
            .unwrap(),
        problems: sqlx::query_as(
            "SELECT id, url, title, acceptance, frequency, updated_at FROM problems ORDER BY id",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
        tags: sqlx::query_as("SELECT problem_id, tag, added_at FROM problem_tags ORDER BY problem_id, tag")
            .fetch_all(pool)
            .await
            .unwrap(),
        associations: sqlx::query_as(
            r#"
            SELECT company_id, problem_id, source_file, timeframe_tag, last_seen
              FROM company_problems
             ORDER BY company_id, problem_id
            "#,
        )
        .fetch_all(pool)
        .await
        .unwrap(),
    }
}

#[tokio::test]
async fn replication_mirrors_and_reruns_cleanly() {
    let _guard = exclusive();
    let Some(source) = fresh("QBANK_TEST_DATABASE_URL", PoolConfig::primary()).await else {
        eprintln!("QBANK_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let Some(destination) = fresh("QBANK_TEST_REPLICA_DATABASE_URL", PoolConfig::replica()).await
    else {
        eprintln!("QBANK_TEST_REPLICA_DATABASE_URL not set; skipping");
        return;
    };
    seed(&source).await;

    let engine = ReplicationEngine::new(PgReplicator::new(source.clone(), destination.clone()));
    let summary = engine.run().await.unwrap();
    assert_eq!(summary.tables.len(), 4);
    assert_eq!(summary.tables[0].table, ReplicatedTable::Companies);
    assert_eq!(summary.tables[0].staged, 3);
    assert_eq!(summary.company_sequence, Some(3));

    let first = contents(&destination).await;
    assert_eq!(first, contents(&source).await);

    engine.run().await.unwrap();
    assert_eq!(contents(&destination).await, first);

    let new_id = upsert_company(&destination, "umbrella").await.unwrap();
    assert!(new_id > 3);
}

async fn pools() -> Option<(PgPool, PgPool)> {
    let source = fresh("QBANK_TEST_DATABASE_URL", PoolConfig::primary()).await?;
    let destination = fresh("QBANK_TEST_REPLICA_DATABASE_URL", PoolConfig::replica()).await?;
    Some((source, destination))
}

fn assert_only_companies_landed(contents: &Contents) {
    assert_eq!(contents.companies.len(), 3);
    assert!(contents.problems.is_empty());
    assert!(contents.tags.is_empty());
    assert!(contents.associations.is_empty());
}

#[tokio::test]
async fn failed_copy_rolls_back_the_table_and_stops_the_run() {
    let _guard = exclusive();
    let Some((source, destination)) = pools().await else {
        return;
    };
    seed(&source).await;
    // The staging table copies this column type, so every seeded title overflows it.
    sqlx::query("ALTER TABLE problems ALTER COLUMN title TYPE VARCHAR(3)")
        .execute(&destination)
        .await
        .unwrap();

    let engine = ReplicationEngine::new(PgReplicator::new(source, destination.clone()));
    let err = engine.run().await.unwrap_err();

    assert!(matches!(
        err,
        ReplicationError::Table {
            table: ReplicatedTable::Problems,
            stage: ReplicationStage::Copy,
            ..
        }
    ));
    assert_only_companies_landed(&contents(&destination).await);
}

#[tokio::test]
async fn failed_upsert_rolls_back_the_table_and_stops_the_run() {
    let _guard = exclusive();
    let Some((source, destination)) = pools().await else {
        return;
    };
    seed(&source).await;
    // CHECK constraints are not copied by LIKE, so staging accepts the rows
    // and the insert into the real table rejects them.
    sqlx::query("ALTER TABLE problems ADD CONSTRAINT problems_no_hard CHECK (difficulty <> 'Hard')")
        .execute(&destination)
        .await
        .unwrap();

    let engine = ReplicationEngine::new(PgReplicator::new(source, destination.clone()));
    let err = engine.run().await.unwrap_err();

    assert!(matches!(
        err,
        ReplicationError::Table {
            table: ReplicatedTable::Problems,
            stage: ReplicationStage::Upsert,
            ..
        }
    ));
    assert_only_companies_landed(&contents(&destination).await);
}

#[tokio::test]
async fn empty_companies_table_restarts_ids_at_one() {
    let _guard = exclusive();
    let Some((source, destination)) = pools().await else {
        return;
    };

    let engine = ReplicationEngine::new(PgReplicator::new(source, destination.clone()));
    let summary = engine.run().await.unwrap();
    assert!(summary.tables.iter().all(|report| report.staged == 0));
    assert_eq!(summary.company_sequence, Some(1));

    assert_eq!(upsert_company(&destination, "first").await.unwrap(), 1);
}
