//! Mirroring the primary store into the replica with stage-then-upsert, one table per transaction.

use std::fmt;

use async_trait::async_trait;
use futures::TryStreamExt;
use qbank_core::{Company, CompanyProblem, Problem, ProblemTag};
use qbank_storage::{
    ReplicatedRow, TableSpec, COMPANIES, COMPANY_PROBLEMS, PROBLEMS, PROBLEM_TAGS,
};
use serde::Serialize;
use sqlx::postgres::PgCopyIn;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};

/// Bytes buffered before a chunk is pushed down the `COPY` stream.
const COPY_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatedTable {
    Companies,
    Problems,
    ProblemTags,
    CompanyProblems,
}

impl ReplicatedTable {
    /// Foreign-key order: parents before the tables that reference them.
    pub const ORDER: [ReplicatedTable; 4] = [
        ReplicatedTable::Companies,
        ReplicatedTable::Problems,
        ReplicatedTable::ProblemTags,
        ReplicatedTable::CompanyProblems,
    ];

    pub fn spec(self) -> TableSpec {
        match self {
            ReplicatedTable::Companies => COMPANIES,
            ReplicatedTable::Problems => PROBLEMS,
            ReplicatedTable::ProblemTags => PROBLEM_TAGS,
            ReplicatedTable::CompanyProblems => COMPANY_PROBLEMS,
        }
    }

    pub fn has_serial_key(self) -> bool {
        self.spec().serial_column.is_some()
    }
}

impl fmt::Display for ReplicatedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStage {
    Begin,
    CreateStaging,
    ReadSource,
    Copy,
    Upsert,
    Commit,
}

impl fmt::Display for ReplicationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplicationStage::Begin => "beginning transaction",
            ReplicationStage::CreateStaging => "creating staging table",
            ReplicationStage::ReadSource => "reading source rows",
            ReplicationStage::Copy => "copying into staging",
            ReplicationStage::Upsert => "upserting from staging",
            ReplicationStage::Commit => "committing",
        })
    }
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("{table}: failed {stage}: {source}")]
    Table {
        table: ReplicatedTable,
        stage: ReplicationStage,
        #[source]
        source: sqlx::Error,
    },
    #[error("{table}: repairing sequence failed: {source}")]
    Sequence {
        table: ReplicatedTable,
        #[source]
        source: sqlx::Error,
    },
}

fn at(table: ReplicatedTable, stage: ReplicationStage) -> impl FnOnce(sqlx::Error) -> ReplicationError {
    move |source| ReplicationError::Table {
        table,
        stage,
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: ReplicatedTable,
    pub staged: u64,
    pub upserted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationSummary {
    pub tables: Vec<TableReport>,
    /// Value the companies id sequence was set to.
    pub company_sequence: Option<i64>,
}

/// Moves one table's rows to the destination and repairs sequences. The
/// engine owns ordering and abort policy; implementors own the mechanics.
#[async_trait]
pub trait TableReplicator: Send + Sync {
    async fn replicate(&self, table: ReplicatedTable) -> Result<TableReport, ReplicationError>;

    async fn repair_sequence(&self, table: ReplicatedTable) -> Result<i64, ReplicationError>;
}

pub struct ReplicationEngine<R> {
    replicator: R,
}

impl<R: TableReplicator> ReplicationEngine<R> {
    pub fn new(replicator: R) -> Self {
        Self { replicator }
    }

    /// Replicate every table in [`ReplicatedTable::ORDER`]. The first failure
    /// aborts the run; later tables may reference the one that failed.
    pub async fn run(&self) -> Result<ReplicationSummary, ReplicationError> {
        let mut summary = ReplicationSummary::default();

        for table in ReplicatedTable::ORDER {
            let span = info_span!("replicate_table", %table);
            let report = match self.replicator.replicate(table).instrument(span).await {
                Ok(report) => report,
                Err(err) => {
                    error!(%table, error = %err, "replication aborted");
                    return Err(err);
                }
            };
            info!(%table, staged = report.staged, upserted = report.upserted, "table replicated");
            summary.tables.push(report);

            // Runs after the table's transaction has committed, never inside it.
            if table.has_serial_key() {
                let value = self.replicator.repair_sequence(table).await.map_err(|err| {
                    error!(%table, error = %err, "sequence repair failed");
                    err
                })?;
                info!(%table, value, "sequence repaired");
                summary.company_sequence = Some(value);
            }
        }

        Ok(summary)
    }
}

/// Postgres-to-Postgres replicator: streams source rows into a `COPY` on a
/// transaction-scoped staging table, then upserts into the destination.
#[derive(Debug, Clone)]
pub struct PgReplicator {
    source: PgPool,
    destination: PgPool,
}

impl PgReplicator {
    pub fn new(source: PgPool, destination: PgPool) -> Self {
        Self {
            source,
            destination,
        }
    }

    async fn sync<T: ReplicatedRow>(
        &self,
        table: ReplicatedTable,
    ) -> Result<TableReport, ReplicationError> {
        let spec = T::SPEC;
        let mut tx = self
            .destination
            .begin()
            .await
            .map_err(at(table, ReplicationStage::Begin))?;

        sqlx::query(&spec.create_staging_sql())
            .execute(&mut *tx)
            .await
            .map_err(at(table, ReplicationStage::CreateStaging))?;

        let mut copy = tx
            .copy_in_raw(&spec.copy_in_sql())
            .await
            .map_err(at(table, ReplicationStage::Copy))?;
        if let Err(err) = stream_rows::<T>(&self.source, table, &mut copy).await {
            let _ = copy.abort(err.to_string()).await;
            return Err(err);
        }
        let staged = copy
            .finish()
            .await
            .map_err(at(table, ReplicationStage::Copy))?;

        let upserted = sqlx::query(&spec.upsert_sql())
            .execute(&mut *tx)
            .await
            .map_err(at(table, ReplicationStage::Upsert))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(at(table, ReplicationStage::Commit))?;

        Ok(TableReport {
            table,
            staged,
            upserted,
        })
    }
}

async fn stream_rows<T: ReplicatedRow>(
    source: &PgPool,
    table: ReplicatedTable,
    copy: &mut PgCopyIn<&mut PgConnection>,
) -> Result<u64, ReplicationError> {
    let select = T::SPEC.select_sql();
    let mut rows = sqlx::query_as::<_, T>(&select).fetch(source);
    let mut buf = String::with_capacity(COPY_CHUNK_BYTES);
    let mut count = 0u64;

    while let Some(row) = rows
        .try_next()
        .await
        .map_err(at(table, ReplicationStage::ReadSource))?
    {
        row.write_copy_line(&mut buf);
        count += 1;
        if buf.len() >= COPY_CHUNK_BYTES {
            copy.send(buf.as_bytes())
                .await
                .map_err(at(table, ReplicationStage::Copy))?;
            buf.clear();
        }
    }
    if !buf.is_empty() {
        copy.send(buf.as_bytes())
            .await
            .map_err(at(table, ReplicationStage::Copy))?;
    }
    Ok(count)
}

#[async_trait]
impl TableReplicator for PgReplicator {
    async fn replicate(&self, table: ReplicatedTable) -> Result<TableReport, ReplicationError> {
        match table {
            ReplicatedTable::Companies => self.sync::<Company>(table).await,
            ReplicatedTable::Problems => self.sync::<Problem>(table).await,
            ReplicatedTable::ProblemTags => self.sync::<ProblemTag>(table).await,
            ReplicatedTable::CompanyProblems => self.sync::<CompanyProblem>(table).await,
        }
    }

    async fn repair_sequence(&self, table: ReplicatedTable) -> Result<i64, ReplicationError> {
        let Some(sql) = table.spec().sequence_repair_sql() else {
            return Ok(0);
        };
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.destination)
            .await
            .map_err(|source| ReplicationError::Sequence { table, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Replicate(ReplicatedTable),
        RepairSequence(ReplicatedTable),
    }

    #[derive(Default)]
    struct RecordingReplicator {
        calls: Mutex<Vec<Call>>,
        fail_on: Option<ReplicatedTable>,
    }

    #[async_trait]
    impl TableReplicator for RecordingReplicator {
        async fn replicate(&self, table: ReplicatedTable) -> Result<TableReport, ReplicationError> {
            self.calls.lock().unwrap().push(Call::Replicate(table));
            if self.fail_on == Some(table) {
                return Err(ReplicationError::Table {
                    table,
                    stage: ReplicationStage::Upsert,
                    source: sqlx::Error::Protocol("duplicate key".into()),
                });
            }
            Ok(TableReport {
                table,
                staged: 2,
                upserted: 2,
            })
        }

        async fn repair_sequence(&self, table: ReplicatedTable) -> Result<i64, ReplicationError> {
            self.calls.lock().unwrap().push(Call::RepairSequence(table));
            Ok(7)
        }
    }

    #[tokio::test]
    async fn tables_replicate_in_foreign_key_order() {
        let engine = ReplicationEngine::new(RecordingReplicator::default());
        let summary = engine.run().await.unwrap();

        assert_eq!(
            *engine.replicator.calls.lock().unwrap(),
            vec![
                Call::Replicate(ReplicatedTable::Companies),
                Call::RepairSequence(ReplicatedTable::Companies),
                Call::Replicate(ReplicatedTable::Problems),
                Call::Replicate(ReplicatedTable::ProblemTags),
                Call::Replicate(ReplicatedTable::CompanyProblems),
            ]
        );
        assert_eq!(summary.tables.len(), 4);
        assert_eq!(summary.company_sequence, Some(7));
    }

    #[tokio::test]
    async fn failure_on_problems_stops_dependent_tables() {
        let engine = ReplicationEngine::new(RecordingReplicator {
            fail_on: Some(ReplicatedTable::Problems),
            ..Default::default()
        });
        let err = engine.run().await.unwrap_err();

        assert!(matches!(
            err,
            ReplicationError::Table {
                table: ReplicatedTable::Problems,
                stage: ReplicationStage::Upsert,
                ..
            }
        ));
        let calls = engine.replicator.calls.lock().unwrap();
        assert!(!calls.contains(&Call::Replicate(ReplicatedTable::ProblemTags)));
        assert!(!calls.contains(&Call::Replicate(ReplicatedTable::CompanyProblems)));
    }

    #[tokio::test]
    async fn failed_companies_table_skips_sequence_repair() {
        let engine = ReplicationEngine::new(RecordingReplicator {
            fail_on: Some(ReplicatedTable::Companies),
            ..Default::default()
        });
        assert!(engine.run().await.is_err());
        assert_eq!(
            *engine.replicator.calls.lock().unwrap(),
            vec![Call::Replicate(ReplicatedTable::Companies)]
        );
    }

    #[test]
    fn errors_name_the_table_and_stage() {
        let err = at(ReplicatedTable::ProblemTags, ReplicationStage::CreateStaging)(
            sqlx::Error::Protocol("boom".into()),
        );
        assert!(err
            .to_string()
            .starts_with("problem_tags: failed creating staging table"));
    }

    #[test]
    fn only_companies_have_a_serial_key() {
        let serial = ReplicatedTable::ORDER
            .into_iter()
            .filter(|t| t.has_serial_key())
            .collect::<Vec<_>>();
        assert_eq!(serial, vec![ReplicatedTable::Companies]);
    }
}
