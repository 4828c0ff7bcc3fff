//! Writing merged company snapshots into the primary store, one transaction per company.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use qbank_adapters::{list_company_dirs, load_company_snapshots, CompanyDir};
use qbank_core::Window;
use qbank_storage::{upsert_company, upsert_company_problem, upsert_problem, StoreError};
use serde::Serialize;
use sqlx::{Acquire, PgPool, Postgres, Transaction};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::merge::{MergedProblem, MergedSnapshot, SnapshotMerger};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompanyIngestSummary {
    pub company: String,
    pub company_id: i64,
    pub problems_written: usize,
    pub associations_written: usize,
    pub rows_failed: usize,
}

#[derive(Debug, Clone)]
pub struct CompanyIngestWriter {
    pool: PgPool,
}

impl CompanyIngestWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert the company, then every merged problem and its association, in a
    /// single transaction. A failing problem/association pair is rolled back to
    /// its savepoint and skipped; a failure to begin or commit loses the whole
    /// company.
    pub async fn write_company(
        &self,
        company: &str,
        merged: &MergedSnapshot,
    ) -> Result<CompanyIngestSummary> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("beginning transaction for {company}"))?;

        let company_id = upsert_company(&mut *tx, company)
            .await
            .with_context(|| format!("upserting company {company}"))?;

        let mut summary = CompanyIngestSummary {
            company: company.to_string(),
            company_id,
            ..Default::default()
        };

        for (id, problem) in merged {
            let mut savepoint = tx
                .begin()
                .await
                .with_context(|| format!("opening savepoint for problem {id}"))?;

            match write_pair(&mut savepoint, company_id, problem).await {
                Ok(()) => {
                    savepoint
                        .commit()
                        .await
                        .with_context(|| format!("releasing savepoint for problem {id}"))?;
                    summary.problems_written += 1;
                    summary.associations_written += 1;
                }
                Err(err) => {
                    warn!(company, problem_id = id, error = %err, "skipping problem");
                    savepoint
                        .rollback()
                        .await
                        .with_context(|| format!("rolling back savepoint for problem {id}"))?;
                    summary.rows_failed += 1;
                }
            }
        }

        tx.commit()
            .await
            .with_context(|| format!("committing transaction for {company}"))?;
        Ok(summary)
    }
}

async fn write_pair(
    tx: &mut Transaction<'_, Postgres>,
    company_id: i64,
    problem: &MergedProblem,
) -> Result<(), StoreError> {
    upsert_problem(&mut **tx, &problem.record).await?;
    upsert_company_problem(
        &mut **tx,
        company_id,
        problem.record.id,
        problem.source_window,
        problem.timeframe,
    )
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub companies: usize,
    pub companies_failed: usize,
    pub problems_written: usize,
    pub associations_written: usize,
    pub rows_failed: usize,
    pub windows_skipped: usize,
}

/// Walk every company directory under `root`, merge its windows and write it.
/// Companies are independent: one failing never stops the next.
pub async fn run_ingest(pool: &PgPool, root: &Path) -> Result<IngestRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let companies = list_company_dirs(root)?;
    let writer = CompanyIngestWriter::new(pool.clone());
    info!(%run_id, root = %root.display(), companies = companies.len(), "ingest starting");

    let mut summary = IngestRunSummary {
        run_id,
        started_at,
        finished_at: started_at,
        companies: companies.len(),
        companies_failed: 0,
        problems_written: 0,
        associations_written: 0,
        rows_failed: 0,
        windows_skipped: 0,
    };

    for dir in &companies {
        let span = info_span!("ingest_company", %run_id, company = %dir.name);
        match ingest_company(&writer, dir).instrument(span).await {
            Ok((company, skipped)) => {
                summary.problems_written += company.problems_written;
                summary.associations_written += company.associations_written;
                summary.rows_failed += company.rows_failed;
                summary.windows_skipped += skipped.len();
            }
            Err(err) => {
                error!(%run_id, company = %dir.name, error = %format!("{err:#}"), "company rolled back");
                summary.companies_failed += 1;
            }
        }
    }

    summary.finished_at = Utc::now();
    info!(
        %run_id,
        companies = summary.companies,
        companies_failed = summary.companies_failed,
        problems_written = summary.problems_written,
        rows_failed = summary.rows_failed,
        "ingest complete"
    );
    Ok(summary)
}

async fn ingest_company(
    writer: &CompanyIngestWriter,
    dir: &CompanyDir,
) -> Result<(CompanyIngestSummary, Vec<Window>)> {
    let snapshots = load_company_snapshots(dir);
    let merged = SnapshotMerger::merge(
        snapshots
            .windows
            .iter()
            .map(|(window, rows)| (*window, rows)),
    );
    let summary = writer.write_company(&snapshots.company, &merged).await?;
    info!(
        company_id = summary.company_id,
        windows = snapshots.windows.len(),
        windows_skipped = snapshots.skipped.len(),
        rows = snapshots.row_count(),
        problems = merged.len(),
        problems_written = summary.problems_written,
        rows_failed = summary.rows_failed,
        "company done"
    );
    Ok((summary, snapshots.skipped))
}
