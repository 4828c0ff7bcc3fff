//! Refreshing each problem's topic tags from the question-metadata service.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use qbank_adapters::TagSource;
use qbank_storage::{replace_problem_tags, ProblemUrl, StoreError};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, info_span, warn, Instrument};

/// Title slug of a problem URL: the segment after `/problems/`.
pub fn extract_slug(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("/problems/")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let slug = rest[..end].trim();
    (!slug.is_empty()).then_some(slug)
}

pub fn normalize_tags<I, S>(names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| name.as_ref().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[async_trait]
pub trait TagWriter: Send + Sync {
    async fn replace_tags(&self, problem_id: i64, tags: &BTreeSet<String>) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgTagWriter {
    pool: PgPool,
}

impl PgTagWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TagWriter for PgTagWriter {
    async fn replace_tags(&self, problem_id: i64, tags: &BTreeSet<String>) -> Result<usize, StoreError> {
        replace_problem_tags(&self.pool, problem_id, tags).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            batch_size: 40,
            batch_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentSummary {
    pub considered: usize,
    pub skipped_no_slug: usize,
    pub updated: usize,
    pub unresolved: usize,
    pub failed_writes: usize,
    pub failed_batches: usize,
}

struct Pending {
    problem_id: i64,
    slug: String,
}

pub struct TagEnrichmentPass<S, W> {
    source: S,
    writer: W,
    config: EnrichmentConfig,
}

impl<S: TagSource, W: TagWriter> TagEnrichmentPass<S, W> {
    pub fn new(source: S, writer: W, config: EnrichmentConfig) -> Self {
        Self {
            source,
            writer,
            config,
        }
    }

    pub async fn run(&self, problems: Vec<ProblemUrl>) -> EnrichmentSummary {
        let mut summary = EnrichmentSummary {
            considered: problems.len(),
            ..Default::default()
        };

        let mut pending = Vec::with_capacity(problems.len());
        for problem in problems {
            match extract_slug(&problem.url) {
                Some(slug) => pending.push(Pending {
                    problem_id: problem.id,
                    slug: slug.to_string(),
                }),
                None => {
                    warn!(problem_id = problem.id, url = %problem.url, "no slug in problem url");
                    summary.skipped_no_slug += 1;
                }
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let batches = pending.len().div_ceil(batch_size);
        for (index, batch) in pending.chunks(batch_size).enumerate() {
            let span = info_span!("enrich_batch", batch = index + 1, of = batches, size = batch.len());
            self.enrich_batch(batch, &mut summary).instrument(span).await;
            tokio::time::sleep(self.config.batch_delay).await;
        }

        info!(
            considered = summary.considered,
            updated = summary.updated,
            unresolved = summary.unresolved,
            failed_batches = summary.failed_batches,
            "enrichment complete"
        );
        summary
    }

    async fn enrich_batch(&self, batch: &[Pending], summary: &mut EnrichmentSummary) {
        let slugs = batch.iter().map(|p| p.slug.clone()).collect::<Vec<_>>();
        let response = match self.source.fetch_tags(&slugs).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "tag batch failed");
                summary.failed_batches += 1;
                return;
            }
        };
        for error in &response.errors {
            warn!(%error, "tag service reported an error");
        }

        for (problem, resolved) in batch.iter().zip(response.resolved) {
            let Some(names) = resolved else {
                debug!(problem_id = problem.problem_id, slug = %problem.slug, "no tags resolved");
                summary.unresolved += 1;
                continue;
            };
            let tags = normalize_tags(names);
            match self.writer.replace_tags(problem.problem_id, &tags).await {
                Ok(_) => summary.updated += 1,
                Err(err) => {
                    warn!(problem_id = problem.problem_id, error = %err, "tag write failed");
                    summary.failed_writes += 1;
                }
            }
        }
    }
}
