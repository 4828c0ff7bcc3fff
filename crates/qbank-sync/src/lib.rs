//! Pass orchestration: snapshot ingest, tag enrichment and replica mirroring.

mod config;
mod enrich;
mod ingest;
mod merge;
mod replicate;

use std::path::Path;

use anyhow::{Context, Result};
use qbank_adapters::GraphqlTagSource;
use qbank_storage::{connect, load_problem_urls, PoolConfig};
use sqlx::PgPool;
use tracing::info;

pub use config::{redact_database_url, ConfigError, SyncConfig};
pub use enrich::{
    extract_slug, normalize_tags, EnrichmentConfig, EnrichmentSummary, PgTagWriter,
    TagEnrichmentPass, TagWriter,
};
pub use ingest::{run_ingest, CompanyIngestSummary, CompanyIngestWriter, IngestRunSummary};
pub use merge::{resolve_timeframe, MergedProblem, MergedSnapshot, PresenceFlags, SnapshotMerger};
pub use replicate::{
    PgReplicator, ReplicatedTable, ReplicationEngine, ReplicationError, ReplicationStage,
    ReplicationSummary, TableReplicator, TableReport,
};

pub const CRATE_NAME: &str = "qbank-sync";

async fn connect_pool(role: &str, url: &str, pool: PoolConfig) -> Result<PgPool> {
    let redacted = redact_database_url(url);
    info!(role, url = %redacted, max_connections = pool.max_connections, "connecting");
    connect(url, &pool)
        .await
        .with_context(|| format!("connecting to {role} database at {redacted}"))
}

async fn connect_primary(config: &SyncConfig) -> Result<PgPool> {
    connect_pool("primary", &config.primary_database_url, PoolConfig::primary()).await
}

/// Apply pending migrations to the primary store, and to the replica when one
/// is configured.
pub async fn migrate_from_config(config: &SyncConfig) -> Result<()> {
    let primary = connect_primary(config).await?;
    qbank_storage::migrate(&primary)
        .await
        .context("migrating primary database")?;

    if let Some(url) = config.replica_database_url.as_deref() {
        let replica = connect_pool("replica", url, PoolConfig::replica()).await?;
        qbank_storage::migrate(&replica)
            .await
            .context("migrating replica database")?;
    }
    Ok(())
}

pub async fn run_ingest_from_config(
    config: &SyncConfig,
    root_override: Option<&Path>,
) -> Result<IngestRunSummary> {
    let root = match root_override {
        Some(root) => root,
        None => config.require_snapshot_root()?,
    };
    let pool = connect_primary(config).await?;
    run_ingest(&pool, root).await
}

pub async fn run_enrichment_from_config(config: &SyncConfig) -> Result<EnrichmentSummary> {
    let pool = connect_primary(config).await?;
    let problems = load_problem_urls(&pool)
        .await
        .context("loading problem urls")?;
    info!(problems = problems.len(), endpoint = %config.tag_service_url, "enrichment starting");

    let source = GraphqlTagSource::new(config.tag_source_config())?;
    let pass = TagEnrichmentPass::new(
        source,
        PgTagWriter::new(pool),
        EnrichmentConfig {
            batch_size: config.tag_batch_size,
            batch_delay: config.tag_batch_delay,
        },
    );
    Ok(pass.run(problems).await)
}

pub async fn run_replication_from_config(config: &SyncConfig) -> Result<ReplicationSummary> {
    let replica_url = config.require_replica()?;
    let source = connect_primary(config).await?;
    let destination = connect_pool("replica", replica_url, PoolConfig::replica()).await?;

    let engine = ReplicationEngine::new(PgReplicator::new(source, destination));
    Ok(engine.run().await?)
}

pub async fn migrate_from_env() -> Result<()> {
    migrate_from_config(&SyncConfig::from_env()?).await
}

pub async fn run_ingest_from_env(root_override: Option<&Path>) -> Result<IngestRunSummary> {
    run_ingest_from_config(&SyncConfig::from_env()?, root_override).await
}

pub async fn run_enrichment_from_env() -> Result<EnrichmentSummary> {
    run_enrichment_from_config(&SyncConfig::from_env()?).await
}

pub async fn run_replication_from_env() -> Result<ReplicationSummary> {
    run_replication_from_config(&SyncConfig::from_env()?).await
}
