//! Source adapters: company snapshot CSVs on disk and the question-metadata tag service.

mod snapshot;
mod tag_source;

pub use snapshot::{
    list_company_dirs, load_company_snapshots, parse_percent, parse_snapshot, read_snapshot,
    CompanyDir, CompanySnapshots, SnapshotError, WindowRecords,
};
pub use tag_source::{
    build_batch_query, decode_batch_response, GraphqlTagSource, TagBatch, TagSource,
    TagSourceConfig, TagSourceError, DEFAULT_TAG_SERVICE_URL,
};

pub const CRATE_NAME: &str = "qbank-adapters";
