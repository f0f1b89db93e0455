//! Ingestion orchestration: normalization, validation gating, change
//! detection and incremental merge of scraped posts into the lake.

pub mod change;
pub mod config;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod validate;

use harvest_core::LoadMode;

pub use change::{compute_fingerprint, ChangeDetector, PendingFingerprint};
pub use config::{SyncConfig, TagRegistry};
pub use merge::{anti_join, IncrementalMerger, MergeOutcome};
pub use normalize::{collapse_duplicates, normalize, normalize_entry, MalformedEntry, NormalizationOutcome};
pub use pipeline::{IngestPipeline, LoadOutcome, PipelineError, RunSummary, TagSummary};
pub use report::{FanoutReportSink, FileReportSink, ReportSink, TracingReportSink};
pub use validate::{DatasetCheck, RowViolation, SchemaValidator, ValidationConfig, ValidationReport};

pub const CRATE_NAME: &str = "harvest-sync";

pub async fn run_once_from_env(mode: LoadMode) -> Result<RunSummary, PipelineError> {
    let pipeline = IngestPipeline::from_config(SyncConfig::from_env())?;
    pipeline.run_once(mode).await
}
