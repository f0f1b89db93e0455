use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::{LoadOutcome, RunSummary};
use crate::validate::ValidationReport;

/// Where per-run reports go. Created by the caller and handed to the pipeline.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn validation(&self, run_id: Uuid, report: &ValidationReport) -> Result<()>;
    async fn run_finished(&self, summary: &RunSummary) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReportSink;

#[async_trait]
impl ReportSink for TracingReportSink {
    async fn validation(&self, run_id: Uuid, report: &ValidationReport) -> Result<()> {
        info!(
            %run_id,
            mode = %report.mode,
            rows = report.rows,
            row_violations = report.row_violations.len(),
            failed_checks = report.failed_checks().count(),
            passed = report.passed(),
            "validation report"
        );
        Ok(())
    }

    async fn run_finished(&self, summary: &RunSummary) -> Result<()> {
        let outcome = match &summary.outcome {
            LoadOutcome::Rejected { .. } => "rejected",
            LoadOutcome::Unchanged => "unchanged",
            LoadOutcome::NoNewRecords => "no_new_records",
            LoadOutcome::Appended { .. } => "appended",
        };
        info!(
            run_id = %summary.run_id,
            mode = %summary.mode,
            tags = summary.tags_total,
            empty_tags = summary.tags_empty,
            raw = summary.raw_entries,
            normalized = summary.normalized,
            dropped = summary.dropped_malformed,
            outcome,
            "run finished"
        );
        Ok(())
    }
}

/// Writes `reports/<run_id>/validation.md` and `reports/<run_id>/run_summary.json`.
#[derive(Debug, Clone)]
pub struct FileReportSink {
    root: PathBuf,
}

impl FileReportSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    async fn write(&self, run_id: Uuid, name: &str, bytes: Vec<u8>) -> Result<()> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

#[async_trait]
impl ReportSink for FileReportSink {
    async fn validation(&self, run_id: Uuid, report: &ValidationReport) -> Result<()> {
        self.write(run_id, "validation.md", report.to_markdown().into_bytes())
            .await
    }

    async fn run_finished(&self, summary: &RunSummary) -> Result<()> {
        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        self.write(summary.run_id, "run_summary.json", json).await
    }
}

/// Forwards to every inner sink; one failing sink does not stop the others.
#[derive(Clone, Default)]
pub struct FanoutReportSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl FanoutReportSink {
    pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ReportSink for FanoutReportSink {
    async fn validation(&self, run_id: Uuid, report: &ValidationReport) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.validation(run_id, report).await {
                warn!(error = %err, "report sink failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn run_finished(&self, summary: &RunSummary) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.run_finished(summary).await {
                warn!(error = %err, "report sink failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::SchemaValidator;
    use chrono::Utc;
    use harvest_core::LoadMode;

    #[tokio::test]
    async fn file_sink_writes_under_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileReportSink::new(dir.path().join("reports"));
        let run_id = Uuid::new_v4();
        let report = SchemaValidator::default().check(&[], LoadMode::Initial, Utc::now());

        let fanout = FanoutReportSink::new(vec![Arc::new(TracingReportSink), Arc::new(sink.clone())]);
        fanout.validation(run_id, &report).await.unwrap();

        let text = std::fs::read_to_string(sink.run_dir(run_id).join("validation.md")).unwrap();
        assert!(text.contains("Result: FAIL"));
        assert!(text.contains("- [ ] record_count"));
        assert!(text.contains("- [x] no_missing_values"));
    }
}
