use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use harvest_core::{LoadMode, NormalizedRecord, RawEntry};
use harvest_scrape::{
    flatten_tasks, AuthState, BatchScheduler, BrowserLauncher, ExtractionSelectors, FixtureLauncher,
    ScrapeError, ScrapeTimings, Scraper, SessionConfig, SessionPhase, SessionReport, TagCategory,
    TagUrlEncoder, WebDriverConfig, WebDriverLauncher,
};
use harvest_storage::{LocalLakeStore, SidecarStore, StorageError, StorageGateway};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::change::ChangeDetector;
use crate::config::{SyncConfig, TagRegistry};
use crate::merge::IncrementalMerger;
use crate::normalize::{collapse_duplicates, normalize};
use crate::report::{FanoutReportSink, FileReportSink, ReportSink, TracingReportSink};
use crate::validate::{SchemaValidator, ValidationConfig};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

/// How a load ended. Only `Appended` touched the main table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Rejected {
        failed_checks: Vec<String>,
        row_violations: usize,
    },
    Unchanged,
    NoNewRecords,
    Appended {
        rows: usize,
        commit_id: Uuid,
    },
}

impl LoadOutcome {
    pub fn appended_rows(&self) -> usize {
        match self {
            LoadOutcome::Appended { rows, .. } => *rows,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TagSummary {
    pub category: String,
    pub tag: String,
    pub entries: usize,
    pub phase: SessionPhase,
    pub failure: Option<String>,
}

impl From<&SessionReport> for TagSummary {
    fn from(report: &SessionReport) -> Self {
        Self {
            category: report.task.category.clone(),
            tag: report.task.tag.clone(),
            entries: report.entries.len(),
            phase: report.final_phase,
            failure: report.failure.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: LoadMode,
    pub tags_total: usize,
    pub tags_empty: usize,
    pub raw_entries: usize,
    pub normalized: usize,
    pub dropped_malformed: usize,
    /// Posts already taken from an earlier tag in the same run.
    pub collapsed_duplicates: usize,
    pub tags: Vec<TagSummary>,
    pub outcome: LoadOutcome,
}

/// Scrape → normalize → validate → change-detect → merge, for one table.
pub struct IngestPipeline {
    config: SyncConfig,
    storage: Arc<dyn StorageGateway>,
    detector: ChangeDetector,
    launcher: Arc<dyn BrowserLauncher>,
    auth: Option<Arc<AuthState>>,
    timings: ScrapeTimings,
    validator: SchemaValidator,
    reports: Arc<dyn ReportSink>,
    run_lock: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(
        config: SyncConfig,
        storage: Arc<dyn StorageGateway>,
        sidecar: Arc<dyn SidecarStore>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        let mut timings = ScrapeTimings::default();
        timings.content_retry.max_attempts = config.max_retries;
        let validator = SchemaValidator::new(ValidationConfig {
            key_variant: config.key_variant,
            ..ValidationConfig::default()
        });
        Self {
            config,
            storage,
            detector: ChangeDetector::new(sidecar),
            launcher,
            auth: None,
            timings,
            validator,
            reports: Arc::new(TracingReportSink),
            run_lock: Mutex::new(()),
        }
    }

    /// Local lake under `store_dir`; fixture pages when `fixtures_dir` is set, WebDriver otherwise.
    pub fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let lake = Arc::new(LocalLakeStore::new(config.store_dir.clone()));
        let replay = config.fixtures_dir.is_some();
        let launcher: Arc<dyn BrowserLauncher> = match &config.fixtures_dir {
            Some(dir) => Arc::new(FixtureLauncher::from_dir(dir)?),
            None => Arc::new(
                WebDriverLauncher::new(WebDriverConfig {
                    base_url: config.webdriver_url.clone(),
                    ..WebDriverConfig::default()
                })
                .context("building webdriver client")?,
            ),
        };
        let auth = if config.auth_state.exists() {
            Some(AuthState::load(&config.auth_state)?)
        } else {
            if !replay {
                warn!(path = %config.auth_state.display(), "no auth state found, scraping signed out");
            }
            None
        };

        let mut sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::new(TracingReportSink)];
        if config.reports_enabled {
            sinks.push(Arc::new(FileReportSink::new(config.reports_root())));
        }

        let mut pipeline = Self::new(config, lake.clone(), lake, launcher)
            .with_reports(Arc::new(FanoutReportSink::new(sinks)));
        if let Some(auth) = auth {
            pipeline = pipeline.with_auth(auth);
        }
        if replay {
            pipeline.timings = ScrapeTimings {
                content_retry: pipeline.timings.content_retry,
                ..ScrapeTimings::immediate()
            };
        }
        Ok(pipeline)
    }

    pub fn with_auth(mut self, auth: AuthState) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn with_timings(mut self, timings: ScrapeTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_validation(mut self, config: ValidationConfig) -> Self {
        self.validator = SchemaValidator::new(config);
        self
    }

    pub fn with_reports(mut self, reports: Arc<dyn ReportSink>) -> Self {
        self.reports = reports;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One full ingestion pass over every tag in `tags.yaml`.
    pub async fn run_once(&self, mode: LoadMode) -> Result<RunSummary, PipelineError> {
        let _guard = self.run_lock.lock().await;
        self.run_registry(mode).await
    }

    pub async fn run_with_tags(&self, categories: &[TagCategory], mode: LoadMode) -> Result<RunSummary, PipelineError> {
        let _guard = self.run_lock.lock().await;
        self.run_unlocked(categories, mode).await
    }

    /// Caller holds `run_lock`.
    async fn run_registry(&self, mode: LoadMode) -> Result<RunSummary, PipelineError> {
        let registry = TagRegistry::load(self.config.tag_registry_path()).await?;
        self.run_unlocked(&registry.categories, mode).await
    }

    async fn run_unlocked(&self, categories: &[TagCategory], mode: LoadMode) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest_run", %run_id, %mode);

        async move {
            let sessions = self.scrape_all(categories, mode).await?;
            let raw: Vec<RawEntry> = sessions.iter().flat_map(|s| s.entries.iter().cloned()).collect();
            let normalized = normalize(&raw);
            let normalized_count = normalized.records.len();
            let (records, collapsed) = collapse_duplicates(normalized.records, self.config.key_variant);
            let outcome = self.load(run_id, &records, mode).await?;

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                mode,
                tags_total: sessions.len(),
                tags_empty: sessions.iter().filter(|s| s.entries.is_empty()).count(),
                raw_entries: raw.len(),
                normalized: normalized_count,
                dropped_malformed: normalized.dropped,
                collapsed_duplicates: collapsed,
                tags: sessions.iter().map(TagSummary::from).collect(),
                outcome,
            };
            if let Err(err) = self.reports.run_finished(&summary).await {
                warn!(error = %err, "could not write run summary");
            }
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// One report per tag, in registry order. Per-tag failures stay inside the reports.
    pub async fn scrape_all(&self, categories: &[TagCategory], mode: LoadMode) -> Result<Vec<SessionReport>, ScrapeError> {
        let encoder = TagUrlEncoder::new(self.config.search_url_template.clone());
        let tasks = flatten_tasks(&encoder.encode(categories));
        let scraper = Scraper::new(
            Arc::clone(&self.launcher),
            self.auth.clone(),
            SessionConfig {
                timings: self.timings,
                max_scrolls: self.config.max_scrolls_for(mode),
                selectors: ExtractionSelectors::default(),
            },
        )?;
        let scheduler = BatchScheduler::new(self.config.scheduler());
        Ok(scheduler.run(&scraper, tasks).await)
    }

    /// Validation gate, then fingerprint short-circuit, then anti-join append.
    /// The fingerprint is only recorded once the merge has succeeded.
    pub async fn load(&self, run_id: Uuid, records: &[NormalizedRecord], mode: LoadMode) -> Result<LoadOutcome, PipelineError> {
        let report = self.validator.check(records, mode, Utc::now());
        crate::validate::log_report(&report);
        if let Err(err) = self.reports.validation(run_id, &report).await {
            warn!(error = %err, "could not write validation report");
        }
        if !report.passed() {
            error!(rows = records.len(), "validation failed, data not saved");
            return Ok(LoadOutcome::Rejected {
                failed_checks: report.failed_checks().map(|c| c.name.to_string()).collect(),
                row_violations: report.row_violations.len(),
            });
        }

        self.ensure_repository().await?;
        let Some(pending) = self.detector.has_changed(records, &self.config.fingerprint_key()).await? else {
            return Ok(LoadOutcome::Unchanged);
        };

        let merger = IncrementalMerger::new(
            Arc::clone(&self.storage),
            self.config.table_path(),
            self.config.key_variant,
        );
        let merged = merger.merge(records).await?;
        self.detector.record(&pending).await?;
        Ok(match merged.commit {
            Some(commit) => LoadOutcome::Appended {
                rows: merged.appended,
                commit_id: commit.commit_id,
            },
            None => LoadOutcome::NoNewRecords,
        })
    }

    async fn ensure_repository(&self) -> Result<(), StorageError> {
        let name = &self.config.repository;
        if !self.storage.repository_exists(name).await? {
            info!(repository = %name, "creating repository");
            self.storage
                .create_repository(name, &self.config.storage_namespace())
                .await?;
        }
        Ok(())
    }

    /// One incremental pass, or `None` when another run holds the lock. The
    /// guard taken here is the one held for the whole pass.
    pub async fn scheduled_tick(&self) -> Option<Result<RunSummary, PipelineError>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous run still in progress, skipping scheduled sync");
            return None;
        };
        Some(self.run_registry(LoadMode::Incremental).await)
    }

    /// Cron job running the incremental flow; `None` unless the scheduler is enabled.
    /// A tick that lands while a run is still going is skipped.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = self;
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.scheduled_tick().await {
                    Some(Ok(summary)) => info!(
                        run_id = %summary.run_id,
                        appended = summary.outcome.appended_rows(),
                        "scheduled sync finished"
                    ),
                    Some(Err(err)) => error!(error = %err, "scheduled sync failed"),
                    None => {}
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
