use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use harvest_core::{LoadMode, NormalizedRecord, PartitionKey};
use harvest_scrape::fixture::article_markup;
use harvest_scrape::{
    FixtureLauncher, FixturePage, FixturePass, ScrapeTimings, SessionPhase, TagCategory, TagUrlEncoder,
};
use harvest_storage::{
    CommitRecord, LocalLakeStore, PartitionColumn, RepositoryInfo, SidecarStore, StorageError, StorageGateway,
    TablePath,
};
use harvest_sync::{FileReportSink, IngestPipeline, LoadOutcome, PipelineError, SyncConfig, ValidationConfig};
use tempfile::tempdir;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single().unwrap()
}

fn articles(range: std::ops::Range<usize>) -> Vec<String> {
    range
        .map(|i| {
            let at = base_time() + TimeDelta::seconds(i as i64 * 90);
            article_markup(
                "Student",
                &format!("@student{i}"),
                &at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                &format!("รับน้อง post number {i}"),
            )
        })
        .collect()
}

fn registry(tags: &[&str]) -> Vec<TagCategory> {
    vec![TagCategory {
        category: "ธรรมศาสตร์".into(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }]
}

fn config_for(root: &std::path::Path) -> SyncConfig {
    SyncConfig {
        workspace_root: root.to_path_buf(),
        store_dir: root.join("lake"),
        ..SyncConfig::default()
    }
}

fn pipeline(config: SyncConfig, lake: Arc<LocalLakeStore>, pages: Vec<FixturePage>) -> IngestPipeline {
    IngestPipeline::new(config, lake.clone(), lake, Arc::new(FixtureLauncher::new(pages)))
        .with_timings(ScrapeTimings::immediate())
}

#[tokio::test(start_paused = true)]
async fn seven_tags_with_two_withheld_still_completes() {
    let dir = tempdir().unwrap();
    let encoder = TagUrlEncoder::default();
    let tags = ["#TU89", "#มธ", "#TCAS", "#LawTU", "#EconTU", "#medtu", "#SIIT"];
    let pages = tags
        .iter()
        .enumerate()
        .map(|(i, tag)| {
            let locator = encoder.encode_tag(tag);
            if i == 2 || i == 5 {
                FixturePage::withheld(locator)
            } else {
                FixturePage::new(locator, vec![FixturePass::new(articles(i * 10..i * 10 + 4))])
            }
        })
        .collect::<Vec<_>>();
    let launcher = FixtureLauncher::new(pages);
    let lake = Arc::new(LocalLakeStore::new(dir.path().join("lake")));
    let pipeline = IngestPipeline::new(config_for(dir.path()), lake.clone(), lake, Arc::new(launcher.clone()));

    let summary = pipeline
        .run_with_tags(&registry(&tags), LoadMode::Incremental)
        .await
        .unwrap();

    assert_eq!(summary.tags_total, 7);
    assert_eq!(summary.tags_empty, 2);
    assert_eq!(summary.raw_entries, 20);
    assert_eq!(summary.outcome.appended_rows(), 20);
    let order = summary.tags.iter().map(|t| t.tag.as_str()).collect::<Vec<_>>();
    assert_eq!(order, tags.to_vec());
    for (i, tag) in summary.tags.iter().enumerate() {
        if i == 2 || i == 5 {
            assert_eq!(tag.entries, 0);
            assert_eq!(tag.phase, SessionPhase::Failed);
            assert!(tag.failure.is_some());
        } else {
            assert_eq!(tag.entries, 4);
            assert_eq!(tag.phase, SessionPhase::Exhausted);
        }
    }
    assert!(launcher.peak_open_contexts() <= 3);
    assert_eq!(launcher.opened_total(), 7);
    assert_eq!(launcher.open_contexts(), 0);
}

#[tokio::test]
async fn first_load_then_fifty_new_rows() {
    let dir = tempdir().unwrap();
    let lake = Arc::new(LocalLakeStore::new(dir.path().join("lake")));
    let locator = TagUrlEncoder::default().encode_tag("#TU89");
    let tags = registry(&["#TU89"]);

    let first = pipeline(
        config_for(dir.path()),
        lake.clone(),
        vec![FixturePage::new(locator.clone(), vec![FixturePass::new(articles(0..1200))])],
    );
    let summary = first.run_with_tags(&tags, LoadMode::Initial).await.unwrap();
    assert_eq!(summary.raw_entries, 1200);
    assert_eq!(summary.normalized, 1200);
    assert_eq!(summary.outcome.appended_rows(), 1200);

    let second = pipeline(
        config_for(dir.path()),
        lake.clone(),
        vec![FixturePage::new(locator, vec![FixturePass::new(articles(0..1250))])],
    );
    let summary = second.run_with_tags(&tags, LoadMode::Incremental).await.unwrap();
    assert!(matches!(summary.outcome, LoadOutcome::Appended { rows: 50, .. }));

    let table = config_for(dir.path()).table_path();
    assert_eq!(lake.read_all(&table).await.unwrap().len(), 1250);

    // Same batch again: fingerprint matches, so the table is not touched.
    let summary = second.run_with_tags(&tags, LoadMode::Incremental).await.unwrap();
    assert_eq!(summary.outcome, LoadOutcome::Unchanged);
    assert_eq!(lake.read_all(&table).await.unwrap().len(), 1250);
    assert_eq!(lake.commits("tweets-repo").await.unwrap().len(), 2);
}

fn record(i: usize) -> NormalizedRecord {
    let ts = base_time() + TimeDelta::minutes(i as i64);
    let key = PartitionKey::from_timestamp(&ts);
    NormalizedRecord {
        category: "ธรรมศาสตร์".into(),
        tag: "#TU89".into(),
        username: format!("@student{i}"),
        tweet_text: format!("post {i}"),
        post_time_raw: ts,
        scrape_time: ts,
        year: key.year,
        month: key.month,
        day: key.day,
    }
}

#[tokio::test]
async fn merging_the_same_batch_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let lake = Arc::new(LocalLakeStore::new(dir.path().join("lake")));
    let batch = (0..20).map(record).collect::<Vec<_>>();

    let first = pipeline(config_for(dir.path()), lake.clone(), vec![]);
    let outcome = first.load(uuid::Uuid::new_v4(), &batch, LoadMode::Incremental).await.unwrap();
    assert_eq!(outcome.appended_rows(), 20);

    // A separate fingerprint store forces the merge path to run again.
    let other_sidecar = Arc::new(LocalLakeStore::new(dir.path().join("other")));
    let second = IngestPipeline::new(
        config_for(dir.path()),
        lake.clone(),
        other_sidecar,
        Arc::new(FixtureLauncher::new(vec![])),
    );
    let outcome = second.load(uuid::Uuid::new_v4(), &batch, LoadMode::Incremental).await.unwrap();
    assert_eq!(outcome, LoadOutcome::NoNewRecords);

    let table = config_for(dir.path()).table_path();
    let mut stored = lake.read_all(&table).await.unwrap();
    stored.sort_by_key(|r| r.post_time_raw);
    assert_eq!(stored, batch);
}

#[tokio::test]
async fn invalid_batches_are_rejected_before_any_write() {
    let dir = tempdir().unwrap();
    let lake = Arc::new(LocalLakeStore::new(dir.path().join("lake")));
    let reports_dir = dir.path().join("reports");
    let pipeline = pipeline(config_for(dir.path()), lake.clone(), vec![])
        .with_reports(Arc::new(FileReportSink::new(&reports_dir)));

    let mut batch = (0..5).map(record).collect::<Vec<_>>();
    batch[3].month = 13;
    let run_id = uuid::Uuid::new_v4();
    let outcome = pipeline.load(run_id, &batch, LoadMode::Incremental).await.unwrap();
    match outcome {
        LoadOutcome::Rejected {
            failed_checks,
            row_violations,
        } => {
            assert!(failed_checks.is_empty());
            assert_eq!(row_violations, 1);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    let report = std::fs::read_to_string(reports_dir.join(run_id.to_string()).join("validation.md")).unwrap();
    assert!(report.contains("row 3: `month`"));

    // Too small for a first load.
    let small = (0..5).map(record).collect::<Vec<_>>();
    let outcome = pipeline.load(uuid::Uuid::new_v4(), &small, LoadMode::Initial).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Rejected { ref failed_checks, .. }
        if failed_checks == &vec!["record_count".to_string(), "time_span".to_string()]));

    assert!(!lake.repository_exists("tweets-repo").await.unwrap());
}

#[tokio::test]
async fn run_summary_lands_in_reports_dir() {
    let dir = tempdir().unwrap();
    let lake = Arc::new(LocalLakeStore::new(dir.path().join("lake")));
    let reports_dir = dir.path().join("reports");
    let locator = TagUrlEncoder::default().encode_tag("#TU89");
    let pipeline = pipeline(
        config_for(dir.path()),
        lake,
        vec![FixturePage::new(locator, vec![FixturePass::new(articles(0..3))])],
    )
    .with_reports(Arc::new(FileReportSink::new(&reports_dir)));

    let summary = pipeline
        .run_with_tags(&registry(&["#TU89"]), LoadMode::Incremental)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(
        &std::fs::read(reports_dir.join(summary.run_id.to_string()).join("run_summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(json["outcome"]["status"], "appended");
    assert_eq!(json["outcome"]["rows"], 3);
    assert_eq!(json["tags"][0]["phase"], "exhausted");
}

/// Fails the first partitioned write, then behaves like the wrapped lake.
struct FailFirstWrite {
    inner: Arc<LocalLakeStore>,
    failed: AtomicBool,
}

#[async_trait]
impl StorageGateway for FailFirstWrite {
    async fn repository_exists(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.repository_exists(name).await
    }

    async fn create_repository(&self, name: &str, namespace: &str) -> Result<RepositoryInfo, StorageError> {
        self.inner.create_repository(name, namespace).await
    }

    async fn write_partitioned(
        &self,
        table: &TablePath,
        records: &[NormalizedRecord],
        partition_columns: &[PartitionColumn],
    ) -> Result<CommitRecord, StorageError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Io {
                path: "lake".into(),
                source: std::io::Error::other("transient"),
            });
        }
        self.inner.write_partitioned(table, records, partition_columns).await
    }

    async fn read_all(&self, table: &TablePath) -> Result<Vec<NormalizedRecord>, StorageError> {
        self.inner.read_all(table).await
    }
}

#[tokio::test]
async fn retry_after_failed_write_still_stores_the_batch() {
    let dir = tempdir().unwrap();
    let lake = Arc::new(LocalLakeStore::new(dir.path().join("lake")));
    let gateway = Arc::new(FailFirstWrite {
        inner: lake.clone(),
        failed: AtomicBool::new(false),
    });
    let pipeline = IngestPipeline::new(
        config_for(dir.path()),
        gateway,
        lake.clone(),
        Arc::new(FixtureLauncher::new(vec![])),
    );
    let batch = (0..5).map(record).collect::<Vec<_>>();

    let err = pipeline
        .load(uuid::Uuid::new_v4(), &batch, LoadMode::Incremental)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Storage(_)));
    let key = config_for(dir.path()).fingerprint_key();
    assert_eq!(lake.read_text(&key).await.unwrap(), None);

    let outcome = pipeline
        .load(uuid::Uuid::new_v4(), &batch, LoadMode::Incremental)
        .await
        .unwrap();
    assert_eq!(outcome.appended_rows(), 5);
    let table = config_for(dir.path()).table_path();
    assert_eq!(lake.read_all(&table).await.unwrap().len(), 5);

    let outcome = pipeline
        .load(uuid::Uuid::new_v4(), &batch, LoadMode::Incremental)
        .await
        .unwrap();
    assert_eq!(outcome, LoadOutcome::Unchanged);
}

#[tokio::test]
async fn post_served_under_two_tags_is_stored_once() {
    let dir = tempdir().unwrap();
    let lake = Arc::new(LocalLakeStore::new(dir.path().join("lake")));
    let encoder = TagUrlEncoder::default();
    let shared = articles(0..1);
    let mut tcas = shared.clone();
    tcas.extend(articles(1..2));
    let pages = vec![
        FixturePage::new(encoder.encode_tag("#TCAS"), vec![FixturePass::new(tcas)]),
        FixturePage::new(encoder.encode_tag("#dek70"), vec![FixturePass::new(shared)]),
    ];
    let pipeline = pipeline(config_for(dir.path()), lake.clone(), pages).with_validation(ValidationConfig {
        min_records: 2,
        min_span: TimeDelta::seconds(60),
        ..ValidationConfig::default()
    });

    let summary = pipeline
        .run_with_tags(&registry(&["#TCAS", "#dek70"]), LoadMode::Initial)
        .await
        .unwrap();
    assert_eq!(summary.raw_entries, 3);
    assert_eq!(summary.normalized, 3);
    assert_eq!(summary.collapsed_duplicates, 1);
    assert_eq!(summary.outcome.appended_rows(), 2);

    let stored = lake.read_all(&config_for(dir.path()).table_path()).await.unwrap();
    assert_eq!(stored.len(), 2);
    let shared_row = stored.iter().find(|r| r.username == "@student0").unwrap();
    assert_eq!(shared_row.tag, "#TCAS");
}
