//! Two-tier gate run before any write: per-row field constraints, then
//! named dataset-level checks whose set depends on the [`LoadMode`].

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use harvest_core::{canonical_timestamp, columns, KeyVariant, LoadMode, NormalizedRecord, PartitionKey};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    pub min_records: usize,
    pub min_span: TimeDelta,
    pub earliest_post: DateTime<Utc>,
    pub key_variant: KeyVariant,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_records: 1000,
            min_span: TimeDelta::hours(24),
            earliest_post: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            key_variant: KeyVariant::Full,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowViolation {
    pub row: usize,
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetCheck {
    pub name: &'static str,
    pub detail: String,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub mode: LoadMode,
    pub rows: usize,
    pub row_violations: Vec<RowViolation>,
    pub dataset_checks: Vec<DatasetCheck>,
}

impl ValidationReport {
    pub fn rows_valid(&self) -> bool {
        self.row_violations.is_empty()
    }

    pub fn dataset_valid(&self) -> bool {
        self.dataset_checks.iter().all(|c| c.passed)
    }

    pub fn passed(&self) -> bool {
        self.rows_valid() && self.dataset_valid()
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &DatasetCheck> {
        self.dataset_checks.iter().filter(|c| !c.passed)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "# Validation ({})\n\n- Rows: {}\n- Row violations: {}\n- Result: {}\n\n## Dataset checks\n",
            self.mode,
            self.rows,
            self.row_violations.len(),
            if self.passed() { "PASS" } else { "FAIL" }
        );
        for check in &self.dataset_checks {
            let mark = if check.passed { "x" } else { " " };
            out.push_str(&format!("- [{mark}] {} ({})\n", check.name, check.detail));
        }
        if !self.row_violations.is_empty() {
            out.push_str("\n## Row violations\n");
            for v in &self.row_violations {
                out.push_str(&format!("- row {}: `{}` {}\n", v.row, v.field, v.message));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    config: ValidationConfig,
}

impl SchemaValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Every row is checked, then every dataset check runs; nothing short-circuits.
    pub fn check(&self, records: &[NormalizedRecord], mode: LoadMode, now: DateTime<Utc>) -> ValidationReport {
        let row_violations = records
            .iter()
            .enumerate()
            .flat_map(|(row, record)| self.row_violations(row, record, now))
            .collect::<Vec<_>>();
        for v in &row_violations {
            warn!(row = v.row, field = v.field, message = %v.message, "row failed validation");
        }

        let mut dataset_checks = Vec::new();
        if mode == LoadMode::Initial {
            dataset_checks.push(self.record_count(records));
            dataset_checks.push(self.time_span(records));
        }
        dataset_checks.push(missing_values(records));
        dataset_checks.push(self.duplicate_keys(records));

        ValidationReport {
            mode,
            rows: records.len(),
            row_violations,
            dataset_checks,
        }
    }

    /// Single yes/no gate; the full report is logged first.
    pub fn validate(&self, records: &[NormalizedRecord], mode: LoadMode) -> bool {
        let report = self.check(records, mode, Utc::now());
        log_report(&report);
        report.passed()
    }

    fn row_violations(&self, row: usize, record: &NormalizedRecord, now: DateTime<Utc>) -> Vec<RowViolation> {
        let mut out = Vec::new();
        let mut push = |field: &'static str, message: String| out.push(RowViolation { row, field, message });

        for (field, value) in [
            (columns::CATEGORY, &record.category),
            (columns::TAG, &record.tag),
            (columns::USERNAME, &record.username),
            (columns::TWEET_TEXT, &record.tweet_text),
        ] {
            if value.trim().is_empty() {
                push(field, "must not be empty".to_string());
            }
        }
        if record.post_time_raw < self.config.earliest_post || record.post_time_raw > now {
            push(
                columns::POST_TIME_RAW,
                format!("{} is outside [{}, now]", canonical_timestamp(&record.post_time_raw), self.config.earliest_post.date_naive()),
            );
        }
        if !(1..=12).contains(&record.month) {
            push(columns::MONTH, format!("{} is not in 1..=12", record.month));
        }
        if !(1..=31).contains(&record.day) {
            push(columns::DAY, format!("{} is not in 1..=31", record.day));
        }
        let derived = PartitionKey::from_timestamp(&record.post_time_raw);
        if derived != record.partition_key() && (1..=12).contains(&record.month) && (1..=31).contains(&record.day) {
            push(
                columns::YEAR,
                format!("partition {} does not match post time ({})", record.partition_key().hive_path(), derived.hive_path()),
            );
        }
        out
    }

    fn record_count(&self, records: &[NormalizedRecord]) -> DatasetCheck {
        DatasetCheck {
            name: "record_count",
            detail: format!("{} records, need >= {}", records.len(), self.config.min_records),
            passed: records.len() >= self.config.min_records,
        }
    }

    fn time_span(&self, records: &[NormalizedRecord]) -> DatasetCheck {
        let min = records.iter().map(|r| r.post_time_raw).min();
        let max = records.iter().map(|r| r.post_time_raw).max();
        match (min, max) {
            (Some(min), Some(max)) => {
                let span = max - min;
                DatasetCheck {
                    name: "time_span",
                    detail: format!(
                        "{} .. {} ({}h, need >= {}h)",
                        canonical_timestamp(&min),
                        canonical_timestamp(&max),
                        span.num_hours(),
                        self.config.min_span.num_hours()
                    ),
                    passed: span >= self.config.min_span,
                }
            }
            _ => DatasetCheck {
                name: "time_span",
                detail: "no records".to_string(),
                passed: false,
            },
        }
    }

    fn duplicate_keys(&self, records: &[NormalizedRecord]) -> DatasetCheck {
        let mut seen = HashSet::with_capacity(records.len());
        let duplicates = records
            .iter()
            .filter(|r| !seen.insert(r.natural_key(self.config.key_variant)))
            .count();
        DatasetCheck {
            name: "no_duplicate_keys",
            detail: format!("{duplicates} duplicates"),
            passed: duplicates == 0,
        }
    }
}

fn missing_values(records: &[NormalizedRecord]) -> DatasetCheck {
    let missing = records
        .iter()
        .map(|r| {
            [&r.category, &r.tag, &r.username, &r.tweet_text]
                .iter()
                .filter(|v| v.trim().is_empty())
                .count()
        })
        .sum::<usize>();
    DatasetCheck {
        name: "no_missing_values",
        detail: format!("{missing} missing"),
        passed: missing == 0,
    }
}

pub(crate) fn log_report(report: &ValidationReport) {
    for check in &report.dataset_checks {
        if check.passed {
            info!(check = check.name, detail = %check.detail, "dataset check passed");
        } else {
            error!(check = check.name, detail = %check.detail, "dataset check failed");
        }
    }
    if report.passed() {
        info!(mode = %report.mode, rows = report.rows, "validation passed");
    } else {
        error!(
            mode = %report.mode,
            rows = report.rows,
            row_violations = report.row_violations.len(),
            failed_checks = report.failed_checks().count(),
            "validation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single().unwrap() + TimeDelta::hours(hours)
    }

    fn record(i: usize, ts: DateTime<Utc>) -> NormalizedRecord {
        let key = PartitionKey::from_timestamp(&ts);
        NormalizedRecord {
            category: "faculty".into(),
            tag: "#TU89".into(),
            username: format!("@user{i}"),
            tweet_text: format!("post {i}"),
            post_time_raw: ts,
            scrape_time: ts,
            year: key.year,
            month: key.month,
            day: key.day,
        }
    }

    fn now() -> DateTime<Utc> {
        at(24 * 60)
    }

    #[test]
    fn month_thirteen_is_reported_by_row() {
        let mut records = (0..3).map(|i| record(i, at(i as i64))).collect::<Vec<_>>();
        records[1].month = 13;
        let report = SchemaValidator::default().check(&records, LoadMode::Incremental, now());

        assert!(report.dataset_valid());
        assert!(!report.passed());
        assert_eq!(report.row_violations.len(), 1);
        assert_eq!(report.row_violations[0].row, 1);
        assert_eq!(report.row_violations[0].field, columns::MONTH);
    }

    #[test]
    fn initial_load_needs_volume_and_span() {
        let validator = SchemaValidator::default();
        let short = (0..1200).map(|i| record(i, at(0) + TimeDelta::seconds(i as i64))).collect::<Vec<_>>();
        let report = validator.check(&short, LoadMode::Initial, now());
        assert!(report.rows_valid());
        assert_eq!(report.failed_checks().map(|c| c.name).collect::<Vec<_>>(), vec!["time_span"]);

        let wide = (0..1200)
            .map(|i| record(i, at(0) + TimeDelta::minutes(i as i64 * 90 / 60)))
            .collect::<Vec<_>>();
        assert!(validator.check(&wide, LoadMode::Initial, now()).passed());

        let few = (0..10).map(|i| record(i, at(i as i64 * 5))).collect::<Vec<_>>();
        let report = validator.check(&few, LoadMode::Initial, now());
        assert_eq!(report.failed_checks().map(|c| c.name).collect::<Vec<_>>(), vec!["record_count"]);
        assert!(validator.check(&few, LoadMode::Incremental, now()).passed());
    }

    #[test]
    fn duplicate_natural_keys_fail_the_dataset() {
        let ts = at(1);
        let records = vec![record(1, ts), record(1, ts), record(2, ts)];
        let report = SchemaValidator::default().check(&records, LoadMode::Incremental, now());
        assert!(report.rows_valid());
        assert!(!report.dataset_valid());
        assert_eq!(report.failed_checks().next().unwrap().name, "no_duplicate_keys");
    }

    #[test]
    fn post_time_bounds_and_partition_consistency() {
        let mut records = vec![
            record(0, Utc.with_ymd_and_hms(2019, 12, 31, 23, 0, 0).single().unwrap()),
            record(1, now() + TimeDelta::hours(1)),
            record(2, at(5)),
        ];
        records[2].day = 2;
        let report = SchemaValidator::default().check(&records, LoadMode::Incremental, now());
        let flagged = report
            .row_violations
            .iter()
            .map(|v| (v.row, v.field))
            .collect::<Vec<_>>();
        assert_eq!(
            flagged,
            vec![(0, columns::POST_TIME_RAW), (1, columns::POST_TIME_RAW), (2, columns::YEAR)]
        );
        assert!(report.to_markdown().contains("row 2: `year`"));
    }
}
