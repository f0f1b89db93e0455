use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use harvest_core::{KeyVariant, NormalizedRecord, PartitionKey, RawEntry};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEntry {
    #[error("entry is missing {0}")]
    MissingField(&'static str),
    #[error("unparseable timestamp {0:?}")]
    BadTimestamp(String),
}

#[derive(Debug, Clone, Default)]
pub struct NormalizationOutcome {
    pub records: Vec<NormalizedRecord>,
    pub dropped: usize,
}

/// Accepts RFC 3339 and the zone-less `%Y-%m-%dT%H:%M:%S%.f` form, the latter read as UTC.
/// Truncated to microseconds, the precision the lake stores.
pub fn parse_post_time(raw: &str) -> Result<DateTime<Utc>, MalformedEntry> {
    let raw = raw.trim();
    let parsed = match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| MalformedEntry::BadTimestamp(raw.to_string()))?,
    };
    Ok(parsed.trunc_subsecs(6))
}

pub fn normalize_entry(entry: &RawEntry) -> Result<NormalizedRecord, MalformedEntry> {
    for (name, value) in [
        ("category", &entry.category),
        ("tag", &entry.tag),
        ("username", &entry.username),
        ("text", &entry.text),
        ("postTimeRaw", &entry.post_time_raw),
    ] {
        if value.trim().is_empty() {
            return Err(MalformedEntry::MissingField(name));
        }
    }
    let post_time = parse_post_time(&entry.post_time_raw)?;
    let partition = PartitionKey::from_timestamp(&post_time);
    Ok(NormalizedRecord {
        category: entry.category.clone(),
        tag: entry.tag.clone(),
        username: entry.username.clone(),
        tweet_text: entry.text.clone(),
        post_time_raw: post_time,
        scrape_time: entry.scrape_time.trunc_subsecs(6),
        year: partition.year,
        month: partition.month,
        day: partition.day,
    })
}

/// Row order is preserved; malformed entries are dropped and counted.
pub fn normalize(entries: &[RawEntry]) -> NormalizationOutcome {
    let mut outcome = NormalizationOutcome {
        records: Vec::with_capacity(entries.len()),
        dropped: 0,
    };
    for (row, entry) in entries.iter().enumerate() {
        match normalize_entry(entry) {
            Ok(record) => outcome.records.push(record),
            Err(err) => {
                debug!(row, tag = %entry.tag, error = %err, "dropping malformed entry");
                outcome.dropped += 1;
            }
        }
    }
    info!(
        normalized = outcome.records.len(),
        dropped = outcome.dropped,
        "normalized raw entries"
    );
    outcome
}

/// Keeps the first record per natural key. The same post served under
/// several tags in one run would otherwise repeat its key.
pub fn collapse_duplicates(records: Vec<NormalizedRecord>, variant: KeyVariant) -> (Vec<NormalizedRecord>, usize) {
    let before = records.len();
    let mut seen = HashSet::with_capacity(before);
    let kept = records
        .into_iter()
        .filter(|record| seen.insert(record.natural_key(variant)))
        .collect::<Vec<_>>();
    let collapsed = before - kept.len();
    if collapsed > 0 {
        debug!(collapsed, "collapsed posts seen under more than one tag");
    }
    (kept, collapsed)
}
