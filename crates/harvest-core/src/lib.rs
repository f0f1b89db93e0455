//! Core record model for the hashtag harvest pipeline.

use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "harvest-core";

/// Canonical rendering of post timestamps wherever they are concatenated or compared as text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Stored column names, shared by the parquet writer/reader and the validator report.
pub mod columns {
    pub const CATEGORY: &str = "category";
    pub const TAG: &str = "tag";
    pub const USERNAME: &str = "username";
    pub const TWEET_TEXT: &str = "tweetText";
    pub const POST_TIME_RAW: &str = "postTimeRaw";
    pub const SCRAPE_TIME: &str = "scrapeTime";
    pub const YEAR: &str = "year";
    pub const MONTH: &str = "month";
    pub const DAY: &str = "day";
}

pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// One post as lifted off a page, before any typing beyond strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    pub category: String,
    pub tag: String,
    pub username: String,
    pub text: String,
    pub post_time_raw: String,
    pub scrape_time: DateTime<Utc>,
}

impl RawEntry {
    /// Key used for dedup inside a single scrape session.
    pub fn session_key(&self) -> (String, String) {
        (self.username.clone(), self.text.clone())
    }
}

/// Typed, partition-ready record. Append-only once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub category: String,
    pub tag: String,
    pub username: String,
    #[serde(rename = "tweetText")]
    pub tweet_text: String,
    #[serde(rename = "postTimeRaw")]
    pub post_time_raw: DateTime<Utc>,
    #[serde(rename = "scrapeTime")]
    pub scrape_time: DateTime<Utc>,
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl NormalizedRecord {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            year: self.year,
            month: self.month,
            day: self.day,
        }
    }

    pub fn natural_key(&self, variant: KeyVariant) -> NaturalKey {
        NaturalKey {
            post_time_raw: self.post_time_raw,
            username: match variant {
                KeyVariant::Full => Some(self.username.clone()),
                KeyVariant::ContentOnly => None,
            },
            tweet_text: self.tweet_text.clone(),
        }
    }
}

/// Which columns participate in cross-load identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyVariant {
    /// `(postTimeRaw, username, tweetText)`
    #[default]
    Full,
    /// `(postTimeRaw, tweetText)`; content dedup without author identity.
    ContentOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub post_time_raw: DateTime<Utc>,
    pub username: Option<String>,
    pub tweet_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionKey {
    pub fn from_timestamp(ts: &DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
            day: ts.day(),
        }
    }

    /// Hive-style directory fragment, e.g. `year=2025/month=3/day=14`.
    pub fn hive_path(&self) -> String {
        format!(
            "{}={}/{}={}/{}={}",
            columns::YEAR,
            self.year,
            columns::MONTH,
            self.month,
            columns::DAY,
            self.day
        )
    }
}

/// First loads are held to volume/time-span checks that incremental loads skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Initial,
    Incremental,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Initial => f.write_str("initial"),
            LoadMode::Incremental => f.write_str("incremental"),
        }
    }
}
