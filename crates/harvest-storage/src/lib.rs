//! Versioned, partitioned record storage for harvested posts.
//!
//! The pipeline only talks to [`StorageGateway`] and [`SidecarStore`]; the
//! bundled [`LocalLakeStore`] keeps repositories on the local filesystem as
//! hive-partitioned parquet with an append-only commit log.

mod codec;
mod lake;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{columns, NormalizedRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub use codec::{decode_parquet, encode_parquet, record_schema};
pub use lake::LocalLakeStore;

pub const CRATE_NAME: &str = "harvest-storage";

pub const DATE_PARTITIONING: [PartitionColumn; 3] =
    [PartitionColumn::Year, PartitionColumn::Month, PartitionColumn::Day];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored table does not match record schema: {0}")]
    Schema(String),
    #[error("repository {0} does not exist")]
    RepositoryMissing(String),
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StorageError {
        let path = path.into();
        move |source| StorageError::Io { path, source }
    }
}

/// Location of one logical table: `repository/branch/path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TablePath {
    pub repository: String,
    pub branch: String,
    pub path: String,
}

impl TablePath {
    pub fn new(
        repository: impl Into<String>,
        branch: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lake://{}/{}/{}", self.repository, self.branch, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionColumn {
    Year,
    Month,
    Day,
}

impl PartitionColumn {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionColumn::Year => columns::YEAR,
            PartitionColumn::Month => columns::MONTH,
            PartitionColumn::Day => columns::DAY,
        }
    }

    pub fn value_for(&self, record: &NormalizedRecord) -> String {
        match self {
            PartitionColumn::Year => record.year.to_string(),
            PartitionColumn::Month => record.month.to_string(),
            PartitionColumn::Day => record.day.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub storage_namespace: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFile {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// One entry of a repository's append-only commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub commit_id: Uuid,
    pub table: String,
    pub committed_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<CommitFile>,
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn repository_exists(&self, name: &str) -> Result<bool, StorageError>;

    /// Create-if-absent. Returns the existing repository info when already present.
    async fn create_repository(
        &self,
        name: &str,
        storage_namespace: &str,
    ) -> Result<RepositoryInfo, StorageError>;

    /// Append `records` to `table`, one part file per distinct partition value.
    async fn write_partitioned(
        &self,
        table: &TablePath,
        records: &[NormalizedRecord],
        partition_columns: &[PartitionColumn],
    ) -> Result<CommitRecord, StorageError>;

    /// Every row currently stored under `table`. A table that was never written is empty.
    async fn read_all(&self, table: &TablePath) -> Result<Vec<NormalizedRecord>, StorageError>;
}

/// Small keyed text objects kept next to the tables (e.g. batch fingerprints).
#[async_trait]
pub trait SidecarStore: Send + Sync {
    async fn read_text(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn write_text(&self, key: &str, text: &str) -> Result<(), StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
