use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use harvest_core::NormalizedRecord;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::codec::{decode_parquet, encode_parquet};
use crate::{
    sha256_hex, CommitFile, CommitRecord, PartitionColumn, RepositoryInfo, SidecarStore,
    StorageError, StorageGateway, TablePath,
};

const REPOSITORY_META: &str = "_repository.json";
const COMMIT_LOG: &str = "_commits.jsonl";
const SIDECAR_DIR: &str = "_sidecar";

/// Filesystem-backed lake: `<root>/<repository>/<branch>/<table>/<col=value>/.../part-<commit>.parquet`.
#[derive(Debug, Clone)]
pub struct LocalLakeStore {
    root: PathBuf,
}

impl LocalLakeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repository_dir(&self, name: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(checked_relative(name)?))
    }

    fn table_dir(&self, table: &TablePath) -> Result<PathBuf, StorageError> {
        Ok(self
            .repository_dir(&table.repository)?
            .join(checked_relative(&table.branch)?)
            .join(checked_relative(&table.path)?))
    }

    async fn require_repository(&self, name: &str) -> Result<PathBuf, StorageError> {
        if !self.repository_exists(name).await? {
            return Err(StorageError::RepositoryMissing(name.to_string()));
        }
        self.repository_dir(name)
    }

    /// All commits recorded for `repository`, oldest first.
    pub async fn commits(&self, repository: &str) -> Result<Vec<CommitRecord>, StorageError> {
        let log_path = self.repository_dir(repository)?.join(COMMIT_LOG);
        let text = match fs::read_to_string(&log_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&log_path)(err)),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StorageError::from))
            .collect()
    }

    async fn append_commit(&self, repository_dir: &Path, commit: &CommitRecord) -> Result<(), StorageError> {
        let log_path = repository_dir.join(COMMIT_LOG);
        let mut line = serde_json::to_vec(commit)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(StorageError::io(&log_path))?;
        file.write_all(&line).await.map_err(StorageError::io(&log_path))?;
        file.flush().await.map_err(StorageError::io(&log_path))?;
        Ok(())
    }
}

/// Reject absolute paths and `..` so keys and table names stay under the root.
fn checked_relative(key: &str) -> Result<PathBuf, StorageError> {
    let path = Path::new(key);
    let ok = !key.trim().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(path.to_path_buf())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Write bytes via a sibling temp file and rename, so readers never see a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    fs::create_dir_all(parent)
        .await
        .map_err(StorageError::io(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(StorageError::io(&temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(StorageError::io(&temp_path))?;
    file.flush().await.map_err(StorageError::io(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(path)(err));
    }
    Ok(())
}

/// Best-effort removal of part files left by a write that did not commit.
async fn discard_parts(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = fs::remove_file(path).await {
            warn!(path = %path.display(), error = %err, "could not remove uncommitted part file");
        }
    }
}

#[async_trait]
impl StorageGateway for LocalLakeStore {
    async fn repository_exists(&self, name: &str) -> Result<bool, StorageError> {
        let meta = self.repository_dir(name)?.join(REPOSITORY_META);
        fs::try_exists(&meta).await.map_err(StorageError::io(&meta))
    }

    async fn create_repository(
        &self,
        name: &str,
        storage_namespace: &str,
    ) -> Result<RepositoryInfo, StorageError> {
        let meta_path = self.repository_dir(name)?.join(REPOSITORY_META);
        if fs::try_exists(&meta_path)
            .await
            .map_err(StorageError::io(&meta_path))?
        {
            let text = fs::read_to_string(&meta_path)
                .await
                .map_err(StorageError::io(&meta_path))?;
            debug!(repository = name, "repository already exists");
            return Ok(serde_json::from_str(&text)?);
        }

        let info = RepositoryInfo {
            name: name.to_string(),
            storage_namespace: storage_namespace.to_string(),
            created_at: Utc::now(),
        };
        write_atomic(&meta_path, &serde_json::to_vec_pretty(&info)?).await?;
        info!(repository = name, storage_namespace, "created repository");
        Ok(info)
    }

    async fn write_partitioned(
        &self,
        table: &TablePath,
        records: &[NormalizedRecord],
        partition_columns: &[PartitionColumn],
    ) -> Result<CommitRecord, StorageError> {
        let repository_dir = self.require_repository(&table.repository).await?;
        let table_dir = self.table_dir(table)?;
        let commit_id = Uuid::new_v4();
        let span = info_span!("write_partitioned", table = %table, %commit_id);

        async move {
            let mut groups: BTreeMap<Vec<String>, Vec<&NormalizedRecord>> = BTreeMap::new();
            for record in records {
                let segments = partition_columns
                    .iter()
                    .map(|col| format!("{}={}", col.name(), col.value_for(record)))
                    .collect::<Vec<_>>();
                groups.entry(segments).or_default().push(record);
            }

            let mut files = Vec::with_capacity(groups.len());
            let mut written = Vec::with_capacity(groups.len());
            for (segments, rows) in &groups {
                let mut dir = table_dir.clone();
                for segment in segments {
                    dir.push(segment);
                }
                let file_path = dir.join(format!("part-{commit_id}.parquet"));
                let bytes = match encode_parquet(rows) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        discard_parts(&written).await;
                        return Err(err);
                    }
                };
                if let Err(err) = write_atomic(&file_path, &bytes).await {
                    discard_parts(&written).await;
                    return Err(err);
                }
                let relative = file_path
                    .strip_prefix(&self.root)
                    .unwrap_or(&file_path)
                    .display()
                    .to_string();
                debug!(path = %relative, rows = rows.len(), "wrote partition file");
                written.push(file_path);
                files.push(CommitFile {
                    path: relative,
                    sha256: sha256_hex(&bytes),
                    bytes: bytes.len() as u64,
                    rows: rows.len(),
                });
            }

            let commit = CommitRecord {
                commit_id,
                table: table.to_string(),
                committed_at: Utc::now(),
                rows: records.len(),
                files,
            };
            if !records.is_empty() {
                if let Err(err) = self.append_commit(&repository_dir, &commit).await {
                    discard_parts(&written).await;
                    return Err(err);
                }
            }
            info!(rows = commit.rows, files = commit.files.len(), "committed partitioned write");
            Ok(commit)
        }
        .instrument(span)
        .await
    }

    /// Reads the part files named by committed entries only; a part without a
    /// commit log line does not exist as far as readers are concerned.
    async fn read_all(&self, table: &TablePath) -> Result<Vec<NormalizedRecord>, StorageError> {
        self.require_repository(&table.repository).await?;
        let name = table.to_string();

        let mut records = Vec::new();
        for commit in self.commits(&table.repository).await? {
            if commit.table != name {
                continue;
            }
            for file in &commit.files {
                let path = self.root.join(&file.path);
                let bytes = fs::read(&path).await.map_err(StorageError::io(&path))?;
                records.extend(decode_parquet(bytes)?);
            }
        }
        debug!(table = %table, rows = records.len(), "read stored table");
        Ok(records)
    }
}

#[async_trait]
impl SidecarStore for LocalLakeStore {
    async fn read_text(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.root.join(SIDECAR_DIR).join(checked_relative(key)?);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(&path)(err)),
        }
    }

    async fn write_text(&self, key: &str, text: &str) -> Result<(), StorageError> {
        let path = self.root.join(SIDECAR_DIR).join(checked_relative(key)?);
        write_atomic(&path, text.as_bytes()).await
    }
}
