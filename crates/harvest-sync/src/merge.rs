use std::collections::HashSet;
use std::sync::Arc;

use harvest_core::{KeyVariant, NormalizedRecord};
use harvest_storage::{CommitRecord, StorageError, StorageGateway, TablePath, DATE_PARTITIONING};
use serde::Serialize;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub candidates: usize,
    pub existing: usize,
    pub appended: usize,
    pub commit: Option<CommitRecord>,
}

/// Rows of `candidates` whose natural key is absent from `stored`, in candidate order.
pub fn anti_join(
    candidates: &[NormalizedRecord],
    stored: &[NormalizedRecord],
    variant: KeyVariant,
) -> Vec<NormalizedRecord> {
    let known = stored
        .iter()
        .map(|r| r.natural_key(variant))
        .collect::<HashSet<_>>();
    candidates
        .iter()
        .filter(|r| !known.contains(&r.natural_key(variant)))
        .cloned()
        .collect()
}

/// Appends only rows not already stored, partitioned by date.
#[derive(Clone)]
pub struct IncrementalMerger {
    storage: Arc<dyn StorageGateway>,
    table: TablePath,
    key_variant: KeyVariant,
}

impl IncrementalMerger {
    pub fn new(storage: Arc<dyn StorageGateway>, table: TablePath, key_variant: KeyVariant) -> Self {
        Self {
            storage,
            table,
            key_variant,
        }
    }

    pub fn table(&self) -> &TablePath {
        &self.table
    }

    /// Storage failures are returned as-is; nothing is retried here.
    pub async fn merge(&self, candidates: &[NormalizedRecord]) -> Result<MergeOutcome, StorageError> {
        let span = info_span!("incremental_merge", table = %self.table, variant = ?self.key_variant);
        async move {
            let stored = self.storage.read_all(&self.table).await?;
            let fresh = anti_join(candidates, &stored, self.key_variant);
            if fresh.is_empty() {
                info!(candidates = candidates.len(), existing = stored.len(), "no new records");
                return Ok(MergeOutcome {
                    candidates: candidates.len(),
                    existing: stored.len(),
                    appended: 0,
                    commit: None,
                });
            }

            let commit = self
                .storage
                .write_partitioned(&self.table, &fresh, &DATE_PARTITIONING)
                .await?;
            info!(
                candidates = candidates.len(),
                existing = stored.len(),
                appended = fresh.len(),
                commit = %commit.commit_id,
                "appended new records"
            );
            Ok(MergeOutcome {
                candidates: candidates.len(),
                existing: stored.len(),
                appended: fresh.len(),
                commit: Some(commit),
            })
        }
        .instrument(span)
        .await
    }
}
