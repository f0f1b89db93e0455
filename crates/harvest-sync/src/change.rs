use std::sync::Arc;

use harvest_core::{canonical_timestamp, NormalizedRecord};
use harvest_storage::{sha256_hex, SidecarStore, StorageError};
use tracing::info;

/// Digest over `postTimeRaw + username + tweetText` of every row, in row order.
pub fn compute_fingerprint(batch: &[NormalizedRecord]) -> String {
    let mut joined = String::new();
    for record in batch {
        joined.push_str(&canonical_timestamp(&record.post_time_raw));
        joined.push_str(&record.username);
        joined.push_str(&record.tweet_text);
    }
    sha256_hex(joined.as_bytes())
}

/// Fingerprint of a batch that differs from the stored one. It is only
/// persisted through [`ChangeDetector::record`] once the batch is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFingerprint {
    pub key: String,
    pub fingerprint: String,
    pub previous: Option<String>,
}

/// Whole-batch change signal backed by a keyed sidecar text object.
#[derive(Clone)]
pub struct ChangeDetector {
    sidecar: Arc<dyn SidecarStore>,
}

impl ChangeDetector {
    pub fn new(sidecar: Arc<dyn SidecarStore>) -> Self {
        Self { sidecar }
    }

    pub async fn stored_fingerprint(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .sidecar
            .read_text(key)
            .await?
            .map(|text| text.trim().to_string()))
    }

    /// `None` when `batch` matches the fingerprint recorded under `key`.
    /// Never writes; the sidecar only moves on [`record`](Self::record).
    pub async fn has_changed(
        &self,
        batch: &[NormalizedRecord],
        key: &str,
    ) -> Result<Option<PendingFingerprint>, StorageError> {
        let fresh = compute_fingerprint(batch);
        let previous = self.stored_fingerprint(key).await?;
        if previous.as_deref() == Some(fresh.as_str()) {
            info!(key, fingerprint = %fresh, "batch unchanged since last load");
            return Ok(None);
        }
        Ok(Some(PendingFingerprint {
            key: key.to_string(),
            fingerprint: fresh,
            previous,
        }))
    }

    /// Call after the batch has been merged successfully.
    pub async fn record(&self, pending: &PendingFingerprint) -> Result<(), StorageError> {
        self.sidecar
            .write_text(&pending.key, &pending.fingerprint)
            .await?;
        info!(
            key = %pending.key,
            fingerprint = %pending.fingerprint,
            had_previous = pending.previous.is_some(),
            "recorded new batch fingerprint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use harvest_storage::LocalLakeStore;

    fn record(user: &str, text: &str) -> NormalizedRecord {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).single().unwrap();
        NormalizedRecord {
            category: "faculty".into(),
            tag: "#TU89".into(),
            username: user.into(),
            tweet_text: text.into(),
            post_time_raw: ts,
            scrape_time: ts,
            year: 2025,
            month: 3,
            day: 14,
        }
    }

    #[test]
    fn fingerprint_follows_row_order_and_key_columns() {
        let a = record("@a", "one");
        let b = record("@b", "two");
        let ab = compute_fingerprint(&[a.clone(), b.clone()]);
        assert_ne!(ab, compute_fingerprint(&[b.clone(), a.clone()]));

        let mut rescraped = a.clone();
        rescraped.scrape_time = Utc::now();
        rescraped.tag = "#other".into();
        assert_eq!(ab, compute_fingerprint(&[rescraped, b]));
        assert_eq!(compute_fingerprint(&[]), sha256_hex(b""));
    }

    #[tokio::test]
    async fn unchanged_batch_short_circuits_once_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let detector = ChangeDetector::new(Arc::new(LocalLakeStore::new(dir.path())));
        let batch = vec![record("@a", "one"), record("@b", "two")];
        let key = "tweets/fingerprint.txt";

        let pending = detector.has_changed(&batch, key).await.unwrap().unwrap();
        assert_eq!(pending.previous, None);
        // Nothing is stored until the caller records it.
        assert!(detector.has_changed(&batch, key).await.unwrap().is_some());
        assert_eq!(detector.stored_fingerprint(key).await.unwrap(), None);

        detector.record(&pending).await.unwrap();
        assert!(detector.has_changed(&batch, key).await.unwrap().is_none());
        assert_eq!(
            detector.stored_fingerprint(key).await.unwrap(),
            Some(compute_fingerprint(&batch))
        );

        let grown = vec![record("@a", "one"), record("@b", "two"), record("@c", "three")];
        let next = detector.has_changed(&grown, key).await.unwrap().unwrap();
        assert_eq!(next.previous, Some(compute_fingerprint(&batch)));
        assert!(detector.has_changed(&batch, "hash/fingerprint.txt").await.unwrap().is_some());
    }
}
