//! Bounded history of finished analyses.
//!
//! Records live in a fixed-capacity ring; appending past capacity evicts the
//! oldest. Reads clone the `Arc`s they need under the read lock and return
//! an owned snapshot, so eviction can never be observed mid-read.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::PersistError;
use crate::types::{duration_ms, HistoryRecord, Outcome};

/// Aggregates over a window of recent records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub count: usize,
    pub success_rate: f64,
    #[serde(with = "duration_ms")]
    pub mean_latency: Duration,
    pub mean_confidence: f64,
    pub completed: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub degraded: usize,
}

struct Ring {
    records: VecDeque<Arc<HistoryRecord>>,
    capacity: usize,
    next_sequence: u64,
}

/// Append-only ring of [`HistoryRecord`]s.
pub struct HistoryLedger {
    ring: RwLock<Ring>,
}

impl HistoryLedger {
    /// `capacity` is clamped to at least one record.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: RwLock::new(Ring {
                records: VecDeque::with_capacity(capacity),
                capacity,
                next_sequence: 1,
            }),
        }
    }

    /// Append a record, assigning its sequence number. Returns the sequence.
    pub async fn append(&self, mut record: HistoryRecord) -> u64 {
        let mut ring = self.ring.write().await;
        let sequence = ring.next_sequence;
        ring.next_sequence += 1;
        record.sequence = sequence;

        if ring.records.len() == ring.capacity {
            if let Some(evicted) = ring.records.pop_front() {
                debug!("Ledger full, evicted record {}", evicted.sequence);
            }
        }
        ring.records.push_back(Arc::new(record));
        sequence
    }

    /// Up to `limit` records, most recent first.
    pub async fn snapshot(&self, limit: usize) -> Vec<Arc<HistoryRecord>> {
        let ring = self.ring.read().await;
        ring.records.iter().rev().take(limit).cloned().collect()
    }

    /// Every retained record with a sequence above `sequence`, most recent first.
    pub async fn since(&self, sequence: u64) -> Vec<Arc<HistoryRecord>> {
        let ring = self.ring.read().await;
        ring.records
            .iter()
            .rev()
            .take_while(|r| r.sequence > sequence)
            .cloned()
            .collect()
    }

    /// Whether a record for `request_id` is currently retained.
    pub async fn contains(&self, request_id: uuid::Uuid) -> bool {
        let ring = self.ring.read().await;
        ring.records.iter().any(|r| r.request.id == request_id)
    }

    /// Stats over the `window` most recent records (all when `None`).
    pub async fn stats(&self, window: Option<usize>) -> LedgerStats {
        let records = self.snapshot(window.unwrap_or(usize::MAX)).await;
        compute_stats(&records)
    }

    pub async fn len(&self) -> usize {
        self.ring.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn capacity(&self) -> usize {
        self.ring.read().await.capacity
    }

    /// Records ever appended, including evicted ones.
    pub async fn total_appended(&self) -> u64 {
        self.ring.read().await.next_sequence - 1
    }

    /// Write a snapshot (oldest first) as pretty JSON.
    pub async fn export_json(&self, path: impl AsRef<Path>) -> Result<usize, PersistError> {
        let path = path.as_ref();
        let mut records = self.snapshot(usize::MAX).await;
        records.reverse();
        let owned: Vec<&HistoryRecord> = records.iter().map(|r| r.as_ref()).collect();
        let bytes = serde_json::to_vec_pretty(&owned)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        debug!("Exported {} history records to {:?}", owned.len(), path);
        Ok(owned.len())
    }
}

fn compute_stats(records: &[Arc<HistoryRecord>]) -> LedgerStats {
    let count = records.len();
    if count == 0 {
        return LedgerStats::default();
    }

    let mut stats = LedgerStats {
        count,
        ..Default::default()
    };
    let mut successes = 0usize;
    let mut latency = Duration::ZERO;
    let mut confidence = 0.0f64;

    for record in records {
        if record.result.success {
            successes += 1;
        }
        if record.result.diagnostics.degraded {
            stats.degraded += 1;
        }
        latency += record.latency;
        confidence += record.result.confidence as f64;
        match record.outcome {
            Outcome::Completed => stats.completed += 1,
            Outcome::TimedOut => stats.timed_out += 1,
            Outcome::Failed => stats.failed += 1,
            Outcome::Cancelled => stats.cancelled += 1,
        }
    }

    stats.success_rate = successes as f64 / count as f64;
    stats.mean_latency = latency / count as u32;
    stats.mean_confidence = confidence / count as f64;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Screenshot;
    use crate::types::{AnalysisRequest, AnalysisResult, Diagnostics, Tier};
    use image::{DynamicImage, RgbImage};

    fn record(success: bool, latency_ms: u64, confidence: f32) -> HistoryRecord {
        let request = AnalysisRequest::new(Screenshot::new(
            DynamicImage::ImageRgb8(RgbImage::new(2, 2)),
            "test",
        ));
        let latency = Duration::from_millis(latency_ms);
        let result = if success {
            AnalysisResult::new(
                request.id,
                Tier::Matcher,
                confidence,
                Vec::new(),
                Vec::new(),
                Diagnostics::default(),
                latency,
            )
        } else {
            AnalysisResult::failed(request.id, Diagnostics::default(), latency)
        };
        HistoryRecord::new(&request, result)
    }

    #[tokio::test]
    async fn test_fifo_eviction() {
        let ledger = HistoryLedger::new(3);
        for _ in 0..5 {
            ledger.append(record(true, 10, 0.5)).await;
        }

        assert_eq!(ledger.len().await, 3);
        assert_eq!(ledger.total_appended().await, 5);
        let seqs: Vec<u64> = ledger.snapshot(10).await.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_snapshot_is_unaffected_by_later_appends() {
        let ledger = HistoryLedger::new(2);
        ledger.append(record(true, 10, 0.5)).await;
        ledger.append(record(true, 10, 0.5)).await;

        let before = ledger.snapshot(2).await;
        ledger.append(record(false, 10, 0.0)).await;
        ledger.append(record(false, 10, 0.0)).await;

        assert_eq!(before.len(), 2);
        assert!(before.iter().all(|r| r.result.success));
        assert_eq!(before[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_since() {
        let ledger = HistoryLedger::new(10);
        for _ in 0..4 {
            ledger.append(record(true, 1, 0.5)).await;
        }
        let seqs: Vec<u64> = ledger.since(2).await.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![4, 3]);
        assert!(ledger.since(4).await.is_empty());
    }

    #[tokio::test]
    async fn test_stats_window() {
        let ledger = HistoryLedger::new(10);
        ledger.append(record(false, 100, 0.0)).await;
        ledger.append(record(true, 20, 0.6)).await;
        ledger.append(record(true, 40, 0.8)).await;

        let all = ledger.stats(None).await;
        assert_eq!(all.count, 3);
        assert!((all.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(all.mean_latency, Duration::from_millis(160) / 3);
        assert_eq!(all.failed, 1);
        assert_eq!(all.completed, 2);

        let recent = ledger.stats(Some(2)).await;
        assert_eq!(recent.count, 2);
        assert_eq!(recent.success_rate, 1.0);
        assert_eq!(recent.mean_latency, Duration::from_millis(30));
        assert!((recent.mean_confidence - 0.7).abs() < 1e-6);

        assert_eq!(HistoryLedger::new(4).stats(None).await, LedgerStats::default());
    }

    #[tokio::test]
    async fn test_export_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history").join("ledger.json");
        let ledger = HistoryLedger::new(5);
        ledger.append(record(true, 5, 0.9)).await;
        ledger.append(record(false, 7, 0.0)).await;

        let written = ledger.export_json(&path).await.unwrap();
        assert_eq!(written, 2);

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<HistoryRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed[0].sequence, 1);
        assert_eq!(parsed[1].outcome, Outcome::Failed);
    }
}
