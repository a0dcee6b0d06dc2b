use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

/// On-disk / wire status of a segment. Numeric values match the
/// `config.json` schema in spec §6 (`0=Pending, 1=Downloading,
/// 2=Completed, 3=Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentStatus {
    Pending = 0,
    Downloading = 1,
    Completed = 2,
    Failed = 3,
}

/// The persisted (serializable) half of a segment's state — what gets
/// written into `config.json`'s `segments` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub start_byte: u64,
    pub end_byte: u64,
    pub status: SegmentStatus,
    pub downloaded_bytes: u64,
    pub last_update_time: u64,
}

struct Mutable {
    status: SegmentStatus,
    downloaded_bytes: u64,
    last_update_time: u64,
}

/// A fixed byte-range record with status, a completion/data-available
/// signal, and on-disk artifacts. Lives behind `Arc` so `GlobalQueue`
/// items and `DownloadTask`'s segment list can share it; the task is the
/// sole owner of its lifetime (spec §3 — QueueItem "weakly references its
/// segment").
///
/// Byte range is immutable once constructed, so those two fields sit
/// outside the lock; status/progress mutate together, so they share one
/// `RwLock` rather than three independently-lockable fields.
pub struct Segment {
    pub start_byte: u64,
    pub end_byte: u64,
    state: RwLock<Mutable>,
    data_available: Notify,
}

impl Segment {
    pub fn new(start_byte: u64, end_byte: u64) -> Self {
        Self {
            start_byte,
            end_byte,
            state: RwLock::new(Mutable {
                status: SegmentStatus::Pending,
                downloaded_bytes: 0,
                last_update_time: now_ms(),
            }),
            data_available: Notify::new(),
        }
    }

    pub fn from_record(record: SegmentRecord) -> Self {
        Self {
            start_byte: record.start_byte,
            end_byte: record.end_byte,
            state: RwLock::new(Mutable {
                status: record.status,
                downloaded_bytes: record.downloaded_bytes,
                last_update_time: record.last_update_time,
            }),
            data_available: Notify::new(),
        }
    }

    pub async fn to_record(&self) -> SegmentRecord {
        let s = self.state.read().await;
        SegmentRecord {
            start_byte: self.start_byte,
            end_byte: self.end_byte,
            status: s.status,
            downloaded_bytes: s.downloaded_bytes,
            last_update_time: s.last_update_time,
        }
    }

    pub fn expected_size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    pub async fn status(&self) -> SegmentStatus {
        self.state.read().await.status
    }

    pub async fn downloaded_bytes(&self) -> u64 {
        self.state.read().await.downloaded_bytes
    }

    pub async fn set_status(&self, status: SegmentStatus) {
        let mut s = self.state.write().await;
        s.status = status;
        s.last_update_time = now_ms();
        if status == SegmentStatus::Completed {
            drop(s);
            self.data_available.notify_waiters();
        }
    }

    /// Set `downloadedBytes` directly (used when resuming from an
    /// on-disk `.tmp` of known length, or when reconciling a restart).
    pub async fn set_downloaded_bytes(&self, bytes: u64) {
        let mut s = self.state.write().await;
        s.downloaded_bytes = bytes.min(self.expected_size());
        s.last_update_time = now_ms();
    }

    /// Reset progress to zero — called at the start of a fresh retry
    /// attempt (spec §3: "reset on retry").
    pub async fn reset_progress(&self) {
        let mut s = self.state.write().await;
        s.downloaded_bytes = 0;
        s.last_update_time = now_ms();
    }

    pub async fn add_downloaded(&self, delta: u64) {
        let mut s = self.state.write().await;
        s.downloaded_bytes = (s.downloaded_bytes + delta).min(self.expected_size());
        s.last_update_time = now_ms();
    }

    /// Wake every task currently waiting on `wait_for_data`. Called every
    /// 10th chunk by the downloader (spec §4.1 step 4) and on completion.
    pub fn notify_data_available(&self) {
        self.data_available.notify_waiters();
    }

    /// Wait for the next "more bytes available" signal, bounded by
    /// `timeout`. Returns `true` if a signal arrived, `false` on timeout.
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.data_available.notified())
            .await
            .is_ok()
    }

    pub fn temp_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(format!("{}_{}.tmp", self.start_byte, self.end_byte))
    }

    pub fn final_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(format!("{}_{}.seg", self.start_byte, self.end_byte))
    }

    /// Parse a `"<start>_<end>"` stem (without extension) back into a byte
    /// range, used when scanning a cache directory during `initialize()`.
    pub fn parse_stem(stem: &str) -> Option<(u64, u64)> {
        let (start, end) = stem.split_once('_')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expected_size_is_inclusive() {
        let seg = Segment::new(0, 2_097_151);
        assert_eq!(seg.expected_size(), 2_097_152);
    }

    #[tokio::test]
    async fn downloaded_bytes_cannot_exceed_expected_size() {
        let seg = Segment::new(0, 9);
        seg.add_downloaded(100).await;
        assert_eq!(seg.downloaded_bytes().await, 10);
    }

    #[tokio::test]
    async fn completion_wakes_waiters() {
        use std::sync::Arc;
        let seg = Arc::new(Segment::new(0, 9));
        let waiter = {
            let seg = seg.clone();
            tokio::spawn(async move { seg.wait_for_data(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        seg.set_status(SegmentStatus::Completed).await;
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn parses_stem() {
        assert_eq!(Segment::parse_stem("0_2097151"), Some((0, 2_097_151)));
        assert_eq!(Segment::parse_stem("garbage"), None);
    }
}
