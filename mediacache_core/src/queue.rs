use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::Mutex;

use crate::config::{priority, Config};
use crate::error::DownloadError;
use crate::segment::{Segment, SegmentStatus};
use crate::segment_downloader;

/// One request to download a segment, submitted by a `DownloadTask` (or
/// the proxy handler on its behalf). Spec §3 `QueueItem`.
///
/// `segment` is an `Arc` clone rather than a true weak pointer — the
/// owning `DownloadTask` keeps its own `Arc` alive for the segment's
/// whole lifetime, so there's no cycle or leak risk in holding a second
/// strong reference here; it just means the queue never needs to check
/// for a dangling upgrade.
pub struct QueueItem {
    pub media_url: String,
    pub segment: Arc<Segment>,
    pub cache_dir: PathBuf,
    pub headers: HashMap<String, String>,
    pub priority: i32,
    pub created_at: Instant,
    /// Own cancellation flag, set by `cancel_media`/`cancel_all_except_current`.
    cancelled_flag: Arc<AtomicBool>,
    /// Task-level cancellation (spec: `cancelToken()`), shared with the
    /// owning `DownloadTask`.
    task_cancel_token: Arc<AtomicBool>,
    on_progress: Arc<dyn Fn(u64) + Send + Sync>,
    on_complete: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl QueueItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media_url: String,
        segment: Arc<Segment>,
        cache_dir: PathBuf,
        headers: HashMap<String, String>,
        priority: i32,
        task_cancel_token: Arc<AtomicBool>,
        on_progress: impl Fn(u64) + Send + Sync + 'static,
        on_complete: impl FnOnce(bool) + Send + 'static,
    ) -> Self {
        Self {
            media_url,
            segment,
            cache_dir,
            headers,
            priority,
            created_at: Instant::now(),
            cancelled_flag: Arc::new(AtomicBool::new(false)),
            task_cancel_token,
            on_progress: Arc::new(on_progress),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_flag.load(Ordering::SeqCst) || self.task_cancel_token.load(Ordering::SeqCst)
    }

    fn active_key(media_url: &str, start_byte: u64) -> String {
        format!("{}|{}", media_url, start_byte)
    }

    fn key(&self) -> String {
        Self::active_key(&self.media_url, self.segment.start_byte)
    }

    fn complete(mut self, success: bool) {
        if let Some(cb) = self.on_complete.take() {
            cb(success);
        }
    }
}

struct ActiveEntry {
    cancelled_flag: Arc<AtomicBool>,
    media_url: String,
}

struct QueueState {
    pending: Vec<QueueItem>,
    active: HashMap<String, ActiveEntry>,
    active_count_per_media: HashMap<String, usize>,
    current_playing_url: Option<String>,
    startup_locks: HashMap<String, i64>,
}

/// Single process-wide priority queue plus the set of in-flight downloads
/// (spec §4.3). Concurrency caps, startup exclusivity, and priority
/// promotion/demotion on playback switch all live here.
pub struct GlobalQueue {
    config: Arc<Config>,
    client: Client,
    state: Mutex<QueueState>,
    pause_old_downloads_on_switch: bool,
    /// Fired (off the scheduling loop) whenever a download attempt reports
    /// `DiskFull`, so an owner like `DownloadManager` can react with an
    /// emergency eviction (spec §4.1 step 6, §4.4). The queue itself has no
    /// notion of cache size or eviction policy — it just surfaces the signal.
    disk_full_hook: StdMutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl GlobalQueue {
    pub fn new(config: Arc<Config>, client: Client) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                active: HashMap::new(),
                active_count_per_media: HashMap::new(),
                current_playing_url: None,
                startup_locks: HashMap::new(),
            }),
            pause_old_downloads_on_switch: true,
            disk_full_hook: StdMutex::new(None),
        })
    }

    /// Install the callback invoked when a download hits `DiskFull`.
    /// Set once by the owner (`DownloadManager::new`) right after
    /// construction, since the queue is built before its owner's `Arc`
    /// exists and so can't be handed a back-reference up front.
    pub fn set_disk_full_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.disk_full_hook.lock().unwrap() = Some(hook);
    }

    /// Test-only: fire the installed `DiskFull` hook directly, without
    /// driving an actual download through `spawn_download`.
    #[cfg(test)]
    pub fn enqueue_disk_full_for_test(&self) {
        if let Some(hook) = self.disk_full_hook.lock().unwrap().clone() {
            hook();
        }
    }

    /// Submit a segment for download. Rejects (invoking `onComplete`
    /// synchronously) if the segment is already `Completed`,
    /// `Downloading`, already pending, or already active.
    pub async fn enqueue(self: &Arc<Self>, mut item: QueueItem) {
        let status = item.segment.status().await;
        if status == SegmentStatus::Completed {
            item.complete(true);
            return;
        }
        if status == SegmentStatus::Downloading {
            item.complete(true);
            return;
        }

        let key = item.key();
        {
            let mut state = self.state.lock().await;
            if state.active.contains_key(&key) || state.pending.iter().any(|p| p.key() == key) {
                drop(state);
                item.complete(false);
                return;
            }

            let effective_priority = if state.current_playing_url.as_deref() == Some(item.media_url.as_str()) {
                item.priority.max(priority::PLAYING)
            } else {
                item.priority
            };
            item.priority = effective_priority;

            let insert_at = state
                .pending
                .iter()
                .position(|p| p.priority < effective_priority)
                .unwrap_or(state.pending.len());
            state.pending.insert(insert_at, item);
        }
        self.try_schedule_more().await;
    }

    /// Mark `url` as the actively-playing media: raise its pending items to
    /// `PLAYING`, and (if configured) demote the previous URL's pending
    /// items to `BACKGROUND`.
    pub async fn set_current_playing(self: &Arc<Self>, url: &str) {
        let mut state = self.state.lock().await;
        if state.current_playing_url.as_deref() == Some(url) {
            return;
        }
        let previous = state.current_playing_url.replace(url.to_string());

        for p in state.pending.iter_mut() {
            if p.media_url == url {
                p.priority = p.priority.max(priority::PLAYING);
            }
        }
        if self.pause_old_downloads_on_switch {
            if let Some(prev_url) = previous {
                for p in state.pending.iter_mut() {
                    if p.media_url == prev_url {
                        p.priority = priority::BACKGROUND;
                    }
                }
            }
        }
        Self::resort_stable(&mut state.pending);
        drop(state);
        self.try_schedule_more().await;
    }

    /// Remove pending items for `url`; if `cancel_active`, flag its active
    /// downloads cancelled (observed at the next body chunk).
    pub async fn cancel_media(&self, url: &str, cancel_active: bool) {
        let mut state = self.state.lock().await;
        let (removed, kept): (Vec<_>, Vec<_>) = state.pending.drain(..).partition(|p| p.media_url == url);
        state.pending = kept;
        for item in removed {
            item.complete(false);
        }
        if cancel_active {
            for entry in state.active.values() {
                if entry.media_url == url {
                    entry.cancelled_flag.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    pub async fn pause_all(&self) {
        let mut state = self.state.lock().await;
        for p in state.pending.iter_mut() {
            p.priority = priority::BACKGROUND;
        }
    }

    pub async fn cancel_all_except_current(&self) {
        let mut state = self.state.lock().await;
        let current = state.current_playing_url.clone();
        let (kept, removed): (Vec<_>, Vec<_>) = state
            .pending
            .drain(..)
            .partition(|p| current.as_deref() == Some(p.media_url.as_str()));
        state.pending = kept;
        for entry in state.active.values() {
            if current.as_deref() != Some(entry.media_url.as_str()) {
                entry.cancelled_flag.store(true, Ordering::SeqCst);
            }
        }
        drop(state);
        for item in removed {
            item.complete(false);
        }
    }

    pub async fn update_startup_lock(&self, url: &str, delta: i64) {
        let mut state = self.state.lock().await;
        let count = state.startup_locks.entry(url.to_string()).or_insert(0);
        *count += delta;
        if *count <= 0 {
            state.startup_locks.remove(url);
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn active_len(&self) -> usize {
        self.state.lock().await.active.len()
    }

    fn resort_stable(pending: &mut [QueueItem]) {
        // Stable sort by descending priority; `sort_by` is stable, so equal
        // priorities keep their relative (FIFO) order.
        pending.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Scheduling loop (spec §4.3). Re-entered under `state`'s mutex so two
    /// callers (an `enqueue` and a completion callback) never race to start
    /// the same slot — each iteration re-acquires the lock just long enough
    /// to pick one item, so the actual network I/O never runs under it.
    async fn try_schedule_more(self: &Arc<Self>) {
        loop {
            let started = {
                let mut state = self.state.lock().await;
                if state.pending.is_empty() || state.active.len() >= self.config.global_max_concurrent_downloads {
                    None
                } else if let Some(lock_gate) = Self::startup_gate_blocks(&state) {
                    let _ = lock_gate;
                    None
                } else {
                    Self::pick_next(&mut state, &self.config)
                }
            };

            let Some(item) = started else { break };
            self.spawn_download(item);
        }
    }

    /// Startup gate: while any `startupLocks` entry is held, only items at
    /// or above `PLAYING_URGENT_MINUS_50` may start — this reserves
    /// bandwidth for the first playback segment and the `moov`/tail
    /// segment during the startup window.
    fn startup_gate_blocks(state: &QueueState) -> Option<()> {
        if state.startup_locks.is_empty() {
            return None;
        }
        let head_priority = state.pending.first()?.priority;
        if head_priority < priority::PLAYING_URGENT_MINUS_50 {
            Some(())
        } else {
            None
        }
    }

    /// Pick the next pending item to start, honoring the per-media cap: if
    /// the head item's media is already at its per-media ceiling, scan for
    /// the first pending item whose media is under the cap.
    fn pick_next(state: &mut QueueState, config: &Config) -> Option<QueueItem> {
        let head_media_at_cap = {
            let head = state.pending.first()?;
            state.active_count_per_media.get(&head.media_url).copied().unwrap_or(0)
                >= config.per_media_max_concurrent_downloads
        };

        let idx = if head_media_at_cap {
            state.pending.iter().position(|p| {
                state.active_count_per_media.get(&p.media_url).copied().unwrap_or(0)
                    < config.per_media_max_concurrent_downloads
            })?
        } else {
            0
        };

        let item = state.pending.remove(idx);
        *state.active_count_per_media.entry(item.media_url.clone()).or_insert(0) += 1;
        state.active.insert(
            item.key(),
            ActiveEntry {
                cancelled_flag: item.cancelled_flag.clone(),
                media_url: item.media_url.clone(),
            },
        );
        Some(item)
    }

    fn spawn_download(self: &Arc<Self>, item: QueueItem) {
        let queue = self.clone();
        tokio::spawn(async move {
            if item.is_cancelled() {
                queue.finish(&item).await;
                item.complete(false);
                return;
            }
            match item.segment.status().await {
                SegmentStatus::Completed => {
                    queue.finish(&item).await;
                    let success = true;
                    item.complete(success);
                    return;
                }
                _ => {}
            }

            let token = tokio_util::sync::CancellationToken::new();
            let cancelled_flag = item.cancelled_flag.clone();
            let watcher_token = token.clone();
            let watcher = tokio::spawn(async move {
                loop {
                    if cancelled_flag.load(Ordering::SeqCst) {
                        watcher_token.cancel();
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            });

            let on_progress = item.on_progress.clone();
            let result = segment_downloader::download(
                &queue.client,
                &item.media_url,
                &item.segment,
                &item.cache_dir,
                &item.headers,
                move |n| on_progress(n),
                &token,
                queue.config.download_retry_count,
                queue.config.download_retry_initial_delay,
                queue.config.http_stream_read_timeout,
            )
            .await;
            watcher.abort();

            if matches!(result, Err(DownloadError::DiskFull)) {
                log::warn!(
                    "[queue] disk full downloading {}_{}; triggering emergency eviction",
                    item.segment.start_byte, item.segment.end_byte
                );
                if let Some(hook) = queue.disk_full_hook.lock().unwrap().clone() {
                    hook();
                }
            }

            queue.finish(&item).await;
            item.complete(matches!(result, Ok(true)));
        });
    }

    async fn finish(self: &Arc<Self>, item: &QueueItem) {
        let mut state = self.state.lock().await;
        state.active.remove(&item.key());
        if let Some(count) = state.active_count_per_media.get_mut(&item.media_url) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active_count_per_media.remove(&item.media_url);
            }
        }
        drop(state);
        self.try_schedule_more().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use std::sync::atomic::AtomicUsize;

    fn no_cancel() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn enqueue_of_completed_segment_completes_synchronously_without_active_work() {
        let queue = GlobalQueue::new(Arc::new(Config::default()), Client::new());
        let segment = Arc::new(Segment::new(0, 9));
        segment.set_status(SegmentStatus::Completed).await;

        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let item = QueueItem::new(
            "http://x/a".to_string(),
            segment,
            PathBuf::from("/tmp"),
            HashMap::new(),
            priority::PLAYING,
            no_cancel(),
            |_| {},
            move |success| {
                assert!(success);
                called2.store(true, Ordering::SeqCst);
            },
        );
        queue.enqueue(item).await;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(queue.active_len().await, 0);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn startup_lock_blocks_low_priority_items() {
        let queue = GlobalQueue::new(Arc::new(Config::default()), Client::new());
        queue.update_startup_lock("http://x/a", 1).await;

        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..2u64 {
            let segment = Arc::new(Segment::new(i * 10, i * 10 + 9));
            let done = done.clone();
            let item = QueueItem::new(
                "http://x/a".to_string(),
                segment,
                PathBuf::from("/tmp"),
                HashMap::new(),
                priority::BACKGROUND,
                no_cancel(),
                |_| {},
                move |_| {
                    done.fetch_add(1, Ordering::SeqCst);
                },
            );
            queue.enqueue(item).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Low-priority items must not have started while the startup lock holds.
        assert_eq!(queue.active_len().await, 0);
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_len().await, 2);
    }

    #[tokio::test]
    async fn switching_playback_demotes_previous_media() {
        let queue = GlobalQueue::new(Arc::new(Config::default()), Client::new());
        queue.set_current_playing("http://a").await;

        let segment = Arc::new(Segment::new(0, 9));
        let item = QueueItem::new(
            "http://a".to_string(),
            segment,
            PathBuf::from("/tmp"),
            HashMap::new(),
            priority::PLAYING,
            no_cancel(),
            |_| {},
            |_| {},
        );
        // Can't easily observe internal priority without a getter; this
        // exercises the switch path without panicking and without
        // starting network I/O (no mock server wired in this test).
        queue.enqueue(item).await;
        queue.set_current_playing("http://b").await;
        // Draining any remaining pending items so the test doesn't leak a
        // background download attempt against a real network.
        queue.cancel_media("http://a", true).await;
    }

    #[tokio::test]
    async fn disk_full_hook_fires_when_set() {
        let queue = GlobalQueue::new(Arc::new(Config::default()), Client::new());
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        queue.set_disk_full_hook(Arc::new(move || {
            fired2.store(true, Ordering::SeqCst);
        }));

        let hook = queue.disk_full_hook.lock().unwrap().clone();
        hook.expect("hook should be installed")();

        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disk_full_hook_is_unset_by_default() {
        let queue = GlobalQueue::new(Arc::new(Config::default()), Client::new());
        assert!(queue.disk_full_hook.lock().unwrap().is_none());
    }
}
