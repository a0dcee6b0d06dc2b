//! `DownloadManager`: task registry, cache-root bookkeeping, and eviction
//! policy (spec §4.4).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{Mutex, RwLock};

use crate::config::{priority, Config};
use crate::error::CacheError;
use crate::moov::MoovPosition;
use crate::queue::{GlobalQueue, QueueItem};
use crate::segment::{now_ms, SegmentStatus};
use crate::task::{self, DownloadTask};

/// One cache-directory's worth of bookkeeping, gathered for eviction
/// decisions.
pub struct CacheEntry {
    pub dir: PathBuf,
    pub size: u64,
    pub last_access: u64,
    /// An entry backing a task with open sessions is never evicted even if
    /// selected — eviction only removes idle cache.
    pub in_use: bool,
}

/// Pluggable eviction strategy, selecting which cache directories to
/// remove given the current snapshot and tunables.
pub trait EvictionPolicy: Send + Sync {
    fn select_for_eviction(&self, entries: &[CacheEntry], config: &Config) -> Vec<usize>;
    fn select_for_emergency_eviction(&self, entries: &[CacheEntry], config: &Config) -> Vec<usize>;
}

/// Default policy (spec §4.4): TTL eviction first (anything older than
/// `cacheMaxAge` goes regardless of pressure), then LRU eviction down to
/// `maxCacheSize * cacheCleanupRatio` if still over that line.
pub struct SmartCachePolicy;

impl EvictionPolicy for SmartCachePolicy {
    fn select_for_eviction(&self, entries: &[CacheEntry], config: &Config) -> Vec<usize> {
        let now = now_ms();
        let ttl_ms = config.cache_max_age.as_millis() as u64;

        let mut victims = Vec::new();
        let mut survivors = Vec::new();
        for (i, e) in entries.iter().enumerate() {
            if e.in_use {
                continue;
            }
            if now.saturating_sub(e.last_access) > ttl_ms {
                victims.push(i);
            } else {
                survivors.push(i);
            }
        }

        let total: u64 = entries.iter().map(|e| e.size).sum();
        let evicted: u64 = victims.iter().map(|&i| entries[i].size).sum();
        let target = (config.max_cache_size as f64 * config.cache_cleanup_ratio) as u64;
        let mut current = total.saturating_sub(evicted);

        if current > target {
            survivors.sort_by_key(|&i| entries[i].last_access);
            for i in survivors {
                if current <= target {
                    break;
                }
                victims.push(i);
                current = current.saturating_sub(entries[i].size);
            }
        }
        victims
    }

    fn select_for_emergency_eviction(&self, entries: &[CacheEntry], config: &Config) -> Vec<usize> {
        let total: u64 = entries.iter().map(|e| e.size).sum();
        let target = (config.max_cache_size as f64 * config.emergency_eviction_ratio) as u64;
        let mut current = total;

        let mut order: Vec<usize> = (0..entries.len()).filter(|&i| !entries[i].in_use).collect();
        order.sort_by_key(|&i| entries[i].last_access);

        let mut victims = Vec::new();
        for i in order {
            if current <= target {
                break;
            }
            victims.push(i);
            current = current.saturating_sub(entries[i].size);
        }
        victims
    }
}

pub struct DownloadManager {
    cache_root: PathBuf,
    config: Arc<Config>,
    client: Client,
    queue: Arc<GlobalQueue>,
    tasks: RwLock<HashMap<String, Arc<DownloadTask>>>,
    /// Serializes `get_or_create_task`'s create path so two concurrent
    /// requests for the same new media never run `initialize()` twice.
    create_lock: Mutex<()>,
    policy: Box<dyn EvictionPolicy>,
}

impl DownloadManager {
    pub fn new(cache_root: PathBuf, config: Config) -> Result<Arc<Self>, CacheError> {
        let config = Arc::new(config);
        let client = Client::builder()
            .connect_timeout(config.http_connect_timeout)
            .pool_idle_timeout(config.http_idle_timeout)
            .build()
            .map_err(|e| CacheError::Download(crate::error::DownloadError::Network(e)))?;
        let queue = GlobalQueue::new(config.clone(), client.clone());

        let manager = Arc::new(Self {
            cache_root,
            config,
            client,
            queue: queue.clone(),
            tasks: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            policy: Box::new(SmartCachePolicy),
        });

        // Wire the queue's DiskFull signal back to this manager's emergency
        // eviction (spec §4.1 step 6, §4.4). A weak reference avoids a
        // reference cycle, since the manager already holds a strong `queue`.
        let weak_manager = Arc::downgrade(&manager);
        queue.set_disk_full_hook(Arc::new(move || {
            let weak_manager = weak_manager.clone();
            tokio::spawn(async move {
                if let Some(manager) = weak_manager.upgrade() {
                    if let Err(err) = manager.emergency_evict().await {
                        log::warn!("[manager] emergency eviction failed: {}", err);
                    }
                }
            });
        }));

        Ok(manager)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn queue(&self) -> &Arc<GlobalQueue> {
        &self.queue
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Fetch the task for `(url, headers)`, creating and initializing it
    /// on first use. Concurrent callers racing on the same new identity
    /// are serialized through `create_lock` rather than double-initializing.
    pub async fn get_or_create_task(
        self: &Arc<Self>,
        url: &str,
        headers: HashMap<String, String>,
    ) -> Result<Arc<DownloadTask>, CacheError> {
        let key = task::cache_key(url, &headers);

        if let Some(existing) = self.tasks.read().await.get(&key).cloned() {
            existing.touch();
            return Ok(existing);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(existing) = self.tasks.read().await.get(&key).cloned() {
            existing.touch();
            return Ok(existing);
        }

        if let Err(err) = self.run_auto_cleanup_hook().await {
            log::warn!("[manager] auto cleanup hook failed: {}", err);
        }

        let created = DownloadTask::new(
            url.to_string(),
            headers,
            &self.cache_root,
            self.config.clone(),
            self.client.clone(),
            self.queue.clone(),
        );
        created.initialize().await?;
        self.tasks.write().await.insert(key, created.clone());
        Ok(created)
    }

    /// Pre-creation auto-cleanup hook (spec §4.4), run only when the
    /// in-memory cache has no entry for the URL being requested: first
    /// sweep dangling `.tmp` files older than `stale_tmp_max_age`, then, if
    /// the cache has grown past `maxCacheSize`, run the eviction policy.
    async fn run_auto_cleanup_hook(&self) -> Result<(), CacheError> {
        self.sweep_stale_tmp_files().await?;
        if self.total_cache_size().await? > self.config.max_cache_size {
            self.cleanup_cache_lru().await?;
        }
        Ok(())
    }

    /// Delete every `.tmp` file under the cache root whose mtime is older
    /// than `stale_tmp_max_age` — leftovers from downloads that never
    /// finalized (crash, cancelled session with no later resume).
    async fn sweep_stale_tmp_files(&self) -> Result<(), CacheError> {
        let max_age = self.config.stale_tmp_max_age;
        let now = std::time::SystemTime::now();

        let mut dirs = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::Disk(e)),
        };
        while let Some(dir_entry) = dirs.next_entry().await.map_err(CacheError::Disk)? {
            let dir_path = dir_entry.path();
            if !dir_entry.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            let mut entries = match tokio::fs::read_dir(&dir_path).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(file_entry) = entries.next_entry().await.map_err(CacheError::Disk)? {
                let file_path = file_entry.path();
                if file_path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                    continue;
                }
                let Ok(meta) = file_entry.metadata().await else { continue };
                let Ok(modified) = meta.modified() else { continue };
                if now.duration_since(modified).unwrap_or_default() > max_age {
                    let _ = tokio::fs::remove_file(&file_path).await;
                }
            }
        }
        Ok(())
    }

    /// Core `preload` entry point (spec §4.6): ensure the task exists,
    /// enqueue its first `segment_count` not-yet-completed segments at
    /// `PREPLAY` priority, and — if `include_moov` and either the media is
    /// an MP4 with `moov` at the tail or `alwaysPreloadEndSegment` is set —
    /// also enqueue the last segment. Resolves once every enqueued segment
    /// reports completion; succeeds iff at least one segment succeeded and
    /// the last (critical) segment, if enqueued, didn't fail.
    ///
    /// This is the entry point the out-of-scope debounced "smart preload"
    /// scheduler wraps with a 300ms trailing debounce; callers here invoke
    /// it directly and synchronously await the outcome.
    pub async fn preload(
        self: &Arc<Self>,
        url: &str,
        headers: HashMap<String, String>,
        segment_count: usize,
        include_moov: bool,
    ) -> Result<bool, CacheError> {
        let task = self.get_or_create_task(url, headers).await?;
        let all_segments = task.all_segments().await;

        let mut targets = Vec::new();
        for segment in &all_segments {
            if targets.len() >= segment_count {
                break;
            }
            if segment.status().await != SegmentStatus::Completed {
                targets.push(segment.clone());
            }
        }

        let wants_tail = include_moov
            && ((task.is_mp4().await && task.moov_at_start().await == MoovPosition::AtEnd)
                || self.config.always_preload_end_segment);
        let mut critical_index = None;
        if wants_tail {
            if let Some(last) = all_segments.last() {
                if last.status().await != SegmentStatus::Completed
                    && !targets.iter().any(|s| Arc::ptr_eq(s, last))
                {
                    critical_index = Some(targets.len());
                    targets.push(last.clone());
                }
            }
        }

        if targets.is_empty() {
            return Ok(true);
        }

        let mut receivers = Vec::with_capacity(targets.len());
        for segment in targets {
            let (tx, rx) = tokio::sync::oneshot::channel();
            receivers.push(rx);
            self.queue
                .enqueue(QueueItem::new(
                    task.media_url.clone(),
                    segment,
                    task.cache_dir.clone(),
                    task.headers.clone(),
                    priority::PREPLAY,
                    task.cancel_token(),
                    |_| {},
                    move |success| {
                        let _ = tx.send(success);
                    },
                ))
                .await;
        }

        let mut outcomes = Vec::with_capacity(receivers.len());
        for rx in receivers {
            outcomes.push(rx.await.unwrap_or(false));
        }

        let any_success = outcomes.iter().any(|&ok| ok);
        let critical_ok = critical_index.map(|i| outcomes[i]).unwrap_or(true);
        Ok(any_success && critical_ok)
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Remove one task's cache directory and registry entry, identified by
    /// the same `(url, headers)` pair `get_or_create_task` uses — there is
    /// no url-only removal path, matching how tasks are looked up.
    pub async fn remove_task(&self, url: &str, headers: &HashMap<String, String>) -> Result<(), CacheError> {
        let key = task::cache_key(url, headers);
        let removed = self.tasks.write().await.remove(&key);
        if let Some(task) = &removed {
            task.cancel_token().store(true, std::sync::atomic::Ordering::SeqCst);
            tokio::fs::remove_dir_all(&task.cache_dir).await.or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        }
        Ok(())
    }

    /// Sum of every `.seg` file under the cache root.
    pub async fn total_cache_size(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;
        let mut dirs = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::Disk(e)),
        };
        while let Some(dir_entry) = dirs.next_entry().await.map_err(CacheError::Disk)? {
            total += Self::dir_size(&dir_entry.path()).await?;
        }
        Ok(total)
    }

    async fn dir_size(dir: &Path) -> Result<u64, CacheError> {
        let mut total = 0u64;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::Disk(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(CacheError::Disk)? {
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    /// Delete everything under the cache root and drop all in-memory
    /// tasks. Tasks with open sessions are cancelled first.
    pub async fn clear_all_cache(&self) -> Result<(), CacheError> {
        {
            let tasks = self.tasks.read().await;
            for task in tasks.values() {
                task.cancel_token().store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }
        self.tasks.write().await.clear();

        let mut dirs = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::Disk(e)),
        };
        while let Some(entry) = dirs.next_entry().await.map_err(CacheError::Disk)? {
            let _ = tokio::fs::remove_dir_all(entry.path()).await;
        }
        Ok(())
    }

    async fn snapshot_entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let active_dirs: std::collections::HashSet<PathBuf> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.active_sessions() > 0)
                .map(|t| t.cache_dir.clone())
                .collect()
        };

        let mut entries = Vec::new();
        let mut dirs = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(CacheError::Disk(e)),
        };
        while let Some(dir_entry) = dirs.next_entry().await.map_err(CacheError::Disk)? {
            let path = dir_entry.path();
            if !dir_entry.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            let size = Self::dir_size(&path).await?;
            let last_access = Self::last_access_of(&path).await;
            entries.push(CacheEntry {
                in_use: active_dirs.contains(&path),
                dir: path,
                size,
                last_access,
            });
        }
        Ok(entries)
    }

    async fn last_access_of(dir: &Path) -> u64 {
        if let Ok(bytes) = tokio::fs::read(dir.join("config.json")).await {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                if let Some(t) = value.get("lastAccessTime").and_then(|v| v.as_u64()) {
                    return t;
                }
            }
        }
        tokio::fs::metadata(dir)
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn evict(&self, entries: Vec<CacheEntry>, victims: Vec<usize>) {
        let mut tasks = self.tasks.write().await;
        for i in victims {
            let entry = &entries[i];
            let _ = tokio::fs::remove_dir_all(&entry.dir).await;
            tasks.retain(|_, t| t.cache_dir != entry.dir);
        }
    }

    /// Routine cleanup pass (spec §4.4): TTL eviction, then LRU down to
    /// `cacheCleanupRatio` of `maxCacheSize` if still over.
    pub async fn cleanup_cache_lru(&self) -> Result<(), CacheError> {
        let entries = self.snapshot_entries().await?;
        let victims = self.policy.select_for_eviction(&entries, &self.config);
        self.evict(entries, victims).await;
        Ok(())
    }

    /// Called when a download reports `DiskFull`: evict LRU entries,
    /// ignoring TTL, straight down to `emergencyEvictionRatio` of
    /// `maxCacheSize`.
    pub async fn emergency_evict(&self) -> Result<(), CacheError> {
        let entries = self.snapshot_entries().await?;
        let victims = self.policy.select_for_emergency_eviction(&entries, &self.config);
        self.evict(entries, victims).await;
        Ok(())
    }

    /// Spawn a background task that runs `cleanup_cache_lru` on a fixed
    /// interval for the life of the process.
    pub fn spawn_auto_cleanup(self: &Arc<Self>, interval: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = manager.cleanup_cache_lru().await {
                    log::warn!("[manager] auto cleanup failed: {}", err);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: u64, last_access: u64, in_use: bool) -> CacheEntry {
        CacheEntry {
            dir: PathBuf::from(format!("/tmp/{}", last_access)),
            size,
            last_access,
            in_use,
        }
    }

    #[test]
    fn ttl_expired_entries_are_always_evicted() {
        let mut config = Config::default();
        config.max_cache_size = 1_000_000;
        config.cache_cleanup_ratio = 0.9;
        config.cache_max_age = Duration::from_millis(100);

        let now = now_ms();
        let entries = vec![entry(10, now - 1000, false), entry(10, now, false)];
        let victims = SmartCachePolicy.select_for_eviction(&entries, &config);
        assert_eq!(victims, vec![0]);
    }

    #[test]
    fn in_use_entries_are_never_selected() {
        let mut config = Config::default();
        config.max_cache_size = 10;
        config.cache_cleanup_ratio = 0.0;
        config.cache_max_age = Duration::from_secs(3600);

        let entries = vec![entry(100, 1, true)];
        let victims = SmartCachePolicy.select_for_eviction(&entries, &config);
        assert!(victims.is_empty());
    }

    #[test]
    fn lru_evicts_oldest_first_down_to_target() {
        let mut config = Config::default();
        config.max_cache_size = 100;
        config.cache_cleanup_ratio = 0.5;
        config.cache_max_age = Duration::from_secs(3600);

        let entries = vec![entry(40, 1, false), entry(40, 2, false), entry(40, 3, false)];
        let victims = SmartCachePolicy.select_for_eviction(&entries, &config);
        assert_eq!(victims, vec![0]);
    }

    #[test]
    fn emergency_eviction_ignores_ttl_and_targets_its_own_ratio() {
        let mut config = Config::default();
        config.max_cache_size = 100;
        config.emergency_eviction_ratio = 0.2;
        config.cache_max_age = Duration::from_secs(3600);

        let entries = vec![entry(40, 1, false), entry(40, 2, false), entry(40, 3, false)];
        let victims = SmartCachePolicy.select_for_emergency_eviction(&entries, &config);
        assert_eq!(victims, vec![0, 1]);
    }

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn preload_fetches_requested_segment_count_and_reports_success() {
        let upstream = MockServer::start().await;
        let body = vec![9u8; 30];
        let full = body.clone();
        Mock::given(method("GET"))
            .and(path("/a.bin"))
            .respond_with(move |req: &wiremock::Request| {
                let range = req.headers.get("Range").unwrap().to_str().unwrap().to_string();
                let spec = range.strip_prefix("bytes=").unwrap();
                let (s, e) = spec.split_once('-').unwrap();
                let (s, e): (usize, usize) = (s.parse().unwrap(), e.parse().unwrap_or(full.len() - 1));
                ResponseTemplate::new(206)
                    .set_body_bytes(full[s..=e.min(full.len() - 1)].to_vec())
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", s, e, full.len()))
            })
            .mount(&upstream)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.segment_size = 10;
        let manager = DownloadManager::new(dir.path().to_path_buf(), config).unwrap();

        let url = format!("{}/a.bin", upstream.uri());
        let ok = manager.preload(&url, HashMap::new(), 2, false).await.unwrap();
        assert!(ok);

        let task = manager.get_or_create_task(&url, HashMap::new()).await.unwrap();
        let segments = task.all_segments().await;
        assert_eq!(segments[0].status().await, SegmentStatus::Completed);
        assert_eq!(segments[1].status().await, SegmentStatus::Completed);
    }

    #[tokio::test]
    async fn preload_is_a_noop_once_everything_is_already_completed() {
        let upstream = MockServer::start().await;
        let body = vec![3u8; 20];
        let full = body.clone();
        Mock::given(method("GET"))
            .and(path("/b.bin"))
            .respond_with(move |req: &wiremock::Request| {
                let range = req.headers.get("Range").unwrap().to_str().unwrap().to_string();
                let spec = range.strip_prefix("bytes=").unwrap();
                let (s, e) = spec.split_once('-').unwrap();
                let (s, e): (usize, usize) = (s.parse().unwrap(), e.parse().unwrap_or(full.len() - 1));
                ResponseTemplate::new(206)
                    .set_body_bytes(full[s..=e.min(full.len() - 1)].to_vec())
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", s, e, full.len()))
            })
            .mount(&upstream)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.segment_size = 10;
        let manager = DownloadManager::new(dir.path().to_path_buf(), config).unwrap();
        let url = format!("{}/b.bin", upstream.uri());

        assert!(manager.preload(&url, HashMap::new(), 2, false).await.unwrap());
        // Second call: both segments are already Completed, so targets stays
        // empty and the call resolves immediately without enqueuing anything.
        assert!(manager.preload(&url, HashMap::new(), 2, false).await.unwrap());
    }

    #[tokio::test]
    async fn auto_cleanup_hook_sweeps_stale_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.stale_tmp_max_age = Duration::from_millis(1);
        let manager = DownloadManager::new(dir.path().to_path_buf(), config).unwrap();

        let task_dir = dir.path().join("somehash");
        tokio::fs::create_dir_all(&task_dir).await.unwrap();
        let stale_tmp = task_dir.join("0_9.tmp");
        tokio::fs::write(&stale_tmp, b"partial").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.run_auto_cleanup_hook().await.unwrap();

        assert!(!stale_tmp.exists());
    }

    #[tokio::test]
    async fn auto_cleanup_hook_leaves_fresh_tmp_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default(); // stale_tmp_max_age defaults to 24h
        let manager = DownloadManager::new(dir.path().to_path_buf(), config).unwrap();

        let task_dir = dir.path().join("somehash");
        tokio::fs::create_dir_all(&task_dir).await.unwrap();
        let fresh_tmp = task_dir.join("0_9.tmp");
        tokio::fs::write(&fresh_tmp, b"partial").await.unwrap();

        manager.run_auto_cleanup_hook().await.unwrap();

        assert!(fresh_tmp.exists());
    }

    #[tokio::test]
    async fn get_or_create_task_runs_the_auto_cleanup_hook_for_a_new_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.stale_tmp_max_age = Duration::from_millis(1);
        let manager = DownloadManager::new(dir.path().to_path_buf(), config).unwrap();

        let stale_dir = dir.path().join("unrelated-task");
        tokio::fs::create_dir_all(&stale_dir).await.unwrap();
        let stale_tmp = stale_dir.join("0_9.tmp");
        tokio::fs::write(&stale_tmp, b"partial").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/c.bin"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(vec![1u8; 4])
                    .insert_header("Content-Range", "bytes 0-3/4"),
            )
            .mount(&upstream)
            .await;
        let url = format!("{}/c.bin", upstream.uri());

        manager.get_or_create_task(&url, HashMap::new()).await.unwrap();

        assert!(!stale_tmp.exists());
    }

    #[tokio::test]
    async fn disk_full_signal_from_the_queue_drives_emergency_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(dir.path().to_path_buf(), Config::default()).unwrap();

        // An idle cache entry well past the emergency ratio so eviction has
        // something to remove once the hook installed in `DownloadManager::new`
        // fires.
        let victim_dir = dir.path().join("victim");
        tokio::fs::create_dir_all(&victim_dir).await.unwrap();
        tokio::fs::write(victim_dir.join("0_9.seg"), vec![0u8; 10]).await.unwrap();

        manager.queue().enqueue_disk_full_for_test();
        // The hook spawns the eviction onto its own task; give it a turn.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!victim_dir.exists());
    }
}
