//! `DownloadTask`: the per-media unit owning a segment layout, its
//! on-disk cache directory, and the persisted `config.json` describing
//! both (spec §4.2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{priority, Config};
use crate::error::{CacheError, DownloadError};
use crate::format;
use crate::moov::{self, MoovPosition};
use crate::queue::{GlobalQueue, QueueItem};
use crate::segment::{now_ms, Segment, SegmentRecord, SegmentStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    url: String,
    request_headers: Option<HashMap<String, String>>,
    content_length: i64,
    content_type: Option<String>,
    moov_at_start: MoovPosition,
    last_access_time: u64,
    segments: Vec<SegmentRecord>,
}

/// Compute the cache directory name for a `(url, headers)` identity.
///
/// Headers are sorted by key before hashing so the identity doesn't
/// depend on header insertion order (Open Question 1: task identity is
/// `(url, canonicalized headers)` everywhere, never url-only).
pub fn cache_key(url: &str, headers: &HashMap<String, String>) -> String {
    use md5::{Digest, Md5};
    let mut pairs: Vec<(&String, &String)> = headers.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Md5::new();
    hasher.update(url.as_bytes());
    for (k, v) in pairs {
        hasher.update(b"|");
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub struct DownloadTask {
    pub media_url: String,
    pub headers: HashMap<String, String>,
    pub cache_dir: PathBuf,
    config: Arc<Config>,
    client: Client,
    queue: Arc<GlobalQueue>,

    content_length: AtomicI64,
    content_type: RwLock<Option<String>>,
    moov_at_start: RwLock<MoovPosition>,
    segments: RwLock<Vec<Arc<Segment>>>,
    active_sessions: AtomicU64,
    last_access_time: AtomicU64,
    moov_preloaded: AtomicBool,
    cancel_token: Arc<AtomicBool>,
    flush_scheduled: AtomicBool,
}

impl DownloadTask {
    pub fn new(
        media_url: String,
        headers: HashMap<String, String>,
        cache_root: &Path,
        config: Arc<Config>,
        client: Client,
        queue: Arc<GlobalQueue>,
    ) -> Arc<Self> {
        let cache_dir = cache_root.join(cache_key(&media_url, &headers));
        Arc::new(Self {
            media_url,
            headers,
            cache_dir,
            config,
            client,
            queue,
            content_length: AtomicI64::new(-1),
            content_type: RwLock::new(None),
            moov_at_start: RwLock::new(MoovPosition::Unknown),
            segments: RwLock::new(Vec::new()),
            active_sessions: AtomicU64::new(0),
            last_access_time: AtomicU64::new(now_ms()),
            moov_preloaded: AtomicBool::new(false),
            cancel_token: Arc::new(AtomicBool::new(false)),
            flush_scheduled: AtomicBool::new(false),
        })
    }

    pub fn content_length(&self) -> i64 {
        self.content_length.load(Ordering::SeqCst)
    }

    pub async fn content_type(&self) -> Option<String> {
        self.content_type.read().await.clone()
    }

    pub async fn moov_at_start(&self) -> MoovPosition {
        *self.moov_at_start.read().await
    }

    pub async fn is_mp4(&self) -> bool {
        match self.content_type().await {
            Some(ct) => format::is_mp4(&ct),
            None => false,
        }
    }

    pub fn touch(&self) {
        self.last_access_time.store(now_ms(), Ordering::SeqCst);
    }

    pub fn last_access_time(&self) -> u64 {
        self.last_access_time.load(Ordering::SeqCst)
    }

    pub fn add_session(&self) {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn remove_session(&self) {
        self.active_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .ok();
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel_token.clone()
    }

    fn config_path(&self) -> PathBuf {
        self.cache_dir.join("config.json")
    }

    /// Bring the task up to a usable state: create the cache directory,
    /// load a persisted `config.json` if present, reconcile on-disk
    /// segment artifacts against it, probe content length/type if still
    /// unknown, and lay out segments (spec §4.2).
    pub async fn initialize(self: &Arc<Self>) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let mut leading_bytes: Vec<u8> = Vec::new();
        let loaded = self.load_config_file().await?;
        if let Some(cfg) = loaded {
            self.content_length.store(cfg.content_length, Ordering::SeqCst);
            *self.content_type.write().await = cfg.content_type;
            *self.moov_at_start.write().await = cfg.moov_at_start;
            let mut segments = Vec::with_capacity(cfg.segments.len());
            for record in cfg.segments {
                segments.push(Arc::new(Segment::from_record(record)));
            }
            *self.segments.write().await = segments;
        }

        self.reconcile_disk_segments().await?;

        if self.content_length() < 0 {
            leading_bytes = self.probe_upstream().await?;
        }

        if self.segments.read().await.is_empty() && self.content_length() > 0 {
            self.layout_segments().await?;
        }

        if self.is_mp4().await && self.moov_at_start().await == MoovPosition::Unknown {
            let content_length = self.content_length().max(0) as u64;
            if moov::should_skip_detection(content_length, self.config.skip_moov_detection_threshold) {
                *self.moov_at_start.write().await = MoovPosition::AtStart;
            } else if !leading_bytes.is_empty() {
                *self.moov_at_start.write().await = moov::detect_moov_position(&leading_bytes);
            } else {
                let sample = self.fetch_leading_bytes().await.unwrap_or_default();
                *self.moov_at_start.write().await = moov::detect_moov_position(&sample);
            }
        }

        self.flush_config(true).await?;
        Ok(())
    }

    async fn load_config_file(&self) -> Result<Option<ConfigFile>, CacheError> {
        let path = self.config_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::ConfigCorrupt(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Disk(e)),
        }
    }

    /// Reconcile `.seg`/`.tmp` files on disk against the in-memory segment
    /// list: a `.seg` at or above its expected length is `Completed`; a
    /// dangling `Downloading` status left from an unclean shutdown reverts
    /// to `Pending` so it gets re-enqueued rather than assumed in-flight.
    async fn reconcile_disk_segments(&self) -> Result<(), CacheError> {
        let segments = self.segments.read().await;
        for segment in segments.iter() {
            if segment.status().await == SegmentStatus::Downloading {
                segment.set_status(SegmentStatus::Pending).await;
            }
            let final_path = segment.final_path(&self.cache_dir);
            if let Ok(meta) = tokio::fs::metadata(&final_path).await {
                if meta.len() >= segment.expected_size() {
                    segment.set_status(SegmentStatus::Completed).await;
                }
            }
        }
        drop(segments);

        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) => return Err(CacheError::Disk(e)),
        };
        let known: Vec<(u64, u64)> = self
            .segments
            .read()
            .await
            .iter()
            .map(|s| (s.start_byte, s.end_byte))
            .collect();

        while let Some(entry) = entries.next_entry().await.map_err(CacheError::Disk)? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let Some(ext) = path.extension().and_then(|s| s.to_str()) else { continue };
            if ext != "seg" {
                continue;
            }
            let Some((start, end)) = Segment::parse_stem(stem) else { continue };
            if known.contains(&(start, end)) {
                continue;
            }
            // A completed segment file with no matching record — e.g. the
            // layout changed, or config.json was lost. Adopt it.
            let meta = entry.metadata().await.map_err(CacheError::Disk)?;
            let segment = Segment::new(start, end);
            if meta.len() >= segment.expected_size() {
                segment.set_status(SegmentStatus::Completed).await;
            }
            self.segments.write().await.push(Arc::new(segment));
        }
        Ok(())
    }

    /// HEAD the upstream for content length/type; if the server doesn't
    /// answer HEAD usefully, fall back to a small ranged GET and read
    /// `Content-Range`'s total, capturing the response body as the
    /// leading-bytes sample for `moov` detection.
    async fn probe_upstream(&self) -> Result<Vec<u8>, CacheError> {
        let head = self
            .client
            .head(&self.media_url)
            .headers(self.header_map())
            .send()
            .await;

        if let Ok(resp) = head {
            if resp.status().is_success() {
                if let Some(len) = resp.content_length() {
                    self.content_length.store(len as i64, Ordering::SeqCst);
                }
                if let Some(ct) = resp.headers().get(reqwest::header::CONTENT_TYPE) {
                    if let Ok(ct) = ct.to_str() {
                        *self.content_type.write().await = Some(ct.to_string());
                    }
                }
                if self.content_type.read().await.is_none() {
                    *self.content_type.write().await =
                        format::infer_mime_type_from_url(&self.media_url).map(|s| s.to_string());
                }
                if self.content_length() >= 0 {
                    return Ok(Vec::new());
                }
            }
        }

        self.fetch_leading_bytes().await
    }

    async fn fetch_leading_bytes(&self) -> Result<Vec<u8>, CacheError> {
        let range_end = self.config.moov_detection_bytes.saturating_sub(1);
        let response = self
            .client
            .get(&self.media_url)
            .headers(self.header_map())
            .header("Range", format!("bytes=0-{}", range_end))
            .send()
            .await
            .map_err(|e| CacheError::Download(DownloadError::Network(e)))?;

        if let Some(ct) = response.headers().get(reqwest::header::CONTENT_TYPE) {
            if let Ok(ct) = ct.to_str() {
                *self.content_type.write().await = Some(ct.to_string());
            }
        }
        if self.content_type.read().await.is_none() {
            *self.content_type.write().await = format::infer_mime_type_from_url(&self.media_url).map(|s| s.to_string());
        }

        if let Some(cr) = response.headers().get(reqwest::header::CONTENT_RANGE) {
            if let Ok(cr) = cr.to_str() {
                if let Some(total) = cr.rsplit('/').next().and_then(|s| s.parse::<i64>().ok()) {
                    self.content_length.store(total, Ordering::SeqCst);
                }
            }
        } else if let Some(len) = response.content_length() {
            self.content_length.store(len as i64, Ordering::SeqCst);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CacheError::Download(DownloadError::Network(e)))?;
        Ok(bytes.to_vec())
    }

    fn header_map(&self) -> reqwest::header::HeaderMap {
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::try_from(k.as_str()),
                reqwest::header::HeaderValue::try_from(v.as_str()),
            ) {
                map.insert(name, value);
            }
        }
        map
    }

    /// Lay out fixed-size segments over `[0, contentLength)`, enlarging
    /// the segment size rather than the count if the naive layout would
    /// exceed `maxSegmentCount` (spec §4.2).
    async fn layout_segments(&self) -> Result<(), CacheError> {
        let content_length = self.content_length().max(0) as u64;
        if content_length == 0 {
            return Ok(());
        }
        let mut segment_size = self.config.segment_size;
        let naive_count = content_length.div_ceil(segment_size) as usize;
        if naive_count > self.config.max_segment_count {
            segment_size = content_length.div_ceil(self.config.max_segment_count as u64);
            let recomputed = content_length.div_ceil(segment_size) as usize;
            if recomputed > self.config.max_segment_count {
                return Err(CacheError::Download(DownloadError::TooManySegments));
            }
        }

        let mut segments = Vec::new();
        let mut start = 0u64;
        while start < content_length {
            let end = (start + segment_size - 1).min(content_length - 1);
            segments.push(Arc::new(Segment::new(start, end)));
            start = end + 1;
        }
        *self.segments.write().await = segments;
        Ok(())
    }

    /// Segments overlapping `[range_start, range_end]`, ordered by start
    /// byte. Lazily lays out the segment list if it's still empty and the
    /// content length has since become known.
    pub async fn get_segments_for_range(self: &Arc<Self>, range_start: u64, range_end: u64) -> Vec<Arc<Segment>> {
        if self.segments.read().await.is_empty() && self.content_length() > 0 {
            let _ = self.layout_segments().await;
        }
        self.segments
            .read()
            .await
            .iter()
            .filter(|s| s.start_byte <= range_end && s.end_byte >= range_start)
            .cloned()
            .collect()
    }

    pub async fn all_segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().await.clone()
    }

    /// Apply a status/progress update and persist it — synchronously for
    /// terminal transitions (`Completed`/`Failed`), debounced otherwise
    /// (spec §4.2: config.json writes are coalesced to at most once per
    /// `configSaveInterval`, except terminal states flush immediately).
    pub async fn update_segment_status(self: &Arc<Self>, segment: &Arc<Segment>, status: SegmentStatus) {
        segment.set_status(status).await;
        let terminal = matches!(status, SegmentStatus::Completed | SegmentStatus::Failed);
        if terminal {
            let _ = self.flush_config(true).await;
        } else {
            self.schedule_debounced_flush();
        }
    }

    fn schedule_debounced_flush(self: &Arc<Self>) {
        if self
            .flush_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let task = self.clone();
        let interval = self.config.config_save_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            task.flush_scheduled.store(false, Ordering::SeqCst);
            let _ = task.flush_config(false).await;
        });
    }

    async fn flush_config(&self, _sync: bool) -> Result<(), CacheError> {
        let segments = self.segments.read().await;
        let mut records = Vec::with_capacity(segments.len());
        for s in segments.iter() {
            records.push(s.to_record().await);
        }
        drop(segments);

        let cfg = ConfigFile {
            url: self.media_url.clone(),
            request_headers: if self.headers.is_empty() { None } else { Some(self.headers.clone()) },
            content_length: self.content_length(),
            content_type: self.content_type().await,
            moov_at_start: self.moov_at_start().await,
            last_access_time: self.last_access_time(),
            segments: records,
        };
        let bytes = serde_json::to_vec_pretty(&cfg).map_err(|e| CacheError::ConfigCorrupt(e.to_string()))?;
        let tmp_path = self.config_path().with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, self.config_path()).await?;
        Ok(())
    }

    /// If this is an MP4 with `moov` known to trail the file, make sure the
    /// last segment is queued at high priority so it's ready before a
    /// seek-to-end or duration probe needs it. Idempotent: only resets
    /// itself to retry if the earlier attempt failed.
    pub async fn preload_moov_segment(self: &Arc<Self>) {
        if !self.is_mp4().await || self.moov_at_start().await != MoovPosition::AtEnd {
            return;
        }
        if self.moov_preloaded.load(Ordering::SeqCst) {
            return;
        }
        let last = { self.segments.read().await.last().cloned() };
        let Some(last) = last else { return };
        if matches!(last.status().await, SegmentStatus::Completed | SegmentStatus::Downloading) {
            return;
        }

        self.moov_preloaded.store(true, Ordering::SeqCst);
        let task = self.clone();
        self.queue
            .enqueue(QueueItem::new(
                self.media_url.clone(),
                last,
                self.cache_dir.clone(),
                self.headers.clone(),
                priority::PLAYING_URGENT_MINUS_50,
                self.cancel_token(),
                |_| {},
                move |success| {
                    if !success {
                        task.moov_preloaded.store(false, Ordering::SeqCst);
                    }
                },
            ))
            .await;
    }
}
