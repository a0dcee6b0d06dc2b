//! `ProxyServer`: the HTTP front door (spec §4.5). A GET to `/media` is
//! answered by streaming bytes out of the on-disk cache while the
//! segment downloader fills in whatever isn't there yet — grounded in
//! the range-based progressive stream pattern used elsewhere in the pack
//! for serving cached media chunks over HTTP (`cache-proxy.rs`'s
//! `create_range_based_progressive_stream`), adapted from a
//! chunk-index/ChunkManager model to this crate's segment/Segment model.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use futures::Stream;
use mediacache_core::config::priority;
use mediacache_core::manager::DownloadManager;
use mediacache_core::queue::QueueItem;
use mediacache_core::segment::{Segment, SegmentStatus};
use mediacache_core::task::DownloadTask;
use tower_http::cors::{Any, CorsLayer};

pub struct AppState {
    pub manager: Arc<DownloadManager>,
    sessions: AtomicU64,
}

impl AppState {
    pub fn new(manager: Arc<DownloadManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            sessions: AtomicU64::new(0),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/media", get(media_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, serde::Deserialize)]
struct MediaQuery {
    url: Option<String>,
    headers: Option<String>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "tasks": state.manager.task_count().await,
        "sessions": state.sessions.load(Ordering::SeqCst),
    }))
}

/// Decode the `headers` query param: base64url(JSON object of string→string).
fn decode_headers(encoded: &str) -> Result<HashMap<String, String>, StatusCode> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)
}

async fn media_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(url) = query.url else {
        return (StatusCode::BAD_REQUEST, "missing 'url' query parameter").into_response();
    };
    let request_headers = match query.headers {
        Some(encoded) => match decode_headers(&encoded) {
            Ok(h) => h,
            Err(code) => return (code, "malformed 'headers' query parameter").into_response(),
        },
        None => HashMap::new(),
    };

    let task = match state.manager.get_or_create_task(&url, request_headers).await {
        Ok(task) => task,
        Err(err) => {
            log::error!("[media] url=\"{}\" initialize failed: {}", url, err);
            return (StatusCode::BAD_GATEWAY, err.to_string()).into_response();
        }
    };

    let total_size = task.content_length();
    if total_size < 0 {
        return (StatusCode::BAD_GATEWAY, "unable to determine content length").into_response();
    }
    let total_size = total_size as u64;

    let (start, end, is_partial) = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(range_header) => match parse_range_header(range_header, total_size) {
            Some((s, e)) => (s, e, true),
            None => {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", total_size))
                    .body(axum::body::Body::empty())
                    .unwrap();
            }
        },
        None => (0, total_size.saturating_sub(1), false),
    };

    state.sessions.fetch_add(1, Ordering::SeqCst);
    task.add_session();
    state.manager.queue().set_current_playing(&url).await;

    start_downloads_for_session(&state.manager, &task, start, end, total_size).await;

    let segments = task.get_segments_for_range(start, end).await;
    let cache_dir = task.cache_dir.clone();
    let redownload_wait_timeout = state.manager.config().redownload_wait_timeout;
    let redownload_max_attempts = state.manager.config().redownload_max_attempts;

    let guard = SessionGuard {
        state: state.clone(),
        task: task.clone(),
    };
    let body_stream = stream_range(
        segments,
        start,
        end,
        cache_dir,
        redownload_wait_timeout,
        redownload_max_attempts,
        state.manager.clone(),
        task.clone(),
        guard,
    );

    let content_type = task
        .content_type()
        .await
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let length = end - start + 1;

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, length.to_string())
        .header("Cache-Control", "public, max-age=3600");

    builder = if is_partial {
        builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total_size))
    } else {
        builder.status(StatusCode::OK)
    };

    builder.body(axum::body::Body::from_stream(body_stream)).unwrap()
}

/// Decrements the task's session count (and the process-wide session
/// gauge) when the response body is dropped — whether the client
/// finished reading or disconnected mid-stream.
struct SessionGuard {
    state: Arc<AppState>,
    task: Arc<DownloadTask>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.task.remove_session();
        self.state.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Kick off the downloads this request needs: the segment covering the
/// start of the requested range goes in at urgent priority (held under a
/// startup lock so background work doesn't steal its bandwidth), the
/// rest of the requested range at playing priority, and a window beyond
/// it at preplay priority for smooth continued playback. Also nudges the
/// `moov` tail-segment preload for MP4s that need it.
///
/// Cold start (no segment of this task has ever completed) only enqueues
/// the critical set — the first playback segment, plus the `moov` tail
/// handled separately below — so background prefetch can't steal
/// bandwidth from the very first bytes the player needs.
async fn start_downloads_for_session(
    manager: &Arc<DownloadManager>,
    task: &Arc<DownloadTask>,
    start: u64,
    end: u64,
    total_size: u64,
) {
    let queue = manager.queue();
    let config = manager.config();
    let prefetch_end = (end + config.prefetch_window_bytes).min(total_size.saturating_sub(1));
    let segments = task.get_segments_for_range(start, prefetch_end).await;

    let mut any_completed = false;
    for s in task.all_segments().await.iter() {
        if matches!(s.status().await, SegmentStatus::Completed) {
            any_completed = true;
            break;
        }
    }
    let cold_start = !any_completed;

    queue.update_startup_lock(&task.media_url, 1).await;
    let mut urgent_done = false;
    let mut first_playback_enqueued = false;

    for segment in &segments {
        let in_requested_range = segment.start_byte <= end && segment.end_byte >= start;
        let is_first_playback_segment = in_requested_range && !urgent_done;

        if matches!(segment.status().await, SegmentStatus::Completed) {
            if is_first_playback_segment {
                urgent_done = true;
            }
            continue;
        }

        if cold_start && !is_first_playback_segment {
            continue;
        }

        if is_first_playback_segment {
            urgent_done = true;
            first_playback_enqueued = true;
            let media_url = task.media_url.clone();
            let queue_for_release = queue.clone();
            queue
                .enqueue(QueueItem::new(
                    task.media_url.clone(),
                    segment.clone(),
                    task.cache_dir.clone(),
                    task.headers.clone(),
                    priority::PLAYING_URGENT,
                    task.cancel_token(),
                    |_| {},
                    move |_success| {
                        tokio::spawn(async move {
                            queue_for_release.update_startup_lock(&media_url, -1).await;
                        });
                    },
                ))
                .await;
        } else {
            let segment_priority = if in_requested_range { priority::PLAYING } else { priority::PREPLAY };
            enqueue_segment(manager, task, segment.clone(), segment_priority).await;
        }
    }

    if !first_playback_enqueued {
        // The first-playback segment was already `Completed` (or the
        // requested range had no covering segment at all), so nothing's
        // `onComplete` would ever release the lock — release it now.
        queue.update_startup_lock(&task.media_url, -1).await;
    }

    task.preload_moov_segment().await;
}

async fn enqueue_segment(manager: &Arc<DownloadManager>, task: &Arc<DownloadTask>, segment: Arc<Segment>, priority: i32) {
    manager
        .queue()
        .enqueue(QueueItem::new(
            task.media_url.clone(),
            segment,
            task.cache_dir.clone(),
            task.headers.clone(),
            priority,
            task.cancel_token(),
            |_| {},
            |_| {},
        ))
        .await;
}

/// Re-enqueue a segment found corrupt on disk at urgent priority, matching
/// spec §4.5 point 2 / §7: the player is actively waiting on this byte
/// range, so it outranks ordinary playing/preplay work.
fn requeue_corrupt_segment(manager: &Arc<DownloadManager>, task: &Arc<DownloadTask>, segment: &Arc<Segment>) {
    let manager = manager.clone();
    let task = task.clone();
    let segment = segment.clone();
    tokio::spawn(async move {
        manager
            .queue()
            .enqueue(QueueItem::new(
                task.media_url.clone(),
                segment,
                task.cache_dir.clone(),
                task.headers.clone(),
                priority::PLAYING_URGENT,
                task.cancel_token(),
                |_| {},
                |_| {},
            ))
            .await;
    });
}

#[allow(clippy::too_many_arguments)]
fn stream_range(
    segments: Vec<Arc<Segment>>,
    start: u64,
    end: u64,
    cache_dir: PathBuf,
    wait_timeout: Duration,
    max_wait_attempts: u32,
    manager: Arc<DownloadManager>,
    task: Arc<DownloadTask>,
    guard: SessionGuard,
) -> impl Stream<Item = Result<bytes::Bytes, io::Error>> {
    async_stream::stream! {
        let _guard = guard;
        let mut cursor = start;

        for segment in segments {
            if cursor > end {
                break;
            }
            let overlap_start = cursor.max(segment.start_byte);
            let overlap_end = end.min(segment.end_byte);
            if overlap_start > overlap_end {
                continue;
            }

            let mut read_from = overlap_start;
            let mut attempts = 0u32;
            let mut redownload_attempts = 0u32;
            let mut self_triggered_failed = false;
            while read_from <= overlap_end {
                let status = segment.status().await;
                if status == SegmentStatus::Failed {
                    if self_triggered_failed && redownload_attempts < max_wait_attempts {
                        segment.wait_for_data(wait_timeout).await;
                        continue;
                    }
                    yield Err(io::Error::other(format!(
                        "segment {}-{} failed", segment.start_byte, segment.end_byte
                    )));
                    return;
                }
                self_triggered_failed = false;

                let available_end = if status == SegmentStatus::Completed {
                    let final_path = segment.final_path(&cache_dir);
                    let on_disk_len = tokio::fs::metadata(&final_path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    if on_disk_len < segment.expected_size() {
                        if redownload_attempts >= max_wait_attempts {
                            yield Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!(
                                    "segment {}-{} stayed corrupt after {} redownload attempts",
                                    segment.start_byte, segment.end_byte, max_wait_attempts
                                ),
                            ));
                            return;
                        }
                        log::warn!(
                            "[stream] segment {}_{} marked Completed but only {}/{} bytes on disk; re-downloading",
                            segment.start_byte, segment.end_byte, on_disk_len, segment.expected_size()
                        );
                        task.update_segment_status(&segment, SegmentStatus::Failed).await;
                        requeue_corrupt_segment(&manager, &task, &segment);
                        redownload_attempts += 1;
                        self_triggered_failed = true;
                        segment.wait_for_data(wait_timeout).await;
                        continue;
                    }
                    segment.end_byte
                } else {
                    let downloaded = segment.downloaded_bytes().await;
                    if downloaded == 0 {
                        segment.start_byte.wrapping_sub(1)
                    } else {
                        segment.start_byte + downloaded - 1
                    }
                };

                if available_end < read_from {
                    if attempts >= max_wait_attempts {
                        yield Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("timed out waiting for segment {}-{}", segment.start_byte, segment.end_byte),
                        ));
                        return;
                    }
                    attempts += 1;
                    segment.wait_for_data(wait_timeout).await;
                    continue;
                }
                attempts = 0;

                let read_to = available_end.min(overlap_end);
                let local_offset = read_from - segment.start_byte;
                let len = (read_to - read_from + 1) as usize;
                let path = if status == SegmentStatus::Completed {
                    segment.final_path(&cache_dir)
                } else {
                    segment.temp_path(&cache_dir)
                };

                match read_slice(&path, local_offset, len).await {
                    Ok(data) => {
                        read_from = read_to + 1;
                        yield Ok(data);
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
            cursor = overlap_end + 1;
        }
    }
}

async fn read_slice(path: &std::path::Path, offset: u64, len: usize) -> io::Result<bytes::Bytes> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(bytes::Bytes::from(buf))
}

/// Parse a single-range `Range: bytes=start-end` header (spec §4.5). Only
/// the first range in a (possibly multi-range) header is honored;
/// multi-range requests are out of scope.
fn parse_range_header(range: &str, total_size: u64) -> Option<(u64, u64)> {
    let spec = range.strip_prefix("bytes=")?;
    let first = spec.split(',').next()?.trim();
    let (start_str, end_str) = first.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 || suffix_len > total_size {
            return Some((0, total_size.saturating_sub(1)));
        }
        return Some((total_size - suffix_len, total_size - 1));
    }

    let start: u64 = start_str.parse().ok()?;
    let end: u64 = if end_str.is_empty() {
        total_size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if start > end || start >= total_size {
        return None;
    }
    Some((start, end.min(total_size - 1)))
}
