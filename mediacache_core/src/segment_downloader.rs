use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::segment::{Segment, SegmentStatus};

/// Apply caller-supplied headers to a request builder, skipping `Range` —
/// this function always sets its own Range per spec §4.1 step 3, and a
/// forwarded stale `Range` would create a duplicate, confusing the
/// upstream server the same way the teacher's `apply_headers` avoids it
/// in `segment_grabber.rs`.
fn apply_headers(mut builder: reqwest::RequestBuilder, headers: &HashMap<String, String>) -> reqwest::RequestBuilder {
    for (key, value) in headers {
        if key.eq_ignore_ascii_case("range") {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder
}

/// Flush to disk and signal "data available" every 10th chunk, per spec.
const FLUSH_EVERY_N_CHUNKS: u32 = 10;

/// Run a single download attempt for `segment` (spec §4.1 steps 1-8).
///
/// Returns `Ok(true)` on success (segment now `Completed`), `Ok(false)`
/// on cooperative cancellation (segment left `Pending`, resumable), or an
/// `Err` the retry wrapper should classify.
async fn download_segment_once(
    client: &Client,
    media_url: &str,
    segment: &Segment,
    cache_dir: &Path,
    headers: &HashMap<String, String>,
    on_progress: &(dyn Fn(u64) + Send + Sync),
    cancel_token: &CancellationToken,
    read_timeout: Duration,
) -> Result<bool, DownloadError> {
    let expected_size = segment.expected_size();
    let final_path = segment.final_path(cache_dir);
    let temp_path = segment.temp_path(cache_dir);

    // Step 1: already completed or the final file is already there.
    if segment.status().await == SegmentStatus::Completed {
        return Ok(true);
    }
    if let Ok(meta) = tokio::fs::metadata(&final_path).await {
        if meta.len() >= expected_size {
            segment.set_status(SegmentStatus::Completed).await;
            return Ok(true);
        }
    }

    // Step 2: resume from an existing partial temp file.
    let existing_bytes = tokio::fs::metadata(&temp_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if existing_bytes >= expected_size {
        return finalize(segment, &temp_path, &final_path, expected_size).await;
    }
    segment.set_downloaded_bytes(existing_bytes).await;

    segment.set_status(SegmentStatus::Downloading).await;

    // Step 3: ranged GET for the remaining bytes.
    let range_start = segment.start_byte + existing_bytes;
    let range_end = segment.end_byte;
    log::info!(
        "[segment_downloader] requesting url={} range=bytes={}-{}",
        media_url, range_start, range_end
    );
    let builder = client.get(media_url);
    let builder = apply_headers(builder, headers).header("Range", format!("bytes={}-{}", range_start, range_end));
    let response = builder.send().await?;
    let status = response.status();
    if status != reqwest::StatusCode::PARTIAL_CONTENT && status != reqwest::StatusCode::OK {
        segment.set_status(SegmentStatus::Failed).await;
        return Err(DownloadError::BadStatus(status.as_u16()));
    }

    // Step 4: stream the body, appending to the temp file.
    let file = if existing_bytes > 0 {
        tokio::fs::OpenOptions::new().append(true).open(&temp_path).await
    } else {
        tokio::fs::File::create(&temp_path).await
    }
    .map_err(DownloadError::from_io)?;
    let mut writer = tokio::io::BufWriter::new(file);

    let mut stream = response.bytes_stream();
    let mut chunk_count: u32 = 0;
    let mut total_written = existing_bytes;

    loop {
        if cancel_token.is_cancelled() {
            let _ = writer.flush().await;
            segment.set_status(SegmentStatus::Pending).await;
            return Ok(false);
        }

        let next = match tokio::time::timeout(read_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = writer.flush().await;
                return Err(DownloadError::Timeout);
            }
        };

        let Some(chunk_result) = next else { break };
        let chunk = chunk_result?;

        if let Err(err) = writer.write_all(&chunk).await {
            let _ = writer.flush().await;
            return Err(DownloadError::from_io(err));
        }

        total_written += chunk.len() as u64;
        segment.add_downloaded(chunk.len() as u64).await;
        on_progress(chunk.len() as u64);

        chunk_count += 1;
        if chunk_count % FLUSH_EVERY_N_CHUNKS == 0 {
            if let Err(err) = writer.flush().await {
                return Err(DownloadError::from_io(err));
            }
            segment.notify_data_available();
        }
    }

    writer.flush().await.map_err(DownloadError::from_io)?;
    drop(writer);

    // Step 7: a short body never finalizes — treated as a retryable attempt
    // failure rather than a terminal cancellation.
    if total_written < expected_size {
        return Err(DownloadError::ShortBody);
    }

    finalize(segment, &temp_path, &final_path, expected_size).await
}

/// Step 8: commit the temp file as the segment's final artifact.
///
/// If another coroutine already won the finalize race (the `.seg` file is
/// already there with the right length), discard our own temp instead of
/// overwriting — the rename is the single commit point, so only one
/// winner's bytes end up on disk either way.
async fn finalize(
    segment: &Segment,
    temp_path: &Path,
    final_path: &Path,
    expected_size: u64,
) -> Result<bool, DownloadError> {
    if let Ok(meta) = tokio::fs::metadata(final_path).await {
        if meta.len() >= expected_size {
            let _ = tokio::fs::remove_file(temp_path).await;
            segment.set_status(SegmentStatus::Completed).await;
            return Ok(true);
        }
    }
    tokio::fs::rename(temp_path, final_path)
        .await
        .map_err(DownloadError::from_io)?;
    segment.set_status(SegmentStatus::Completed).await;
    Ok(true)
}

/// Public contract: `download(mediaUrl, segment, cacheDir, headers,
/// onProgress, cancelToken) -> bool` (spec §4.1), with the retry wrapper
/// (`downloadRetryCount` attempts, exponential backoff from
/// `downloadRetryInitialDelayMs`) applied around the single attempt.
/// `DiskFullError` aborts the retry loop immediately and propagates.
#[allow(clippy::too_many_arguments)]
pub async fn download(
    client: &Client,
    media_url: &str,
    segment: &Arc<Segment>,
    cache_dir: &Path,
    headers: &HashMap<String, String>,
    on_progress: impl Fn(u64) + Send + Sync,
    cancel_token: &CancellationToken,
    retry_count: u32,
    retry_initial_delay: Duration,
    read_timeout: Duration,
) -> Result<bool, DownloadError> {
    let mut attempt = 0u32;
    loop {
        match download_segment_once(
            client,
            media_url,
            segment,
            cache_dir,
            headers,
            &on_progress,
            cancel_token,
            read_timeout,
        )
        .await
        {
            Ok(outcome) => return Ok(outcome),
            Err(DownloadError::DiskFull) => {
                segment.set_status(SegmentStatus::Failed).await;
                return Err(DownloadError::DiskFull);
            }
            Err(DownloadError::Cancelled) => return Ok(false),
            Err(err) => {
                attempt += 1;
                if attempt >= retry_count {
                    segment.set_status(SegmentStatus::Failed).await;
                    return Err(DownloadError::MaxRetryExceeded);
                }
                log::warn!(
                    "[segment_downloader] attempt {} failed for {}_{}: {}",
                    attempt, segment.start_byte, segment.end_byte, err
                );
                segment.reset_progress().await;
                let delay = retry_initial_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn noop_progress(_: u64) {}

    #[tokio::test]
    async fn downloads_segment_and_renames_to_seg() {
        let server = MockServer::start().await;
        let body = vec![7u8; 10];
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(body.clone())
                    .insert_header("Content-Range", "bytes 0-9/10"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = Client::new();
        let segment = Arc::new(Segment::new(0, 9));
        let url = format!("{}/f", server.uri());
        let ok = download(
            &client,
            &url,
            &segment,
            dir.path(),
            &HashMap::new(),
            noop_progress,
            &CancellationToken::new(),
            3,
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(ok);
        assert_eq!(segment.status().await, SegmentStatus::Completed);
        assert!(!segment.temp_path(dir.path()).exists());
        assert_eq!(tokio::fs::read(segment.final_path(dir.path())).await.unwrap(), body);
    }

    #[tokio::test]
    async fn resumes_from_partial_temp_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(move |req: &wiremock::Request| {
                let range = req.headers.get("Range").unwrap().to_str().unwrap().to_string();
                assert_eq!(range, "bytes=4-9");
                ResponseTemplate::new(206)
                    .set_body_bytes(vec![9u8; 6])
                    .insert_header("Content-Range", "bytes 4-9/10")
            })
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let segment = Arc::new(Segment::new(0, 9));
        tokio::fs::write(segment.temp_path(dir.path()), vec![1u8; 4]).await.unwrap();

        let client = Client::new();
        let url = format!("{}/f", server.uri());
        let ok = download(
            &client,
            &url,
            &segment,
            dir.path(),
            &HashMap::new(),
            noop_progress,
            &CancellationToken::new(),
            3,
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(ok);
        let final_bytes = tokio::fs::read(segment.final_path(dir.path())).await.unwrap();
        assert_eq!(final_bytes, vec![1, 1, 1, 1, 9, 9, 9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn short_body_fails_without_finalizing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8; 3]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let segment = Arc::new(Segment::new(0, 9));
        let client = Client::new();
        let url = format!("{}/f", server.uri());
        let err = download(
            &client,
            &url,
            &segment,
            dir.path(),
            &HashMap::new(),
            noop_progress,
            &CancellationToken::new(),
            1,
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::MaxRetryExceeded));
        assert_eq!(segment.status().await, SegmentStatus::Failed);
        assert!(!segment.final_path(dir.path()).exists());
    }
}
