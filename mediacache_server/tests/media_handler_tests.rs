use std::time::Duration;

use mediacache_core::config::Config;
use mediacache_core::manager::DownloadManager;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "../src/server.rs"]
mod server;

async fn spawn_proxy(cache_root: std::path::PathBuf, config: Config) -> String {
    let manager = DownloadManager::new(cache_root, config).unwrap();
    let state = server::AppState::new(manager);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn serves_a_range_request_by_downloading_the_covering_segment() {
    let upstream = MockServer::start().await;
    let body = vec![42u8; 2048];
    let full_body = body.clone();
    Mock::given(method("GET"))
        .and(path("/video.mp4"))
        .respond_with(move |req: &wiremock::Request| {
            let range = req.headers.get("Range").unwrap().to_str().unwrap().to_string();
            let spec = range.strip_prefix("bytes=").unwrap();
            let (start_str, end_str) = spec.split_once('-').unwrap();
            let start: usize = start_str.parse().unwrap();
            let end: usize = end_str.parse().unwrap_or(full_body.len() - 1);
            let end = end.min(full_body.len() - 1);
            ResponseTemplate::new(206)
                .set_body_bytes(full_body[start..=end].to_vec())
                .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, full_body.len()))
                .insert_header("Content-Type", "video/mp4")
        })
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.segment_size = 2048;
    config.moov_detection_bytes = 16;
    config.redownload_wait_timeout = Duration::from_millis(200);
    config.redownload_max_attempts = 20;

    let proxy_addr = spawn_proxy(dir.path().to_path_buf(), config).await;

    let media_url = format!("{}/video.mp4", upstream.uri());
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/media?url={}", proxy_addr, urlencoding_encode(&media_url)))
        .header("Range", "bytes=0-2047")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 206);
    let content_range = response
        .headers()
        .get("content-range")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(content_range, "bytes 0-2047/2048");
    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.as_ref(), body.as_slice());
}

#[tokio::test]
async fn health_endpoint_reports_task_and_session_counts() {
    let dir = tempfile::tempdir().unwrap();
    let proxy_addr = spawn_proxy(dir.path().to_path_buf(), Config::default()).await;

    let client = reqwest::Client::new();
    let response = client.get(format!("{}/health", proxy_addr)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["tasks"], 0);
}

#[tokio::test]
async fn missing_url_param_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let proxy_addr = spawn_proxy(dir.path().to_path_buf(), Config::default()).await;

    let client = reqwest::Client::new();
    let response = client.get(format!("{}/media", proxy_addr)).send().await.unwrap();
    assert_eq!(response.status(), 400);
}

/// Minimal percent-encoding for the one query value this test needs —
/// avoids pulling in a URL-encoding crate just for the test suite.
fn urlencoding_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
