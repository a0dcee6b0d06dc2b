use std::io;

/// Errors surfaced while downloading a single segment.
///
/// Mirrors the shape of the teacher's `DownloadError` (thiserror, one
/// variant per failure mode) but adds `DiskFull`, which the queue needs
/// to distinguish from an ordinary disk error so it can trigger
/// emergency eviction instead of a retry.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("disk error: {0}")]
    Disk(#[from] io::Error),
    #[error("disk full")]
    DiskFull,
    #[error("upstream responded with unexpected status {0}")]
    BadStatus(u16),
    #[error("read timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("max retries exceeded")]
    MaxRetryExceeded,
    #[error("response body shorter than the expected segment size")]
    ShortBody,
    #[error("segment count would exceed the configured ceiling")]
    TooManySegments,
}

impl DownloadError {
    /// Classify an I/O error: disk-full (`ENOSPC`) gets its own variant so
    /// the retry wrapper can abort immediately instead of burning attempts.
    pub fn from_io(err: io::Error) -> Self {
        let is_disk_full = err.raw_os_error() == Some(28) || err.to_string().contains("No space left");
        if is_disk_full {
            DownloadError::DiskFull
        } else {
            DownloadError::Disk(err)
        }
    }
}

/// Errors surfaced by the task registry / eviction machinery.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("disk error: {0}")]
    Disk(#[from] io::Error),
    #[error("config corrupt: {0}")]
    ConfigCorrupt(String),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Errors surfaced at the HTTP proxy boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing required 'url' query parameter")]
    MissingUrl,
    #[error("malformed 'headers' query parameter")]
    MalformedHeaders,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_enospc_as_disk_full() {
        let err = io::Error::from_raw_os_error(28);
        assert!(matches!(DownloadError::from_io(err), DownloadError::DiskFull));
    }

    #[test]
    fn other_io_errors_stay_disk_errors() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(DownloadError::from_io(err), DownloadError::Disk(_)));
    }
}
