//! MIME-type helpers. Pure lookup functions — no I/O, no state.
//!
//! Grounded in the teacher's `ext_from_mime` table in
//! `multipart_download_strategy.rs` (there: MIME → extension, for naming
//! the assembled output file). Here the direction is reversed and the
//! table is filtered to the media types this proxy actually needs to
//! reason about (range-seekable audio/video containers).

/// Map a file extension (no leading dot, case-insensitive) to a MIME type.
pub fn mime_from_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.trim_start_matches('.').to_lowercase();
    Some(match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "m4a" => "audio/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "3gp" => "video/3gpp",
        "flv" => "video/x-flv",
        "mpg" | "mpeg" => "video/mpeg",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "opus" => "audio/opus",
        _ => return None,
    })
}

/// Best-effort MIME inference from a URL when the upstream response gave
/// no `Content-Type`.
///
/// Open Question 2: if the parsed path component has no extension, fall
/// back to re-scanning the raw URL string for a recognizable extension
/// (e.g. a bare query-string URL like `?file=movie.mp4`). Kept as a
/// defensive fallback per the spec's guidance, not a primary path.
pub fn infer_mime_type_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if let Some(ext) = extension_of(path) {
        if let Some(mime) = mime_from_extension(ext) {
            return Some(mime);
        }
    }
    // Defensive fallback: rescan the raw URL (covers query-embedded filenames).
    extension_of(url).and_then(mime_from_extension)
}

/// Is this MIME type (or file extension) an MP4-family container?
/// Drives whether `moov` detection / tail-prefetch logic applies.
pub fn is_mp4(content_type: &str) -> bool {
    let ct = content_type.split(';').next().unwrap_or(content_type).trim();
    matches!(ct, "video/mp4" | "video/x-m4v" | "audio/mp4")
}

fn extension_of(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let dot = name.rfind('.')?;
    let ext = &name[dot + 1..];
    if ext.is_empty() || ext.len() > 8 {
        None
    } else {
        Some(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_extensions() {
        assert_eq!(mime_from_extension("MP4"), Some("video/mp4"));
        assert_eq!(mime_from_extension("mkv"), Some("video/x-matroska"));
        assert_eq!(mime_from_extension("unknown_ext"), None);
    }

    #[test]
    fn infers_from_path() {
        assert_eq!(
            infer_mime_type_from_url("https://cdn.example.com/movie.mp4?x=1"),
            Some("video/mp4")
        );
    }

    #[test]
    fn infers_from_raw_url_when_path_has_no_extension() {
        // Path component is empty; the filename lives in the query string.
        assert_eq!(
            infer_mime_type_from_url("https://cdn.example.com/stream?file=movie.mp4"),
            Some("video/mp4")
        );
    }

    #[test]
    fn is_mp4_ignores_charset_parameters() {
        assert!(is_mp4("video/mp4; charset=binary"));
        assert!(!is_mp4("video/webm"));
    }
}
