//! Conditional-GET and byte-range serving, shared by the asset handler and
//! the `response`/`filesystem` providers' `ServeContent`/`ServeFile` hijack
//! methods: a standard content server helper that consumes a seekable
//! reader and modtime.

use std::time::{SystemTime, UNIX_EPOCH};

use http::header::{CONTENT_RANGE, RANGE};

use crate::http::{
    Bytes, HeaderMap, HeaderValue, IntoResponse, Response, StatusCode, ACCEPT_RANGES,
    CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, VARY,
};

/// Static metadata a served body carries into conditional-GET negotiation.
#[derive(Debug, Clone, Default)]
pub struct ContentMeta {
    pub etag: Option<String>,
    pub modified: Option<SystemTime>,
    pub content_type: Option<String>,
    pub content_encoding: Option<&'static str>,
    pub cache_control: Option<&'static str>,
    pub vary_accept_encoding: bool,
}

fn httpdate(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

fn parse_httpdate(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value).ok()
}

/// `ETag`-quotes a raw token: `Etag "\"<hash>\""`.
fn quoted(tag: &str) -> String {
    format!("\"{tag}\"")
}

fn if_none_match_hits(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let quoted_etag = quoted(etag);
    value.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || candidate == quoted_etag || candidate.trim_start_matches("W/") == quoted_etag
    })
}

fn if_modified_since_hits(headers: &HeaderMap, modified: SystemTime) -> bool {
    let Some(value) = headers.get(IF_MODIFIED_SINCE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(since) = parse_httpdate(value) else { return false };
    // HTTP dates are second-resolution; truncate both sides before comparing.
    let modified_secs = modified.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let since_secs = since.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    modified_secs <= since_secs
}

struct Range {
    start: u64,
    end: u64,
}

fn parse_range(headers: &HeaderMap, total_len: u64) -> Option<Range> {
    let value = headers.get(RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    // Only a single range is supported; multi-range responses are out of
    // scope for this adapter.
    let (start_s, end_s) = spec.split_once('-')?;
    if total_len == 0 {
        return None;
    }
    let (start, end) = if start_s.is_empty() {
        // suffix range: last N bytes
        let suffix_len: u64 = end_s.parse().ok()?;
        let suffix_len = suffix_len.min(total_len);
        (total_len - suffix_len, total_len - 1)
    } else {
        let start: u64 = start_s.parse().ok()?;
        let end: u64 = if end_s.is_empty() {
            total_len.saturating_sub(1)
        } else {
            end_s.parse::<u64>().ok()?.min(total_len.saturating_sub(1))
        };
        (start, end)
    };
    if start > end || start >= total_len {
        return None;
    }
    Some(Range { start, end })
}

/// Serves `body` against `request_headers` honoring `If-None-Match`,
/// `If-Modified-Since`, and a single-range `Range` request.
pub fn serve_bytes(body: Bytes, meta: &ContentMeta, request_headers: &HeaderMap) -> Response {
    if let Some(etag) = &meta.etag {
        if if_none_match_hits(request_headers, etag) {
            return not_modified(meta);
        }
    }
    if meta.etag.is_none() {
        if let Some(modified) = meta.modified {
            if if_modified_since_hits(request_headers, modified) {
                return not_modified(meta);
            }
        }
    }

    let total_len = body.len() as u64;
    let mut headers = HeaderMap::new();
    apply_common_headers(&mut headers, meta);
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(range) = parse_range(request_headers, total_len) {
        let slice = body.slice(range.start as usize..=range.end as usize);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(slice.len()));
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", range.start, range.end, total_len))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        return (StatusCode::PARTIAL_CONTENT, headers, slice).into_response();
    }

    headers.insert(CONTENT_LENGTH, HeaderValue::from(total_len));
    (StatusCode::OK, headers, body).into_response()
}

fn not_modified(meta: &ContentMeta) -> Response {
    let mut headers = HeaderMap::new();
    apply_common_headers(&mut headers, meta);
    (StatusCode::NOT_MODIFIED, headers).into_response()
}

fn apply_common_headers(headers: &mut HeaderMap, meta: &ContentMeta) {
    if let Some(etag) = &meta.etag {
        if let Ok(value) = HeaderValue::from_str(&quoted(etag)) {
            headers.insert(ETAG, value);
        }
    }
    if let Some(modified) = meta.modified {
        if let Ok(value) = HeaderValue::from_str(&httpdate(modified)) {
            headers.insert(LAST_MODIFIED, value);
        }
    }
    if let Some(ct) = &meta.content_type {
        if let Ok(value) = HeaderValue::from_str(ct) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    if let Some(enc) = meta.content_encoding {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(enc));
    }
    if let Some(cc) = meta.cache_control {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(cc));
    }
    if meta.vary_accept_encoding {
        headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_none_match_returns_304() {
        let meta = ContentMeta { etag: Some("sha384-abc".into()), ..Default::default() };
        let mut req_headers = HeaderMap::new();
        req_headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"sha384-abc\""));
        let resp = serve_bytes(Bytes::from_static(b"hello"), &meta, &req_headers);
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn range_request_returns_206() {
        let meta = ContentMeta::default();
        let mut req_headers = HeaderMap::new();
        req_headers.insert(RANGE, HeaderValue::from_static("bytes=0-2"));
        let resp = serve_bytes(Bytes::from_static(b"hello world"), &meta, &req_headers);
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    }

    #[test]
    fn plain_request_returns_200_with_length() {
        let meta = ContentMeta::default();
        let resp = serve_bytes(Bytes::from_static(b"hello"), &meta, &HeaderMap::new());
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
