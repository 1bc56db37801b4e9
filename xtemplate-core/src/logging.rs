//! Request identity and per-request logging.
//!
//! A request id is minted-or-propagated once per request and stashed where
//! downstream code can find it, alongside the `tracing`/`tracing-subscriber`
//! setup every instance shares. A per-request `tracing::Span` carries the id
//! by attaching it to the request extensions.

use std::time::Instant;

use crate::http::{HeaderMap, HeaderValue, Request};

/// Header an upstream proxy/load-balancer may have already set; honored in
/// preference to minting a new id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// An upstream-supplied request id, looked up via `Request::extensions()`
/// before falling back to the header and then to minting one. A host
/// integrating this crate with its own reverse-proxy layer inserts this
/// extension upstream of the dispatcher.
#[derive(Debug, Clone)]
pub struct UpstreamRequestId(pub String);

/// Resolves this request's id: upstream extension, then header, then a
/// freshly minted k-sortable id (spec.md §4.J: "otherwise a k-sortable id is
/// minted").
pub fn request_id<B>(req: &Request<B>) -> String {
    if let Some(id) = req.extensions().get::<UpstreamRequestId>() {
        return id.0.clone();
    }
    if let Some(id) = req.headers().get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    mint_request_id()
}

pub fn mint_request_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Derives this request's logger from the instance logger, attaching the
/// request id.
pub fn request_span(instance_logger: &tracing::Span, request_id: &str) -> tracing::Span {
    tracing::info_span!(parent: instance_logger, "request", request_id = %request_id)
}

/// Stamps the response with the request id header so a caller (or a test)
/// can correlate client-observed behavior with server logs.
pub fn stamp_response_header(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

/// Accumulates the data a finished request logs at completion: duration,
/// status code, and bytes written, logged at DEBUG+2 once the response is
/// done. `DEBUG+2` is represented as a `verbosity` field on a `DEBUG`-level
/// event rather than inventing a new `tracing` level.
pub struct ResponseMetrics {
    started: Instant,
}

impl ResponseMetrics {
    pub fn start() -> Self {
        Self { started: Instant::now() }
    }

    pub fn finish(self, span: &tracing::Span, status: u16, bytes_written: usize) {
        let _entered = span.enter();
        tracing::event!(
            tracing::Level::DEBUG,
            verbosity = 2,
            status,
            bytes_written,
            duration_ms = self.started.elapsed().as_secs_f64() * 1000.0,
            "response completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HeaderMap as Headers, Method, Request as HttpRequest};

    #[test]
    fn uses_header_when_no_upstream_extension() {
        let mut req = HttpRequest::builder()
            .method(Method::GET)
            .uri("/")
            .body(())
            .unwrap();
        req.headers_mut().insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(request_id(&req), "abc-123");
    }

    #[test]
    fn mints_an_id_when_nothing_supplied() {
        let req = HttpRequest::builder().method(Method::GET).uri("/").body(()).unwrap();
        let id = request_id(&req);
        assert!(!id.is_empty());
    }

    #[test]
    fn upstream_extension_takes_precedence_over_header() {
        let mut req = HttpRequest::builder().method(Method::GET).uri("/").body(()).unwrap();
        req.headers_mut().insert(REQUEST_ID_HEADER, HeaderValue::from_static("from-header"));
        req.extensions_mut().insert(UpstreamRequestId("from-upstream".to_string()));
        assert_eq!(request_id(&req), "from-upstream");
    }

    #[test]
    fn stamp_response_header_sets_value() {
        let mut headers = Headers::new();
        stamp_response_header(&mut headers, "req-1");
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-1");
    }
}
