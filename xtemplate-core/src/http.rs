//! Thin re-export of the HTTP types used across this crate.
//!
//! A single place that picks the concrete `axum`/`http`/`bytes` types so the
//! rest of the crate never names those dependencies directly.

pub use axum::body::Body;
pub use axum::response::sse::{Event as SseEvent, KeepAlive as SseKeepAlive};
pub use axum::response::{Html, IntoResponse, Response, Sse};
pub use bytes::Bytes;
pub use http::header::{
    self, ACCEPT, ACCEPT_ENCODING, ACCEPT_RANGES, CACHE_CONTROL, CONNECTION, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_TYPE, COOKIE, ETAG, HeaderName, HeaderValue, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, VARY,
};
pub use http::request::Parts as RequestParts;
pub use http::{HeaderMap, Method, Request, StatusCode, Uri};
