//! Request handler kinds: buffered template, streaming/SSE template, and
//! static asset. This is the module `dot/flush.rs` and
//! `dot/sql.rs` refer to when they explain why blocking inside a dot
//! provider method is sound: template execution always runs inside
//! `tokio::task::spawn_blocking` here, never directly on a runtime worker.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::dot::flush::StreamSink;
use crate::dot::response::ResponseState;
use crate::dot::{DotValue, ExecError, ProviderContext};
use crate::error::{AppError, ExecOutcome};
use crate::http::{
    Body, Bytes, HeaderMap, HeaderValue, IntoResponse, Method, Request, Response, StatusCode, Uri,
    ACCEPT, ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE,
};
use crate::instance::{Instance, RouteTarget};
use crate::logging::{self, ResponseMetrics};

/// Body size this adapter buffers fully before handing bytes to the
/// `request` dot provider. Streaming request bodies are out of scope; only
/// streaming *responses* are supported.
const MAX_BUFFERED_BODY: usize = 16 * 1024 * 1024;

/// Top-level request entry point a [`crate::server::Server`] calls for every
/// request against the current [`Instance`] — always re-reads the live
/// instance per request.
pub async fn dispatch(instance: Instance, req: Request<Body>) -> Response {
    let request_id = logging::request_id(&req);
    let span = logging::request_span(instance.logger(), &request_id);
    let _entered = span.enter();
    let metrics = ResponseMetrics::start();

    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = clean_path(parts.uri.path());
    let body_bytes = match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(b) => b,
        Err(_) => {
            let response = AppError::Internal("failed to read request body".to_string()).into_response();
            let status = response.status().as_u16();
            metrics.finish(&span, status, 0);
            return response;
        }
    };

    if let Some((target, path_vars)) = instance.router().route(&method, &path) {
        match target.clone() {
            RouteTarget::Buffered(name) => {
                let mut response =
                    buffered_handler(&instance, &parts.headers, &method, &parts.uri, &body_bytes, path_vars, &name).await;
                logging::stamp_response_header(response.headers_mut(), &request_id);
                let status = response.status().as_u16();
                metrics.finish(&span, status, content_length_of(&response));
                return response;
            }
            RouteTarget::Streaming(name) => {
                // The body hasn't been written yet (it streams out after this
                // function returns), so the byte count isn't known until it
                // has: `metrics` is handed to the body stream itself and
                // finishes there, once the stream is fully drained.
                let mut response = streaming_handler(
                    &instance,
                    &parts.headers,
                    &method,
                    &parts.uri,
                    &body_bytes,
                    path_vars,
                    &name,
                    span.clone(),
                    metrics,
                )
                .await;
                logging::stamp_response_header(response.headers_mut(), &request_id);
                return response;
            }
        }
    }

    let mut response = if method == Method::GET || method == Method::HEAD {
        asset_handler(&instance, &path, parts.uri.query(), &parts.headers).await
    } else {
        AppError::NotFound.into_response()
    };
    logging::stamp_response_header(response.headers_mut(), &request_id);
    let status = response.status().as_u16();
    metrics.finish(&span, status, content_length_of(&response));
    response
}

/// Reads back the `Content-Length` a handler already set (the buffered
/// handler and `content::serve_bytes` both set it explicitly) for the
/// response-metrics bytes-written field; `0` for a body whose length isn't
/// known synchronously (e.g. an error response with no body).
fn content_length_of(response: &Response) -> usize {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Normalizes a request path the way the asset/router lookups expect:
/// percent-decoded, with a single leading `/` and no trailing `/` (other
/// than the root itself).
fn clean_path(raw: &str) -> String {
    let decoded = percent_encoding::percent_decode_str(raw).decode_utf8_lossy().into_owned();
    if decoded.len() > 1 && decoded.ends_with('/') {
        decoded.trim_end_matches('/').to_string()
    } else {
        decoded
    }
}

/// Runs [`crate::template::TemplateEngine::render_to_write`] off the async
/// runtime (spec.md §5, §9: template execution is the only place user code —
/// a dot provider, a `try`-wrapped function — might block), into an owned
/// buffer rather than `render`'s all-or-nothing `String`: a `return`/
/// `ReturnStatus` abort signal unwinds minijinja's evaluation with an `Err`,
/// but whatever the template already wrote before that point must still
/// reach the response body (spec.md §4.I/§7), and `render` has no way to
/// hand back partial output alongside its error.
async fn render_buffered(instance: Instance, name: String, dot: DotValue) -> (Vec<u8>, Result<(), minijinja::Error>) {
    tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        let result = instance.render_template_to_write(&name, dot.as_value(), &mut buf);
        (buf, result)
    })
    .await
    .unwrap_or_else(|join_err| {
        (
            Vec::new(),
            Err(minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("template execution panicked: {join_err}"),
            )),
        )
    })
}

async fn render_to_write_blocking(
    instance: Instance,
    name: String,
    dot: DotValue,
    sink: Arc<StreamSink>,
) -> Result<(), minijinja::Error> {
    tokio::task::spawn_blocking(move || {
        let mut writer: &StreamSink = &sink;
        instance.render_template_to_write(&name, dot.as_value(), &mut writer)
    })
    .await
    .unwrap_or_else(|join_err| {
        Err(minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("template execution panicked: {join_err}"),
        ))
    })
}

/// Wraps the streaming body's channel stream to count bytes as they actually
/// drain to the client, logging the same response-metrics event the buffered
/// and asset handlers log synchronously (spec.md §4.J) once the stream ends
/// — the true byte count for a chunked body isn't known any earlier than
/// that.
struct CountingStream<S> {
    inner: S,
    counted: usize,
    span: tracing::Span,
    status: u16,
    metrics: Option<ResponseMetrics>,
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.counted += chunk.len();
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                if let Some(metrics) = this.metrics.take() {
                    metrics.finish(&this.span, this.status, this.counted);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Buffered template handler (spec.md §4.F): assembles the buffered dot
/// value, executes the template into a string, then (on success) merges
/// headers and writes status + body.
async fn buffered_handler(
    instance: &Instance,
    headers: &HeaderMap,
    method: &Method,
    uri: &Uri,
    body: &Bytes,
    path_vars: Vec<(String, String)>,
    name: &str,
) -> Response {
    let request_cancel = CancellationToken::new();
    let ctx = ProviderContext {
        server_cancel: instance.cancellation(),
        request_cancel: &request_cancel,
        method,
        uri,
        headers,
        body,
        path_vars: &path_vars,
        field_name: "",
        settings: instance.user_config(),
        instance,
        sink: None,
    };

    let dot = match instance.buffered_plan().assemble(&ctx).await {
        Ok(dot) => dot,
        Err(err) => {
            tracing::error!(error = %err, template = name, "dot provider failed to initialize");
            return AppError::Internal(err.to_string()).into_response();
        }
    };

    let (body_bytes, render_result) = render_buffered(instance.clone(), name.to_string(), dot.clone()).await;
    let outcome = dot.signal().resolve(render_result);

    let exec_error = match &outcome {
        ExecOutcome::Error(err) => Some(ExecError::from(err)),
        ExecOutcome::Ok | ExecOutcome::Hijack(_) => None,
    };
    let cleanup_error = instance.buffered_plan().cleanup(&dot, exec_error).await;

    if let Some(err) = cleanup_error {
        tracing::error!(error = %err, template = name, "dot provider cleanup failed");
        return AppError::Internal(err.to_string()).into_response();
    }

    match outcome {
        ExecOutcome::Hijack(response) => response,
        ExecOutcome::Error(err) => {
            tracing::error!(error = %err, template = name, "template execution failed");
            AppError::Internal(err.to_string()).into_response()
        }
        ExecOutcome::Ok => {
            let mut response_headers = HeaderMap::new();
            let mut status = StatusCode::OK;
            if let Some(field) = instance.response_field() {
                let state = dot.field(field).cloned().and_then(|v| v.downcast_object::<ResponseState>());
                if let Some(state) = state {
                    status = StatusCode::from_u16(state.status()).unwrap_or(StatusCode::OK);
                    state.apply_to(&mut response_headers);
                }
            }
            response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
            response_headers.insert(CONTENT_LENGTH, HeaderValue::from(body_bytes.len()));
            (status, response_headers, body_bytes).into_response()
        }
    }
}

/// Streaming (SSE) template handler (spec.md §4.F): writes response headers
/// immediately, then runs template execution in a spawned task that writes
/// chunks into a channel-backed body stream. Cancellation is derived from
/// the body stream's receiver being dropped (client disconnect).
async fn streaming_handler(
    instance: &Instance,
    headers: &HeaderMap,
    _method: &Method,
    uri: &Uri,
    body: &Bytes,
    path_vars: Vec<(String, String)>,
    name: &str,
    span: tracing::Span,
    metrics: ResponseMetrics,
) -> Response {
    let accepts_event_stream = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream") || v.contains("*/*"))
        .unwrap_or(false);
    if !accepts_event_stream {
        let response = AppError::NotAcceptable("Accept: text/event-stream required".to_string()).into_response();
        metrics.finish(&span, response.status().as_u16(), content_length_of(&response));
        return response;
    }

    let request_cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = StreamSink::new(tx.clone());

    let owned_method = Method::GET;
    let owned_uri = uri.clone();
    let owned_headers = headers.clone();
    let owned_body = body.clone();
    let owned_name = name.to_string();
    let owned_instance = instance.clone();
    let owned_request_cancel = request_cancel.clone();

    // Cancel on client disconnect: `closed()` resolves once the receiver
    // (the response body stream) is dropped.
    tokio::spawn({
        let tx_for_close = tx.clone();
        let request_cancel = request_cancel.clone();
        async move {
            tx_for_close.closed().await;
            request_cancel.cancel();
        }
    });
    drop(tx);

    tokio::spawn(async move {
        let ctx = ProviderContext {
            server_cancel: owned_instance.cancellation(),
            request_cancel: &owned_request_cancel,
            method: &owned_method,
            uri: &owned_uri,
            headers: &owned_headers,
            body: &owned_body,
            path_vars: &path_vars,
            field_name: "",
            settings: owned_instance.user_config(),
            instance: &owned_instance,
            sink: Some(sink.clone()),
        };

        let dot = match owned_instance.flusher_plan().assemble(&ctx).await {
            Ok(dot) => dot,
            Err(err) => {
                tracing::error!(error = %err, template = %owned_name, "dot provider failed to initialize (streaming)");
                return;
            }
        };

        let result = render_to_write_blocking(owned_instance.clone(), owned_name.clone(), dot.clone(), sink.clone()).await;
        if let Err(err) = &result {
            tracing::error!(error = %err, template = %owned_name, "streaming template execution failed");
        }
        let outcome = dot.signal().resolve(result);
        sink.flush();

        let exec_error = match &outcome {
            ExecOutcome::Error(err) => Some(ExecError::from(err)),
            ExecOutcome::Ok | ExecOutcome::Hijack(_) => None,
        };
        let cleanup_error = owned_instance.flusher_plan().cleanup(&dot, exec_error).await;
        if let Some(err) = cleanup_error {
            tracing::error!(error = %err, "dot provider cleanup failed (streaming)");
        }
        sink.flush();
    });

    let counted = CountingStream {
        inner: UnboundedReceiverStream::new(rx),
        counted: 0,
        span,
        status: StatusCode::OK.as_u16(),
        metrics: Some(metrics),
    };
    let response_body = Body::from_stream(counted);
    let mut response = Response::new(response_body);
    *response.status_mut() = StatusCode::OK;
    let response_headers = response.headers_mut();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// Static asset handler (spec.md §4.A steps 1-5).
async fn asset_handler(instance: &Instance, path: &str, query: Option<&str>, req_headers: &HeaderMap) -> Response {
    let Some(asset) = instance.assets().get(path) else {
        return AppError::NotFound.into_response();
    };

    let requested_hash = query.and_then(|q| query_param(q, "hash"));
    let hash_matched = match &requested_hash {
        Some(h) => {
            if h.as_ref() != asset.content_hash {
                return AppError::NotFound.into_response();
            }
            true
        }
        None => false,
    };

    let accept_encoding = req_headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok());
    let Some(entry) = crate::assets::negotiate_encoding(asset, accept_encoding) else {
        tracing::error!(path = %path, "asset has no identity encoding; build invariant violated");
        return AppError::Internal("asset has no identity encoding".to_string()).into_response();
    };

    let (bytes, live_modtime) = match entry.read().await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::error!(error = %err, path = %path, "failed to read asset from disk");
            return AppError::Internal("failed to read asset".to_string()).into_response();
        }
    };
    if let Some(live) = live_modtime {
        if live != entry.modtime {
            tracing::warn!(path = %path, "asset modtime on disk differs from the recorded build-time modtime");
        }
    }

    let content_encoding = match entry.label {
        crate::assets::Encoding::Identity => None,
        crate::assets::Encoding::Gzip => Some("gzip"),
        crate::assets::Encoding::Br => Some("br"),
        crate::assets::Encoding::Zstd => Some("zstd"),
    };

    let meta = crate::content::ContentMeta {
        etag: Some(asset.content_hash.clone()),
        modified: Some(entry.modtime),
        content_type: Some(asset.content_type.clone()),
        content_encoding,
        cache_control: hash_matched.then_some("public, max-age=31536000, immutable"),
        vary_accept_encoding: true,
    };

    crate::content::serve_bytes(bytes, &meta, req_headers)
}

fn query_param<'q>(query: &'q str, key: &str) -> Option<std::borrow::Cow<'q, str>> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k != key {
            return None;
        }
        Some(percent_encoding::percent_decode_str(v).decode_utf8_lossy())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_strips_trailing_slash() {
        assert_eq!(clean_path("/a/b/"), "/a/b");
        assert_eq!(clean_path("/"), "/");
    }

    #[test]
    fn query_param_finds_hash() {
        assert_eq!(query_param("hash=abc&x=1", "hash").as_deref(), Some("abc"));
        assert!(query_param("x=1", "hash").is_none());
    }
}
