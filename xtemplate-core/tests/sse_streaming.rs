//! S5 — SSE and cancellation (spec.md §8).

use axum::body::{to_bytes, Body};
use xtemplate_core::config::{Config, TemplatesRoot};
use xtemplate_core::handlers;
use xtemplate_core::http::{Method, Request};
use xtemplate_core::instance;

#[tokio::test]
async fn s5_sse_emits_initial_frame_then_closes_once_the_instance_cancels() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("reload.html"),
        r#"{{define "SSE /reload"}}data: reload

{{ flush.WaitForServerStop() }}{{end}}"#,
    )
    .unwrap();

    let config = Config::new(TemplatesRoot::Dir(dir.path().to_path_buf())).with_default_providers();
    let instance = instance::build(config).await.unwrap();

    let mut req = Request::builder().method(Method::GET).uri("/reload").body(Body::empty()).unwrap();
    req.headers_mut().insert("accept", "text/event-stream".parse().unwrap());

    let resp = handlers::dispatch(instance.clone(), req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/event-stream");
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");

    // Cancel shortly after the handler starts; `WaitForServerStop` polls in
    // 5ms slices, so it notices well within this test's timeout.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    instance.cancellation().cancel();

    let body = tokio::time::timeout(std::time::Duration::from_secs(2), to_bytes(resp.into_body(), usize::MAX))
        .await
        .expect("stream should close once the instance cancels")
        .unwrap();
    assert_eq!(&body[..], b"data: reload\n\n");
}

#[tokio::test]
async fn s5_sse_requires_event_stream_accept_header() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("reload.html"),
        r#"{{define "SSE /reload"}}data: reload

{{end}}"#,
    )
    .unwrap();

    let config = Config::new(TemplatesRoot::Dir(dir.path().to_path_buf())).with_default_providers();
    let instance = instance::build(config).await.unwrap();

    let req = Request::builder().method(Method::GET).uri("/reload").body(Body::empty()).unwrap();
    let resp = handlers::dispatch(instance, req).await;
    assert_eq!(resp.status(), 406);
}
