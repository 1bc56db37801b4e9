//! End-to-end scenarios from spec.md §8 (S1-S4, S6; S5 lives in
//! `sse_streaming.rs` since it needs its own cancellation timing).

use std::io::Write as _;

use axum::body::{to_bytes, Body};
use xtemplate_core::assets::sri_hash;
use xtemplate_core::config::{Config, TemplatesRoot};
use xtemplate_core::handlers;
use xtemplate_core::http::{Method, Request};
use xtemplate_core::instance;

async fn build_instance(dir: &std::path::Path) -> xtemplate_core::Instance {
    let config = Config::new(TemplatesRoot::Dir(dir.to_path_buf())).with_default_providers();
    instance::build(config).await.unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().method(Method::GET).uri(path).body(Body::empty()).unwrap()
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn s1_asset_negotiation_prefers_gzip_and_honors_hash_and_conditional_get() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("assets")).unwrap();

    let identity = b"body { margin: 0; padding: 0; color: black; }".to_vec();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&identity).unwrap();
    let gz_bytes = encoder.finish().unwrap();

    std::fs::write(dir.path().join("assets/reset.css"), &identity).unwrap();
    std::fs::write(dir.path().join("assets/reset.css.gz"), &gz_bytes).unwrap();

    let instance = build_instance(dir.path()).await;
    let expected_hash = sri_hash(&identity);

    // Accept-Encoding negotiation picks gzip.
    let mut req = get("/assets/reset.css");
    req.headers_mut().insert("accept-encoding", "gzip, br".parse().unwrap());
    let resp = handlers::dispatch(instance.clone(), req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-encoding").unwrap(), "gzip");
    let etag = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{expected_hash}\""));

    // Correct ?hash= query adds the immutable cache-control header.
    let req = get(&format!("/assets/reset.css?hash={expected_hash}"));
    let resp = handlers::dispatch(instance.clone(), req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("cache-control").unwrap(), "public, max-age=31536000, immutable");

    // Wrong ?hash= query 404s (spec.md §4.A step 2, §8 property 2).
    let req = get("/assets/reset.css?hash=sha384-not-the-real-hash");
    let resp = handlers::dispatch(instance.clone(), req).await;
    assert_eq!(resp.status(), 404);

    // If-None-Match with the correct ETag yields 304.
    let mut req = get("/assets/reset.css");
    req.headers_mut().insert("if-none-match", format!("\"{expected_hash}\"").parse().unwrap());
    let resp = handlers::dispatch(instance.clone(), req).await;
    assert_eq!(resp.status(), 304);
}

#[tokio::test]
async fn s2_directory_index_routes_to_parent_and_rejects_literal_index() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "welcome home").unwrap();

    let instance = build_instance(dir.path()).await;

    let resp = handlers::dispatch(instance.clone(), get("/")).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(body_string(resp).await, "welcome home");

    let resp = handlers::dispatch(instance.clone(), get("/index")).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn s3_hidden_template_is_invocable_but_not_routed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("shared")).unwrap();
    std::fs::write(dir.path().join("shared/.head.html"), "<head-fragment>").unwrap();
    std::fs::write(
        dir.path().join("page.html"),
        r#"start-{{ instance.Template("/shared/.head.html") }}-end"#,
    )
    .unwrap();

    let instance = build_instance(dir.path()).await;

    let resp = handlers::dispatch(instance.clone(), get("/shared/.head.html")).await;
    assert_eq!(resp.status(), 404);

    let resp = handlers::dispatch(instance.clone(), get("/page")).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(body_string(resp).await, "start-<head-fragment>-end");
}

#[tokio::test]
async fn s4_method_path_pattern_route_exposes_path_variable() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("contact.html"),
        r#"{{define "DELETE /contact/{id}"}}deleted {{ request.PathValue("id") }}{{end}}"#,
    )
    .unwrap();

    let instance = build_instance(dir.path()).await;

    let req = Request::builder().method(Method::DELETE).uri("/contact/42").body(Body::empty()).unwrap();
    let resp = handlers::dispatch(instance.clone(), req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(body_string(resp).await, "deleted 42");

    // Unrelated methods/paths don't match this route at all.
    let req = Request::builder().method(Method::DELETE).uri("/contact/42/extra").body(Body::empty()).unwrap();
    let resp = handlers::dispatch(instance, req).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn s7_return_keeps_the_already_rendered_preamble_and_sets_content_length() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("early.html"), r#"preamble{{ return }}unreached"#).unwrap();

    let instance = build_instance(dir.path()).await;

    let resp = handlers::dispatch(instance, get("/early")).await;
    assert_eq!(resp.status(), 200);
    let content_length = resp.headers().get("content-length").unwrap().to_str().unwrap().to_string();
    assert_eq!(content_length, "8");
    assert_eq!(body_string(resp).await, "preamble");
}

#[tokio::test]
async fn s6_serve_content_hijacks_and_discards_the_preamble() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("hijack.html"),
        r#"preamble{{ response.ServeContent("/x", 0, "replacement") }}unreached"#,
    )
    .unwrap();

    let instance = build_instance(dir.path()).await;

    let resp = handlers::dispatch(instance, get("/hijack")).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(body_string(resp).await, "replacement");
}
