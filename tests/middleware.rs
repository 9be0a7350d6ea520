//! End-to-end middleware behavior against a fake transcode tool.
//!
//! The fake tool is a shell script that logs every invocation and copies the
//! source file to the destination, so response bodies can be checked against
//! the source bytes without a real WebP encoder.

#![cfg(unix)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::{middleware, Router};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tower::util::ServiceExt;
use tower_http::services::ServeDir;
use webp_serve::cache::cache_key;
use webp_serve::config::WebpConfig;
use webp_serve::{serve_webp, WebpContext};

const JPEG_BYTES: &[u8] = b"original-jpeg-bytes";

#[derive(Clone, Copy)]
enum Tool {
    /// Copies the source to the destination.
    Convert,
    /// As `Convert`, after a delay long enough for requests to pile up.
    Slow,
    /// Exits non-zero without producing output.
    Fail,
    /// Never finishes within any reasonable timeout.
    Hang,
}

struct TestServer {
    app: Router,
    source_dir: PathBuf,
    cache_dir: PathBuf,
    count_file: PathBuf,
    _tmp: TempDir,
}

impl TestServer {
    fn invocations(&self) -> usize {
        std::fs::read_to_string(&self.count_file)
            .unwrap_or_default()
            .lines()
            .count()
    }

    fn cache_path_for(&self, url: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.webp", cache_key(url)))
    }
}

fn write_tool(path: &Path, kind: Tool, count_file: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let copy = r#"src="$1"
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
cp "$src" "$out"
"#;
    let mut script = format!("#!/bin/sh\necho run >> \"{}\"\n", count_file.display());
    match kind {
        Tool::Convert => script.push_str(copy),
        Tool::Slow => {
            script.push_str("sleep 0.3\n");
            script.push_str(copy);
        }
        Tool::Fail => script.push_str("exit 1\n"),
        Tool::Hang => {
            script.push_str("sleep 5\n");
            script.push_str(copy);
        }
    }
    std::fs::write(path, script).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

async fn server_with(kind: Tool, mutate: impl FnOnce(&mut WebpConfig)) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let source_dir = tmp.path().join("public");
    std::fs::create_dir_all(&source_dir).unwrap();
    std::fs::write(source_dir.join("photo.jpg"), JPEG_BYTES).unwrap();
    std::fs::write(source_dir.join("broken.png"), b"not-really-a-png").unwrap();
    std::fs::write(source_dir.join("notes.txt"), b"plain text").unwrap();

    let count_file = tmp.path().join("invocations.log");
    let tool = tmp.path().join("fake-cwebp");
    write_tool(&tool, kind, &count_file);

    let cache_dir = tmp.path().join("cache");
    let mut config = WebpConfig {
        cache_dir: Some(cache_dir.clone()),
        tool,
        ..WebpConfig::default()
    };
    mutate(&mut config);

    let ctx = WebpContext::new(source_dir.clone(), config).await.unwrap();
    let app = Router::new()
        .fallback_service(ServeDir::new(source_dir.clone()))
        .layer(middleware::from_fn_with_state(ctx, serve_webp));

    TestServer {
        app,
        source_dir,
        cache_dir,
        count_file,
        _tmp: tmp,
    }
}

fn get(uri: &str, accept: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(accept) = accept {
        builder = builder.header(header::ACCEPT, accept);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn eligible_request_is_transcoded_and_cached() {
    let server = server_with(Tool::Convert, |_| {}).await;

    let response = server
        .app
        .clone()
        .oneshot(get("/photo.jpg", Some("image/webp,image/*;q=0.8")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/webp"
    );
    assert_eq!(response.headers().get(header::VARY).unwrap(), "Accept");
    assert_eq!(body_bytes(response).await, JPEG_BYTES);

    assert_eq!(server.invocations(), 1);
    assert!(server.cache_path_for("/photo.jpg").is_file());
}

#[tokio::test]
async fn repeated_request_is_served_from_cache() {
    let server = server_with(Tool::Convert, |_| {}).await;

    for _ in 0..2 {
        let response = server
            .app
            .clone()
            .oneshot(get("/photo.jpg", Some("image/webp")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, JPEG_BYTES);
    }

    assert_eq!(server.invocations(), 1);
}

#[tokio::test]
async fn client_without_webp_accept_gets_the_original() {
    let server = server_with(Tool::Convert, |_| {}).await;

    let response = server
        .app
        .clone()
        .oneshot(get("/photo.jpg", Some("image/avif,image/png")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, JPEG_BYTES);
    assert_eq!(server.invocations(), 0);
}

#[tokio::test]
async fn unsupported_mime_passes_through_untouched() {
    let server = server_with(Tool::Convert, |_| {}).await;

    let response = server
        .app
        .clone()
        .oneshot(get("/notes.txt", Some("image/webp")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"plain text");
    assert_eq!(server.invocations(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_invoke_the_tool_once() {
    let server = server_with(Tool::Slow, |_| {}).await;
    let request = || get("/photo.jpg", Some("image/webp"));

    let (a, b, c, d) = tokio::join!(
        server.app.clone().oneshot(request()),
        server.app.clone().oneshot(request()),
        server.app.clone().oneshot(request()),
        server.app.clone().oneshot(request()),
    );

    for response in [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()] {
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, JPEG_BYTES);
    }
    assert_eq!(server.invocations(), 1);
}

#[tokio::test]
async fn tool_failure_falls_through_and_leaves_no_cache_file() {
    let server = server_with(Tool::Fail, |_| {}).await;

    let response = server
        .app
        .clone()
        .oneshot(get("/broken.png", Some("image/webp")))
        .await
        .unwrap();

    // The static handler still serves the original.
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"not-really-a-png");

    assert_eq!(server.invocations(), 1);
    assert!(!server.cache_path_for("/broken.png").exists());
}

#[tokio::test]
async fn failures_are_negatively_cached() {
    let server = server_with(Tool::Fail, |_| {}).await;

    for _ in 0..2 {
        let response = server
            .app
            .clone()
            .oneshot(get("/broken.png", Some("image/webp")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // The second request hits the negative cache instead of the tool.
    assert_eq!(server.invocations(), 1);
}

#[tokio::test]
async fn tool_timeout_counts_as_failure() {
    let server = server_with(Tool::Hang, |config| {
        config.tool_timeout = Duration::from_millis(200);
    })
    .await;

    let response = server
        .app
        .clone()
        .oneshot(get("/photo.jpg", Some("image/webp")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, JPEG_BYTES);
    assert_eq!(server.invocations(), 1);
    assert!(!server.cache_path_for("/photo.jpg").exists());
}

#[tokio::test]
async fn vanished_cache_file_heals_transparently() {
    let server = server_with(Tool::Convert, |_| {}).await;
    let request = || get("/photo.jpg", Some("image/webp"));

    let first = server.app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // Delete the cached file out-of-band while it is still registered in
    // the fast-path set.
    std::fs::remove_file(server.cache_path_for("/photo.jpg")).unwrap();

    let second = server.app.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_bytes(second).await, JPEG_BYTES);

    // The send failure evicted the entry and re-ran the full resolution.
    assert_eq!(server.invocations(), 2);
    assert!(server.cache_path_for("/photo.jpg").is_file());
}

#[tokio::test]
async fn direct_webp_request_serves_transcoded_source() {
    let server = server_with(Tool::Convert, |config| {
        config.serve_webp = true;
    })
    .await;

    let response = server
        .app
        .clone()
        .oneshot(get("/photo.webp", Some("image/webp")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/webp"
    );
    assert_eq!(body_bytes(response).await, JPEG_BYTES);

    // The rewritten request shares its cache entry with /photo.jpg.
    assert!(server.cache_path_for("/photo.jpg").is_file());
    assert_eq!(server.invocations(), 1);
}

#[tokio::test]
async fn direct_webp_request_without_source_passes_through() {
    let server = server_with(Tool::Convert, |config| {
        config.serve_webp = true;
    })
    .await;

    let response = server
        .app
        .clone()
        .oneshot(get("/missing.webp", Some("image/webp")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(server.invocations(), 0);
}

#[tokio::test]
async fn query_strings_key_separate_cache_entries() {
    let server = server_with(Tool::Convert, |_| {}).await;

    let plain = server
        .app
        .clone()
        .oneshot(get("/photo.jpg", Some("image/webp")))
        .await
        .unwrap();
    assert_eq!(plain.status(), StatusCode::OK);

    let with_query = server
        .app
        .clone()
        .oneshot(get("/photo.jpg?v=2", Some("image/webp")))
        .await
        .unwrap();
    assert_eq!(with_query.status(), StatusCode::OK);

    assert_eq!(server.invocations(), 2);
    assert!(server.cache_path_for("/photo.jpg").is_file());
    assert!(server.cache_path_for("/photo.jpg?v=2").is_file());
}

#[tokio::test]
async fn source_files_are_left_alone() {
    let server = server_with(Tool::Convert, |_| {}).await;

    let response = server
        .app
        .clone()
        .oneshot(get("/photo.jpg", Some("image/webp")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let original = std::fs::read(server.source_dir.join("photo.jpg")).unwrap();
    assert_eq!(original, JPEG_BYTES);
}
