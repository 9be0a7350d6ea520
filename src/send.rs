use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use std::path::Path;
use tokio::fs;

use crate::Result;

/// File-sending collaborator. One implementation serves from disk; tests
/// substitute their own to exercise send-failure handling.
#[async_trait::async_trait]
pub trait FileSender: Send + Sync {
    /// Builds a WebP response for the file at `path`. Errors are returned to
    /// the caller, never surfaced to the client from here.
    async fn send(&self, path: &Path) -> Result<Response>;
}

/// Reads the cache file and answers it with content-negotiation headers.
/// Every response varies on `Accept` so an intermediary cache never serves
/// WebP to a client that did not ask for it.
pub struct DiskSender;

#[async_trait::async_trait]
impl FileSender for DiskSender {
    async fn send(&self, path: &Path) -> Result<Response> {
        let body = fs::read(path).await?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("image/webp"))
            .header(header::CONTENT_LENGTH, body.len())
            .header(header::VARY, HeaderValue::from_static("Accept"))
            .body(Body::from(body))?;
        Ok(response)
    }
}
