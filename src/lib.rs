//! Axum middleware that serves WebP renditions of JPEG, PNG and TIFF assets.
//!
//! Eligible requests (supported source format, client advertises
//! `image/webp`) are answered from a disk cache of transcoded files, keyed
//! by a digest of the request URL. On a miss the external transcode tool is
//! invoked exactly once per key, however many requests race for it; every
//! other failure mode falls through to the inner service, so the client is
//! never worse off than without the middleware.
//!
//! Cache entries are never invalidated: a source image is assumed to be
//! immutable for a given path. Rotate the cache directory if assets are
//! republished under the same URLs.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod cache;
pub mod classify;
pub mod config;
pub mod options;
pub mod send;
pub mod transcode;

use crate::cache::{CacheStore, FastPathCache};
use crate::classify::{Classifier, RequestDescriptor};
use crate::config::WebpConfig;
use crate::send::{DiskSender, FileSender};
use crate::transcode::{TranscodeCoordinator, TranscodeOutcome};

#[derive(Error, Debug)]
pub enum WebpServeError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("response error: {0}")]
    Response(#[from] axum::http::Error),
}

pub type Result<T> = std::result::Result<T, WebpServeError>;

/// Send failures on a cache hit self-heal by evicting and re-resolving; the
/// loop is bounded so a persistently inconsistent filesystem degrades to a
/// fallthrough instead of recursing.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// Everything one middleware instance owns: compiled tool flags, both cache
/// tiers, the in-flight registry and the file sender. Constructed once,
/// shared via [`axum::middleware::from_fn_with_state`]. Separate instances
/// (different base paths or options) do not interfere.
pub struct WebpContext {
    classifier: Classifier,
    store: CacheStore,
    fast_path: FastPathCache,
    coordinator: Arc<TranscodeCoordinator>,
    sender: Arc<dyn FileSender>,
}

impl WebpContext {
    /// Builds a context serving sources under `base_dir`, creating the cache
    /// directory if needed.
    pub async fn new(base_dir: PathBuf, config: WebpConfig) -> Result<Arc<Self>> {
        Self::with_sender(base_dir, config, Arc::new(DiskSender)).await
    }

    /// As [`WebpContext::new`] with an injected file-sending collaborator.
    pub async fn with_sender(
        base_dir: PathBuf,
        config: WebpConfig,
        sender: Arc<dyn FileSender>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let cache_dir = config.resolved_cache_dir();
        let store = CacheStore::new(cache_dir).await?;
        info!(
            base_dir = %base_dir.display(),
            cache_dir = %store.dir().display(),
            tool = %config.tool.display(),
            "webp middleware initialized"
        );

        let flags = options::compile_flags(&config);
        let coordinator = Arc::new(TranscodeCoordinator::new(
            config.tool.clone(),
            flags,
            config.tool_timeout,
            config.failure_ttl,
        ));

        Ok(Arc::new(Self {
            classifier: Classifier::new(base_dir, config.serve_webp),
            store,
            fast_path: FastPathCache::new(),
            coordinator,
            sender,
        }))
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        self.store.dir()
    }
}

/// The middleware. Layer it with
/// `axum::middleware::from_fn_with_state(ctx, serve_webp)` over whatever
/// serves the original assets; ineligible requests and every failure path
/// end in `next.run(req)`, untouched.
pub async fn serve_webp(
    State(ctx): State<Arc<WebpContext>>,
    req: Request,
    next: Next,
) -> Response {
    let desc = RequestDescriptor::from_request(&req);
    let Some(eligible) = ctx.classifier.classify(&desc).await else {
        return next.run(req).await;
    };

    let key = cache::cache_key(&eligible.effective_url);
    let cache_path = ctx.store.path_for(&key);

    for _ in 0..MAX_RESOLVE_ATTEMPTS {
        // Fast path: skip the disk probe for paths we have served before.
        if ctx.fast_path.contains(&cache_path) {
            match ctx.sender.send(&cache_path).await {
                Ok(response) => return response,
                Err(e) => {
                    warn!(path = %cache_path.display(), error = %e, "fast-path entry unservable, evicting");
                    ctx.fast_path.evict(&cache_path);
                    continue;
                }
            }
        }

        // Durable tier: a non-empty file is valid and is never regenerated.
        if ctx.store.exists(&cache_path).await {
            match ctx.sender.send(&cache_path).await {
                Ok(response) => {
                    ctx.fast_path.insert(cache_path.clone());
                    return response;
                }
                Err(e) => {
                    warn!(path = %cache_path.display(), error = %e, "cached file vanished mid-send");
                    continue;
                }
            }
        }

        // Miss: lead or join the in-flight transcode, then re-resolve.
        match ctx
            .coordinator
            .transcode(&ctx.store, &key, &eligible.source_path, &cache_path)
            .await
        {
            TranscodeOutcome::Completed => continue,
            TranscodeOutcome::Failed => return next.run(req).await,
        }
    }

    next.run(req).await
}
