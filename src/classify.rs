use axum::extract::Request;
use axum::http::header;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Source extensions probed, in preference order, when a direct `.webp`
/// request falls back to an origin format.
const SOURCE_EXTENSIONS: [&str; 3] = ["jpg", "png", "tiff"];

/// Per-request view of the fields classification needs. Immutable once
/// derived.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub path: String,
    pub query: Option<String>,
    pub accept: Option<String>,
}

impl RequestDescriptor {
    pub fn from_request(req: &Request) -> Self {
        Self {
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            accept: req
                .headers()
                .get(header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }

    /// The URL string the cache key is derived from.
    pub fn url(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    fn with_extension(&self, ext: &str) -> Self {
        let path = match self.path.rfind('.') {
            Some(dot) => format!("{}.{}", &self.path[..dot], ext),
            None => self.path.clone(),
        };
        Self {
            path,
            query: self.query.clone(),
            accept: self.accept.clone(),
        }
    }

    fn extension(&self) -> Option<String> {
        Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }
}

/// A request the middleware will attempt to serve as WebP.
#[derive(Debug, Clone)]
pub struct Eligible {
    /// On-disk path of the source image under the base directory.
    pub source_path: PathBuf,
    /// URL string (after any alternate-source rewrite) the cache key is
    /// derived from.
    pub effective_url: String,
}

pub struct Classifier {
    base_dir: PathBuf,
    serve_webp: bool,
}

impl Classifier {
    pub fn new(base_dir: PathBuf, serve_webp: bool) -> Self {
        Self {
            base_dir,
            serve_webp,
        }
    }

    /// Decides whether a request is eligible for transcoding.
    ///
    /// Direct `.webp` requests are resolved to an existing source file under
    /// the preference order jpg, png, tiff and re-classified with the
    /// rewritten extension. A rewritten extension is never `.webp`, so one
    /// rewrite bounds the loop. Everything else either passes the MIME and
    /// Accept checks or is handed back to the inner service untouched.
    pub async fn classify(&self, desc: &RequestDescriptor) -> Option<Eligible> {
        // Path traversal never reaches the filesystem probes.
        if desc.path.split('/').any(|seg| seg == "..") {
            return None;
        }

        let mut desc = desc.clone();
        for _ in 0..2 {
            if self.serve_webp && desc.extension().as_deref() == Some("webp") {
                desc = self.resolve_alternate_source(&desc).await?;
                continue;
            }

            let mime_type = mime_guess::from_path(&desc.path).first()?;
            let supported = mime_type == mime::IMAGE_JPEG
                || mime_type == mime::IMAGE_PNG
                || mime_type == "image/tiff";
            let accepts_webp = desc
                .accept
                .as_deref()
                .is_some_and(|a| a.contains("image/webp"));

            if !supported || !accepts_webp {
                debug!(path = %desc.path, %mime_type, accepts_webp, "request not eligible for transcoding");
                return None;
            }

            return Some(Eligible {
                source_path: self.source_path(&desc.path),
                effective_url: desc.url(),
            });
        }
        None
    }

    /// For a direct `.webp` request, finds a source file with the same base
    /// name and returns the rewritten descriptor.
    async fn resolve_alternate_source(
        &self,
        desc: &RequestDescriptor,
    ) -> Option<RequestDescriptor> {
        for ext in SOURCE_EXTENSIONS {
            let rewritten = desc.with_extension(ext);
            let candidate = self.source_path(&rewritten.path);
            match fs::metadata(&candidate).await {
                Ok(meta) if meta.is_file() => {
                    debug!(from = %desc.path, to = %rewritten.path, "rewrote direct webp request");
                    return Some(rewritten);
                }
                _ => continue,
            }
        }
        None
    }

    fn source_path(&self, url_path: &str) -> PathBuf {
        self.base_dir.join(url_path.trim_start_matches('/'))
    }
}
