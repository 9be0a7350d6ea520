use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default WebP quality handed to the external tool when none is configured.
pub const DEFAULT_QUALITY: u8 = 80;

fn default_tool() -> PathBuf {
    PathBuf::from("cwebp")
}

fn default_tool_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_ttl() -> Duration {
    Duration::from_secs(30)
}

/// Middleware configuration.
///
/// Everything under "transcode options" is passed through to the external
/// tool's flag vocabulary by [`crate::options::compile_flags`]; invalid
/// combinations surface as a transcode failure, not a config error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebpConfig {
    /// Cache directory. Defaults to `<cwd>/webp-cache` when unset.
    pub cache_dir: Option<PathBuf>,

    /// Serve a transcoded source image for direct `.webp` requests when the
    /// `.webp` file itself does not exist on disk.
    pub serve_webp: bool,

    /// External transcode tool, invoked as `tool <src> [flags...] -o <dest>`.
    #[serde(default = "default_tool")]
    pub tool: PathBuf,

    /// Wall-clock limit on a single tool invocation. Expiry counts as a
    /// transcode failure.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout: Duration,

    /// How long a failed key is remembered before the tool may be retried.
    #[serde(default = "default_failure_ttl")]
    pub failure_ttl: Duration,

    // Transcode options (cwebp flag vocabulary).
    pub quality: Option<u8>,
    pub method: Option<u8>,
    pub lossless: bool,
    pub multithread: bool,
    pub resize: Option<(u32, u32)>,
    pub metadata: Option<String>,

    /// Verbatim extra flags appended after the recognized options.
    pub extra_flags: Vec<String>,
}

impl Default for WebpConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            serve_webp: false,
            tool: default_tool(),
            tool_timeout: default_tool_timeout(),
            failure_ttl: default_failure_ttl(),
            quality: None,
            method: None,
            lossless: false,
            multithread: false,
            resize: None,
            metadata: None,
            extra_flags: Vec::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("tool path cannot be empty")]
    EmptyTool,
    #[error("quality must be <= 100")]
    InvalidQuality,
    #[error("method must be <= 6")]
    InvalidMethod,
    #[error("resize dimensions must be > 0")]
    InvalidResize,
}

impl WebpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool.as_os_str().is_empty() {
            return Err(ConfigError::EmptyTool);
        }
        if matches!(self.quality, Some(q) if q > 100) {
            return Err(ConfigError::InvalidQuality);
        }
        if matches!(self.method, Some(m) if m > 6) {
            return Err(ConfigError::InvalidMethod);
        }
        if matches!(self.resize, Some((w, h)) if w == 0 || h == 0) {
            return Err(ConfigError::InvalidResize);
        }
        Ok(())
    }

    /// Cache directory with the `<cwd>/webp-cache` fallback applied.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("webp-cache")
        })
    }
}
