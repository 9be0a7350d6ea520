use axum::{middleware, Router};
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use webp_serve::{config::WebpConfig, serve_webp, WebpContext};

/// Standalone demo server: static files with WebP transcoding layered on
/// top.
///
/// # Configuration
/// Environment variables:
/// - `WEBP_BASE_DIR`: directory of source assets (default: "./public")
/// - `WEBP_CACHE_DIR`: transcode cache directory (default: "<cwd>/webp-cache")
/// - `WEBP_QUALITY`: quality flag passed to the tool (default: tool default)
/// - `WEBP_SERVE_WEBP`: set to serve sources for direct `.webp` requests
/// - `WEBP_OPTIONS`: JSON-encoded [`WebpConfig`], overrides the above
/// - `PORT`: HTTP listen port (default: 8080)
/// - `RUST_LOG`: logging verbosity (default: "webp_serve=debug,tower_http=debug")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webp_serve=debug,tower_http=debug".into()),
        )
        .init();

    tracing::info!("Starting webp-serve demo server");

    let base_dir = PathBuf::from(
        std::env::var("WEBP_BASE_DIR").unwrap_or_else(|_| "./public".to_string()),
    );

    let config = match std::env::var("WEBP_OPTIONS") {
        Ok(json) => serde_json::from_str(&json)?,
        Err(_) => {
            let mut cfg = WebpConfig::default();
            if let Ok(dir) = std::env::var("WEBP_CACHE_DIR") {
                cfg.cache_dir = Some(PathBuf::from(dir));
            }
            if let Ok(q) = std::env::var("WEBP_QUALITY") {
                cfg.quality = Some(q.parse()?);
            }
            cfg.serve_webp = std::env::var("WEBP_SERVE_WEBP").is_ok();
            cfg
        }
    };

    let ctx = WebpContext::new(base_dir.clone(), config).await?;

    let app = Router::new()
        .fallback_service(ServeDir::new(base_dir))
        .layer(middleware::from_fn_with_state(ctx, serve_webp))
        .layer(TraceLayer::new_for_http());

    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);

    // Bind to 0.0.0.0 so containerized deployments accept external traffic.
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
