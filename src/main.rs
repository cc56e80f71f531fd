//! Collaborative canvas service binary

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use pixelboard::{default_palette, parse_palette, CanvasConfig, ServiceConfig, ServiceRunner};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(name = "pixelboard-service")]
#[clap(about = "Pixelboard - collaborative pixel canvas service")]
struct Args {
    /// Database connection URL (can also be set via CANVAS_DATABASE_URL env var)
    #[clap(long, env = "CANVAS_DATABASE_URL")]
    database_url: String,

    /// Listen address for the websocket and admin HTTP server
    #[clap(long, default_value = "0.0.0.0:8080", env = "CANVAS_LISTEN_ADDR")]
    listen_addr: SocketAddr,

    /// Bearer token guarding the admin surface; admin routes are closed
    /// when unset
    #[clap(long, env = "CANVAS_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Palette as a JSON array of {id, hex, name} objects
    #[clap(long, env = "CANVAS_PALETTE")]
    palette: Option<String>,

    /// Canvas width used until a size is stored
    #[clap(long, default_value = "1000", env = "CANVAS_WIDTH")]
    width: u32,

    /// Canvas height used until a size is stored
    #[clap(long, default_value = "1000", env = "CANVAS_HEIGHT")]
    height: u32,

    /// Seconds one banked pixel takes to refill
    #[clap(long, default_value = "60", env = "CANVAS_BASE_COOLDOWN_SECS")]
    base_cooldown_secs: u64,

    /// Maximum banked pixels per user
    #[clap(long, default_value = "6", env = "CANVAS_MAX_STACK")]
    max_stack: u32,

    /// Section worker count
    #[clap(long, default_value = "4", env = "CANVAS_WORKER_COUNT")]
    worker_count: usize,

    /// Section edge length in cells
    #[clap(long, default_value = "100", env = "CANVAS_SECTION_EDGE")]
    section_edge: u32,

    /// Snapshot and section cache TTL in seconds
    #[clap(long, default_value = "300", env = "CANVAS_SNAPSHOT_TTL_SECS")]
    snapshot_ttl_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pixelboard={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Pixelboard service");
    tracing::info!("Database URL: {}", mask_url(&args.database_url));
    tracing::info!("Listen address: {}", args.listen_addr);
    if args.admin_token.is_none() {
        tracing::warn!("No admin token configured - the admin surface is closed");
    }

    let palette = match &args.palette {
        Some(json) => parse_palette(json)?,
        None => default_palette(),
    };

    let config = ServiceConfig {
        database_url: args.database_url,
        listen_addr: args.listen_addr,
        admin_token: args.admin_token,
        palette,
        canvas: CanvasConfig {
            default_width: args.width,
            default_height: args.height,
            base_cooldown_secs: args.base_cooldown_secs,
            max_stack: args.max_stack,
            snapshot_ttl_secs: args.snapshot_ttl_secs,
            worker_count: args.worker_count,
            section_edge: args.section_edge,
            ..CanvasConfig::default()
        },
    };

    let service = ServiceRunner::new(config);

    // Handle shutdown gracefully
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        tracing::info!("Received shutdown signal");
    };

    tokio::select! {
        result = service.run() => {
            if let Err(e) = result {
                tracing::error!("Service error: {}", e);
                std::process::exit(1);
            }
        }
        _ = shutdown => {
            tracing::info!("Shutting down gracefully");
        }
    }

    tracing::info!("Pixelboard service stopped");
    Ok(())
}

/// Mask sensitive parts of database URL for logging
fn mask_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(password) = parsed.password() {
            return url.replace(password, "****");
        }
        return url.to_string();
    }
    // If parsing fails, mask anything between the last ':' and '@'
    if let Some(at_pos) = url.find('@') {
        let before_at = &url[..at_pos];
        if let Some(colon_pos) = before_at.rfind(':') {
            return format!("{}:****{}", &before_at[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
