//! Mirrorgate - Main entry point
//!
//! A rewriting reverse proxy with device-aware upstream selection and
//! per-IP rate limiting

use anyhow::Result;
use clap::Parser;
use mirrorgate::config::{default_rewrite_rules, parse_list, parse_rewrite_rules};
use mirrorgate::{AccessControl, ProxyConfig, ProxyServer, RateLimiter, RewriteEngine};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Mirrorgate - A rewriting reverse proxy
#[derive(Parser, Debug)]
#[command(name = "mirrorgate")]
#[command(author = "Mirrorgate Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A rewriting reverse proxy with device-aware upstream selection")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Upstream host for desktop clients, host or host:port
    #[arg(long, env = "UPSTREAM")]
    upstream: String,

    /// Upstream host for mobile clients; defaults to the desktop upstream
    #[arg(long, env = "UPSTREAM_MOBILE")]
    upstream_mobile: Option<String>,

    /// Path prefix grafted onto every forwarded request path
    #[arg(long, env = "UPSTREAM_PATH", default_value = "/")]
    upstream_path: String,

    /// Secret injected as a bearer Authorization header; empty disables it
    #[arg(long, env = "AUTH_TOKEN", default_value = "")]
    auth_token: String,

    /// Comma-separated region codes to deny
    #[arg(long, env = "BLOCKED_REGIONS", default_value = "")]
    blocked_regions: String,

    /// Comma-separated IP addresses to deny
    #[arg(long, env = "BLOCKED_IPS", default_value = "")]
    blocked_ips: String,

    /// Use https for upstream requests
    #[arg(long, env = "UPSTREAM_TLS", action = clap::ArgAction::Set, default_value_t = true)]
    upstream_tls: bool,

    /// Force Cache-Control: no-store on every response
    #[arg(long, env = "DISABLE_CACHE", default_value = "false")]
    disable_cache: bool,

    /// Rewrite dictionary as a JSON list of [search, replace] pairs
    #[arg(long, env = "REWRITE_RULES")]
    rewrite_rules: Option<String>,

    /// Rate limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "120")]
    rate_limit_window_secs: u64,

    /// Maximum requests per IP within one window
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value = "25")]
    rate_limit_max_requests: usize,

    /// Seconds between rate-limiter cleanup sweeps
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value = "300")]
    cleanup_interval_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let rewrite_rules = match &args.rewrite_rules {
        Some(json) => parse_rewrite_rules(json)?,
        None => default_rewrite_rules(),
    };

    let config = Arc::new(ProxyConfig {
        port: args.port,
        upstream_mobile: args
            .upstream_mobile
            .unwrap_or_else(|| args.upstream.clone()),
        upstream: args.upstream,
        upstream_path: args.upstream_path,
        auth_token: args.auth_token,
        blocked_regions: parse_list(&args.blocked_regions),
        blocked_ips: parse_list(&args.blocked_ips),
        upstream_tls: args.upstream_tls,
        disable_cache: args.disable_cache,
        rewrite_rules,
        rate_limit_window: Duration::from_secs(args.rate_limit_window_secs),
        rate_limit_max_requests: args.rate_limit_max_requests,
        cleanup_interval: Duration::from_secs(args.cleanup_interval_secs),
    });

    info!("Starting Mirrorgate v1.0.0");
    info!("Listening on port {}", config.port);
    info!(
        "Upstream: {} (mobile: {})",
        config.upstream, config.upstream_mobile
    );

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_window,
        config.rate_limit_max_requests,
    ));
    let access_control = Arc::new(AccessControl::new(
        config.blocked_regions.clone(),
        config.blocked_ips.clone(),
    ));
    let rewrite_engine = Arc::new(RewriteEngine::new(config.rewrite_rules.clone()));

    let server = Arc::new(ProxyServer::new(
        config,
        rate_limiter,
        access_control,
        rewrite_engine,
    ));

    info!("Mirrorgate started successfully");

    server.run().await?;

    Ok(())
}
