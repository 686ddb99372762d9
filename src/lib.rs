//! Mirrorgate - A rewriting reverse proxy
//!
//! Forwards requests to a device-selected upstream, providing:
//! - Sliding-window per-IP rate limiting
//! - Static region/IP deny lists
//! - Outbound URL/header rewriting with bearer-token injection
//! - Streaming chunk-local rewriting of textual response bodies
//! - Security-header sanitization
//! - Verbatim WebSocket passthrough

pub mod access;
pub mod config;
pub mod device;
pub mod error;
pub mod proxy;
pub mod rate_limit;
pub mod rewrite;

pub use access::AccessControl;
pub use config::{ProxyConfig, RewriteRule};
pub use error::ProxyError;
pub use proxy::ProxyServer;
pub use rate_limit::RateLimiter;
pub use rewrite::RewriteEngine;
