//! Proxy configuration
//! Resolved once at startup and shared immutably across all request tasks

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Placeholder resolved per request to the selected upstream hostname.
pub const TOKEN_UPSTREAM: &str = "$upstream";

/// Placeholder resolved per request to the client-visible hostname.
pub const TOKEN_CUSTOM_DOMAIN: &str = "$custom_domain";

/// A single search/replace pair of the rewrite dictionary.
///
/// Either side may contain [`TOKEN_UPSTREAM`] or [`TOKEN_CUSTOM_DOMAIN`],
/// resolved per request before matching.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(String, String)")]
pub struct RewriteRule {
    pub search: String,
    pub replace: String,
}

impl From<(String, String)> for RewriteRule {
    fn from((search, replace): (String, String)) -> Self {
        Self { search, replace }
    }
}

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    /// Upstream host for desktop clients, `host` or `host:port`.
    pub upstream: String,
    /// Upstream host for mobile clients.
    pub upstream_mobile: String,
    /// Path prefix grafted onto every forwarded request path.
    pub upstream_path: String,
    /// Secret injected as a bearer `Authorization` header; empty disables it.
    pub auth_token: String,
    pub blocked_regions: HashSet<String>,
    pub blocked_ips: HashSet<String>,
    /// Whether upstream requests use https.
    pub upstream_tls: bool,
    /// Forces `Cache-Control: no-store` on every response.
    pub disable_cache: bool,
    /// Ordered search/replace pairs applied to textual response bodies.
    pub rewrite_rules: Vec<RewriteRule>,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: usize,
    pub cleanup_interval: Duration,
}

impl ProxyConfig {
    /// Scheme used for upstream requests.
    pub fn upstream_scheme(&self) -> &'static str {
        if self.upstream_tls {
            "https"
        } else {
            "http"
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            upstream: "example.com".to_string(),
            upstream_mobile: "example.com".to_string(),
            upstream_path: "/".to_string(),
            auth_token: String::new(),
            blocked_regions: HashSet::new(),
            blocked_ips: HashSet::new(),
            upstream_tls: true,
            disable_cache: false,
            rewrite_rules: default_rewrite_rules(),
            rate_limit_window: Duration::from_secs(120),
            rate_limit_max_requests: 25,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// The minimal dictionary: rewrite the upstream hostname to the
/// client-visible one.
pub fn default_rewrite_rules() -> Vec<RewriteRule> {
    vec![RewriteRule {
        search: TOKEN_UPSTREAM.to_string(),
        replace: TOKEN_CUSTOM_DOMAIN.to_string(),
    }]
}

/// Parse a rewrite dictionary from its JSON form: a list of
/// `[search, replace]` pairs, e.g. `[["$upstream","$custom_domain"]]`.
pub fn parse_rewrite_rules(json: &str) -> Result<Vec<RewriteRule>> {
    serde_json::from_str(json).context("invalid rewrite rules, expected a JSON list of [search, replace] pairs")
}

/// Split a comma-separated config value into a set, dropping empty items.
pub fn parse_list(value: &str) -> HashSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
