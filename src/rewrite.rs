//! Response rewriting
//! Sanitizes upstream response headers and rewrites textual response bodies
//! chunk-by-chunk while they stream through the proxy

use crate::config::{ProxyConfig, RewriteRule, TOKEN_CUSTOM_DOMAIN, TOKEN_UPSTREAM};
use bytes::Bytes;
use futures_util::Stream;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH,
    CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY_REPORT_ONLY, TRANSFER_ENCODING,
};
use parking_lot::RwLock;
use pin_project_lite::pin_project;
use regex::bytes::{NoExpand, Regex};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

const CLEAR_SITE_DATA: HeaderName = HeaderName::from_static("clear-site-data");
const X_PJAX_URL: HeaderName = HeaderName::from_static("x-pjax-url");

const CACHE_LONG: &str = "public, max-age=31536000";

/// A search pattern compiled once, with its resolved replacement.
#[derive(Clone)]
pub struct CompiledRule {
    pattern: Arc<Regex>,
    replacement: Bytes,
}

/// Holds the configured rewrite dictionary and a process-wide cache of
/// compiled search patterns, keyed by the resolved search string.
///
/// The cache is read-mostly: entries are immutable once inserted and live
/// for the process lifetime, so repeated per-request rewrites never
/// recompile a matcher.
pub struct RewriteEngine {
    rules: Vec<RewriteRule>,
    cache: RwLock<HashMap<String, Arc<Regex>>>,
}

impl RewriteEngine {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self {
            rules,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the dictionary against a concrete upstream and
    /// client-visible hostname, compiling any search string not yet cached.
    pub fn rules_for(&self, upstream_host: &str, client_host: &str) -> Vec<CompiledRule> {
        self.rules
            .iter()
            .map(|rule| {
                let search = resolve_tokens(&rule.search, upstream_host, client_host);
                let replace = resolve_tokens(&rule.replace, upstream_host, client_host);
                CompiledRule {
                    pattern: self.compiled(&search),
                    replacement: Bytes::from(replace),
                }
            })
            .collect()
    }

    fn compiled(&self, search: &str) -> Arc<Regex> {
        if let Some(pattern) = self.cache.read().get(search) {
            return pattern.clone();
        }

        let pattern = Arc::new(
            Regex::new(&regex::escape(search)).expect("escaped literal always compiles"),
        );
        self.cache
            .write()
            .entry(search.to_string())
            .or_insert(pattern)
            .clone()
    }

    #[cfg(test)]
    fn cached_patterns(&self) -> usize {
        self.cache.read().len()
    }
}

fn resolve_tokens(value: &str, upstream_host: &str, client_host: &str) -> String {
    value
        .replace(TOKEN_UPSTREAM, upstream_host)
        .replace(TOKEN_CUSTOM_DOMAIN, client_host)
}

/// Run one chunk through the rule table. Chunks with no match are handed
/// back untouched, without a copy.
pub fn apply_rules(rules: &[CompiledRule], chunk: Bytes) -> Bytes {
    let mut rewritten: Option<Vec<u8>> = None;

    for rule in rules {
        let haystack: &[u8] = rewritten.as_deref().unwrap_or(&chunk);
        if rule.pattern.is_match(haystack) {
            rewritten = Some(
                rule.pattern
                    .replace_all(haystack, NoExpand(rule.replacement.as_ref()))
                    .into_owned(),
            );
        }
    }

    match rewritten {
        Some(data) => Bytes::from(data),
        None => chunk,
    }
}

/// True when the Content-Type names UTF-8 text/HTML, the only bodies the
/// rewrite stage touches. A missing charset means passthrough: re-encoding
/// an unknown charset chunk-wise is not safe.
pub fn is_rewritable_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("utf-8") && (ct.starts_with("text/") || ct.contains("html"))
}

pin_project! {
    /// Applies a compiled rule table to every chunk of the inner stream,
    /// forwarding each rewritten chunk immediately. The full body is never
    /// buffered.
    ///
    /// Matching is chunk-local: a search string that spans a chunk
    /// boundary is not found. Known limitation of the streaming rewrite.
    pub struct RewriteStream<S> {
        #[pin]
        inner: S,
        rules: Vec<CompiledRule>,
    }
}

impl<S> RewriteStream<S> {
    pub fn new(inner: S, rules: Vec<CompiledRule>) -> Self {
        Self { inner, rules }
    }
}

impl<S, E> Stream for RewriteStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(apply_rules(this.rules, chunk)))),
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Apply the response header policy. Each decision is independent of the
/// others:
/// - security policy headers are always removed
/// - CORS is forced open
/// - the cache policy follows the config flag
/// - a present `x-pjax-url` has the upstream host swapped for the client's
/// - hop-by-hop fields are dropped, and `Content-Length` too when the body
///   went through the rewrite stage (its length may have changed)
pub fn sanitize_response_headers(
    headers: &mut HeaderMap,
    config: &ProxyConfig,
    upstream_host: &str,
    client_host: &str,
    body_rewritten: bool,
) {
    headers.remove(CONTENT_SECURITY_POLICY);
    headers.remove(CONTENT_SECURITY_POLICY_REPORT_ONLY);
    headers.remove(CLEAR_SITE_DATA);

    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    if body_rewritten {
        headers.remove(CONTENT_LENGTH);
    }

    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );

    let cache_policy = if config.disable_cache {
        HeaderValue::from_static("no-store")
    } else {
        HeaderValue::from_static(CACHE_LONG)
    };
    headers.insert(CACHE_CONTROL, cache_policy);

    let pjax = headers
        .get(&X_PJAX_URL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(pjax) = pjax {
        let swapped = pjax.replace(
            &format!("//{upstream_host}"),
            &format!("//{client_host}"),
        );
        if let Ok(value) = HeaderValue::from_str(&swapped) {
            headers.insert(X_PJAX_URL, value);
        }
    }
}
