//! Proxy server implementation
//! Gates inbound requests, forwards them to the device-selected upstream and
//! streams the rewritten response back

use crate::access::AccessControl;
use crate::config::ProxyConfig;
use crate::device::UpstreamSelector;
use crate::error::ProxyError;
use crate::rate_limit::RateLimiter;
use crate::rewrite::{
    is_rewritable_content_type, sanitize_response_headers, CompiledRule, RewriteEngine,
    RewriteStream,
};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    REFERER, TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};
use url::Url;

/// Body type used on every path through the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Header the edge uses to hand us the real client address.
const CLIENT_IP_HEADER: &str = "cf-connecting-ip";

/// Header the edge uses to hand us the client's region code.
const CLIENT_REGION_HEADER: &str = "cf-ipcountry";

/// Proxy server
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    rate_limiter: Arc<RateLimiter>,
    access_control: Arc<AccessControl>,
    rewrite_engine: Arc<RewriteEngine>,
    selector: UpstreamSelector,
    tls: TlsConnector,
}

impl ProxyServer {
    /// Create a new proxy server from its injected services.
    pub fn new(
        config: Arc<ProxyConfig>,
        rate_limiter: Arc<RateLimiter>,
        access_control: Arc<AccessControl>,
        rewrite_engine: Arc<RewriteEngine>,
    ) -> Self {
        let selector = UpstreamSelector::new(
            config.upstream.clone(),
            config.upstream_mobile.clone(),
        );

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let tls = TlsConnector::from(Arc::new(tls_config));

        Self {
            config,
            rate_limiter,
            access_control,
            rewrite_engine,
            selector,
            tls,
        }
    }

    /// Start the proxy server
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);

        tokio::spawn(
            self.rate_limiter
                .clone()
                .run_sweeper(self.config.cleanup_interval),
        );

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single inbound connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let server = self.clone();

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request, translating failures into status responses
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.process_request(req, remote_addr).await {
            Ok(response) => {
                debug!("{} {} -> {}", method, path, response.status());
                Ok(response)
            }
            Err(e) => {
                match e {
                    ProxyError::RateLimited | ProxyError::AccessDenied => {
                        warn!("{} {} rejected: {}", method, path, e)
                    }
                    _ => error!("{} {} failed: {}", method, path, e),
                }
                Ok(Self::error_response(&e))
            }
        }
    }

    /// Process request
    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        debug!(
            "{} {} from {}",
            req.method(),
            req.uri().path(),
            remote_addr
        );

        // Health checks are answered locally, before any gate.
        if req.uri().path() == "/health" {
            return Ok(Self::text_response(StatusCode::OK, "OK"));
        }

        let client_ip = Self::client_ip(req.headers(), remote_addr);
        let region = Self::client_region(req.headers());

        if !self.rate_limiter.allow(client_ip) {
            return Err(ProxyError::RateLimited);
        }

        if self
            .access_control
            .is_blocked(&region, &client_ip.to_string())
        {
            return Err(ProxyError::AccessDenied);
        }

        let client_host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::MalformedRequest("missing Host header".to_string()))?;

        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let upstream_host = self.selector.select(user_agent.as_deref()).to_string();

        if Self::is_websocket_upgrade(&req) {
            return self.websocket_passthrough(req, &upstream_host).await;
        }

        self.forward(req, &upstream_host, &client_host).await
    }

    /// Forward the request and stream the rewritten response back
    async fn forward(
        &self,
        req: Request<Incoming>,
        upstream_host: &str,
        client_host: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (parts, body) = req.into_parts();

        let path_q = Self::build_upstream_path(&self.config.upstream_path, &parts.uri);
        let uri: Uri = path_q
            .parse()
            .map_err(|e| ProxyError::MalformedRequest(format!("invalid path {path_q}: {e}")))?;
        let headers =
            Self::build_upstream_headers(&self.config, &parts.headers, upstream_host)?;

        // GET and HEAD carry no body; everything else streams through unread.
        let outbound_body: ProxyBody =
            if parts.method == Method::GET || parts.method == Method::HEAD {
                Self::empty_body()
            } else {
                body.boxed()
            };

        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(outbound_body)
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        *outbound.headers_mut() = headers;

        let upstream_response = self.send_upstream(upstream_host, outbound).await?;

        let (mut parts, body) = upstream_response.into_parts();

        let rewritable = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(is_rewritable_content_type)
            .unwrap_or(false);

        sanitize_response_headers(
            &mut parts.headers,
            &self.config,
            upstream_host,
            client_host,
            rewritable,
        );

        let body = if rewritable {
            let rules = self.rewrite_engine.rules_for(upstream_host, client_host);
            Self::rewritten_body(body, rules)
        } else {
            body.boxed()
        };

        Ok(Response::from_parts(parts, body))
    }

    /// Relay a WebSocket upgrade verbatim and splice the two upgraded
    /// connections. No header or body rewriting happens on this path.
    async fn websocket_passthrough(
        &self,
        mut req: Request<Incoming>,
        upstream_host: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let path_q = Self::build_upstream_path(&self.config.upstream_path, req.uri());
        let uri: Uri = path_q
            .parse()
            .map_err(|e| ProxyError::MalformedRequest(format!("invalid path {path_q}: {e}")))?;

        // Connection, Upgrade and the Sec-WebSocket-* fields must survive,
        // so the inbound headers are kept wholesale and only the overrides
        // are applied.
        let mut headers = req.headers().clone();
        Self::inject_override_headers(&self.config, &mut headers, upstream_host)?;

        let mut outbound = Request::builder()
            .method(req.method().clone())
            .uri(uri)
            .version(Version::HTTP_11)
            .body(Self::empty_body())
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        *outbound.headers_mut() = headers;

        let mut upstream_response = self.send_upstream(upstream_host, outbound).await?;

        if upstream_response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);

            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, upstream_upgrade) {
                    Ok((client_io, upstream_io)) => {
                        let mut client_io = TokioIo::new(client_io);
                        let mut upstream_io = TokioIo::new(upstream_io);
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                        {
                            debug!("WebSocket tunnel closed: {}", e);
                        }
                    }
                    Err(e) => warn!("WebSocket upgrade failed: {}", e),
                }
            });
        }

        let (parts, body) = upstream_response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Connect to the upstream, TLS if configured, and send the request.
    async fn send_upstream(
        &self,
        upstream_host: &str,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let (host, port) = Self::host_and_port(&self.config, upstream_host)?;

        let tcp = TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
            ProxyError::UpstreamFailure(format!("connect to {host}:{port}: {e}"))
        })?;

        if self.config.upstream_tls {
            let server_name = ServerName::try_from(host.clone()).map_err(|_| {
                ProxyError::MalformedRequest(format!("invalid upstream hostname {host}"))
            })?;
            let tls = self.tls.connect(server_name, tcp).await.map_err(|e| {
                ProxyError::UpstreamFailure(format!("tls handshake with {host}: {e}"))
            })?;
            Self::exchange(TokioIo::new(tls), req, upstream_host).await
        } else {
            Self::exchange(TokioIo::new(tcp), req, upstream_host).await
        }
    }

    async fn exchange<T>(
        io: T,
        req: Request<ProxyBody>,
        upstream_host: &str,
    ) -> Result<Response<Incoming>, ProxyError>
    where
        T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| {
                ProxyError::UpstreamFailure(format!("handshake with {upstream_host}: {e}"))
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream connection error: {}", e);
            }
        });

        sender.send_request(req).await.map_err(|e| {
            ProxyError::UpstreamFailure(format!("request to {upstream_host}: {e}"))
        })
    }

    /// Resolve the configured host into a hostname and connect port.
    fn host_and_port(
        config: &ProxyConfig,
        upstream_host: &str,
    ) -> Result<(String, u16), ProxyError> {
        let url_str = format!("{}://{}", config.upstream_scheme(), upstream_host);
        let url = Url::parse(&url_str).map_err(|e| {
            ProxyError::MalformedRequest(format!("invalid upstream host {upstream_host}: {e}"))
        })?;

        let host = url
            .host_str()
            .ok_or_else(|| {
                ProxyError::MalformedRequest(format!("invalid upstream host {upstream_host}"))
            })?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if config.upstream_tls { 443 } else { 80 });

        Ok((host, port))
    }

    /// Check if request is a WebSocket upgrade
    fn is_websocket_upgrade<T>(req: &Request<T>) -> bool {
        req.headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Client IP as supplied by the edge, falling back to the socket peer.
    fn client_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> IpAddr {
        headers
            .get(CLIENT_IP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_else(|| remote_addr.ip())
    }

    /// Client region code as supplied by the edge; empty when absent.
    fn client_region(headers: &HeaderMap) -> String {
        headers
            .get(CLIENT_REGION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    }

    /// Rewrite path based on the configured prefix, preserving the query
    fn build_upstream_path(upstream_path: &str, uri: &Uri) -> String {
        let prefix = upstream_path.trim_end_matches('/');
        let path = uri.path();

        let mut result = if path == "/" {
            if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix.to_string()
            }
        } else {
            format!("{}{}", prefix, path)
        };

        if let Some(query) = uri.query() {
            result = format!("{}?{}", result, query);
        }

        result
    }

    /// Copy inbound headers minus hop-by-hop fields, then apply overrides
    fn build_upstream_headers(
        config: &ProxyConfig,
        inbound: &HeaderMap,
        upstream_host: &str,
    ) -> Result<HeaderMap, ProxyError> {
        let mut headers = HeaderMap::new();

        for (name, value) in inbound.iter() {
            if name == HOST
                || name == CONTENT_LENGTH
                || name == CONNECTION
                || name == TRANSFER_ENCODING
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        Self::inject_override_headers(config, &mut headers, upstream_host)?;
        Ok(headers)
    }

    /// Set Host, Referer and Authorization for the upstream
    fn inject_override_headers(
        config: &ProxyConfig,
        headers: &mut HeaderMap,
        upstream_host: &str,
    ) -> Result<(), ProxyError> {
        let host = HeaderValue::from_str(upstream_host).map_err(|_| {
            ProxyError::MalformedRequest(format!("invalid upstream host {upstream_host}"))
        })?;
        headers.insert(HOST, host);

        let referer = format!("{}://{}", config.upstream_scheme(), upstream_host);
        let referer = HeaderValue::from_str(&referer).map_err(|_| {
            ProxyError::MalformedRequest(format!("invalid upstream host {upstream_host}"))
        })?;
        headers.insert(REFERER, referer);

        if !config.auth_token.is_empty() {
            let token = format!("Bearer {}", config.auth_token);
            let token = HeaderValue::from_str(&token).map_err(|_| {
                ProxyError::MalformedRequest("invalid auth token".to_string())
            })?;
            headers.insert(AUTHORIZATION, token);
        }

        Ok(())
    }

    /// Wrap an upstream body in the chunk-local rewrite stream.
    fn rewritten_body(body: Incoming, rules: Vec<CompiledRule>) -> ProxyBody {
        let stream = RewriteStream::new(body.into_data_stream(), rules).map_ok(Frame::data);
        BodyExt::boxed(StreamBody::new(stream))
    }

    /// Create error response with the taxonomy's status and a short body
    fn error_response(err: &ProxyError) -> Response<ProxyBody> {
        match err {
            ProxyError::RateLimited => Response::builder()
                .status(err.status_code())
                .header("Content-Type", "application/json")
                .body(Self::full_body(Bytes::from_static(
                    br#"{"status":429,"message":"Too many requests"}"#,
                )))
                .unwrap(),
            _ => Self::text_response(err.status_code(), &err.to_string()),
        }
    }

    /// Create text response
    fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Self::full_body(Bytes::from(body.to_string())))
            .unwrap()
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> ProxyBody {
        Full::new(bytes).map_err(|never| match never {}).boxed()
    }

    /// Create empty body
    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            upstream_path: "/mirror".to_string(),
            auth_token: "sekrit".to_string(),
            upstream_tls: false,
            ..ProxyConfig::default()
        }
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_build_upstream_path_root_becomes_prefix() {
        assert_eq!(ProxyServer::build_upstream_path("/mirror", &uri("/")), "/mirror");
    }

    #[test]
    fn test_build_upstream_path_prefix_prepended() {
        assert_eq!(
            ProxyServer::build_upstream_path("/mirror", &uri("/foo/bar")),
            "/mirror/foo/bar"
        );
    }

    #[test]
    fn test_build_upstream_path_query_preserved() {
        assert_eq!(
            ProxyServer::build_upstream_path("/mirror", &uri("/foo?a=1&b=2")),
            "/mirror/foo?a=1&b=2"
        );
    }

    #[test]
    fn test_build_upstream_path_bare_prefix() {
        assert_eq!(ProxyServer::build_upstream_path("/", &uri("/")), "/");
        assert_eq!(ProxyServer::build_upstream_path("/", &uri("/foo")), "/foo");
        assert_eq!(ProxyServer::build_upstream_path("", &uri("/foo")), "/foo");
    }

    #[test]
    fn test_build_upstream_headers_overrides() {
        let config = test_config();
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("proxy.mine.io"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));
        inbound.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));

        let headers =
            ProxyServer::build_upstream_headers(&config, &inbound, "upstream.example.com")
                .unwrap();

        assert_eq!(headers.get(HOST).unwrap(), "upstream.example.com");
        assert_eq!(headers.get(REFERER).unwrap(), "http://upstream.example.com");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sekrit");
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_no_auth_header_without_token() {
        let mut config = test_config();
        config.auth_token = String::new();

        let headers =
            ProxyServer::build_upstream_headers(&config, &HeaderMap::new(), "upstream.example.com")
                .unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_referer_scheme_follows_tls_flag() {
        let mut config = test_config();
        config.upstream_tls = true;

        let headers =
            ProxyServer::build_upstream_headers(&config, &HeaderMap::new(), "upstream.example.com")
                .unwrap();
        assert_eq!(headers.get(REFERER).unwrap(), "https://upstream.example.com");
    }

    #[test]
    fn test_is_websocket_upgrade() {
        let req = Request::builder()
            .uri("/ws")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(ProxyServer::is_websocket_upgrade(&req));

        let req = Request::builder()
            .uri("/ws")
            .header(UPGRADE, "WebSocket")
            .body(())
            .unwrap();
        assert!(ProxyServer::is_websocket_upgrade(&req));

        let req = Request::builder().uri("/plain").body(()).unwrap();
        assert!(!ProxyServer::is_websocket_upgrade(&req));
    }

    #[test]
    fn test_client_ip_prefers_edge_header() {
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_IP_HEADER, HeaderValue::from_static("1.2.3.4"));
        assert_eq!(
            ProxyServer::client_ip(&headers, remote),
            "1.2.3.4".parse::<IpAddr>().unwrap()
        );

        // Unparseable or missing header falls back to the peer address.
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_IP_HEADER, HeaderValue::from_static("not an ip"));
        assert_eq!(ProxyServer::client_ip(&headers, remote), remote.ip());
        assert_eq!(ProxyServer::client_ip(&HeaderMap::new(), remote), remote.ip());
    }

    #[test]
    fn test_client_region() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_REGION_HEADER, HeaderValue::from_static("US"));
        assert_eq!(ProxyServer::client_region(&headers), "US");
        assert_eq!(ProxyServer::client_region(&HeaderMap::new()), "");
    }

    #[test]
    fn test_host_and_port() {
        let config = test_config();
        assert_eq!(
            ProxyServer::host_and_port(&config, "upstream.example.com").unwrap(),
            ("upstream.example.com".to_string(), 80)
        );
        assert_eq!(
            ProxyServer::host_and_port(&config, "127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );

        let mut config = test_config();
        config.upstream_tls = true;
        assert_eq!(
            ProxyServer::host_and_port(&config, "upstream.example.com").unwrap(),
            ("upstream.example.com".to_string(), 443)
        );
    }

    #[test]
    fn test_error_responses() {
        let resp = ProxyServer::error_response(&ProxyError::RateLimited);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");

        let resp = ProxyServer::error_response(&ProxyError::AccessDenied);
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp =
            ProxyServer::error_response(&ProxyError::UpstreamFailure("boom".to_string()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp =
            ProxyServer::error_response(&ProxyError::MalformedRequest("bad".to_string()));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
