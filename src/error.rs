//! Per-request error taxonomy
//! Every variant is terminal for its request; nothing here triggers a retry

use hyper::StatusCode;
use thiserror::Error;

/// Ways a proxied request can fail.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Client exceeded its sliding-window quota. Recoverable by the client
    /// once the window elapses.
    #[error("too many requests")]
    RateLimited,

    /// Client region or IP is on the deny list.
    #[error("access denied")]
    AccessDenied,

    /// The upstream could not be reached or the transfer failed before a
    /// response arrived. Upstream HTTP error statuses are not this variant;
    /// they pass through to the client.
    #[error("upstream request failed: {0}")]
    UpstreamFailure(String),

    /// Unparseable URL or header data on the inbound request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::AccessDenied => StatusCode::FORBIDDEN,
            ProxyError::UpstreamFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}
