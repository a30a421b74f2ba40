//! URL derivation from the configured endpoint, and HTTP failure
//! classification shared by the HTTP-based transports.

use reqwest::{StatusCode, Url};
use tether_core::TransportError;

/// Parse the configured `http(s)://` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, TransportError> {
    let url = Url::parse(endpoint.trim())
        .map_err(|e| TransportError::network(format!("invalid endpoint {endpoint}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TransportError::network(format!(
            "endpoint scheme must be http(s), got {other}"
        ))),
    }
}

/// Append `path` to the endpoint's own path prefix.
///
/// `https://api.example.com/v1` + `/ws` → `https://api.example.com/v1/ws`.
/// Any query on the endpoint is dropped.
pub fn join_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{path}"));
    url.set_query(None);
    url
}

/// Switch `http` → `ws` and `https` → `wss`.
pub fn websocket_url(url: &Url) -> Result<Url, TransportError> {
    let mut ws = url.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::network(format!(
                "cannot derive a websocket URL from scheme {other}"
            )));
        }
    };
    ws.set_scheme(scheme)
        .map_err(|()| TransportError::network(format!("cannot set scheme {scheme} on {url}")))?;
    Ok(ws)
}

/// Classify a non-success HTTP status. 401/403 are credential rejections.
pub fn check_status(status: StatusCode, what: &str) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    let auth = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN);
    Err(TransportError::rejected(auth, format!("{what} returned HTTP {status}")))
}

/// Classify a failed HTTP exchange.
pub fn request_error(error: &reqwest::Error, what: &str) -> TransportError {
    if error.is_timeout() {
        TransportError::timeout(format!("{what} timed out"))
    } else if error.is_decode() || error.is_body() {
        TransportError::protocol(format!("{what} body unreadable: {error}"))
    } else {
        TransportError::network(format!("{what} failed: {error}"))
    }
}
