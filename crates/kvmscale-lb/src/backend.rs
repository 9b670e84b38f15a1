//! A single reverse-proxied backend.

use std::sync::RwLock;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use http::uri::PathAndQuery;
use http::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use thiserror::Error;

/// The backend's position in the drain lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Alive,
    Draining,
}

#[derive(Debug, Error)]
#[error("invalid backend url {url:?}: {reason}")]
pub struct InvalidBackendUrl {
    pub url: String,
    pub reason: String,
}

/// Errors raised while talking to a backend.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request path: {0}")]
    Path(#[from] http::uri::InvalidUri),

    #[error("invalid upstream uri: {0}")]
    Uri(#[from] http::uri::InvalidUriParts),

    #[error("failed to build upstream request: {0}")]
    Request(#[from] http::Error),

    #[error("encoding payload failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

/// One registered backend: its URL, drain state, and the HTTP client
/// that acts as its reverse-proxy handle.
pub struct Backend {
    name: String,
    /// Normalized `scheme://authority` form used as the identity key.
    url: String,
    uri: Uri,
    state: RwLock<BackendState>,
    client: Client<HttpConnector, Body>,
}

impl Backend {
    pub fn new(name: &str, url: &str) -> Result<Self, InvalidBackendUrl> {
        let invalid = |reason: String| InvalidBackendUrl {
            url: url.to_string(),
            reason,
        };
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| invalid("missing scheme".to_string()))?;
        let authority = uri
            .authority()
            .ok_or_else(|| invalid("missing authority".to_string()))?;

        Ok(Self {
            name: name.to_string(),
            url: format!("{scheme}://{authority}"),
            uri,
            state: RwLock::new(BackendState::Alive),
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_alive(&self) -> bool {
        *self.state.read().expect("backend state lock") == BackendState::Alive
    }

    pub fn is_draining(&self) -> bool {
        *self.state.read().expect("backend state lock") == BackendState::Draining
    }

    /// Re-assert liveness after a successful probe. A draining backend
    /// stays draining; its removal is already scheduled.
    pub fn confirm_alive(&self) {
        let mut state = self.state.write().expect("backend state lock");
        if *state != BackendState::Draining {
            *state = BackendState::Alive;
        }
    }

    /// Flip to Draining. Returns false if the backend was already
    /// draining, so removal is scheduled at most once.
    pub fn begin_draining(&self) -> bool {
        let mut state = self.state.write().expect("backend state lock");
        if *state == BackendState::Draining {
            false
        } else {
            *state = BackendState::Draining;
            true
        }
    }

    /// Forward an incoming request to this backend, keeping the
    /// original path and query.
    pub async fn forward(&self, mut req: axum::extract::Request) -> Result<Response, ProxyError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let mut parts = self.uri.clone().into_parts();
        parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>()?);
        *req.uri_mut() = Uri::from_parts(parts)?;

        let response = self.client.request(req).await?;
        Ok(response.map(Body::new))
    }

    /// GET `<url>/health`, treating timeouts and transport errors as
    /// failures.
    pub async fn probe_health(&self, timeout: Duration) -> Result<(), ProbeFailure> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/health", self.url))
            .header(http::header::USER_AGENT, "kvmscale-lb/0.1")
            .body(Body::empty())
            .map_err(|e| ProbeFailure::Transport(e.to_string()))?;

        match tokio::time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) if response.status() == StatusCode::OK => Ok(()),
            Ok(Ok(response)) => Err(ProbeFailure::Status(response.status())),
            Ok(Err(err)) => Err(ProbeFailure::Transport(err.to_string())),
            Err(_) => Err(ProbeFailure::TimedOut),
        }
    }

    /// POST a JSON payload to `<url><path>` and return the status.
    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<StatusCode, ProxyError> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{path}", self.url))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))?;

        let response = self.client.request(request).await?;
        Ok(response.status())
    }
}

/// Why a health probe failed.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("health endpoint returned {0}")]
    Status(StatusCode),

    #[error("probe transport error: {0}")]
    Transport(String),

    #[error("probe timed out")]
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_normalized_to_scheme_and_authority() {
        let backend = Backend::new("b1", "http://10.0.0.1:3000").unwrap();
        assert_eq!(backend.url(), "http://10.0.0.1:3000");

        let backend = Backend::new("b1", "http://10.0.0.1:3000/").unwrap();
        assert_eq!(backend.url(), "http://10.0.0.1:3000");
    }

    #[test]
    fn url_without_scheme_is_rejected() {
        assert!(Backend::new("b1", "10.0.0.1:3000").is_err());
    }

    #[test]
    fn new_backend_starts_alive() {
        let backend = Backend::new("b1", "http://10.0.0.1:3000").unwrap();
        assert!(backend.is_alive());
        assert!(!backend.is_draining());
    }

    #[test]
    fn begin_draining_fires_once() {
        let backend = Backend::new("b1", "http://10.0.0.1:3000").unwrap();
        assert!(backend.begin_draining());
        assert!(!backend.begin_draining());
        assert!(backend.is_draining());
    }

    #[test]
    fn confirm_alive_does_not_resurrect_a_draining_backend() {
        let backend = Backend::new("b1", "http://10.0.0.1:3000").unwrap();
        backend.begin_draining();
        backend.confirm_alive();
        assert!(backend.is_draining());
    }

    #[tokio::test]
    async fn probe_against_closed_port_fails() {
        let backend = Backend::new("b1", "http://127.0.0.1:1").unwrap();
        let result = backend.probe_health(Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
