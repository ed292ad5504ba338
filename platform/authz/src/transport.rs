//! Ways of delivering a request to the permissions service.
//!
//! `HttpTransport` talks to a separately deployed service; `RouterTransport`
//! hands the request to an `axum::Router` mounted in the same process.

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, header::LOCATION},
};
use serde_json::Value;
use thiserror::Error;
use tower::ServiceExt;
use url::Url;

/// Largest in-process response body we are willing to buffer.
const MAX_LOCAL_BODY: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid permissions service url: {0}")]
    Url(#[from] url::ParseError),
    #[error("permissions service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid in-process request: {0}")]
    Request(#[from] axum::http::Error),
    #[error("unable to read in-process response: {0}")]
    Body(#[from] axum::Error),
}

#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path and query, always starting with `/`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ServiceResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ServiceResponse {
    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<ServiceResponse, TransportError>;

    /// Full target of `path`, for diagnostics.
    fn describe(&self, path: &str) -> String {
        path.to_string()
    }
}

/// Cross-process transport rooted at an absolute base URL.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
}

impl HttpTransport {
    pub fn new(base: &Url) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(client: reqwest::Client, base: &Url) -> Self {
        Self {
            client,
            base: base.as_str().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ServiceResponse, TransportError> {
        let url = Url::parse(&self.describe(&request.path))?;
        tracing::debug!(method = %request.method, %url, "calling permissions service");
        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(ServiceResponse {
            status,
            headers,
            body,
        })
    }

    fn describe(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Same-process transport dispatching straight into a router.
#[derive(Clone)]
pub struct RouterTransport {
    router: Router,
}

impl RouterTransport {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Transport for RouterTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ServiceResponse, TransportError> {
        tracing::debug!(method = %request.method, path = %request.path, "routing permissions request in-process");
        let mut outbound = Request::builder()
            .method(request.method)
            .uri(request.path.as_str())
            .body(Body::from(request.body.unwrap_or_default()))?;
        *outbound.headers_mut() = request.headers;

        let response = self
            .router
            .clone()
            .oneshot(outbound)
            .await
            .unwrap_or_else(|never| match never {});
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_LOCAL_BODY).await?;
        Ok(ServiceResponse {
            status: parts.status,
            headers: parts.headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::HeaderValue,
        routing::{get, post},
    };

    fn router() -> Router {
        Router::new()
            .route(
                "/az-permissions",
                post(|headers: HeaderMap, body: String| async move {
                    let user = headers
                        .get("x-caller")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    (
                        StatusCode::CREATED,
                        [(LOCATION, "/az-permissions?x")],
                        format!("{user}:{body}"),
                    )
                }),
            )
            .route("/az-is-allowed", get(|| async { "true" }))
    }

    #[tokio::test]
    async fn router_transport_round_trips_headers_and_body() {
        let transport = RouterTransport::new(router());
        let mut headers = HeaderMap::new();
        headers.insert("x-caller", HeaderValue::from_static("u7"));
        let response = transport
            .send(OutboundRequest {
                method: Method::POST,
                path: "/az-permissions".into(),
                headers,
                body: Some("{}".into()),
            })
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.location(), Some("/az-permissions?x"));
        assert_eq!(response.body, "u7:{}");
    }

    #[tokio::test]
    async fn router_transport_reports_unknown_routes() {
        let transport = RouterTransport::new(router());
        let response = transport
            .send(OutboundRequest {
                method: Method::GET,
                path: "/missing".into(),
                headers: HeaderMap::new(),
                body: None,
            })
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn http_transport_joins_base_by_concatenation() {
        let base = Url::parse("http://gateway.internal/perms/").unwrap();
        let transport = HttpTransport::new(&base);
        assert_eq!(
            transport.describe("/az-is-allowed?resource=x"),
            "http://gateway.internal/perms/az-is-allowed?resource=x"
        );
    }
}
