//! Webhook listeners
//!
//! One HTTP listener per distinct port serves every route registered on it.
//! Requests are matched on the exact path; the method must equal the route's.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use events_core::config::SourceType;
use events_core::error::{GatewayError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::route::{Classification, RouteRegistry, RouteSource, WebhookRequest};

// ============================================================================
// Generic webhook source
// ============================================================================

/// Plain webhook source; the whole body is the event payload
#[derive(Debug, Default, Clone, Copy)]
pub struct WebhookSource;

#[async_trait]
impl RouteSource for WebhookSource {
    fn source_type(&self) -> SourceType {
        SourceType::Webhook
    }

    fn verify(&self, _request: &WebhookRequest) -> Result<()> {
        Ok(())
    }

    fn classify(&self, request: &WebhookRequest) -> Result<Classification> {
        if request.body.is_empty() {
            return Err(GatewayError::parse("request body is empty"));
        }
        Ok(Classification::Event(request.body.clone()))
    }
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Clone)]
struct ListenerState {
    port: u16,
    registry: Arc<RouteRegistry>,
}

/// Router serving every route registered on `port`
///
/// Payloads are opaque and unbounded, so axum's request body limit is lifted.
pub fn listener_router(port: u16, registry: Arc<RouteRegistry>) -> Router {
    Router::new()
        .fallback(dispatch_request)
        .layer(DefaultBodyLimit::disable())
        .with_state(ListenerState { port, registry })
}

async fn dispatch_request(
    State(state): State<ListenerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(route) = state.registry.lookup(state.port, uri.path()) else {
        debug!(port = state.port, path = %uri.path(), "No route for path");
        return (StatusCode::NOT_FOUND, "route not found").into_response();
    };

    if !route.accepts(&method) {
        debug!(route = %route.name(), method = %method, "Method not allowed");
        return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
    }

    route
        .handle_request(&WebhookRequest::new(method, headers, body))
        .await
        .into_response()
}

/// Serve the routes on `port` until `shutdown` fires
pub async fn serve_port(
    port: u16,
    registry: Arc<RouteRegistry>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::config(format!("failed to bind {}: {}", addr, e)))?;
    info!(port, "Webhook listener started");

    axum::serve(listener, listener_router(port, registry))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| GatewayError::Internal(format!("webhook listener on {} failed: {}", port, e)))?;

    info!(port, "Webhook listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use crate::slack::SlackSource;
    use axum::body::Body;
    use axum::http::Request;
    use events_core::config::RouteConfig;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_path_and_wrong_method() {
        let mut registry = RouteRegistry::new();
        let (route, _rx) = Route::new(
            RouteConfig::new("hooks", SourceType::Webhook, "/hooks"),
            Arc::new(WebhookSource),
        )
        .unwrap();
        registry.register(route).unwrap();
        let app = listener_router(12000, Arc::new(registry));

        let response = app
            .clone()
            .oneshot(Request::post("/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/hooks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_webhook_body_forwarded_verbatim() {
        let mut registry = RouteRegistry::new();
        let (route, mut rx) = Route::new(
            RouteConfig::new("hooks", SourceType::Webhook, "/hooks"),
            Arc::new(WebhookSource),
        )
        .unwrap();
        route.activate().await.unwrap();
        registry.register(route).unwrap();
        let app = listener_router(12000, Arc::new(registry));

        let response = app
            .oneshot(
                Request::post("/hooks")
                    .body(Body::from(&b"\x00raw\xff"[..]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "success");
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"\x00raw\xff");
    }

    #[tokio::test]
    async fn test_large_body_accepted() {
        let mut registry = RouteRegistry::new();
        let (route, mut rx) = Route::new(
            RouteConfig::new("hooks", SourceType::Webhook, "/hooks"),
            Arc::new(WebhookSource),
        )
        .unwrap();
        route.activate().await.unwrap();
        registry.register(route).unwrap();
        let app = listener_router(12000, Arc::new(registry));

        let body = vec![b'x'; 3 * 1024 * 1024];
        let response = app
            .oneshot(Request::post("/hooks").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().len(), 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_inactive_route_returns_client_error() {
        let mut registry = RouteRegistry::new();
        let (route, mut rx) = Route::new(
            RouteConfig::new("hooks", SourceType::Webhook, "/hooks"),
            Arc::new(WebhookSource),
        )
        .unwrap();
        registry.register(route).unwrap();
        let app = listener_router(12000, Arc::new(registry));

        let response = app
            .oneshot(Request::post("/hooks").body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "endpoint is inactive");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slack_challenge_over_http() {
        let mut registry = RouteRegistry::new();
        let (route, mut rx) = Route::new(
            RouteConfig::new("slack", SourceType::Slack, "/slack"),
            Arc::new(SlackSource::new(None, None, Duration::from_secs(300))),
        )
        .unwrap();
        route.activate().await.unwrap();
        registry.register(route).unwrap();
        let app = listener_router(12000, Arc::new(registry));

        let response = app
            .oneshot(
                Request::post("/slack")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"type":"url_verification","challenge":"T123"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text");
        assert_eq!(body_string(response).await, "T123");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_webhook_body_is_parse_error() {
        let request = WebhookRequest::new(Method::POST, HeaderMap::new(), Bytes::new());
        assert!(matches!(
            WebhookSource.classify(&request),
            Err(GatewayError::Parse { .. })
        ));
    }
}
