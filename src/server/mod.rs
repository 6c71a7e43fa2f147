//! Downstream HTTP surface.
//!
//! Exposes the MCP endpoints (`/mcp[/{selector}]` streamable-HTTP,
//! `/sse[/{selector}]` + `/messages[/{selector}]` SSE) on one axum router.
//! The MCP protocol machinery per endpoint comes from the SDK; one service
//! instance is created lazily per selector so each session binds to its
//! group. Bearer auth and the global-route gate run as middleware in front.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Router,
};
use dashmap::DashMap;
use rmcp::transport::{
    sse_server::{SseServer, SseServerConfig},
    streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    },
};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::{hub::Hub, session::HubService};

const DOWNSTREAM_KEEP_ALIVE: Duration = Duration::from_secs(15);

type HubStreamableService = StreamableHttpService<HubService, LocalSessionManager>;

pub struct HttpState {
    hub: Arc<Hub>,
    streamable: DashMap<String, HubStreamableService>,
    sse: DashMap<String, Router>,
    ct: CancellationToken,
}

impl HttpState {
    fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            streamable: DashMap::new(),
            sse: DashMap::new(),
            ct: CancellationToken::new(),
        }
    }

    /// Streamable-HTTP protocol service for one selector, created on first
    /// use. Each selector keeps its own session manager.
    fn streamable_for(&self, selector: Option<&str>) -> HubStreamableService {
        let key = selector.unwrap_or("").to_string();
        if let Some(service) = self.streamable.get(&key) {
            return service.clone();
        }

        debug!(selector = %key, "Creating streamable endpoint");
        let hub = Arc::clone(&self.hub);
        let bound_selector = selector.map(str::to_string);
        let service = StreamableHttpService::new(
            move || Ok(HubService::new(Arc::clone(&hub), bound_selector.clone())),
            Arc::new(LocalSessionManager::default()),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(DOWNSTREAM_KEEP_ALIVE),
            },
        );
        self.streamable.insert(key, service.clone());
        service
    }

    /// SSE router for one selector. The inner router owns the event stream
    /// and message endpoints at their final paths, so requests dispatch into
    /// it unmodified and the advertised messages path stays scoped.
    fn sse_router_for(&self, selector: Option<&str>) -> Router {
        let key = selector.unwrap_or("").to_string();
        if let Some(router) = self.sse.get(&key) {
            return router.clone();
        }

        let (sse_path, post_path) = match selector {
            None => ("/sse".to_string(), "/messages".to_string()),
            Some(g) => (format!("/sse/{}", g), format!("/messages/{}", g)),
        };

        debug!(selector = %key, sse = %sse_path, "Creating SSE endpoint");
        let (sse_server, router) = SseServer::new(SseServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            sse_path,
            post_path,
            ct: self.ct.child_token(),
            sse_keep_alive: Some(DOWNSTREAM_KEEP_ALIVE),
        });

        let hub = Arc::clone(&self.hub);
        let bound_selector = selector.map(str::to_string);
        sse_server.with_service(move || HubService::new(Arc::clone(&hub), bound_selector.clone()));

        self.sse.insert(key, router.clone());
        router
    }
}

/// Assemble the downstream router.
pub fn build_router(hub: Arc<Hub>) -> Router {
    let state = Arc::new(HttpState::new(hub));

    Router::new()
        .route("/mcp", any(mcp_global))
        .route("/mcp/{selector}", any(mcp_scoped))
        .route("/sse", get(sse_global))
        .route("/sse/{selector}", get(sse_scoped))
        .route("/messages", post(messages_global))
        .route("/messages/{selector}", post(messages_scoped))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), gate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bearer-auth and global-route gates (§6).
async fn gate(
    State(state): State<Arc<HttpState>>,
    request: Request,
    next: Next,
) -> Response {
    let settings = state.hub.settings().current();
    let routing = &settings.system_config.routing;

    if routing.enable_bearer_auth && !routing.skip_auth {
        let expected = routing.bearer_auth_key.as_deref().unwrap_or("");
        let provided = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if expected.is_empty() || provided != Some(expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    if !routing.enable_global_route {
        let path = request.uri().path().trim_end_matches('/');
        if matches!(path, "/mcp" | "/sse" | "/messages") {
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    next.run(request).await
}

async fn mcp_global(State(state): State<Arc<HttpState>>, request: Request) -> Response {
    forward_streamable(state, None, request).await
}

async fn mcp_scoped(
    State(state): State<Arc<HttpState>>,
    Path(selector): Path<String>,
    request: Request,
) -> Response {
    forward_streamable(state, Some(selector), request).await
}

async fn forward_streamable(
    state: Arc<HttpState>,
    selector: Option<String>,
    request: Request<Body>,
) -> Response {
    let mut service = state.streamable_for(selector.as_deref());
    match service.call(request).await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn sse_global(State(state): State<Arc<HttpState>>, request: Request) -> Response {
    forward_sse(state, None, request).await
}

async fn sse_scoped(
    State(state): State<Arc<HttpState>>,
    Path(selector): Path<String>,
    request: Request,
) -> Response {
    forward_sse(state, Some(selector), request).await
}

async fn messages_global(State(state): State<Arc<HttpState>>, request: Request) -> Response {
    forward_sse(state, None, request).await
}

async fn messages_scoped(
    State(state): State<Arc<HttpState>>,
    Path(selector): Path<String>,
    request: Request,
) -> Response {
    forward_sse(state, Some(selector), request).await
}

async fn forward_sse(
    state: Arc<HttpState>,
    selector: Option<String>,
    request: Request<Body>,
) -> Response {
    let router = state.sse_router_for(selector.as_deref());
    match router.oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::test_hub;
    use crate::settings::Settings;
    use axum::http::Method;

    fn request(method: Method, path: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn settings_with_auth(key: &str) -> Settings {
        let mut settings = Settings::default();
        settings.system_config.routing.enable_bearer_auth = true;
        settings.system_config.routing.bearer_auth_key = Some(key.to_string());
        settings
    }

    #[tokio::test]
    async fn test_bearer_gate_rejects_missing_and_wrong_tokens() {
        let hub = test_hub(settings_with_auth("secret")).await;
        let router = build_router(Arc::clone(&hub));

        for path in ["/mcp", "/sse", "/messages", "/mcp/$smart", "/sse/dev"] {
            let method = if path.starts_with("/messages") || path.starts_with("/mcp") {
                Method::POST
            } else {
                Method::GET
            };

            let response = router
                .clone()
                .oneshot(request(method.clone(), path, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "path {}", path);

            let response = router
                .clone()
                .oneshot(request(method, path, Some("wrong")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "path {}", path);
        }
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_bearer_gate_admits_matching_token() {
        let hub = test_hub(settings_with_auth("secret")).await;
        let router = build_router(Arc::clone(&hub));

        let response = router
            .clone()
            .oneshot(request(Method::GET, "/mcp", Some("secret")))
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_skip_auth_bypasses_bearer() {
        let mut settings = settings_with_auth("secret");
        settings.system_config.routing.skip_auth = true;
        let hub = test_hub(settings).await;
        let router = build_router(Arc::clone(&hub));

        let response = router
            .clone()
            .oneshot(request(Method::GET, "/mcp", None))
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_route_gate() {
        let mut settings = Settings::default();
        settings.system_config.routing.enable_global_route = false;
        let hub = test_hub(settings).await;
        let router = build_router(Arc::clone(&hub));

        for path in ["/mcp", "/sse", "/messages"] {
            let response = router
                .clone()
                .oneshot(request(Method::GET, path, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "path {}", path);
        }

        // Scoped routes stay reachable.
        let response = router
            .clone()
            .oneshot(request(Method::GET, "/sse/dev", None))
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::FORBIDDEN);
        hub.shutdown().await;
    }
}
