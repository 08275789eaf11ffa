//! HTTP surface for the service registry.
//!
//! Route table mirrors the eight registry endpoints: two unauthenticated
//! reads (`GET /meta/version`, `GET /services`) and six authenticated
//! mutation endpoints for worker/czar/controller self-registration and
//! removal. Every mutating route requires an `X-Auth-Key` header matching
//! the configured shared secret and an `X-Instance-Id` header matching
//! this registry's instance id, per §4.6.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::state::RegistryState;
use crate::config::SecurityContext;

#[derive(Clone)]
struct AppState {
    registry: Arc<RegistryState>,
    security: Arc<SecurityContext>,
}

#[derive(Clone)]
pub struct RegistryServer {
    state: AppState,
}

impl RegistryServer {
    pub fn new(state: Arc<RegistryState>) -> Self {
        Self::with_security(state, SecurityContext { auth_key: String::new(), instance_id: String::new() })
    }

    pub fn with_security(state: Arc<RegistryState>, security: SecurityContext) -> Self {
        Self {
            state: AppState { registry: state, security: Arc::new(security) },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/meta/version", get(version))
            .route("/services", get(services))
            .route("/worker", post(add_worker))
            .route("/qserv-worker", post(add_qserv_worker))
            .route("/worker/{name}", delete(remove_worker))
            .route("/czar", post(add_czar))
            .route("/czar/{name}", delete(remove_czar))
            .route("/controller", post(add_controller))
            .route("/controller/{name}", delete(remove_controller))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

async fn version() -> impl IntoResponse {
    Json(json!({
        "kind": "qserv-registry",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn services(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.services_snapshot())
}

fn worker_name(payload: &Value) -> Result<&str, (StatusCode, Json<Value>)> {
    payload
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_request("payload is missing required field 'name'"))
}

fn bad_request(msg: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg})))
}

fn unauthorized(msg: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": msg})))
}

/// Enforce the `X-Auth-Key` / `X-Instance-Id` pair on a mutating route.
/// A blank configured `auth_key` disables enforcement entirely, which is
/// the out-of-the-box (no security context configured) default.
fn authorize(headers: &HeaderMap, security: &SecurityContext) -> Result<(), (StatusCode, Json<Value>)> {
    if security.auth_key.is_empty() {
        return Ok(());
    }
    let auth_key = headers.get("x-auth-key").and_then(|v| v.to_str().ok()).unwrap_or("");
    let instance_id = headers.get("x-instance-id").and_then(|v| v.to_str().ok()).unwrap_or("");
    if auth_key != security.auth_key {
        warn!("registry mutation rejected: bad auth key");
        return Err(unauthorized("invalid or missing X-Auth-Key"));
    }
    if instance_id != security.instance_id {
        warn!("registry mutation rejected: instance id mismatch");
        return Err(unauthorized("invalid or missing X-Instance-Id"));
    }
    Ok(())
}

async fn add_worker(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.security) {
        return err.into_response();
    }
    match worker_name(&payload) {
        Ok(name) => {
            state.registry.register_worker(name, "replication-worker", &payload, addr.ip());
            info!(worker = name, "replication-worker registered");
            (StatusCode::OK, Json(json!({"success": true}))).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn add_qserv_worker(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.security) {
        return err.into_response();
    }
    match worker_name(&payload) {
        Ok(name) => {
            state.registry.register_worker(name, "qserv-worker", &payload, addr.ip());
            info!(worker = name, "qserv-worker registered");
            (StatusCode::OK, Json(json!({"success": true}))).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn remove_worker(State(state): State<AppState>, headers: HeaderMap, Path(name): Path<String>) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.security) {
        return err.into_response();
    }
    if state.registry.remove_worker(&name) {
        (StatusCode::OK, Json(json!({"success": true}))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"success": false}))).into_response()
    }
}

async fn add_czar(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.security) {
        return err.into_response();
    }
    match worker_name(&payload) {
        Ok(name) => {
            state.registry.register_czar(name, &payload, addr.ip());
            info!(czar = name, "czar registered");
            (StatusCode::OK, Json(json!({"success": true}))).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn remove_czar(State(state): State<AppState>, headers: HeaderMap, Path(name): Path<String>) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.security) {
        return err.into_response();
    }
    if state.registry.remove_czar(&name) {
        (StatusCode::OK, Json(json!({"success": true}))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"success": false}))).into_response()
    }
}

async fn add_controller(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.security) {
        return err.into_response();
    }
    match worker_name(&payload) {
        Ok(name) => {
            state.registry.register_controller(name, &payload, addr.ip());
            info!(controller = name, "controller registered");
            (StatusCode::OK, Json(json!({"success": true}))).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn remove_controller(State(state): State<AppState>, headers: HeaderMap, Path(name): Path<String>) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, &state.security) {
        return err.into_response();
    }
    if state.registry.remove_controller(&name) {
        (StatusCode::OK, Json(json!({"success": true}))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"success": false}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_server() -> RegistryServer {
        RegistryServer::new(Arc::new(RegistryState::new()))
    }

    fn secured_server() -> RegistryServer {
        RegistryServer::with_security(
            Arc::new(RegistryState::new()),
            SecurityContext { auth_key: "secret".to_string(), instance_id: "inst-1".to_string() },
        )
    }

    #[tokio::test]
    async fn version_requires_no_auth_and_reports_kind() {
        let router = test_server().router();
        let response = router
            .oneshot(Request::builder().uri("/meta/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn removing_unknown_worker_is_not_found() {
        let router = test_server().router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/worker/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mutation_without_auth_key_is_rejected_when_security_configured() {
        let router = secured_server().router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/worker/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mutation_with_correct_headers_passes_through_to_the_route() {
        let router = secured_server().router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/worker/ghost")
                    .header("x-auth-key", "secret")
                    .header("x-instance-id", "inst-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn services_read_never_requires_auth_even_when_security_configured() {
        let router = secured_server().router();
        let response = router
            .oneshot(Request::builder().uri("/services").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_controller_route_is_wired_to_the_registry() {
        let state = Arc::new(RegistryState::new());
        state.register_controller(
            "ctrl1",
            &json!({}),
            std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        );
        let router = RegistryServer::with_security(
            state,
            SecurityContext { auth_key: "secret".to_string(), instance_id: "inst-1".to_string() },
        )
        .router();

        let response = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/controller/ctrl1")
                    .header("x-auth-key", "secret")
                    .header("x-instance-id", "inst-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
