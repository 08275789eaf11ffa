//! Czar management HTTP surface: the `/query` control-plane endpoint
//! (§6) that cancels, cancels-after-restart, or completes a user query by
//! fanning the operation out to every worker currently in the registry.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::querymgmt::{query_op_fanout, QueryOp, WorkerQueryManagement};
use crate::registry::RegistryState;

#[derive(Clone)]
struct AppState {
    client: Arc<dyn WorkerQueryManagement>,
    registry: Arc<RegistryState>,
}

#[derive(Debug, Deserialize)]
struct QueryManagementRequest {
    op: QueryOp,
    query_id: u64,
    #[allow(dead_code)]
    czar_id: String,
}

/// Exposes `POST /query` over the czar's own worker-query-management
/// client (normally a [`crate::controller::Controller`]).
pub struct CzarManagementServer {
    state: AppState,
}

impl CzarManagementServer {
    pub fn new(client: Arc<dyn WorkerQueryManagement>, registry: Arc<RegistryState>) -> Self {
        Self { state: AppState { client, registry } }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/query", post(handle_query_management))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

async fn handle_query_management(
    State(state): State<AppState>,
    Json(req): Json<QueryManagementRequest>,
) -> impl IntoResponse {
    let workers = state.registry.worker_names();
    info!(
        op = ?req.op,
        query_id = req.query_id,
        czar_id = %req.czar_id,
        worker_count = workers.len(),
        "fanning out query management request"
    );
    let results = query_op_fanout(&*state.client, &workers, req.op, req.query_id).await;
    (StatusCode::OK, Json(json!(results)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    struct FakeClient {
        fail_worker: Option<String>,
    }

    #[async_trait::async_trait]
    impl WorkerQueryManagement for FakeClient {
        async fn apply(&self, worker_name: &str, _op: QueryOp, _query_id: u64) -> Result<(), String> {
            if self.fail_worker.as_deref() == Some(worker_name) {
                Err("unknown query id".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn registry_with_workers(names: &[&str]) -> Arc<RegistryState> {
        let registry = Arc::new(RegistryState::new());
        for name in names {
            registry.register_worker(
                name,
                "qserv-worker",
                &json!({}),
                std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
            );
        }
        registry
    }

    #[tokio::test]
    async fn query_fans_out_to_every_registered_worker() {
        let registry = registry_with_workers(&["worker-1", "worker-2"]);
        let client: Arc<dyn WorkerQueryManagement> = Arc::new(FakeClient { fail_worker: None });
        let server = CzarManagementServer::new(client, registry);

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"op":"CANCEL","query_id":42,"czar_id":"czar1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["worker-1"], "");
        assert_eq!(parsed["worker-2"], "");
    }

    #[tokio::test]
    async fn query_reports_per_worker_errors() {
        let registry = registry_with_workers(&["worker-1", "worker-2"]);
        let client: Arc<dyn WorkerQueryManagement> = Arc::new(FakeClient { fail_worker: Some("worker-2".to_string()) });
        let server = CzarManagementServer::new(client, registry);

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"op":"COMPLETE","query_id":7,"czar_id":"czar1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["worker-1"], "");
        assert_eq!(parsed["worker-2"], "unknown query id");
    }
}
