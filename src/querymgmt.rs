//! Query-management fan-out (control-plane `/query` operation).
//!
//! Cancelling, cancelling-after-restart, or completing a user query
//! requires telling every worker that might be running a fragment of it.
//! Requests are fanned out concurrently; the result is a per-worker error
//! map where an empty string means success, matching the wire contract
//! workers already expect from `wpublish`-style management requests.

use std::collections::HashMap;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The operations the `/query` control-plane endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryOp {
    CancelAfterRestart,
    Cancel,
    Complete,
}

/// One worker's outcome from a management fan-out: `Ok(())` on success,
/// `Err` carrying the worker's reported error text.
#[async_trait::async_trait]
pub trait WorkerQueryManagement: Send + Sync {
    async fn apply(&self, worker_name: &str, op: QueryOp, query_id: u64) -> Result<(), String>;
}

/// Apply `op` to `query_id` on every worker in `workers`, concurrently,
/// and collect a `worker_name -> error` map (empty string on success).
pub async fn query_op_fanout(
    client: &(dyn WorkerQueryManagement),
    workers: &[String],
    op: QueryOp,
    query_id: u64,
) -> HashMap<String, String> {
    let futures = workers.iter().map(|worker_name| async move {
        let result = client.apply(worker_name, op, query_id).await;
        let error = match result {
            Ok(()) => String::new(),
            Err(e) => {
                warn!(worker = %worker_name, query_id, ?op, error = %e, "worker rejected query management request");
                e
            }
        };
        (worker_name.clone(), error)
    });

    join_all(futures).await.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeClient {
        fail_on: Vec<String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl WorkerQueryManagement for FakeClient {
        async fn apply(&self, worker_name: &str, _op: QueryOp, _query_id: u64) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&worker_name.to_string()) {
                Err("unknown query id".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn collects_empty_string_on_success_and_error_text_on_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = FakeClient {
            fail_on: vec!["worker-2".to_string()],
            calls: calls.clone(),
        };
        let workers = vec!["worker-1".to_string(), "worker-2".to_string(), "worker-3".to_string()];

        let result = query_op_fanout(&client, &workers, QueryOp::Cancel, 42).await;

        assert_eq!(result["worker-1"], "");
        assert_eq!(result["worker-2"], "unknown query id");
        assert_eq!(result["worker-3"], "");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_worker_list_returns_empty_map() {
        let client = FakeClient { fail_on: vec![], calls: Arc::new(AtomicUsize::new(0)) };
        let result = query_op_fanout(&client, &[], QueryOp::Complete, 1).await;
        assert!(result.is_empty());
    }

    #[test]
    fn query_op_serializes_as_screaming_snake_case() {
        assert_eq!(serde_json::to_string(&QueryOp::CancelAfterRestart).unwrap(), "\"CANCEL_AFTER_RESTART\"");
        assert_eq!(serde_json::to_string(&QueryOp::Cancel).unwrap(), "\"CANCEL\"");
        assert_eq!(serde_json::to_string(&QueryOp::Complete).unwrap(), "\"COMPLETE\"");
    }
}
