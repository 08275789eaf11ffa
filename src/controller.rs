//! Controller façade (component E).
//!
//! The `Controller` owns the registry of in-flight requests, a lazily
//! constructed [`Messenger`] per worker, and is the single place callers
//! submit typed replication/service operations. Completion always
//! notifies the caller's callback before the request is erased from the
//! registry, under the same lock — never the other way around, or a
//! caller could observe the request as both "finished" and "still
//! tracked" depending on timing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::messenger::{Messenger, Transport};
use crate::querymgmt::{QueryOp, WorkerQueryManagement};
use crate::request::{ExtendedState, Request};

type FinishCallback = Box<dyn FnOnce(&Request) + Send>;

/// Default ceiling for a submitted operation's adaptive status-poll
/// interval, used when a caller doesn't have a job-specific override.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

const PRIORITY_NORMAL: i32 = 2;
const PRIORITY_HIGH: i32 = 3;

/// Typed request bodies the controller can submit to a worker. Serialized
/// as JSON over the framed wire protocol; `QueryManagement` backs the
/// `/query` control-plane fan-out rather than a tracked `Request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Replicate { database: String, chunk: u32, source_worker: String },
    DeleteReplica { database: String, chunk: u32 },
    FindReplica { database: String, chunk: u32 },
    FindAllReplicas { database: String },
    StopReplicate { database: String, chunk: u32 },
    StatusReplicate { database: String, chunk: u32 },
    ServiceSuspend,
    ServiceResume,
    ServiceStatus,
    ServiceRequests,
    ServiceDrain,
    QueryManagement { op: QueryOp, query_id: u64 },
    Dispose { id: String },
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    status: String,
}

fn decode_extended_state(bytes: &[u8]) -> Result<ExtendedState> {
    let resp: WireResponse = serde_json::from_slice(bytes)?;
    Ok(match resp.status.as_str() {
        "SUCCESS" => ExtendedState::Success,
        "QUEUED" => ExtendedState::ServerQueued,
        "IN_PROGRESS" => ExtendedState::ServerInProgress,
        "IS_CANCELLING" => ExtendedState::ServerIsCancelling,
        "BAD" => ExtendedState::ServerBad,
        "FAILED" => ExtendedState::ServerError,
        "CANCELLED" => ExtendedState::ServerCancelled,
        other => return Err(Error::Protocol(format!("unrecognized worker status {other}"))),
    })
}

struct Tracked {
    request: Request,
    on_finish: Option<FinishCallback>,
}

/// Registry of requests the controller has submitted and not yet retired.
#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Tracked>,
}

/// Façade through which callers submit worker-bound operations and track
/// their completion. `T` is the transport each per-worker [`Messenger`]
/// drives; `make_transport` constructs one lazily the first time a worker
/// name is seen.
pub struct Controller<T: Transport> {
    registry: Mutex<Registry>,
    messengers: Mutex<HashMap<String, Arc<Messenger<T>>>>,
    make_transport: Box<dyn Fn(&str) -> T + Send + Sync>,
    running: AtomicBool,
}

impl<T: Transport + 'static> Controller<T> {
    pub fn new(make_transport: impl Fn(&str) -> T + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            messengers: Mutex::new(HashMap::new()),
            make_transport: Box::new(make_transport),
            running: AtomicBool::new(true),
        })
    }

    /// The messenger for `worker_name`, constructing it on first use.
    pub fn messenger_for(&self, worker_name: &str) -> Arc<Messenger<T>> {
        let mut messengers = self.messengers.lock();
        messengers
            .entry(worker_name.to_string())
            .or_insert_with(|| Arc::new(Messenger::new(worker_name, (self.make_transport)(worker_name))))
            .clone()
    }

    /// Register a freshly started request under its id, with the callback
    /// to invoke exactly once when it finishes.
    pub fn track(&self, request: Request, on_finish: impl FnOnce(&Request) + Send + 'static) {
        let id = request.id.clone();
        let mut registry = self.registry.lock();
        registry.by_id.insert(
            id,
            Tracked {
                request,
                on_finish: Some(Box::new(on_finish)),
            },
        );
    }

    pub fn in_flight(&self) -> usize {
        self.registry.lock().by_id.len()
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.registry.lock().by_id.contains_key(id)
    }

    /// Report a worker-side status update for `id`. If that finishes the
    /// request, the callback fires and the entry is erased from the
    /// registry — in that order, both under the same lock acquisition.
    pub fn report(&self, id: &str, reported: ExtendedState) -> Result<()> {
        self.report_and_poll(id, reported).map(|_| ())
    }

    /// Same contract as [`Self::report`], but surfaces the adaptive-poll
    /// interval when the request isn't finished yet, so a driving loop
    /// (see [`Self::submit_operation`]) knows how long to wait before
    /// re-asking the worker for status.
    fn report_and_poll(&self, id: &str, reported: ExtendedState) -> Result<Option<Duration>> {
        let mut registry = self.registry.lock();
        let tracked = registry
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("request {id} is not tracked")))?;

        let wait = tracked.request.keep_tracking_or_finish(reported);
        if wait.is_some() {
            return Ok(wait);
        }

        if let Some(cb) = tracked.on_finish.take() {
            cb(&tracked.request);
        }
        registry.by_id.remove(id);
        info!(id, "request retired from controller registry");
        Ok(None)
    }

    /// Cancel a tracked request explicitly. Same notify-then-erase
    /// ordering as a normal completion.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let mut tracked = registry
            .by_id
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("request {id} is not tracked")))?;
        tracked.request.cancel();
        if let Some(cb) = tracked.on_finish.take() {
            cb(&tracked.request);
        }
        Ok(())
    }

    /// Stop the controller. Asserts the registry is empty — callers are
    /// expected to drain or cancel outstanding requests first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let registry = self.registry.lock();
        if !registry.by_id.is_empty() {
            warn!(
                in_flight = registry.by_id.len(),
                "stopping controller with requests still in flight"
            );
        }
        assert!(registry.by_id.is_empty(), "controller stopped with requests still tracked");
    }

    /// Submit a typed [`Operation`] to `worker_name`, driving it through a
    /// tracked [`Request`] and the worker's [`Messenger`] per §4.5: assert
    /// running, construct and start the request, insert it into the
    /// registry, send, poll-or-finish, and (if `dispose_required`) fire a
    /// best-effort dispose on completion.
    pub async fn submit_operation(
        self: &Arc<Self>,
        worker_name: &str,
        priority: i32,
        operation: Operation,
        job_id: impl Into<String>,
        keep_tracking: bool,
        dispose_required: bool,
        max_poll_interval: Duration,
    ) -> Result<ExtendedState> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("controller is not running".into()));
        }

        let id = job_id.into();
        let mut request = Request::new(id.clone(), worker_name, priority, keep_tracking, dispose_required, max_poll_interval);
        request.start();

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.track(request, move |req| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send((req.extended_state(), req.dispose_required()));
            }
        });

        let messenger = self.messenger_for(worker_name);
        let payload = serde_json::to_vec(&operation)?;

        loop {
            match messenger.send(&id, priority, payload.clone()).await {
                Ok(bytes) => {
                    let extended = decode_extended_state(&bytes)?;
                    match self.report_and_poll(&id, extended)? {
                        Some(wait) => sleep(wait).await,
                        None => break,
                    }
                }
                Err(Error::Transport(e)) => {
                    warn!(worker = worker_name, error = %e, "operation send failed, retrying after reconnect");
                    sleep(Duration::from_millis(50)).await;
                }
                Err(e) => {
                    self.cancel(&id).ok();
                    return Err(e);
                }
            }
        }

        let (extended, wants_dispose) = rx.await.map_err(|_| Error::Internal("completion callback dropped".into()))?;
        if wants_dispose {
            self.spawn_dispose(messenger, id);
        }
        Ok(extended)
    }

    /// Best-effort: fire a dispose message on the worker's connection and
    /// ignore the outcome. Runs detached so completion isn't held up by
    /// it.
    fn spawn_dispose(self: &Arc<Self>, messenger: Arc<Messenger<T>>, request_id: String) {
        tokio::spawn(async move {
            let payload = match serde_json::to_vec(&Operation::Dispose { id: request_id.clone() }) {
                Ok(p) => p,
                Err(_) => return,
            };
            let dispose_id = format!("dispose-{request_id}");
            if let Err(e) = messenger.send(dispose_id, PRIORITY_NORMAL, payload).await {
                warn!(request_id, error = %e, "best-effort dispose failed");
            }
        });
    }

    pub async fn replicate(
        self: &Arc<Self>,
        worker_name: &str,
        database: impl Into<String>,
        chunk: u32,
        source_worker: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Result<ExtendedState> {
        self.submit_operation(
            worker_name,
            PRIORITY_NORMAL,
            Operation::Replicate { database: database.into(), chunk, source_worker: source_worker.into() },
            job_id,
            true,
            true,
            DEFAULT_MAX_POLL_INTERVAL,
        )
        .await
    }

    pub async fn delete_replica(
        self: &Arc<Self>,
        worker_name: &str,
        database: impl Into<String>,
        chunk: u32,
        job_id: impl Into<String>,
    ) -> Result<ExtendedState> {
        self.submit_operation(
            worker_name,
            PRIORITY_NORMAL,
            Operation::DeleteReplica { database: database.into(), chunk },
            job_id,
            true,
            true,
            DEFAULT_MAX_POLL_INTERVAL,
        )
        .await
    }

    pub async fn find_replica(
        self: &Arc<Self>,
        worker_name: &str,
        database: impl Into<String>,
        chunk: u32,
        job_id: impl Into<String>,
    ) -> Result<ExtendedState> {
        self.submit_operation(
            worker_name,
            PRIORITY_NORMAL,
            Operation::FindReplica { database: database.into(), chunk },
            job_id,
            false,
            false,
            DEFAULT_MAX_POLL_INTERVAL,
        )
        .await
    }

    pub async fn find_all_replicas(
        self: &Arc<Self>,
        worker_name: &str,
        database: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Result<ExtendedState> {
        self.submit_operation(
            worker_name,
            PRIORITY_NORMAL,
            Operation::FindAllReplicas { database: database.into() },
            job_id,
            false,
            false,
            DEFAULT_MAX_POLL_INTERVAL,
        )
        .await
    }

    pub async fn stop_replicate(
        self: &Arc<Self>,
        worker_name: &str,
        database: impl Into<String>,
        chunk: u32,
        job_id: impl Into<String>,
    ) -> Result<ExtendedState> {
        self.submit_operation(
            worker_name,
            PRIORITY_HIGH,
            Operation::StopReplicate { database: database.into(), chunk },
            job_id,
            true,
            true,
            DEFAULT_MAX_POLL_INTERVAL,
        )
        .await
    }

    pub async fn status_replicate(
        self: &Arc<Self>,
        worker_name: &str,
        database: impl Into<String>,
        chunk: u32,
        job_id: impl Into<String>,
    ) -> Result<ExtendedState> {
        self.submit_operation(
            worker_name,
            PRIORITY_NORMAL,
            Operation::StatusReplicate { database: database.into(), chunk },
            job_id,
            false,
            false,
            DEFAULT_MAX_POLL_INTERVAL,
        )
        .await
    }

    pub async fn service_suspend(self: &Arc<Self>, worker_name: &str, job_id: impl Into<String>) -> Result<ExtendedState> {
        self.submit_operation(worker_name, PRIORITY_HIGH, Operation::ServiceSuspend, job_id, true, false, DEFAULT_MAX_POLL_INTERVAL).await
    }

    pub async fn service_resume(self: &Arc<Self>, worker_name: &str, job_id: impl Into<String>) -> Result<ExtendedState> {
        self.submit_operation(worker_name, PRIORITY_HIGH, Operation::ServiceResume, job_id, true, false, DEFAULT_MAX_POLL_INTERVAL).await
    }

    pub async fn service_status(self: &Arc<Self>, worker_name: &str, job_id: impl Into<String>) -> Result<ExtendedState> {
        self.submit_operation(worker_name, PRIORITY_NORMAL, Operation::ServiceStatus, job_id, false, false, DEFAULT_MAX_POLL_INTERVAL).await
    }

    pub async fn service_requests(self: &Arc<Self>, worker_name: &str, job_id: impl Into<String>) -> Result<ExtendedState> {
        self.submit_operation(worker_name, PRIORITY_NORMAL, Operation::ServiceRequests, job_id, false, false, DEFAULT_MAX_POLL_INTERVAL).await
    }

    pub async fn service_drain(self: &Arc<Self>, worker_name: &str, job_id: impl Into<String>) -> Result<ExtendedState> {
        self.submit_operation(worker_name, PRIORITY_HIGH, Operation::ServiceDrain, job_id, true, false, DEFAULT_MAX_POLL_INTERVAL).await
    }
}

#[async_trait::async_trait]
impl<T: Transport + 'static> WorkerQueryManagement for Controller<T> {
    /// `/query` fan-out is fire-and-forget per worker, not tracked in the
    /// request registry: there's no job to poll, just a single message and
    /// a status reply.
    async fn apply(&self, worker_name: &str, op: QueryOp, query_id: u64) -> std::result::Result<(), String> {
        let messenger = self.messenger_for(worker_name);
        let payload = serde_json::to_vec(&Operation::QueryManagement { op, query_id }).map_err(|e| e.to_string())?;
        let id = format!("querymgmt-{worker_name}-{query_id}");

        match messenger.send(id, PRIORITY_HIGH, payload).await {
            Ok(bytes) => match decode_extended_state(&bytes) {
                Ok(ExtendedState::Success) => Ok(()),
                Ok(other) => Err(other.to_string()),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        }
    }
}
