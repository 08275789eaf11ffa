//! Request base state machine (component D).
//!
//! Every outbound operation against a worker is modeled as a `Request`:
//! `CREATED -> IN_PROGRESS -> FINISHED`, with an `ExtendedState` refining
//! the terminal `FINISHED` state. Adaptive polling doubles the retry
//! interval on each `keep_tracking_or_finish` call that doesn't finish the
//! request outright, capped at a configured ceiling.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Primary state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    InProgress,
    Finished,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Created => "CREATED",
            State::InProgress => "IN_PROGRESS",
            State::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// Refined sub-state once a request reaches `State::Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedState {
    None,
    Success,
    ClientError,
    ServerBad,
    ServerError,
    ServerCreated,
    ServerQueued,
    ServerInProgress,
    ServerIsCancelling,
    ServerCancelled,
    TimeoutExpired,
    Cancelled,
}

impl fmt::Display for ExtendedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtendedState::None => "NONE",
            ExtendedState::Success => "SUCCESS",
            ExtendedState::ClientError => "CLIENT_ERROR",
            ExtendedState::ServerBad => "SERVER_BAD",
            ExtendedState::ServerError => "SERVER_ERROR",
            ExtendedState::ServerCreated => "SERVER_CREATED",
            ExtendedState::ServerQueued => "SERVER_QUEUED",
            ExtendedState::ServerInProgress => "SERVER_IN_PROGRESS",
            ExtendedState::ServerIsCancelling => "SERVER_IS_CANCELLING",
            ExtendedState::ServerCancelled => "SERVER_CANCELLED",
            ExtendedState::TimeoutExpired => "TIMEOUT_EXPIRED",
            ExtendedState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl ExtendedState {
    /// States reported by the worker while a request is still being
    /// actively handled there, as opposed to a definitive outcome.
    fn is_in_progress_on_server(self) -> bool {
        matches!(
            self,
            ExtendedState::ServerCreated
                | ExtendedState::ServerQueued
                | ExtendedState::ServerInProgress
                | ExtendedState::ServerIsCancelling
        )
    }
}

/// Initial adaptive-polling interval. Doubles on each non-terminal
/// `keep_tracking_or_finish` call up to `max_poll_interval`.
pub const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Base state machine shared by every outbound worker request.
pub struct Request {
    pub id: String,
    pub worker_name: String,
    pub priority: i32,
    keep_tracking: bool,
    dispose_required: bool,
    state: State,
    extended_state: ExtendedState,
    poll_interval: Duration,
    max_poll_interval: Duration,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        worker_name: impl Into<String>,
        priority: i32,
        keep_tracking: bool,
        disposal_required: bool,
        max_poll_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            worker_name: worker_name.into(),
            priority,
            keep_tracking,
            dispose_required: disposal_required,
            state: State::Created,
            extended_state: ExtendedState::None,
            poll_interval: INITIAL_POLL_INTERVAL,
            max_poll_interval,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn extended_state(&self) -> ExtendedState {
        self.extended_state
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn keep_tracking(&self) -> bool {
        self.keep_tracking
    }

    pub fn dispose_required(&self) -> bool {
        self.dispose_required
    }

    /// Transition `CREATED -> IN_PROGRESS`. Must be called exactly once,
    /// before any tracking or finishing.
    pub fn start(&mut self) {
        assert_eq!(self.state, State::Created, "request already started");
        self.state = State::InProgress;
        info!(id = %self.id, worker = %self.worker_name, "request started");
    }

    /// Given the latest state reported by the worker, either keep polling
    /// (returning the next interval to wait) or transition to `FINISHED`.
    ///
    /// A server-side in-progress status doubles the poll interval and
    /// returns it; any other status is terminal and finishes the request.
    pub fn keep_tracking_or_finish(&mut self, reported: ExtendedState) -> Option<Duration> {
        assert_eq!(self.state, State::InProgress, "request is not in progress");

        if reported.is_in_progress_on_server() && self.keep_tracking {
            self.poll_interval = (self.poll_interval * 2).min(self.max_poll_interval);
            debug!(id = %self.id, next_poll_ms = self.poll_interval.as_millis(), "still in progress, polling again");
            return Some(self.poll_interval);
        }

        self.finish(reported);
        None
    }

    /// Transition `IN_PROGRESS -> FINISHED`. Idempotent: a second call is
    /// a no-op rather than a panic, mirroring the worker-side pattern of
    /// tolerating a duplicate completion notification.
    pub fn finish(&mut self, extended_state: ExtendedState) {
        if self.state == State::Finished {
            return;
        }
        self.state = State::Finished;
        self.extended_state = extended_state;
        match extended_state {
            ExtendedState::Success => {
                info!(id = %self.id, "request finished: SUCCESS")
            }
            ExtendedState::Cancelled | ExtendedState::TimeoutExpired => {
                warn!(id = %self.id, state = %extended_state, "request finished without success")
            }
            _ => warn!(id = %self.id, state = %extended_state, "request finished with an error"),
        }
    }

    /// Explicit client-side cancellation. Does not touch any remote state.
    pub fn cancel(&mut self) {
        self.finish(ExtendedState::Cancelled);
    }

    pub fn state_label(&self) -> String {
        match self.state {
            State::Finished => format!("{}::{}", self.state, self.extended_state),
            other => other.to_string(),
        }
    }
}
