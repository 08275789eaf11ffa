//! Pull-based streaming query request (component J).
//!
//! A `QueryRequest` pulls result buffers from a worker one at a time
//! rather than having them pushed: each call to [`QueryRequest::claim`]
//! hands the caller a buffer to fill, and [`QueryRequest::flush`] posts it
//! back to the merger. A query whose buffers keep coming back oversized
//! is demoted to the low-priority lane and stays there for the rest of
//! its run, even if a later buffer happens to be small.

use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::messenger::{Messenger, Transport};
use crate::scheduler::lanes::LaneName;

/// Threshold above which a single response buffer counts as "large" for
/// the purposes of sticky demotion.
pub const LARGE_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Something that accepts completed result buffers in order. Production
/// code backs this with the actual result merger; tests back it with a
/// `Vec` collecting what was flushed.
pub trait Merger: Send {
    fn flush(&mut self, data: Vec<u8>, last: bool);
}

struct State {
    claimed: bool,
    demoted: bool,
    done: bool,
}

/// One streaming query's pull-based claim/flush cycle.
pub struct QueryRequest<M: Merger> {
    pub query_id: u64,
    pub chunk_id: i32,
    merger: Mutex<M>,
    state: Mutex<State>,
    /// Set once a transport failure has already triggered one retry, a
    /// merge failure occurred, or the query was cancelled. Guarantees
    /// at-most-once delivery: a second failure after `_retried` is set is
    /// surfaced rather than retried again.
    retried: Mutex<bool>,
}

impl<M: Merger> QueryRequest<M> {
    pub fn new(query_id: u64, chunk_id: i32, merger: M) -> Self {
        Self {
            query_id,
            chunk_id,
            merger: Mutex::new(merger),
            state: Mutex::new(State {
                claimed: false,
                demoted: false,
                done: false,
            }),
            retried: Mutex::new(false),
        }
    }

    /// Claim the right to fill the next buffer. Only one claim may be
    /// outstanding at a time; a second claim before a flush is a logic
    /// error in the caller.
    pub fn claim(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.done || state.claimed {
            return false;
        }
        state.claimed = true;
        true
    }

    /// Hand a filled buffer to the merger. `last` marks the final chunk
    /// of this query's results. A buffer over [`LARGE_RESPONSE_BYTES`]
    /// demotes the query's current and future lane assignment to `Low`,
    /// and that demotion is sticky: once set, it never reverts even if a
    /// later buffer happens to be small.
    pub fn flush(&self, data: Vec<u8>, last: bool) {
        let mut state = self.state.lock().unwrap();
        assert!(state.claimed, "flush without an outstanding claim");

        if data.len() > LARGE_RESPONSE_BYTES {
            if !state.demoted {
                info!(query_id = self.query_id, bytes = data.len(), "demoting query to low-priority lane");
            }
            state.demoted = true;
        }

        state.claimed = false;
        if last {
            state.done = true;
            debug!(query_id = self.query_id, chunk_id = self.chunk_id, "query stream complete");
        }

        self.merger.lock().unwrap().flush(data, last);
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// The lane this query should currently be scheduled on, honoring any
    /// sticky large-result demotion.
    pub fn preferred_lane(&self, default: LaneName) -> LaneName {
        if self.state.lock().unwrap().demoted {
            LaneName::Low
        } else {
            default
        }
    }

    /// Drive the `AskForResponseData` pull cycle against a worker: claim a
    /// buffer, ask the messenger for it at the priority `preferred_lane`
    /// currently resolves to, flush what comes back, and loop until the
    /// worker marks its reply `last`. A single transport failure is
    /// retried once (`_retried` guards against a second); beyond that the
    /// error is surfaced and the merger sees nothing further for this
    /// chunk, preserving at-most-once delivery.
    pub async fn pump<T: Transport>(&self, messenger: &Messenger<T>, resource_url: &str, default_lane: LaneName) -> Result<()> {
        loop {
            if !self.claim() {
                return Err(Error::InvalidState(format!(
                    "query {} chunk {} pump called with no outstanding claim available",
                    self.query_id, self.chunk_id
                )));
            }

            let priority = self.preferred_lane(default_lane).priority();
            let id = format!("ask-{}-{}", self.query_id, self.chunk_id);
            let response = match messenger.send(id, priority, resource_url.as_bytes().to_vec()).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.state.lock().unwrap().claimed = false;
                    let mut retried = self.retried.lock().unwrap();
                    if *retried {
                        return Err(e);
                    }
                    *retried = true;
                    continue;
                }
            };

            if response.is_empty() {
                self.state.lock().unwrap().claimed = false;
                return Err(Error::Protocol(format!(
                    "query {} chunk {} AskForResponseData reply missing the last-flag byte",
                    self.query_id, self.chunk_id
                )));
            }
            let last = response[0] != 0;
            let data = response[1..].to_vec();
            self.flush(data, last);

            if last {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecMerger(Vec<(Vec<u8>, bool)>);

    impl Merger for VecMerger {
        fn flush(&mut self, data: Vec<u8>, last: bool) {
            self.0.push((data, last));
        }
    }

    #[test]
    fn claim_then_flush_delivers_to_merger() {
        let req = QueryRequest::new(1, 10, VecMerger(Vec::new()));
        assert!(req.claim());
        req.flush(b"rows".to_vec(), false);
        assert!(!req.is_done());
    }

    #[test]
    fn second_claim_before_flush_is_rejected() {
        let req = QueryRequest::new(1, 10, VecMerger(Vec::new()));
        assert!(req.claim());
        assert!(!req.claim());
    }

    #[test]
    fn last_flush_marks_request_done() {
        let req = QueryRequest::new(1, 10, VecMerger(Vec::new()));
        req.claim();
        req.flush(b"final".to_vec(), true);
        assert!(req.is_done());
        assert!(!req.claim());
    }

    #[test]
    fn large_buffer_sticks_demotion_even_after_small_buffers() {
        let req = QueryRequest::new(1, 10, VecMerger(Vec::new()));
        req.claim();
        req.flush(vec![0u8; LARGE_RESPONSE_BYTES + 1], false);
        assert_eq!(req.preferred_lane(LaneName::High), LaneName::Low);

        req.claim();
        req.flush(vec![0u8; 8], true);
        assert_eq!(req.preferred_lane(LaneName::High), LaneName::Low);
    }

    #[test]
    fn small_buffers_never_demote() {
        let req = QueryRequest::new(1, 10, VecMerger(Vec::new()));
        req.claim();
        req.flush(vec![0u8; 8], true);
        assert_eq!(req.preferred_lane(LaneName::High), LaneName::High);
    }

    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        fail_first_n: AtomicU32,
        replies: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, _worker_name: &str) -> Result<()> {
            Ok(())
        }

        async fn send_recv(&self, _payload: Vec<u8>) -> Result<Vec<u8>> {
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Transport("connection reset".into()));
            }
            let mut replies = self.replies.lock().unwrap();
            Ok(replies.remove(0))
        }
    }

    fn framed(last: bool, data: &[u8]) -> Vec<u8> {
        let mut out = vec![last as u8];
        out.extend_from_slice(data);
        out
    }

    #[tokio::test]
    async fn pump_streams_until_last_and_feeds_the_merger_in_order() {
        let transport = ScriptedTransport {
            fail_first_n: AtomicU32::new(0),
            replies: Mutex::new(vec![framed(false, b"rows-1"), framed(true, b"rows-2")]),
        };
        let messenger = Messenger::new("worker-1", transport);
        let req = QueryRequest::new(1, 10, VecMerger(Vec::new()));

        req.pump(&messenger, "/query/abc", LaneName::Normal).await.unwrap();

        assert!(req.is_done());
        assert_eq!(req.merger.lock().unwrap().0, vec![(b"rows-1".to_vec(), false), (b"rows-2".to_vec(), true)]);
    }

    #[tokio::test]
    async fn pump_retries_a_single_transport_failure_then_succeeds() {
        let transport = ScriptedTransport {
            fail_first_n: AtomicU32::new(1),
            replies: Mutex::new(vec![framed(true, b"rows")]),
        };
        let messenger = Messenger::new("worker-1", transport);
        let req = QueryRequest::new(1, 10, VecMerger(Vec::new()));

        req.pump(&messenger, "/query/abc", LaneName::Normal).await.unwrap();
        assert!(req.is_done());
    }

    #[tokio::test]
    async fn pump_surfaces_a_second_consecutive_failure_without_retrying_again() {
        let transport = ScriptedTransport {
            fail_first_n: AtomicU32::new(2),
            replies: Mutex::new(vec![framed(true, b"rows")]),
        };
        let messenger = Messenger::new("worker-1", transport);
        let req = QueryRequest::new(1, 10, VecMerger(Vec::new()));

        let result = req.pump(&messenger, "/query/abc", LaneName::Normal).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(!req.is_done());
    }
}
