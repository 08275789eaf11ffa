//! Chunk-query dispatcher state machine (component I).
//!
//! Each dispatched chunk query moves through a fixed sequence — opening a
//! write channel to the worker, writing the query, opening a read
//! channel, reading results — before reaching `Complete`. `Aborted` and
//! `Corrupt` are terminal failure states; `WriteOpen` alone is allowed a
//! bounded number of retries before giving up.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::messenger::{Messenger, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    WriteQueue,
    WriteOpen,
    WriteWrite,
    ReadQueue,
    ReadOpen,
    ReadRead,
    Complete,
    Aborted,
    Corrupt,
}

impl DispatcherState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DispatcherState::Complete | DispatcherState::Aborted | DispatcherState::Corrupt)
    }
}

/// Content-addressable resource URL for a chunk query's result, derived
/// from the md5 of its serialized request (terminator included) — the
/// worker can dedupe identical requests by URL alone.
pub fn resource_url(request_bytes: &[u8]) -> String {
    let digest = md5::compute(request_bytes);
    format!("/query/{:x}", digest)
}

const MAX_WRITE_OPEN_RETRIES: u32 = 3;

/// The terminator `WRITE_WRITE` appends to the payload before sending.
const WRITE_TERMINATOR: [u8; 4] = [0, 0, 0, 0];

/// Drives one chunk query through its state machine.
pub struct ChunkQueryDispatcher {
    pub chunk_id: i32,
    state: DispatcherState,
    write_open_retries: u32,
    payload: Vec<u8>,
    resource_url: Option<String>,
}

impl ChunkQueryDispatcher {
    pub fn new(chunk_id: i32, payload: Vec<u8>) -> Self {
        Self {
            chunk_id,
            state: DispatcherState::WriteQueue,
            write_open_retries: 0,
            payload,
            resource_url: None,
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The worker endpoint this chunk query's results live at, once the
    /// write has completed. `None` before `WRITE_WRITE` finishes.
    pub fn resource_url(&self) -> Option<&str> {
        self.resource_url.as_deref()
    }

    /// The write channel to the worker has been opened.
    pub fn write_opened(&mut self) {
        assert_eq!(self.state, DispatcherState::WriteQueue);
        self.state = DispatcherState::WriteOpen;
    }

    /// Opening the write channel failed; retry up to the bound, then abort.
    pub fn write_open_failed(&mut self) {
        self.write_open_retries += 1;
        if self.write_open_retries > MAX_WRITE_OPEN_RETRIES {
            warn!(chunk_id = self.chunk_id, "write-open retries exhausted, aborting");
            self.state = DispatcherState::Aborted;
        } else {
            debug!(chunk_id = self.chunk_id, attempt = self.write_open_retries, "retrying write-open");
            self.state = DispatcherState::WriteQueue;
        }
    }

    /// Appends the 4-null terminator to the payload before it's sent.
    pub fn write_sent(&mut self) {
        assert_eq!(self.state, DispatcherState::WriteOpen);
        self.payload.extend_from_slice(&WRITE_TERMINATOR);
        self.state = DispatcherState::WriteWrite;
    }

    /// Derives and stores the resource URL from the (now terminated)
    /// payload's content hash.
    pub fn write_complete(&mut self) {
        assert_eq!(self.state, DispatcherState::WriteWrite);
        self.resource_url = Some(resource_url(&self.payload));
        self.state = DispatcherState::ReadQueue;
    }

    pub fn read_opened(&mut self) {
        assert_eq!(self.state, DispatcherState::ReadQueue);
        self.state = DispatcherState::ReadOpen;
    }

    pub fn read_started(&mut self) {
        assert_eq!(self.state, DispatcherState::ReadOpen);
        self.state = DispatcherState::ReadRead;
    }

    /// Final chunk of results received.
    pub fn read_complete(&mut self) {
        assert_eq!(self.state, DispatcherState::ReadRead);
        self.state = DispatcherState::Complete;
    }

    /// The worker's reply failed checksum/parse validation.
    pub fn mark_corrupt(&mut self) {
        self.state = DispatcherState::Corrupt;
    }

    /// Explicit client-side abort, valid from any non-terminal state.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = DispatcherState::Aborted;
        }
    }

    /// Drive `WRITE_QUEUE -> ... -> READ_QUEUE` through a real messenger:
    /// probe the open (retrying per `write_open_failed`'s bound), then
    /// send the terminated payload and derive the resource URL.
    pub async fn run_write<T: Transport>(&mut self, messenger: &Messenger<T>, id: &str, priority: i32) -> Result<()> {
        loop {
            match messenger.send(format!("{id}-open"), priority, Vec::new()).await {
                Ok(_) => {
                    self.write_opened();
                    break;
                }
                Err(e) => {
                    self.write_open_failed();
                    if self.state == DispatcherState::Aborted {
                        return Err(e);
                    }
                }
            }
        }

        self.write_sent();
        messenger.send(id, priority, self.payload.clone()).await?;
        self.write_complete();
        Ok(())
    }

    /// Drive `READ_QUEUE -> READ_OPEN`, asking the worker to open a read
    /// channel against the resource URL assigned by `run_write`.
    pub async fn run_read_open<T: Transport>(&mut self, messenger: &Messenger<T>, id: &str, priority: i32) -> Result<Vec<u8>> {
        let url = self
            .resource_url
            .clone()
            .ok_or_else(|| Error::InvalidState("read-open attempted before a resource url was assigned".into()))?;

        self.read_opened();
        let response = messenger.send(id, priority, url.into_bytes()).await?;
        self.read_started();
        Ok(response)
    }
}
