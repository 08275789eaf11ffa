//! Concrete [`messenger::Transport`] backing a `Messenger` with a real
//! TCP socket, framing every request and response with [`wire::FrameBuffer`]
//! / [`wire::FrameReader`].
//!
//! One `TcpTransport` owns at most one live socket at a time. `connect`
//! replaces it; `send_recv` writes a framed request and blocks for the
//! framed reply. Callers never hold the socket across an `.await` point
//! themselves — the lock is internal and scoped to a single round trip.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::messenger::Transport;
use crate::wire::{FrameBuffer, FrameReader, LENGTH_HEADER_SIZE};

pub struct TcpTransport {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, worker_name: &str) -> Result<()> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::Transport(format!("connect to {} ({worker_name}) failed: {e}", self.addr)))?;
        stream.set_nodelay(true).map_err(|e| Error::Transport(e.to_string()))?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn send_recv(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("{} is not connected", self.addr)))?;

        let mut buf = FrameBuffer::new();
        buf.serialize(&payload)?;
        if let Err(e) = stream.write_all(buf.as_bytes()).await {
            *guard = None;
            return Err(Error::Transport(e.to_string()));
        }

        let mut header = [0u8; LENGTH_HEADER_SIZE];
        if let Err(e) = stream.read_exact(&mut header).await {
            *guard = None;
            return Err(Error::Transport(e.to_string()));
        }
        let len = u32::from_be_bytes(header) as usize;

        let mut framed = Vec::with_capacity(LENGTH_HEADER_SIZE + len);
        framed.extend_from_slice(&header);
        framed.resize(LENGTH_HEADER_SIZE + len, 0);
        if let Err(e) = stream.read_exact(&mut framed[LENGTH_HEADER_SIZE..]).await {
            *guard = None;
            return Err(Error::Transport(e.to_string()));
        }

        let mut reader = FrameReader::new(&framed);
        reader.parse()
    }
}
