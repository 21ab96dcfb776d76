//! In-memory duplex link, used by tests and single-process deployments.
//!
//! A [`MemoryTransport::pair`] yields two connected transports; bytes
//! written on one side surface on the other with the same fragmentation
//! semantics as a socket, which keeps the receiver state machine honest
//! about partial reads.

use super::{LinkReceiver, LinkSender, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

/// Capacity of the in-memory pipe between the two sides.
const PIPE_CAPACITY: usize = 64 * 1024;

/// One side of an in-memory link pair.
pub struct MemoryTransport {
    name: String,
    halves: Option<(WriteHalf<DuplexStream>, ReadHalf<DuplexStream>)>,
}

impl MemoryTransport {
    /// A transport with no peer; every connect attempt fails. Stands in
    /// for an [`crate::config::LinkTransport::InProcess`] link until the
    /// real pair is installed.
    pub fn unconnected(name: &str) -> Self {
        Self {
            name: format!("mem:{name}"),
            halves: None,
        }
    }

    /// Create a connected pair of in-memory transports.
    pub fn pair(a_name: &str, b_name: &str) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self {
                name: format!("mem:{a_name}"),
                halves: Some((a_write, a_read)),
            },
            Self {
                name: format!("mem:{b_name}"),
                halves: Some((b_write, b_read)),
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn id(&self) -> String {
        self.name.clone()
    }

    async fn connect(
        &mut self,
    ) -> Result<(Box<dyn LinkSender>, Box<dyn LinkReceiver>), TransportError> {
        let (write, read) = self.halves.take().ok_or(TransportError::NotConnected)?;
        Ok((
            Box::new(MemoryLinkSender(write)),
            Box::new(MemoryLinkReceiver(read)),
        ))
    }
}

struct MemoryLinkSender(WriteHalf<DuplexStream>);

#[async_trait]
impl LinkSender for MemoryLinkSender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.0.write_all(frame).await?;
        Ok(())
    }
}

struct MemoryLinkReceiver(ReadHalf<DuplexStream>);

#[async_trait]
impl LinkReceiver for MemoryLinkReceiver {
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.0.read(buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(n)
    }
}
