//! Unix-domain socket link implementation.

use super::{LinkReceiver, LinkSender, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

enum Role {
    Dial(PathBuf),
    Listen(PathBuf),
}

/// Unix-domain socket transport for one peer link.
pub struct UnixTransport {
    role: Role,
    // True once this instance bound the socket file; only the owner
    // unlinks it on drop.
    owns_socket_file: bool,
}

impl UnixTransport {
    /// Link that dials the peer's socket at `path`.
    pub fn dial(path: PathBuf) -> Self {
        Self {
            role: Role::Dial(path),
            owns_socket_file: false,
        }
    }

    /// Link that binds `path` and accepts exactly one peer.
    pub fn listen(path: PathBuf) -> Self {
        Self {
            role: Role::Listen(path),
            owns_socket_file: false,
        }
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        if let (true, Role::Listen(path)) = (self.owns_socket_file, &self.role) {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "failed to remove socket file: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn id(&self) -> String {
        match &self.role {
            Role::Dial(path) => format!("uds:{}", path.display()),
            Role::Listen(path) => format!("uds-listen:{}", path.display()),
        }
    }

    async fn connect(
        &mut self,
    ) -> Result<(Box<dyn LinkSender>, Box<dyn LinkReceiver>), TransportError> {
        let stream = match &self.role {
            Role::Dial(path) => {
                debug!(path = %path.display(), "dialing Unix peer");
                UnixStream::connect(path).await?
            }
            Role::Listen(path) => {
                // Remove a stale socket file from a previous run before
                // binding; only NotFound is expected to be common.
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), "failed to remove stale socket: {e}");
                    }
                }
                let listener = UnixListener::bind(path)?;
                self.owns_socket_file = true;
                debug!(path = %path.display(), "awaiting Unix peer");
                let (stream, _) = listener.accept().await?;
                stream
            }
        };
        let (read, write) = stream.into_split();
        Ok((
            Box::new(UnixLinkSender(write)),
            Box::new(UnixLinkReceiver(read)),
        ))
    }
}

struct UnixLinkSender(OwnedWriteHalf);

#[async_trait]
impl LinkSender for UnixLinkSender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.0.write_all(frame).await?;
        self.0.flush().await?;
        Ok(())
    }
}

struct UnixLinkReceiver(OwnedReadHalf);

#[async_trait]
impl LinkReceiver for UnixLinkReceiver {
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.0.read(buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uds_pair_moves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.sock");

        let mut server = UnixTransport::listen(path.clone());
        let server_task = tokio::spawn(async move { server.connect().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut client = UnixTransport::dial(path);
        let (mut tx, _rx) = client.connect().await.unwrap();
        let (_stx, mut srx) = server_task.await.unwrap().unwrap();

        tx.send(b"frame").await.unwrap();
        let mut buf = [0u8; 16];
        let n = srx.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &b"frame"[..n]);
    }
}
