//! Byte pumping between an accepted local connection and a remote stream

use async_trait::async_trait;
use meshlink_common::Result;
use std::net::SocketAddr;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub trait ForwardStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type ForwardStream = Box<dyn ForwardStreamIo>;

/// A connection that can open streams to addresses on its far side
#[async_trait]
pub trait ForwardSession: Send + Sync + 'static {
    /// Open a stream to `host:port` as seen from the remote end
    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        origin: SocketAddr,
    ) -> Result<ForwardStream>;

    /// Tear the connection down
    async fn close(&self) -> Result<()>;
}

/// Establishes the session a tunnel forwards through
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: ForwardSession;

    /// Remote endpoint, for logging
    fn remote(&self) -> &str;

    async fn connect(&self) -> Result<Self::Session>;
}

/// How a forwarded connection ended
#[derive(Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Either side closed; byte counts per direction
    Finished { to_remote: u64, to_local: u64 },
    Cancelled,
    Failed(String),
}

/// Copy both directions until a side closes or `cancel` fires
pub async fn forward<L, R>(mut local: L, mut remote: R, cancel: CancellationToken) -> ForwardOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = tokio::select! {
        _ = cancel.cancelled() => ForwardOutcome::Cancelled,
        copied = copy_bidirectional(&mut local, &mut remote) => match copied {
            Ok((to_remote, to_local)) => ForwardOutcome::Finished { to_remote, to_local },
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::ConnectionReset
            ) => ForwardOutcome::Finished { to_remote: 0, to_local: 0 },
            Err(e) => ForwardOutcome::Failed(e.to_string()),
        },
    };

    let _ = remote.shutdown().await;
    let _ = local.shutdown().await;
    debug!("forwarder stopped: {:?}", outcome);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_copies_both_directions() {
        let (mut client, local) = duplex(64);
        let (remote, mut server) = duplex(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(local, remote, cancel));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
        assert_eq!(
            task.await.unwrap(),
            ForwardOutcome::Finished {
                to_remote: 4,
                to_local: 4
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_forwarding() {
        let (mut client, local) = duplex(64);
        let (remote, _server) = duplex(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(local, remote, cancel.clone()));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), ForwardOutcome::Cancelled);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
