//! Reliable byte-stream transport to the remote host.
//!
//! Wraps any `AsyncRead + AsyncWrite` stream in a [`Framed`] with the
//! [`TpktCodec`]. Every blocking operation races the session's
//! [`CancellationToken`]; handshake reads additionally run under the
//! configured deadline.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{Frame, TpktCodec};
use crate::error::{RdcError, Result};

/// Any duplex byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

// ── Transport ────────────────────────────────────────────────────

/// A framed connection to one host.
pub struct Transport {
    framed: Framed<Box<dyn AsyncStream>, TpktCodec>,
    deadline: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Resolve `host` and open a TCP connection to it.
    ///
    /// Resolution failures and refused connections surface as
    /// [`RdcError::HostResolution`]; exceeding `deadline` as
    /// [`RdcError::Timeout`].
    pub async fn connect(
        host: &str,
        port: u16,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let unreachable = |reason: String| RdcError::HostResolution {
            host: host.to_string(),
            reason,
        };

        let attempt = async {
            let addrs: Vec<_> = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| unreachable(e.to_string()))?
                .collect();
            if addrs.is_empty() {
                return Err(unreachable("no addresses".into()));
            }
            let stream = TcpStream::connect(&addrs[..])
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            stream.set_nodelay(true)?;
            Ok(stream)
        };

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(RdcError::Canceled),
            res = tokio::time::timeout(deadline, attempt) => {
                res.map_err(|_| RdcError::Timeout(deadline))??
            }
        };

        debug!(host, port, "transport connected");
        Ok(Self::from_stream(stream, deadline, cancel))
    }

    /// Run over an already-open stream.
    pub fn from_stream<S>(stream: S, deadline: Duration, cancel: CancellationToken) -> Self
    where
        S: AsyncStream + 'static,
    {
        let boxed: Box<dyn AsyncStream> = Box::new(stream);
        Self {
            framed: Framed::new(boxed, TpktCodec),
            deadline,
            cancel,
        }
    }

    /// Write one fully framed buffer.
    pub async fn send(&mut self, data: Bytes) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RdcError::Canceled),
            res = self.framed.send(data) => res,
        }
    }

    /// Read the next frame, waiting at most the handshake deadline.
    pub async fn recv(&mut self) -> Result<Frame> {
        let deadline = self.deadline;
        match tokio::time::timeout(deadline, self.recv_untimed()).await {
            Ok(res) => res,
            Err(_) => Err(RdcError::Timeout(deadline)),
        }
    }

    /// Read the next frame with no deadline.
    pub async fn recv_untimed(&mut self) -> Result<Frame> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RdcError::Canceled),
            next = self.framed.next() => match next {
                Some(frame) => frame,
                None => Err(RdcError::Closed),
            },
        }
    }

    /// Flush and shut down the write half, ignoring failures.
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(Duration::from_millis(500), self.framed.close()).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[tokio::test]
    async fn frames_are_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(&[3, 0])
            .read(&[0, 6, 2, 0xf0])
            .write(&[3, 0, 0, 4])
            .build();
        let mut t = Transport::from_stream(mock, Duration::from_secs(1), CancellationToken::new());

        let frame = t.recv().await.unwrap();
        assert_eq!(frame, Frame::X224(BytesMut::from(&[2u8, 0xf0][..])));
        t.send(Bytes::from_static(&[3, 0, 0, 4])).await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_reports_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut t = Transport::from_stream(client, Duration::from_secs(1), CancellationToken::new());
        assert!(matches!(t.recv().await, Err(RdcError::Closed)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_reads() {
        let (client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let mut t = Transport::from_stream(client, Duration::from_secs(5), cancel.clone());
        cancel.cancel();
        assert!(matches!(t.recv().await, Err(RdcError::Canceled)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut t =
            Transport::from_stream(client, Duration::from_millis(20), CancellationToken::new());
        let err = t.recv().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ConnectionError::TimeOut);
    }
}
