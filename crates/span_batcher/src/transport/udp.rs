//! UDP agent transport. One batch per datagram, no acknowledgement.

use super::{SendOutcome, Transport, TransportFailure, TransportStatus};
use crate::encoder::Envelope;
use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Sends `emitBatch` messages to an agent.
///
/// The socket is bound and connected lazily on the first send and dropped on
/// any socket error so the next attempt re-resolves the agent address.
pub struct UdpTransport {
    agent: String,
    socket: Mutex<Option<UdpSocket>>,
    closed: AtomicBool,
}

impl UdpTransport {
    /// `agent` is a `host:port` string, resolved on first use.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            socket: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    async fn connect(&self) -> io::Result<UdpSocket> {
        let mut last_err = None;
        for addr in tokio::net::lookup_host(&self.agent).await? {
            let local: SocketAddr = if addr.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let attempt = async {
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                Ok::<_, io::Error>(socket)
            };
            match attempt.await {
                Ok(socket) => {
                    tracing::debug!(agent = %self.agent, %addr, "udp transport connected");
                    return Ok(socket);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "agent address resolved to nothing")
        }))
    }

    async fn send_datagram(&self, payload: &[u8]) -> io::Result<()> {
        let mut guard = self.socket.lock().await;
        // taken out so any error leaves the slot empty
        let socket = match guard.take() {
            Some(socket) => socket,
            None => self.connect().await?,
        };
        let written = socket.send(payload).await?;
        if written != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {} of {} bytes", written, payload.len()),
            ));
        }
        *guard = Some(socket);
        Ok(())
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("agent", &self.agent)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Transport for UdpTransport {
    async fn send(&self, payload: Bytes, deadline: Instant) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return TransportFailure::new(TransportStatus::Cancelled, "transport closed").into();
        }
        if payload.len() > MAX_DATAGRAM_SIZE {
            return TransportFailure::new(
                TransportStatus::Io(io::ErrorKind::InvalidInput),
                format!("payload of {} bytes exceeds datagram limit", payload.len()),
            )
            .into();
        }

        match tokio::time::timeout_at(deadline, self.send_datagram(&payload)).await {
            Ok(Ok(())) => SendOutcome::Success,
            Ok(Err(e)) => TransportFailure::new(TransportStatus::Io(e.kind()), e.to_string()).into(),
            Err(_) => TransportFailure::new(TransportStatus::Timeout, "udp send timed out").into(),
        }
    }

    fn envelope(&self) -> Envelope {
        Envelope::EmitBatch
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.socket.lock().await.take();
    }

    fn name(&self) -> &str {
        "udp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_datagram() {
        let agent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(agent.local_addr().unwrap().to_string());

        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = transport.send(Bytes::from_static(b"batch"), deadline).await;
        assert_eq!(outcome, SendOutcome::Success);

        let mut buf = [0u8; 64];
        let n = agent.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"batch");
    }

    #[tokio::test]
    async fn test_oversize_payload_not_retryable() {
        let transport = UdpTransport::new("127.0.0.1:6832");
        let payload = Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE + 1]);
        let deadline = Instant::now() + Duration::from_secs(1);
        let SendOutcome::Failure(failure) = transport.send(payload, deadline).await else {
            panic!("oversize datagram must fail");
        };
        assert!(!failure.is_retryable());
    }

    #[tokio::test]
    async fn test_send_after_close_is_cancelled() {
        let transport = UdpTransport::new("127.0.0.1:6832");
        transport.close().await;
        let deadline = Instant::now() + Duration::from_secs(1);
        let SendOutcome::Failure(failure) = transport.send(Bytes::from_static(b"x"), deadline).await else {
            panic!("closed transport must fail");
        };
        assert_eq!(failure.status, TransportStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unresolvable_agent_fails() {
        let transport = UdpTransport::new("not a host");
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(!transport.send(Bytes::from_static(b"x"), deadline).await.is_success());
    }
}
