//! Dialing the manager socket

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{AmiError, AmiResult};

/// Opens the byte stream a session runs on.
///
/// [`TcpTransport`] is the production implementation. Tests substitute
/// in-memory streams or scripted failures.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stream type handed to the session.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Connect to `address` (`host:port`), giving up after `dial_timeout`.
    async fn dial(&self, address: &str, dial_timeout: Duration) -> AmiResult<Self::Stream>;
}

/// Plain TCP with `TCP_NODELAY` and OS keep-alive enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

async fn tcp_connect(address: &str) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in lookup_host(address).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;

        match socket
            .connect(addr)
            .await
        {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("[CONNECT] {} refused: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} resolved to no addresses", address),
        )
    }))
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn dial(&self, address: &str, dial_timeout: Duration) -> AmiResult<TcpStream> {
        match timeout(dial_timeout, tcp_connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                debug!("[CONNECT] TCP connection established to {}", address);
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!("[CONNECT] TCP connect to {} failed: {}", address, e);
                Err(AmiError::Io(e))
            }
            Err(_) => {
                let timeout_ms = dial_timeout.as_millis() as u64;
                warn!(
                    "[CONNECT] TCP connect to {} timed out after {}ms",
                    address, timeout_ms
                );
                Err(AmiError::Timeout { timeout_ms })
            }
        }
    }
}
