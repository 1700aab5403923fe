//! One TCP session per device operation
//!
//! The WFIREX4 firmware serves a single request per connection, so
//! every send, learn and sensor read opens its own socket and closes
//! it afterwards. Nothing is pooled.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{DeviceError, Result};

const READ_CHUNK: usize = 1024;

/// When to stop reading a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadUntil {
    /// Return after the first non-empty read (command acks)
    FirstChunk,
    /// Read until the peer closes (learning)
    Closed,
    /// Read until at least this many bytes arrived, or the peer closes
    AtLeast(usize),
}

/// Connect and per-read timeouts
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

/// An open connection to the device
pub struct Session {
    stream: TcpStream,
    addr: String,
}

impl Session {
    /// Connect to `host:port`, failing after `connect_timeout`
    pub async fn open(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DeviceError::Connect {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DeviceError::Connect {
                    addr,
                    reason: format!("timed out after {:?}", connect_timeout),
                })
            }
        };
        debug!("Connected to {}", addr);
        Ok(Self { stream, addr })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Write a full request
    pub async fn send(&mut self, request: &[u8]) -> Result<()> {
        debug!("-> {} {}", self.addr, hex::encode(request));
        self.stream.write_all(request).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read a response according to `until`
    ///
    /// Each individual read is bounded by `read_timeout`; there is no
    /// deadline over the whole response.
    pub async fn drain(&mut self, until: ReadUntil, read_timeout: Duration) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let n = tokio::time::timeout(read_timeout, self.stream.read(&mut buf))
                .await
                .map_err(|_| DeviceError::ReadTimeout {
                    addr: self.addr.clone(),
                    timeout: read_timeout,
                })??;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);

            match until {
                ReadUntil::FirstChunk => break,
                ReadUntil::AtLeast(min) if data.len() >= min => break,
                _ => {}
            }
        }

        debug!("<- {} {}", self.addr, hex::encode(&data));
        Ok(data)
    }

    /// Shut down the write side, then drop the socket
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} failed (non-critical): {}", self.addr, e);
        }
    }
}

/// Open a session, send `request`, read the response and close
///
/// The session is closed whether or not the exchange succeeded. If the
/// returned future is dropped mid-flight the socket is dropped with it.
pub async fn exchange(
    host: &str,
    port: u16,
    request: &[u8],
    until: ReadUntil,
    timeouts: Timeouts,
) -> Result<Vec<u8>> {
    let mut session = Session::open(host, port, timeouts.connect).await?;
    let result = match session.send(request).await {
        Ok(()) => session.drain(until, timeouts.read).await,
        Err(e) => Err(e),
    };
    session.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TIMEOUTS: Timeouts = Timeouts {
        connect: Duration::from_secs(2),
        read: Duration::from_secs(2),
    };

    /// Accept one connection, read the request, write `chunks` with a
    /// short pause between them, then close (or hang if `hold` is set)
    async fn serve_once(chunks: Vec<Vec<u8>>, hold: bool) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 64];
            let n = socket.read(&mut req).await.unwrap();
            req.truncate(n);
            for chunk in chunks {
                socket.write_all(&chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if hold {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            req
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_read_until_closed_accumulates_chunks() {
        let (port, server) = serve_once(vec![vec![0xAA, 0x01], vec![0x02, 0x03]], false).await;

        let data = exchange("127.0.0.1", port, &[0x01], ReadUntil::Closed, TIMEOUTS)
            .await
            .unwrap();
        assert_eq!(data, vec![0xAA, 0x01, 0x02, 0x03]);
        assert_eq!(server.await.unwrap(), vec![0x01]);
    }

    #[tokio::test]
    async fn test_read_at_least_stops_without_close() {
        let (port, _server) = serve_once(vec![vec![0xAA; 6], vec![0xBB; 6]], true).await;

        let data = exchange("127.0.0.1", port, &[0x18], ReadUntil::AtLeast(12), TIMEOUTS)
            .await
            .unwrap();
        assert_eq!(data.len(), 12);
    }

    #[tokio::test]
    async fn test_read_at_least_returns_early_on_close() {
        let (port, _server) = serve_once(vec![vec![0xAA; 5]], false).await;

        let data = exchange("127.0.0.1", port, &[0x18], ReadUntil::AtLeast(12), TIMEOUTS)
            .await
            .unwrap();
        assert_eq!(data.len(), 5);
    }

    #[tokio::test]
    async fn test_first_chunk() {
        let (port, _server) = serve_once(vec![vec![0xAA, 0x00], vec![0xFF]], true).await;

        let data = exchange("127.0.0.1", port, &[0x11], ReadUntil::FirstChunk, TIMEOUTS)
            .await
            .unwrap();
        assert_eq!(data, vec![0xAA, 0x00]);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (port, _server) = serve_once(vec![], true).await;
        let timeouts = Timeouts {
            connect: Duration::from_secs(2),
            read: Duration::from_millis(100),
        };

        let result = exchange("127.0.0.1", port, &[0x18], ReadUntil::Closed, timeouts).await;
        assert!(matches!(result, Err(DeviceError::ReadTimeout { .. })));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Session::open("127.0.0.1", port, Duration::from_secs(1)).await;
        match result {
            Err(DeviceError::Connect { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{}", port)),
            other => panic!("expected connect error, got {:?}", other.map(|s| s.addr().to_string())),
        }
    }
}
