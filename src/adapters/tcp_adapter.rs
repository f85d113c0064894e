//! TCP line transport
//!
//! Provides buffered, line-delimited async I/O over a `tokio` TCP stream for
//! devices that sit behind a terminal server or speak telnet-style ASCII.

use super::{LineTransport, COMMAND_EOL};
use crate::error::{DcbError, DcbResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// TCP transport for line-protocol devices
///
/// Reads are buffered so that a partially received line survives a read
/// timeout and is completed by the next call.
pub struct TcpTransport {
    /// Host name or address
    host: String,

    /// TCP port
    port: u16,

    /// Connection timeout
    connect_timeout: Duration,

    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,

    /// Bytes of a line not yet terminated
    pending: Vec<u8>,
}

impl TcpTransport {
    /// Create a new transport; nothing is opened until [`LineTransport::connect`].
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            reader: None,
            writer: None,
            pending: Vec::new(),
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[async_trait]
impl LineTransport for TcpTransport {
    async fn connect(&mut self) -> DcbResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                DcbError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {addr} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        self.reader = Some(BufReader::new(read_half));
        self.writer = Some(write_half);
        self.pending.clear();

        debug!("Connected to {}", addr);
        Ok(())
    }

    async fn send_line(&mut self, command: &str) -> DcbResult<()> {
        let writer = self.writer.as_mut().ok_or(DcbError::NotConnected)?;
        let line = format!("{command}{COMMAND_EOL}");
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        debug!("-> {}", command);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> DcbResult<String> {
        let reader = self.reader.as_mut().ok_or(DcbError::NotConnected)?;

        // read_until is not cancel safe on its own, so bytes are accumulated
        // into `pending`, which outlives the timed-out future.
        let pending = &mut self.pending;
        let read = tokio::time::timeout(timeout, async {
            loop {
                let buf = reader.fill_buf().await?;
                if buf.is_empty() {
                    return Ok::<bool, std::io::Error>(false);
                }
                match buf.iter().position(|&b| b == b'\n') {
                    Some(i) => {
                        pending.extend_from_slice(&buf[..=i]);
                        reader.consume(i + 1);
                        return Ok(true);
                    }
                    None => {
                        let n = buf.len();
                        pending.extend_from_slice(buf);
                        reader.consume(n);
                    }
                }
            }
        })
        .await;

        match read {
            Err(_) => Err(DcbError::ReadTimeout(timeout)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(false)) => Err(DcbError::ConnectionClosed),
            Ok(Ok(true)) => {
                let line = self.take_line();
                debug!("<- {}", line);
                Ok(line)
            }
        }
    }

    async fn discard_pending(&mut self) -> DcbResult<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        let mut stale = std::mem::take(&mut self.pending);
        stale.extend_from_slice(reader.buffer());
        let buffered = reader.buffer().len();
        reader.consume(buffered);

        // Whatever the socket already holds, without blocking. EOF is left
        // for the next read to report.
        let mut scratch = [0u8; 1024];
        loop {
            match reader.get_ref().try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => stale.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if !stale.is_empty() {
            debug!("discarded {} stale bytes", stale.len());
        }
        Ok(stale.iter().filter(|&&b| b == b'\n').count())
    }

    async fn close(&mut self) -> DcbResult<()> {
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            // Peer may already be gone.
            let _ = writer.shutdown().await;
            debug!("Disconnected from {}:{}", self.host, self.port);
        }
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_builder_pattern() {
        let transport = TcpTransport::new("pdu-dcb".to_string(), 23)
            .with_connect_timeout(Duration::from_millis(500));
        assert_eq!(transport.connect_timeout, Duration::from_millis(500));
        assert!(!transport.is_connected());
        assert_eq!(transport.describe(), "tcp://pdu-dcb:23");
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut transport = TcpTransport::new("localhost".to_string(), 1);
        assert!(matches!(
            transport.send_line("adc 1").await,
            Err(DcbError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_line_exchange_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 7];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"adc 1\r\n");
            // A line split across writes, then a second one.
            socket.write_all(b"-.00").await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
            socket.write_all(b"14\r\nDone\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let mut transport = TcpTransport::new("127.0.0.1".to_string(), port);
        transport.connect().await.unwrap();
        transport.send_line("adc 1").await.unwrap();

        // First window closes before the line is complete.
        let first = transport.read_line(Duration::from_millis(20)).await;
        assert!(matches!(first, Err(DcbError::ReadTimeout(_))));

        let line = transport.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "-.0014");
        let line = transport.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "Done");

        server.await.unwrap();
        assert_eq!(transport.discard_pending().await.unwrap(), 0);
        let closed = transport.read_line(Duration::from_secs(1)).await;
        assert!(matches!(closed, Err(DcbError::ConnectionClosed)));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_discard_pending_drops_late_output() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"Moving...\r\nMoved to position 2\r\nhalf")
                .await
                .unwrap();
            let mut buf = [0u8; 7];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"-.0014\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let mut transport = TcpTransport::new("127.0.0.1".to_string(), port);
        transport.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(transport.discard_pending().await.unwrap(), 2);
        transport.send_line("adc 1").await.unwrap();
        let line = transport.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "-.0014");

        server.await.unwrap();
    }
}
