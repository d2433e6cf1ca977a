use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::ConnectInfo;

/// Error type for target connection and handshake operations
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("target {host}:{port} unreachable: {source}")]
    Unreachable {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("connect to {host}:{port} timed out")]
    Timeout { host: String, port: u16 },

    #[error("target rejected CONNECT handshake: {status_line}")]
    HandshakeRejected { status_line: String },

    #[error("handshake i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Largest header block accepted from the target during the handshake
const HANDSHAKE_PEEK_LIMIT: usize = 4096;

/// Open a TCP connection to the resolved target, bounded by `timeout`
pub async fn connect_target(
    info: &ConnectInfo,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    debug!(host = %info.host, port = info.port, "connecting to target");

    match tokio::time::timeout(timeout, TcpStream::connect((info.host.as_str(), info.port))).await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ConnectError::Unreachable {
            host: info.host.clone(),
            port: info.port,
            source,
        }),
        Err(_) => Err(ConnectError::Timeout {
            host: info.host.clone(),
            port: info.port,
        }),
    }
}

/// Perform the one-shot CONNECT handshake against an internal access path.
///
/// Sends `CONNECT <path> HTTP/1.1` and peeks at the response without
/// consuming it until a full header block is visible. On success exactly
/// the header block is drained from the stream; any payload bytes the
/// target sent after it stay queued for the relay. On any failure the
/// target socket is shut down before the error propagates.
pub async fn handshake(stream: &mut TcpStream, path: &str) -> Result<(), ConnectError> {
    match run_handshake(stream, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = stream.shutdown().await;
            Err(e)
        }
    }
}

async fn run_handshake(stream: &mut TcpStream, path: &str) -> Result<(), ConnectError> {
    let request = format!("CONNECT {path} HTTP/1.1\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = vec![0u8; HANDSHAKE_PEEK_LIMIT];
    let header_len = loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(ConnectError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "target closed during handshake",
            )));
        }

        if let Some(pos) = find_header_end(&buf[..n]) {
            let status_line = status_line(&buf[..pos]);
            // Loose match on purpose: the historical behavior accepts any
            // status line containing "200", not a parsed status code.
            if !status_line.contains("200") {
                return Err(ConnectError::HandshakeRejected { status_line });
            }
            break pos + 4;
        }

        if n == buf.len() {
            return Err(ConnectError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake header block too large",
            )));
        }
    };

    // Drain exactly the header block; bytes after it belong to the relay
    let mut header = vec![0u8; header_len];
    stream.read_exact(&mut header).await?;

    debug!(header_len, "CONNECT handshake accepted");
    Ok(())
}

/// Position of the `\r\n\r\n` header terminator, if visible
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// First line of the peeked header block, lossily decoded for matching
fn status_line(header: &[u8]) -> String {
    let line = header
        .windows(2)
        .position(|w| w == b"\r\n")
        .map_or(header, |pos| &header[..pos]);
    String::from_utf8_lossy(line).into_owned()
}
