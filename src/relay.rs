use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::buffer_pool;
use crate::record::SessionRecorder;

/// Error type for the relay phase.
///
/// Either side failing triggers symmetric teardown; beyond that a relay
/// error only terminates the session it belongs to.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("client websocket error: {0}")]
    Client(#[from] WsError),

    #[error("target i/o error: {0}")]
    Target(#[from] std::io::Error),
}

/// Byte counters for a finished relay, reported in the session log
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayOutcome {
    pub from_client: u64,
    pub from_target: u64,
}

/// A reset without a closing handshake is how most console clients
/// disappear; treat it as a normal close rather than an error.
fn is_clean_close(error: &WsError) -> bool {
    matches!(
        error,
        WsError::ConnectionClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

/// Full-duplex byte relay between the WebSocket client and the target.
///
/// Payload-agnostic: binary and text frames both forward as raw bytes,
/// control frames stay inside the WebSocket layer. The loop runs until
/// either direction observes end-of-stream or an I/O error, then both
/// sides are actively shut down so no half-open socket lingers. Relayed
/// chunks are mirrored into `recorder` when session recording is on.
pub async fn relay<S>(
    ws: WebSocketStream<S>,
    target: TcpStream,
    recorder: Option<SessionRecorder>,
) -> Result<RelayOutcome, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut target_rx, mut target_tx) = target.into_split();

    let mut buf = buffer_pool::get_buffer().await;
    let mut outcome = RelayOutcome::default();
    let mut error: Option<RelayError> = None;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    None => break,
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = target_tx.write_all(&data).await {
                            error = Some(e.into());
                            break;
                        }
                        outcome.from_client += data.len() as u64;
                        if let Some(rec) = &recorder {
                            rec.record(data);
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        let data = Bytes::from(text);
                        if let Err(e) = target_tx.write_all(&data).await {
                            error = Some(e.into());
                            break;
                        }
                        outcome.from_client += data.len() as u64;
                        if let Some(rec) = &recorder {
                            rec.record(data);
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    // Ping/pong are answered by the websocket layer
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if !is_clean_close(&e) {
                            error = Some(e.into());
                        }
                        break;
                    }
                }
            }
            res = target_rx.read(&mut buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if let Some(rec) = &recorder {
                            rec.record(data.clone());
                        }
                        if let Err(e) = ws_tx.send(Message::Binary(data)).await {
                            error = Some(e.into());
                            break;
                        }
                        outcome.from_target += n as u64;
                    }
                    Err(e) => {
                        error = Some(e.into());
                        break;
                    }
                }
            }
        }
    }

    // Symmetric teardown: close the websocket and shut the target write
    // half so neither side is left half-open.
    let _ = ws_tx.close().await;
    let _ = target_tx.shutdown().await;

    buffer_pool::return_buffer(buf).await;

    debug!(
        from_client = outcome.from_client,
        from_target = outcome.from_target,
        "relay finished"
    );

    match error {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{accept_async, connect_async};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    /// Build a (client websocket, relay future input) pair plus the
    /// target's peer stream, with the relay running in a background task.
    async fn spawn_relay(
        recorder: Option<SessionRecorder>,
    ) -> (
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        >,
        TcpStream,
        tokio::task::JoinHandle<Result<RelayOutcome, RelayError>>,
    ) {
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws");
        let ws_addr = ws_listener.local_addr().expect("ws addr");
        let target_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind target");
        let target_addr = target_listener.local_addr().expect("target addr");

        let client_fut = connect_async(format!("ws://{ws_addr}/"));
        let server_fut = async {
            let (stream, _) = ws_listener.accept().await.expect("accept ws");
            accept_async(stream).await.expect("ws handshake")
        };
        let (client, server_ws) = tokio::join!(client_fut, server_fut);
        let (client_ws, _) = client.expect("client connect");

        let relay_target = TcpStream::connect(target_addr).await.expect("connect target");
        let (target_peer, _) = target_listener.accept().await.expect("accept target");

        let handle = tokio::spawn(relay(server_ws, relay_target, recorder));
        (client_ws, target_peer, handle)
    }

    #[tokio::test]
    async fn test_relay_client_to_target_in_order() {
        let (mut client, mut target, _handle) = spawn_relay(None).await;

        client
            .send(Message::binary(b"hello ".to_vec()))
            .await
            .expect("send 1");
        client
            .send(Message::binary(b"console".to_vec()))
            .await
            .expect("send 2");

        let mut received = vec![0u8; 13];
        timeout(TEST_TIMEOUT, target.read_exact(&mut received))
            .await
            .expect("no timeout")
            .expect("read");
        assert_eq!(&received, b"hello console");
    }

    #[tokio::test]
    async fn test_relay_target_to_client_in_order() {
        let (mut client, mut target, _handle) = spawn_relay(None).await;

        target.write_all(b"framebuffer").await.expect("write");

        let mut received = Vec::new();
        while received.len() < 11 {
            let msg = timeout(TEST_TIMEOUT, client.next())
                .await
                .expect("no timeout")
                .expect("stream open")
                .expect("frame");
            match msg {
                Message::Binary(data) => received.extend_from_slice(&data),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(&received, b"framebuffer");
    }

    #[tokio::test]
    async fn test_relay_text_frames_forward_as_bytes() {
        let (mut client, mut target, _handle) = spawn_relay(None).await;

        client
            .send(Message::text("keypress"))
            .await
            .expect("send text");

        let mut received = vec![0u8; 8];
        timeout(TEST_TIMEOUT, target.read_exact(&mut received))
            .await
            .expect("no timeout")
            .expect("read");
        assert_eq!(&received, b"keypress");
    }

    #[tokio::test]
    async fn test_target_close_tears_down_client() {
        let (mut client, target, handle) = spawn_relay(None).await;
        drop(target);

        // The client must observe the close within bounded time
        let end = timeout(TEST_TIMEOUT, async {
            loop {
                match client.next().await {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(end.is_ok(), "client side not closed after target went away");

        let outcome = timeout(TEST_TIMEOUT, handle)
            .await
            .expect("relay ended")
            .expect("task join")
            .expect("clean close");
        assert_eq!(outcome.from_client, 0);
    }

    #[tokio::test]
    async fn test_client_close_tears_down_target() {
        let (mut client, mut target, handle) = spawn_relay(None).await;
        client.close(None).await.expect("close ws");

        let mut buf = [0u8; 16];
        let n = timeout(TEST_TIMEOUT, target.read(&mut buf))
            .await
            .expect("no timeout")
            .expect("read");
        assert_eq!(n, 0, "target must see end-of-stream");

        timeout(TEST_TIMEOUT, handle)
            .await
            .expect("relay ended")
            .expect("task join")
            .expect("clean close");
    }

    #[tokio::test]
    async fn test_relay_records_both_directions() {
        let base = std::env::temp_dir().join(format!(
            "console-relay-relaytest-{}",
            std::process::id()
        ));
        let session_id = crate::session::next_session_id();
        let recorder = SessionRecorder::create(&base, session_id)
            .await
            .expect("create recorder");
        let record_file = crate::record::record_path(&base, session_id);

        let (mut client, mut target, handle) = spawn_relay(Some(recorder)).await;

        client
            .send(Message::binary(b"up".to_vec()))
            .await
            .expect("send");
        let mut received = vec![0u8; 2];
        timeout(TEST_TIMEOUT, target.read_exact(&mut received))
            .await
            .expect("no timeout")
            .expect("read");

        target.write_all(b"down").await.expect("write");
        let msg = timeout(TEST_TIMEOUT, client.next())
            .await
            .expect("no timeout")
            .expect("open")
            .expect("frame");
        assert_eq!(msg.into_data().as_ref(), b"down");

        client.close(None).await.expect("close");
        let _ = timeout(TEST_TIMEOUT, handle).await.expect("relay ended");

        // Writer task drains after the recorder is dropped by the relay
        tokio::time::sleep(Duration::from_millis(200)).await;
        let contents = tokio::fs::read(&record_file).await.expect("record file");
        assert_eq!(contents, b"updown");

        let _ = tokio::fs::remove_file(&record_file).await;
    }
}
