use std::net::SocketAddr;
use std::path::{Component, Path};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use color_eyre::eyre::{eyre, Result};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_TYPE, COOKIE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auth::{self, Authorizer};
use crate::config::ProxyConfig;
use crate::connector;
use crate::record::SessionRecorder;
use crate::relay;
use crate::session::{Session, SessionState};
use crate::tls;

/// First byte of a TLS ClientHello record
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Client-facing stream, plain or TLS-terminated on the same port
enum ClientStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Console proxy server: listener setup, TLS wrapping, per-connection
/// worker dispatch, optional static file serving.
pub struct ConsoleProxyServer {
    config: Arc<ProxyConfig>,
    authorizer: Arc<dyn Authorizer>,
}

impl ConsoleProxyServer {
    pub fn new(config: ProxyConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            config: Arc::new(config),
            authorizer,
        }
    }

    /// Resolve the configured listen address and bind the listener
    pub async fn bind(&self) -> Result<TcpListener> {
        let host_port = format!("{}:{}", self.config.listen_host, self.config.listen_port);
        let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host(&host_port)
            .await
            .map_err(|e| eyre!("failed to resolve listen address {host_port}: {e}"))?
            .collect();
        if self.config.source_is_ipv6 {
            addrs.sort_by_key(|addr| if addr.is_ipv6() { 0 } else { 1 });
        } else {
            addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });
        }
        let addr = addrs
            .first()
            .ok_or_else(|| eyre!("no addresses found for {host_port}"))?;

        let listener = TcpListener::bind(*addr).await?;
        Ok(listener)
    }

    /// Bind and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        info!(
            variant = self.config.variant.name(),
            addr = %listener.local_addr()?,
            "console proxy listening"
        );
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    ///
    /// Each accepted connection gets its own tokio task; a stalled
    /// session never blocks the accept loop or other sessions.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let acceptor = self.build_tls_acceptor()?;
        let config = self.config;
        let authorizer = self.authorizer;

        let server = async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let config = Arc::clone(&config);
                        let authorizer = Arc::clone(&authorizer);
                        let acceptor = acceptor.clone();
                        tokio::task::spawn(async move {
                            handle_client(config, authorizer, acceptor, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {e} (continuing)");
                        continue;
                    }
                }
            }
        };

        tokio::select! {
            _ = server => {
                warn!("server loop terminated");
            }
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
            }
        }

        Ok(())
    }

    /// Load TLS material when a certificate is present.
    ///
    /// A certificate that exists but fails to load is fatal under
    /// `ssl_only` and downgrades to plain-only service otherwise.
    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        if !self.config.cert.exists() {
            return Ok(None);
        }
        match tls::build_acceptor(&self.config.cert, self.config.key.as_deref()) {
            Ok(acceptor) => Ok(Some(acceptor)),
            Err(e) if self.config.ssl_only => Err(e.into()),
            Err(e) => {
                warn!("TLS disabled: {e}");
                Ok(None)
            }
        }
    }
}

/// Per-connection entry point: sniff TLS, enforce ssl_only, then hand the
/// stream to the HTTP layer with upgrade support.
async fn handle_client(
    config: Arc<ProxyConfig>,
    authorizer: Arc<dyn Authorizer>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let mut first = [0u8; 1];
    let n = match stream.peek(&mut first).await {
        Ok(n) => n,
        Err(e) => {
            debug!(%peer, "peek on new connection failed: {e}");
            return;
        }
    };
    if n == 0 {
        return;
    }

    let client = if first[0] == TLS_HANDSHAKE_BYTE {
        match &acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => ClientStream::Tls(Box::new(tls_stream)),
                Err(e) => {
                    warn!(%peer, "TLS handshake failed: {e}");
                    return;
                }
            },
            None => {
                warn!(%peer, "TLS client hello but no usable certificate configured");
                return;
            }
        }
    } else if config.ssl_only {
        warn!(%peer, "rejecting non-encrypted connection (ssl_only)");
        return;
    } else {
        ClientStream::Plain(stream)
    };

    let io = TokioIo::new(client);
    let service = service_fn(move |req| {
        handle_request(req, Arc::clone(&config), Arc::clone(&authorizer), peer)
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        // Normal endings show up as connection errors here; only log the rest
        if !err.to_string().contains("connection closed") {
            debug!(%peer, "connection error: {err:?}");
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    config: Arc<ProxyConfig>,
    authorizer: Arc<dyn Authorizer>,
    peer: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if is_websocket_upgrade(&req) {
        return Ok(upgrade_websocket(req, config, authorizer, peer));
    }

    if let Some(web_root) = config.web.clone() {
        return Ok(serve_static(&web_root, &req).await);
    }

    Ok(status_response(StatusCode::NOT_FOUND, "not found"))
}

/// Answer a WebSocket upgrade and spawn the session worker.
///
/// The token cookie is captured from the upgrade request up front; the
/// worker then runs authenticate -> connect -> relay entirely on its own
/// task after the 101 response goes out.
fn upgrade_websocket(
    req: Request<Incoming>,
    config: Arc<ProxyConfig>,
    authorizer: Arc<dyn Authorizer>,
    peer: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let key = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => key.as_bytes().to_vec(),
        None => return status_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key"),
    };

    let cookie = req.headers().get(COOKIE).and_then(|v| v.to_str().ok());
    let token = match auth::token_from_cookie(cookie) {
        Ok(token) => token,
        Err(e) => {
            warn!(%peer, error = %e, "rejecting websocket request");
            return status_response(StatusCode::BAD_REQUEST, "missing or malformed token cookie");
        }
    };

    let accept = derive_accept_key(&key);

    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                run_session(config, authorizer, token, ws, peer).await;
            }
            Err(e) => warn!(%peer, "upgrade error: {e}"),
        }
    });

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    match HeaderValue::from_str(&accept) {
        Ok(value) => {
            headers.insert(SEC_WEBSOCKET_ACCEPT, value);
        }
        Err(_) => {
            return status_response(StatusCode::BAD_REQUEST, "invalid Sec-WebSocket-Key");
        }
    }
    response
}

/// Drive one console session through its lifecycle.
///
/// Every failure path closes whatever is open and ends the worker; there
/// is no retry at this layer, and nothing here is shared with other
/// sessions.
async fn run_session<S>(
    config: Arc<ProxyConfig>,
    authorizer: Arc<dyn Authorizer>,
    token: String,
    ws: WebSocketStream<S>,
    peer: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut session = Session::new(peer);

    let info = match auth::authenticate(authorizer.as_ref(), &token, config.auth_timeout).await {
        Ok(info) => info,
        Err(e) => {
            warn!(session = session.id, %peer, error = %e, "authentication failed");
            close_websocket(ws).await;
            session.advance(SessionState::Closed);
            return;
        }
    };

    info!(
        session = session.id,
        %peer,
        target_host = %info.host,
        target_port = info.port,
        "connecting to target"
    );
    session.advance(SessionState::Connecting);

    let mut target = match connector::connect_target(&info, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(session = session.id, error = %e, "target connection failed");
            close_websocket(ws).await;
            session.advance(SessionState::Closed);
            return;
        }
    };

    if let Some(path) = &info.internal_access_path {
        session.advance(SessionState::Handshaking);
        // handshake() shuts the target down on any failure
        if let Err(e) = connector::handshake(&mut target, path).await {
            warn!(session = session.id, error = %e, "target handshake failed");
            close_websocket(ws).await;
            session.advance(SessionState::Closed);
            return;
        }
    }

    session.advance(SessionState::Relaying);

    let recorder = match &config.record {
        Some(base) => match SessionRecorder::create(base, session.id).await {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                warn!(session = session.id, "session recording disabled: {e}");
                None
            }
        },
        None => None,
    };

    match relay::relay(ws, target, recorder).await {
        Ok(outcome) => {
            info!(
                session = session.id,
                from_client = outcome.from_client,
                from_target = outcome.from_target,
                "session closed"
            );
        }
        Err(e) => {
            warn!(session = session.id, error = %e, "session ended with error");
        }
    }
    session.advance(SessionState::Closed);
}

async fn close_websocket<S>(mut ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = ws.close(None).await;
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let upgrade_to_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade_to_websocket && connection_upgrade
}

/// Serve a file from the configured web root (thin pass-through for the
/// console web client; GET only, no traversal outside the root).
async fn serve_static(
    web_root: &Path,
    req: &Request<Incoming>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if req.method() != Method::GET {
        return status_response(StatusCode::METHOD_NOT_ALLOWED, "GET only");
    }

    let rel = req.uri().path().trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    let rel_path = Path::new(rel);
    if !rel_path
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return status_response(StatusCode::NOT_FOUND, "not found");
    }

    let path = web_root.join(rel_path);
    match tokio::fs::read(&path).await {
        Ok(contents) => {
            let mut response = Response::new(full(contents));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
            response
        }
        Err(_) => status_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

fn status_response(
    status: StatusCode,
    msg: &'static str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full(msg));
    *response.status_mut() = status;
    response
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
