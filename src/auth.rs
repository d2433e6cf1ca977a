use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Error type for token authentication.
///
/// All variants are per-session: the session is torn down and the client
/// is expected to reconnect with a fresh token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("authorization service unavailable: {0}")]
    Collaborator(String),

    #[error("token resolution timed out")]
    Timeout,
}

/// Target connection info resolved from an access token.
///
/// Produced by the authorization collaborator and treated as opaque
/// beyond the presence of host and port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectInfo {
    pub host: String,
    pub port: u16,
    pub internal_access_path: Option<String>,
}

/// Raw collaborator payload before host/port presence validation
#[derive(Debug, Deserialize)]
pub struct RawConnectInfo {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub internal_access_path: Option<String>,
}

impl ConnectInfo {
    /// Validate a raw collaborator payload.
    ///
    /// Returns `None` when host or port is absent; the caller treats that
    /// the same as an unknown token.
    pub fn from_raw(raw: RawConnectInfo) -> Option<Self> {
        let host = raw.host.filter(|h| !h.is_empty())?;
        let port = raw.port?;
        Some(Self {
            host,
            port,
            internal_access_path: raw.internal_access_path.filter(|p| !p.is_empty()),
        })
    }
}

/// Extract the `token` value from a `Cookie` request header.
///
/// The header is parsed as `k=v` pairs separated by `;`. A missing header,
/// a pair without `=`, or an empty token value all count as a malformed
/// request rather than an invalid token: no authorization call is made.
pub fn token_from_cookie(header: Option<&str>) -> Result<String, AuthError> {
    let header =
        header.ok_or_else(|| AuthError::MalformedRequest("no cookie header".to_string()))?;

    let mut pairs = HashMap::new();
    for part in header.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, value) = part.split_once('=').ok_or_else(|| {
            AuthError::MalformedRequest(format!("cookie pair without '=': {part:?}"))
        })?;
        pairs.insert(name.trim(), value.trim());
    }

    match pairs.get("token") {
        Some(value) if !value.is_empty() => Ok((*value).to_string()),
        Some(_) => Err(AuthError::MalformedRequest("empty token cookie".to_string())),
        None => Err(AuthError::MalformedRequest("no token cookie".to_string())),
    }
}

/// External authorization collaborator.
///
/// Implementations resolve a short-lived access token to target connect
/// info. `Ok(None)` means the token is unknown or expired. The trait is
/// object safe so servers can hold `Arc<dyn Authorizer>`.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn check_token(&self, token: &str) -> Result<Option<ConnectInfo>, AuthError>;
}

/// Resolve a token through the authorizer, bounded by `timeout`.
///
/// An empty collaborator response and a response missing host or port are
/// both reported as `InvalidToken`; the session never touches a target
/// socket in either case.
pub async fn authenticate(
    authorizer: &dyn Authorizer,
    token: &str,
    timeout: Duration,
) -> Result<ConnectInfo, AuthError> {
    let result = tokio::time::timeout(timeout, authorizer.check_token(token))
        .await
        .map_err(|_| AuthError::Timeout)??;

    match result {
        Some(info) => {
            debug!(host = %info.host, port = info.port, "token resolved");
            Ok(info)
        }
        None => Err(AuthError::InvalidToken),
    }
}

/// Authorization client speaking JSON over HTTP/1 to the token service.
///
/// Sends `POST <auth_url>` with a `{"token": "..."}` body and expects the
/// resolved connect info as a JSON object, or 404 / `null` for unknown
/// tokens. The wire format is private to the deployment; the proxy only
/// validates host/port presence.
pub struct HttpAuthorizer {
    endpoint: http::Uri,
    timeout: Duration,
}

impl HttpAuthorizer {
    pub fn new(endpoint: http::Uri, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    async fn request(&self, token: &str) -> Result<Option<ConnectInfo>, AuthError> {
        let authority = self
            .endpoint
            .authority()
            .ok_or_else(|| AuthError::Collaborator("auth URL missing host".to_string()))?
            .clone();
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(80);

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| AuthError::Collaborator(e.to_string()))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .handshake(io)
            .await
            .map_err(|e| AuthError::Collaborator(e.to_string()))?;

        // Drive the connection until the exchange completes
        let conn_handle = tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("authorizer connection error: {err:?}");
            }
        });

        let body = serde_json::json!({ "token": token }).to_string();
        let request = Request::builder()
            .method(Method::POST)
            .uri(
                self.endpoint
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/"),
            )
            .header(HOST, authority.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| AuthError::Collaborator(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| AuthError::Collaborator(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AuthError::Collaborator(format!(
                "auth service returned {status}"
            )));
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| AuthError::Collaborator(e.to_string()))?
            .to_bytes();
        conn_handle.abort();

        if bytes.is_empty() || bytes.as_ref() == b"null" {
            return Ok(None);
        }

        let raw: RawConnectInfo = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::Collaborator(format!("bad auth response: {e}")))?;

        match ConnectInfo::from_raw(raw) {
            Some(info) => Ok(Some(info)),
            None => {
                warn!("auth service returned connect info without host/port");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn check_token(&self, token: &str) -> Result<Option<ConnectInfo>, AuthError> {
        tokio::time::timeout(self.timeout, self.request(token))
            .await
            .map_err(|_| AuthError::Timeout)?
    }
}

/// In-memory token map, for embedding and tests
#[derive(Default)]
pub struct StaticAuthorizer {
    tokens: HashMap<String, ConnectInfo>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, info: ConnectInfo) {
        self.tokens.insert(token.into(), info);
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn check_token(&self, token: &str) -> Result<Option<ConnectInfo>, AuthError> {
        Ok(self.tokens.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_token_from_cookie_simple() {
        let token = token_from_cookie(Some("token=abc123")).expect("token present");
        assert_eq!(token, "abc123");
    }

    #[test]
    fn test_token_from_cookie_among_others() {
        let header = "session=xyz; token=abc123; theme=dark";
        let token = token_from_cookie(Some(header)).expect("token present");
        assert_eq!(token, "abc123");
    }

    #[test]
    fn test_token_from_cookie_missing_header() {
        let err = token_from_cookie(None).expect_err("no header");
        assert!(matches!(err, AuthError::MalformedRequest(_)));
    }

    #[test]
    fn test_token_from_cookie_missing_token() {
        let err = token_from_cookie(Some("session=xyz")).expect_err("no token pair");
        assert!(matches!(err, AuthError::MalformedRequest(_)));
    }

    #[test]
    fn test_token_from_cookie_empty_value() {
        let err = token_from_cookie(Some("token=")).expect_err("empty token");
        assert!(matches!(err, AuthError::MalformedRequest(_)));
    }

    #[test]
    fn test_token_from_cookie_malformed_pair() {
        let err = token_from_cookie(Some("garbage")).expect_err("pair without =");
        assert!(matches!(err, AuthError::MalformedRequest(_)));
    }

    #[test]
    fn test_connect_info_from_raw_complete() {
        let raw = RawConnectInfo {
            host: Some("10.0.0.5".to_string()),
            port: Some(5900),
            internal_access_path: Some("/console".to_string()),
        };
        let info = ConnectInfo::from_raw(raw).expect("complete info");
        assert_eq!(info.host, "10.0.0.5");
        assert_eq!(info.port, 5900);
        assert_eq!(info.internal_access_path.as_deref(), Some("/console"));
    }

    #[test]
    fn test_connect_info_from_raw_missing_host() {
        let raw = RawConnectInfo {
            host: None,
            port: Some(5900),
            internal_access_path: None,
        };
        assert!(ConnectInfo::from_raw(raw).is_none());
    }

    #[test]
    fn test_connect_info_from_raw_missing_port() {
        let raw = RawConnectInfo {
            host: Some("10.0.0.5".to_string()),
            port: None,
            internal_access_path: None,
        };
        assert!(ConnectInfo::from_raw(raw).is_none());
    }

    #[test]
    fn test_connect_info_from_raw_empty_access_path_dropped() {
        let raw = RawConnectInfo {
            host: Some("10.0.0.5".to_string()),
            port: Some(5900),
            internal_access_path: Some(String::new()),
        };
        let info = ConnectInfo::from_raw(raw).expect("complete info");
        assert!(info.internal_access_path.is_none());
    }

    #[tokio::test]
    async fn test_authenticate_maps_unknown_token_to_invalid() {
        let authorizer = StaticAuthorizer::new();
        let err = authenticate(&authorizer, "nope", Duration::from_secs(1))
            .await
            .expect_err("unknown token");
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_authenticate_static_hit() {
        let mut authorizer = StaticAuthorizer::new();
        authorizer.insert(
            "tok",
            ConnectInfo {
                host: "127.0.0.1".to_string(),
                port: 5900,
                internal_access_path: None,
            },
        );

        let info = authenticate(&authorizer, "tok", Duration::from_secs(1))
            .await
            .expect("known token");
        assert_eq!(info.port, 5900);
    }

    /// Minimal canned-response HTTP server for authorizer tests
    async fn spawn_auth_stub(status: &'static str, body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .await
                .expect("write response");
        });
        addr
    }

    #[tokio::test]
    async fn test_http_authorizer_resolves_token() {
        let addr = spawn_auth_stub(
            "200 OK",
            r#"{"host":"192.0.2.1","port":5901,"internal_access_path":"/vm1"}"#,
        )
        .await;

        let endpoint: http::Uri = format!("http://{addr}/check_token")
            .parse()
            .expect("valid uri");
        let authorizer = HttpAuthorizer::new(endpoint, Duration::from_secs(2));

        let info = authorizer
            .check_token("tok")
            .await
            .expect("request ok")
            .expect("token known");
        assert_eq!(info.host, "192.0.2.1");
        assert_eq!(info.port, 5901);
        assert_eq!(info.internal_access_path.as_deref(), Some("/vm1"));
    }

    #[tokio::test]
    async fn test_http_authorizer_unknown_token_is_none() {
        let addr = spawn_auth_stub("404 Not Found", "").await;

        let endpoint: http::Uri = format!("http://{addr}/check_token")
            .parse()
            .expect("valid uri");
        let authorizer = HttpAuthorizer::new(endpoint, Duration::from_secs(2));

        let result = authorizer.check_token("tok").await.expect("request ok");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_http_authorizer_incomplete_info_is_none() {
        let addr = spawn_auth_stub("200 OK", r#"{"port":5900}"#).await;

        let endpoint: http::Uri = format!("http://{addr}/check_token")
            .parse()
            .expect("valid uri");
        let authorizer = HttpAuthorizer::new(endpoint, Duration::from_secs(2));

        let result = authorizer.check_token("tok").await.expect("request ok");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_http_authorizer_unreachable_is_collaborator_error() {
        // Reserved port with nothing listening
        let endpoint: http::Uri = "http://127.0.0.1:1/check_token".parse().expect("valid uri");
        let authorizer = HttpAuthorizer::new(endpoint, Duration::from_secs(2));

        let err = authorizer.check_token("tok").await.expect_err("no listener");
        assert!(matches!(err, AuthError::Collaborator(_)));
    }
}
