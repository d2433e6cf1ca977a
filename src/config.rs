use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Console subsystem served by this proxy instance.
///
/// The two variants are identical at runtime; they only differ in the
/// default listen port and the name used in logs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProxyVariant {
    /// noVNC-style console proxy
    Vnc,
    /// SPICE HTML5 console proxy
    Spice,
}

impl ProxyVariant {
    /// Default listen port for this console subsystem
    pub fn default_port(self) -> u16 {
        match self {
            ProxyVariant::Vnc => 6080,
            ProxyVariant::Spice => 6082,
        }
    }

    /// Short name used in logs
    pub fn name(self) -> &'static str {
        match self {
            ProxyVariant::Vnc => "vnc",
            ProxyVariant::Spice => "spice",
        }
    }
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "WebSocket console proxy",
    long_about = "console-relay accepts WebSocket console connections carrying a short-lived\n\
access token, resolves the token through an authorization service, and relays\n\
bytes to the resolved VNC/SPICE backend.\n\n\
Variants:\n\
- vnc   : listen on 6080 by default\n\
- spice : listen on 6082 by default\n\n\
Features:\n\
- Optional TLS termination (plain connections rejected with --ssl-only)\n\
- Optional static file serving for the console web client (--web)\n\
- Per-session traffic recording (--record FILE -> FILE.<session>)\n"
)]
pub struct Cli {
    /// Console subsystem to serve
    #[arg(long, value_enum, default_value_t = ProxyVariant::Vnc)]
    pub variant: ProxyVariant,

    /// Host on which to listen for incoming requests
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Port on which to listen (defaults to 6080 for vnc, 6082 for spice)
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Disallow non-encrypted connections
    #[arg(long)]
    pub ssl_only: bool,

    /// SSL certificate file
    #[arg(long, default_value = "self.pem")]
    pub cert: PathBuf,

    /// SSL key file (if separate from cert)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Serve static files from DIR on the same port
    #[arg(long, value_name = "DIR")]
    pub web: Option<PathBuf>,

    /// Become a daemon (background process)
    #[arg(long)]
    pub daemon: bool,

    /// Record sessions to FILE.<session>
    #[arg(long, value_name = "FILE")]
    pub record: Option<PathBuf>,

    /// Prefer IPv6 addresses when resolving the listen host
    #[arg(long)]
    pub source_is_ipv6: bool,

    /// Authorization service endpoint used to resolve access tokens
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8775/check_token")]
    pub auth_url: String,

    /// Timeout in seconds for token resolution
    #[arg(long, default_value_t = 10)]
    pub auth_timeout: u64,

    /// Timeout in seconds for connecting to the target console backend
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,
}

/// Error type for startup configuration validation.
///
/// These are fatal: the process reports the error and exits without
/// binding a listener.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SSL only and certificate {} not found", .0.display())]
    MissingCertificate(PathBuf),

    #[error("can not find web root at {}", .0.display())]
    MissingWebRoot(PathBuf),

    #[error("invalid authorization service URL {url}: {reason}")]
    InvalidAuthUrl { url: String, reason: String },
}

/// Proxy server configuration derived from CLI arguments.
///
/// Constructed once at startup, immutable thereafter, and shared
/// read-only by every session worker.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub variant: ProxyVariant,
    pub listen_host: String,
    pub listen_port: u16,
    pub cert: PathBuf,
    pub key: Option<PathBuf>,
    pub ssl_only: bool,
    pub daemon: bool,
    pub record: Option<PathBuf>,
    pub web: Option<PathBuf>,
    pub source_is_ipv6: bool,
    pub auth_url: http::Uri,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments, validating preconditions
    /// before any socket is bound.
    pub fn from_cli(args: Cli) -> Result<Self, ConfigError> {
        if args.ssl_only && !args.cert.exists() {
            return Err(ConfigError::MissingCertificate(args.cert));
        }

        if let Some(web) = &args.web {
            if !web.is_dir() {
                return Err(ConfigError::MissingWebRoot(web.clone()));
            }
        }

        let auth_url: http::Uri =
            args.auth_url
                .parse()
                .map_err(|e: http::uri::InvalidUri| ConfigError::InvalidAuthUrl {
                    url: args.auth_url.clone(),
                    reason: e.to_string(),
                })?;
        if auth_url.authority().is_none() {
            return Err(ConfigError::InvalidAuthUrl {
                url: args.auth_url,
                reason: "missing host".to_string(),
            });
        }

        let listen_port = args.listen_port.unwrap_or(args.variant.default_port());

        Ok(Self {
            variant: args.variant,
            listen_host: args.listen_host,
            listen_port,
            cert: args.cert,
            key: args.key,
            ssl_only: args.ssl_only,
            daemon: args.daemon,
            record: args.record,
            web: args.web,
            source_is_ipv6: args.source_is_ipv6,
            auth_url,
            auth_timeout: Duration::from_secs(args.auth_timeout),
            connect_timeout: Duration::from_secs(args.connect_timeout),
        })
    }
}
