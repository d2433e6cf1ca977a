use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Error type for TLS material loading
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to load certificate {path}: {reason}")]
    CertLoad { path: String, reason: String },

    #[error("failed to load private key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Load all certificates from a PEM file (supports chains)
fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::CertLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::CertLoad {
            path: path.display().to_string(),
            reason: "no certificates found in file".to_string(),
        });
    }
    Ok(certs)
}

/// Load a private key from a PEM file (RSA, PKCS8, or EC)
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason: "no private key found in file".to_string(),
        })
}

/// Build a TLS acceptor from a certificate file and an optional separate
/// key file. When no key file is given the key is read from the
/// certificate file, matching the combined-PEM deployment layout.
pub fn build_acceptor(cert: &Path, key: Option<&Path>) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certificates(cert)?;
    let key = load_private_key(key.unwrap_or(cert))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
