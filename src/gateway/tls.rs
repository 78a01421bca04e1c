//! TLS acceptor setup
//!
//! Loads the server certificate chain and key from PEM files. A CA bundle,
//! when given, turns on client certificate verification, optional unless
//! `require_client_cert` is set.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use super::TlsConfig;

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    let certs = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKeyError(format!("{}: {}", path.display(), e)))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::CertificateError(format!("bad CA certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Build a TlsAcceptor from the gateway's TLS settings
pub fn load_tls_config(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    if config.require_client_cert && config.ca_cert_path.is_none() {
        return Err(TlsError::ConfigError(
            "ca_cert_path is required when require_client_cert is true".to_string(),
        ));
    }

    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let builder = match &config.ca_cert_path {
        Some(ca_path) => {
            let roots = Arc::new(load_roots(ca_path)?);
            let verifier = (if config.require_client_cert {
                WebPkiClientVerifier::builder(roots).build()
            } else {
                WebPkiClientVerifier::builder(roots)
                    .allow_unauthenticated()
                    .build()
            })
            .map_err(|e| TlsError::ConfigError(format!("client verifier: {}", e)))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::ConfigError(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn tls_config(cert: &Path, key: &Path) -> TlsConfig {
        TlsConfig {
            cert_path: cert.to_path_buf(),
            key_path: key.to_path_buf(),
            ca_cert_path: None,
            require_client_cert: false,
        }
    }

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::CertificateError("test error".to_string());
        assert!(err.to_string().contains("Certificate error"));

        let err = TlsError::PrivateKeyError("key error".to_string());
        assert!(err.to_string().contains("Private key error"));

        let err = TlsError::ConfigError("config error".to_string());
        assert!(err.to_string().contains("TLS config error"));
    }

    #[test]
    fn test_missing_files() {
        let err = load_tls_config(&tls_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        ))
        .err().unwrap();
        assert!(matches!(err, TlsError::Io(_)));
    }

    #[test]
    fn test_empty_certificate_file() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "not a pem file").unwrap();

        let err = load_tls_config(&tls_config(cert.path(), cert.path())).err().unwrap();
        assert!(matches!(err, TlsError::CertificateError(_)), "{}", err);
    }

    #[test]
    fn test_require_client_cert_needs_ca() {
        let mut config = tls_config(Path::new("cert.pem"), Path::new("key.pem"));
        config.require_client_cert = true;

        let err = load_tls_config(&config).err().unwrap();
        assert!(matches!(err, TlsError::ConfigError(_)));
    }
}
