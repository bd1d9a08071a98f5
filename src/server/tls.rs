use crate::{config::TlsLimits, errors::ConfigError};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::{rustls, TlsAcceptor};

pub(crate) const ALPN_H2: &[u8] = b"h2";
pub(crate) const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Builds the TLS acceptor from PEM key material, advertising `h2` and
/// `http/1.1` for ALPN. Runs at startup; any problem is fatal before the
/// listener binds.
pub(crate) fn build_acceptor(limits: &TlsLimits) -> Result<TlsAcceptor, ConfigError> {
    let mut cert_reader = BufReader::new(File::open(&limits.cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(ConfigError::Tls)?;
    if certs.is_empty() {
        return Err(ConfigError::Invalid("certificate file holds no certificates"));
    }

    let mut key_reader = BufReader::new(File::open(&limits.key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(ConfigError::Tls)?
        .ok_or(ConfigError::Invalid("key file holds no private key"))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|_| ConfigError::Invalid("certificate/key pair rejected"))?;
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tls_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_files_fail_fast() {
        let limits = TlsLimits::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(build_acceptor(&limits).is_err());
    }

    #[test]
    fn garbage_pem_rejected() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"not a certificate").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(b"not a key").unwrap();

        let limits = TlsLimits::new(cert.path(), key.path());
        assert!(build_acceptor(&limits).is_err());
    }
}
