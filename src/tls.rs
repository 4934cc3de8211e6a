//! TLS termination support.
//!
//! Acceptors are built from PEM certificate and key files and cached per
//! (certificate, key) path pair, so a rule table reload that keeps the same
//! files does not re-read them.

use crate::error::{GatewayError, Result};
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

fn read_certs(reader: &mut dyn BufRead, source: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::tls(format!("{}: {}", source, e)))?;
    if certs.is_empty() {
        return Err(GatewayError::tls(format!("{}: no certificates found", source)));
    }
    Ok(certs)
}

fn read_key(reader: &mut dyn BufRead, source: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| GatewayError::tls(format!("{}: {}", source, e)))?
        .ok_or_else(|| GatewayError::tls(format!("{}: no private key found", source)))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| GatewayError::InvalidConfigFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Server configuration using the ring provider, independent of any
/// process-wide default.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

/// Build an acceptor from PEM-encoded certificate chain and key.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor> {
    let certs = read_certs(&mut &cert_pem[..], "certificate")?;
    let key = read_key(&mut &key_pem[..], "private key")?;
    Ok(TlsAcceptor::from(Arc::new(server_config(certs, key)?)))
}

/// Build an acceptor from certificate and key files.
pub fn load_acceptor<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<TlsAcceptor> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let certs = read_certs(&mut open(cert_path)?, &cert_path.display().to_string())?;
    let key = read_key(&mut open(key_path)?, &key_path.display().to_string())?;
    Ok(TlsAcceptor::from(Arc::new(server_config(certs, key)?)))
}

#[derive(Default)]
pub struct TlsAcceptorCache {
    acceptors: DashMap<(String, String), TlsAcceptor>,
}

impl TlsAcceptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached acceptor for a certificate and key pair, loading it on first use.
    pub fn acceptor(&self, cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
        let key = (cert_path.to_string(), key_path.to_string());
        if let Some(acceptor) = self.acceptors.get(&key) {
            return Ok(acceptor.value().clone());
        }

        // Loaded outside the map so file I/O never holds a shard lock.
        let acceptor = load_acceptor(cert_path, key_path)?;
        info!(cert = cert_path, "Loaded TLS certificate");
        Ok(self.acceptors.entry(key).or_insert(acceptor).value().clone())
    }

    pub fn len(&self) -> usize {
        self.acceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acceptors.is_empty()
    }
}
