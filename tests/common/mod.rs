#![allow(dead_code)]

use harbr_gateway::{Gateway, GatewayConfig, HotReloader, MemoryConfigSource};
use rustls::pki_types::ServerName;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const LISTEN: &str = "127.0.0.1:0";

/// A running gateway bound to an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub source: Arc<MemoryConfigSource>,
    pub reloader: Arc<HotReloader>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TestGateway {
    pub async fn start(mut config: GatewayConfig) -> Self {
        // Reloads happen only when a test asks for them.
        config.settings.reload_interval_secs = 3600;

        let source = Arc::new(MemoryConfigSource::new(config));
        let gateway = Gateway::bind(source.clone()).await.unwrap();
        let addr = gateway.local_addr(LISTEN).unwrap();
        let reloader = gateway.reloader();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            gateway
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            source,
            reloader,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap();
        }
    }
}

/// Backend that answers every read with `tag` followed by the bytes read.
pub async fn tagged_echo(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let mut reply = tag.as_bytes().to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    addr
}

/// Same as [`tagged_echo`], behind TLS terminated with `acceptor`.
pub async fn tls_tagged_echo(tag: &'static str, acceptor: TlsAcceptor) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(stream).await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let mut reply = tag.as_bytes().to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                }
            });
        }
    });

    addr
}

/// Send `payload` and read back exactly `expected` bytes.
pub async fn exchange<S>(stream: &mut S, payload: &[u8], expected_len: usize) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
    let mut reply = vec![0u8; expected_len];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

/// Self-signed certificate for `host`, written to temporary PEM files.
pub struct TestCert {
    pub der: rustls::pki_types::CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_file: tempfile::NamedTempFile,
    pub key_file: tempfile::NamedTempFile,
}

impl TestCert {
    pub fn new(host: &str) -> Self {
        let generated = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let cert_pem = generated.cert.pem();
        let key_pem = generated.key_pair.serialize_pem();

        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert_pem.as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(key_pem.as_bytes()).unwrap();

        Self {
            der: generated.cert.der().clone(),
            cert_pem,
            key_pem,
            cert_file,
            key_file,
        }
    }

    pub fn cert_path(&self) -> String {
        self.cert_file.path().display().to_string()
    }

    pub fn key_path(&self) -> String {
        self.key_file.path().display().to_string()
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        harbr_gateway::tls::acceptor_from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes()).unwrap()
    }

    /// Client trusting only this certificate.
    pub fn connector(&self) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.der.clone()).unwrap();
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

pub async fn tls_connect(
    connector: &TlsConnector,
    addr: SocketAddr,
    host: &str,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    connector.connect(name, stream).await
}
