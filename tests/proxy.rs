mod common;

use common::{exchange, tagged_echo, tls_connect, tls_tagged_echo, TestCert, TestGateway, LISTEN};
use harbr_gateway::{GatewayConfig, ProxyRuleConfig};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn proxy_rule(tls: bool, sni: Option<&str>, target: String) -> ProxyRuleConfig {
    ProxyRuleConfig {
        tls,
        sni: sni.map(str::to_string),
        tls_cert_path: None,
        tls_key_path: None,
        listen_addr: LISTEN.to_string(),
        target_addr: target,
        priority: 0,
    }
}

#[tokio::test]
async fn test_plaintext_routed_by_host_header() {
    let app = tagged_echo("app:").await;
    let default = tagged_echo("default:").await;

    let config = GatewayConfig {
        proxy_rules: vec![
            proxy_rule(false, None, default.to_string()),
            proxy_rule(false, Some("app.example.com"), app.to_string()),
        ],
        ..Default::default()
    };
    let gateway = TestGateway::start(config).await;

    let request = b"GET / HTTP/1.1\r\nHost: APP.example.com:80\r\n\r\n";
    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    let reply = exchange(&mut client, request, 4 + request.len()).await;
    assert!(reply.starts_with(b"app:GET / HTTP/1.1"));

    // Later bytes on the same connection keep going to the same backend.
    let reply = exchange(&mut client, b"more", 8).await;
    assert_eq!(reply, b"app:more");

    drop(client);

    let request = b"GET / HTTP/1.1\r\nHost: other.example.com\r\n\r\n";
    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    let reply = exchange(&mut client, request, 8 + request.len()).await;
    assert!(reply.starts_with(b"default:"));
    drop(client);

    gateway.stop().await;
}

#[tokio::test]
async fn test_tls_terminated_and_passed_through_by_sni() {
    let terminated_cert = TestCert::new("app.example.com");
    let passthrough_cert = TestCert::new("pass.example.com");

    let plain_backend = tagged_echo("plain:").await;
    let tls_backend = tls_tagged_echo("tls:", passthrough_cert.acceptor()).await;

    let mut terminate = proxy_rule(true, Some("app.example.com"), plain_backend.to_string());
    terminate.tls_cert_path = Some(terminated_cert.cert_path());
    terminate.tls_key_path = Some(terminated_cert.key_path());

    let config = GatewayConfig {
        proxy_rules: vec![
            terminate,
            proxy_rule(true, Some("pass.example.com"), tls_backend.to_string()),
        ],
        ..Default::default()
    };
    let gateway = TestGateway::start(config).await;

    // The gateway presents the certificate and relays decrypted bytes.
    let mut stream = tls_connect(&terminated_cert.connector(), gateway.addr, "app.example.com")
        .await
        .unwrap();
    assert_eq!(exchange(&mut stream, b"hello", 11).await, b"plain:hello");
    drop(stream);

    // The backend terminates; the gateway only read the ClientHello.
    let mut stream = tls_connect(&passthrough_cert.connector(), gateway.addr, "pass.example.com")
        .await
        .unwrap();
    assert_eq!(exchange(&mut stream, b"hello", 9).await, b"tls:hello");
    drop(stream);

    gateway.stop().await;
}

#[tokio::test]
async fn test_unknown_sni_receives_tls_alert() {
    let cert = TestCert::new("unknown.example.com");
    let backend = tagged_echo("x:").await;
    let config = GatewayConfig {
        proxy_rules: vec![proxy_rule(true, Some("app.example.com"), backend.to_string())],
        ..Default::default()
    };
    let gateway = TestGateway::start(config).await;

    let result = tls_connect(&cert.connector(), gateway.addr, "unknown.example.com").await;
    assert!(result.is_err());

    gateway.stop().await;
}

#[tokio::test]
async fn test_unroutable_plaintext_gets_server_error() {
    let backend = tagged_echo("x:").await;
    let config = GatewayConfig {
        proxy_rules: vec![proxy_rule(false, Some("app.example.com"), backend.to_string())],
        ..Default::default()
    };
    let gateway = TestGateway::start(config).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: nowhere.example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 500 "));

    gateway.stop().await;
}

#[tokio::test]
async fn test_zero_byte_connection_closes_quietly() {
    let backend = tagged_echo("x:").await;
    let config = GatewayConfig {
        proxy_rules: vec![proxy_rule(false, None, backend.to_string())],
        ..Default::default()
    };
    let gateway = TestGateway::start(config).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client.shutdown().await.unwrap();

    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
    assert_eq!(read.unwrap().unwrap(), 0);

    gateway.stop().await;
}
