mod common;

use common::{exchange, tagged_echo, TestGateway, LISTEN};
use harbr_gateway::{GatewayConfig, GatewayError, ProxyRuleConfig, ReloadStatus};
use std::net::SocketAddr;
use tokio::net::TcpStream;

fn catch_all(target: SocketAddr) -> GatewayConfig {
    GatewayConfig {
        proxy_rules: vec![ProxyRuleConfig {
            tls: false,
            sni: None,
            tls_cert_path: None,
            tls_key_path: None,
            listen_addr: LISTEN.to_string(),
            target_addr: target.to_string(),
            priority: 0,
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_reload_affects_only_new_connections() {
    let old = tagged_echo("old:").await;
    let new = tagged_echo("new:").await;
    let gateway = TestGateway::start(catch_all(old)).await;

    let mut in_flight = TcpStream::connect(gateway.addr).await.unwrap();
    assert_eq!(exchange(&mut in_flight, b"one", 7).await, b"old:one");

    let version = gateway.source.publish(catch_all(new));
    assert_eq!(
        gateway.reloader.check_now().unwrap(),
        ReloadStatus::Reloaded(version)
    );

    // The relaying connection keeps its resolved target.
    assert_eq!(exchange(&mut in_flight, b"two", 7).await, b"old:two");

    let mut fresh = TcpStream::connect(gateway.addr).await.unwrap();
    assert_eq!(exchange(&mut fresh, b"three", 9).await, b"new:three");

    drop(in_flight);
    drop(fresh);
    gateway.stop().await;
}

#[tokio::test]
async fn test_rejected_reload_keeps_serving_previous_rules() {
    let old = tagged_echo("old:").await;
    let gateway = TestGateway::start(catch_all(old)).await;

    let mut broken = catch_all(old);
    broken.proxy_rules[0].target_addr.clear();
    gateway.source.publish(broken);

    assert!(matches!(
        gateway.reloader.check_now(),
        Err(GatewayError::ConfigReloadFailed { .. })
    ));

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    assert_eq!(exchange(&mut client, b"still", 9).await, b"old:still");

    drop(client);
    gateway.stop().await;
}
