// src/lib.rs
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub mod buffers;
pub mod classify;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod fallback;
pub mod forwarder;
pub mod listener;
pub mod metrics;
pub mod proxies;
pub mod reload;
pub mod rewrite;
pub mod rules;
pub mod sni;
pub mod store;
pub mod stream;
pub mod tls;

use crate::listener::Listener;
use crate::proxies::ServiceContext;

/// Shortest reload ticker period, whatever the configured interval.
const MIN_TICK: Duration = Duration::from_millis(100);

/// The gateway: every configured listener plus the hot-reload controller.
pub struct Gateway {
    ctx: Arc<ServiceContext>,
    reloader: Arc<HotReloader>,
    listeners: Vec<Listener>,
}

impl Gateway {
    /// Load the initial rules from `source` and bind every listener they name.
    pub async fn bind(source: Arc<dyn ConfigSource>) -> Result<Self> {
        let settings = source.load()?.settings;
        let store = Arc::new(RuleStore::empty());
        let reloader = Arc::new(HotReloader::new(source, Arc::clone(&store), settings.reload_interval()));
        let config = reloader.load_initial()?;

        let ctx = Arc::new(ServiceContext::new(store, config.settings.clone()));

        let mut listeners = Vec::new();
        for (listen_key, kind) in config.listeners() {
            listeners.push(Listener::bind(&listen_key, kind, Arc::clone(&ctx)).await?);
        }

        info!(
            listeners = listeners.len(),
            rules = ctx.store.snapshot().table.len(),
            "Gateway initialized"
        );
        Ok(Self {
            ctx,
            reloader,
            listeners,
        })
    }

    /// Create a gateway whose rules come from a configuration file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::bind(Arc::new(FileConfigSource::new(path))).await
    }

    /// Actual socket address of the listener configured as `listen_key`.
    pub fn local_addr(&self, listen_key: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|listener| listener.listen_key() == listen_key)
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn store(&self) -> SharedRuleStore {
        Arc::clone(&self.ctx.store)
    }

    pub fn reloader(&self) -> Arc<HotReloader> {
        Arc::clone(&self.reloader)
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then let in-flight connections finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let bound: HashSet<String> = self
            .listeners
            .iter()
            .map(|listener| listener.listen_key().to_string())
            .collect();

        let ticker = tokio::spawn(reload_ticker(
            Arc::clone(&self.reloader),
            Arc::clone(&self.ctx),
            bound,
            stopped(stop_rx.clone()),
        ));

        let handles: Vec<_> = self
            .listeners
            .into_iter()
            .map(|listener| tokio::spawn(listener.run(stopped(stop_rx.clone()))))
            .collect();

        shutdown.await;
        info!("Shutting down gateway");
        let _ = stop_tx.send(true);

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => e.log("Listener"),
                Err(e) => error!("Listener task failed: {}", e),
            }
        }
        let _ = ticker.await;

        info!("Gateway stopped");
        Ok(())
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Interval-driven reload checks, plus early checks requested by listeners.
async fn reload_ticker<F>(reloader: Arc<HotReloader>, ctx: Arc<ServiceContext>, bound: HashSet<String>, shutdown: F)
where
    F: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(reloader.interval().max(MIN_TICK));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = ctx.reload_requested() => {}
            _ = &mut shutdown => break,
        }

        match reloader.maybe_reload_blocking().await {
            Ok(ReloadStatus::Reloaded(_)) => {
                let snapshot = ctx.store.snapshot();
                warn_unbound(&snapshot.table, &bound);
                let pruned = ctx.connectors.retain_targets(&snapshot.table);
                if pruned > 0 {
                    debug!(pruned, "Dropped pooled clients for removed targets");
                }
            }
            Ok(_) => {}
            Err(e) => e.log("Hot reload"),
        }
    }
}

/// Listener addresses only take effect at startup.
fn warn_unbound(table: &RuleTable, bound: &HashSet<String>) {
    for listen_key in table.listeners() {
        if !bound.contains(listen_key) {
            warn!(listener = listen_key, "Rules name a listener that is not bound; restart to serve it");
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

// Re-export types for easier usage
pub use classify::StreamKind;
pub use config::{load_config, FallbackPolicy, FallbackResponse, GatewayConfig, GatewayRuleConfig, ListenerKind, ProxyRuleConfig, Settings};
pub use error::{GatewayError, Result};
pub use forwarder::{DuplexForwarder, RelayOutcome, Side, TerminalState};
pub use proxies::{ConnectionOutcome, Service};
pub use reload::{ConfigSource, ConfigVersion, FileConfigSource, HotReloader, MemoryConfigSource, ReloadStatus};
pub use rules::{Rule, RuleTable, Target};
pub use store::{RuleStore, SharedRuleStore};
