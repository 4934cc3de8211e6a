// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use harbr_gateway::config::LoggingConfig;
use harbr_gateway::{load_config, Gateway};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Content-routing TCP/TLS/HTTP gateway.
#[derive(Parser, Debug)]
#[command(name = "harbr-gateway", version, about)]
struct Cli {
    /// Path to the YAML (or .json) configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config.yml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    if cli.check {
        println!(
            "{}: OK ({} proxy rules, {} gateway rules, {} listeners)",
            cli.config.display(),
            config.proxy_rules.len(),
            config.gateway_rules.len(),
            config.listeners().len()
        );
        return Ok(());
    }

    init_logging(&config.settings.logging);
    harbr_gateway::metrics::init_metrics(&config.settings.metrics)?;

    let gateway = Gateway::from_file(&cli.config).await?;
    gateway.run().await?;

    Ok(())
}
