use crate::error::{GatewayError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub proxy_rules: Vec<ProxyRuleConfig>,
    #[serde(default)]
    pub gateway_rules: Vec<GatewayRuleConfig>,
}

/// A raw TCP / TLS forwarding rule.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyRuleConfig {
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    #[serde(default)]
    pub tls_key_path: Option<String>,
    pub listen_addr: String,
    pub target_addr: String,
    #[serde(default)]
    pub priority: i32,
}

/// An HTTP path-rewriting rule.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GatewayRuleConfig {
    #[serde(default)]
    pub priority: u8,
    pub listen_addr: String,
    pub target_addr: String,
    pub path_pattern: String,
    pub path_template: String,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub buffer_size: usize,
    pub read_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub reload_interval_secs: u64,
    pub max_connections: usize,
    pub fallback: FallbackPolicy,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            read_timeout_secs: 120,
            connect_timeout_ms: 5000,
            reload_interval_secs: 5,
            max_connections: 10000,
            fallback: FallbackPolicy::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

/// What an unroutable connection receives.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackResponse {
    NotFound,
    ServerError,
    Close,
}

/// Decides which fallback applies to which unroutable connection.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct FallbackPolicy {
    /// Gateway listener: no rule for the request's host/path.
    pub http_unmatched: FallbackResponse,
    /// Proxy listener: an identity was extracted but nothing matched it.
    pub proxy_unmatched: FallbackResponse,
    /// Proxy listener: no identity could be extracted and no catch-all exists.
    pub proxy_missing_identity: FallbackResponse,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            http_unmatched: FallbackResponse::NotFound,
            proxy_unmatched: FallbackResponse::ServerError,
            proxy_missing_identity: FallbackResponse::ServerError,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// The kind of service a listener address runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Proxy,
    Gateway,
}

impl GatewayConfig {
    pub fn from_str_with_format(content: &str, json: bool) -> Result<Self> {
        if json {
            Ok(serde_json::from_str(content)?)
        } else {
            Ok(serde_yaml::from_str(content)?)
        }
    }

    /// Every listener address named by the rules, with the service it runs.
    pub fn listeners(&self) -> Vec<(String, ListenerKind)> {
        let mut seen = HashSet::new();
        let mut listeners = Vec::new();

        for rule in &self.proxy_rules {
            if seen.insert(rule.listen_addr.clone()) {
                listeners.push((rule.listen_addr.clone(), ListenerKind::Proxy));
            }
        }
        for rule in &self.gateway_rules {
            if seen.insert(rule.listen_addr.clone()) {
                listeners.push((rule.listen_addr.clone(), ListenerKind::Gateway));
            }
        }

        listeners
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut kinds: HashMap<&str, ListenerKind> = HashMap::new();

        if self.settings.buffer_size == 0 {
            errors.push("settings.buffer_size must be greater than zero".to_string());
        }
        if self.settings.read_timeout_secs == 0 {
            errors.push("settings.read_timeout_secs must be greater than zero".to_string());
        }
        if self.settings.max_connections == 0 {
            errors.push("settings.max_connections must be greater than zero".to_string());
        }

        for (i, rule) in self.proxy_rules.iter().enumerate() {
            if rule.listen_addr.is_empty() {
                errors.push(format!("proxy_rules[{}]: listen_addr cannot be empty", i));
            }
            if rule.target_addr.is_empty() {
                errors.push(format!("proxy_rules[{}]: target_addr cannot be empty", i));
            }
            match (&rule.tls_cert_path, &rule.tls_key_path) {
                (Some(_), None) | (None, Some(_)) => errors.push(format!(
                    "proxy_rules[{}]: tls_cert_path and tls_key_path must be set together",
                    i
                )),
                (Some(_), Some(_)) if !rule.tls => errors.push(format!(
                    "proxy_rules[{}]: a certificate requires tls: true",
                    i
                )),
                _ => {}
            }
            if let Some(ListenerKind::Gateway) =
                kinds.insert(rule.listen_addr.as_str(), ListenerKind::Proxy)
            {
                errors.push(format!(
                    "listen address {} is shared by proxy and gateway rules",
                    rule.listen_addr
                ));
            }
        }

        for (i, rule) in self.gateway_rules.iter().enumerate() {
            if rule.listen_addr.is_empty() {
                errors.push(format!("gateway_rules[{}]: listen_addr cannot be empty", i));
            }
            if rule.target_addr.is_empty() {
                errors.push(format!("gateway_rules[{}]: target_addr cannot be empty", i));
            }
            if let Err(e) = Regex::new(&rule.path_pattern) {
                errors.push(format!(
                    "gateway_rules[{}]: invalid path_pattern '{}': {}",
                    i, rule.path_pattern, e
                ));
            }
            if let Some(ListenerKind::Proxy) =
                kinds.insert(rule.listen_addr.as_str(), ListenerKind::Gateway)
            {
                errors.push(format!(
                    "listen address {} is shared by proxy and gateway rules",
                    rule.listen_addr
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::ConfigValidation { errors })
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| GatewayError::InvalidConfigFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let json = path.extension().map_or(false, |ext| ext == "json");
    let config = GatewayConfig::from_str_with_format(&content, json)?;
    config.validate()?;
    Ok(config)
}
