//! Routing rules and the rule matcher.
//!
//! A [`RuleTable`] maps each listener address to its rules, sorted by
//! descending priority with ties kept in configuration order. Lookups prefer
//! an exact identity match and fall back to the highest-priority catch-all.

use crate::config::{GatewayConfig, GatewayRuleConfig, ProxyRuleConfig};
use crate::error::{GatewayError, Result};
use crate::rewrite;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Backend address a rule forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    addr: String,
}

impl Target {
    pub fn new<S: Into<String>>(addr: S) -> Self {
        let addr = addr.into();
        // Accept "http://host:port/" style upstreams as well as bare host:port.
        let host_port = match addr.split_once("://") {
            Some((_, rest)) => rest,
            None => addr.as_str(),
        };
        let host_port = host_port.split('/').next().unwrap_or(host_port);
        Self {
            addr: host_port.to_string(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// Proxy-specific rule data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    /// Certificate and key used to terminate TLS; `None` relays TLS untouched.
    pub tls_identity: Option<(String, String)>,
}

/// Gateway-specific rule data.
#[derive(Debug, Clone)]
pub struct PathRoute {
    pub pattern: Regex,
    pub template: String,
}

#[derive(Debug, Clone)]
pub enum RuleKind {
    Proxy(ProxyRoute),
    Gateway(PathRoute),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub listen_key: String,
    pub match_key: Option<String>,
    pub tls_required: bool,
    pub priority: i32,
    pub target: Target,
    pub kind: RuleKind,
}

impl Rule {
    pub fn from_proxy_config(config: &ProxyRuleConfig) -> Self {
        let tls_identity = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        };

        Self {
            listen_key: config.listen_addr.clone(),
            match_key: config.sni.as_deref().map(normalize_hostname),
            tls_required: config.tls,
            priority: config.priority,
            target: Target::new(config.target_addr.as_str()),
            kind: RuleKind::Proxy(ProxyRoute { tls_identity }),
        }
    }

    pub fn from_gateway_config(config: &GatewayRuleConfig) -> Result<Self> {
        let pattern =
            Regex::new(&config.path_pattern).map_err(|e| GatewayError::InvalidPattern {
                pattern: config.path_pattern.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            listen_key: config.listen_addr.clone(),
            match_key: config.host.as_deref().map(normalize_hostname),
            tls_required: false,
            priority: i32::from(config.priority),
            target: Target::new(config.target_addr.as_str()),
            kind: RuleKind::Gateway(PathRoute {
                pattern,
                template: config.path_template.clone(),
            }),
        })
    }

    /// Gateway rules need a path their pattern accepts; proxy rules ignore it.
    fn path_matches(&self, path: Option<&str>) -> bool {
        match &self.kind {
            RuleKind::Proxy(_) => true,
            RuleKind::Gateway(route) => path.map_or(false, |p| route.pattern.is_match(p)),
        }
    }

    /// Rewritten path-and-query for a gateway rule, `None` for proxy rules or
    /// when the pattern does not accept `path`.
    pub fn rewrite_path(&self, path: &str, query: Option<&str>) -> Option<String> {
        match &self.kind {
            RuleKind::Gateway(route) => rewrite::rewrite(&route.pattern, &route.template, path, query),
            RuleKind::Proxy(_) => None,
        }
    }

    pub fn is_catch_all(&self) -> bool {
        self.match_key.is_none()
    }
}

/// Lowercase, trim a trailing dot and drop any `:port` suffix.
pub fn normalize_hostname(hostname: &str) -> String {
    let hostname = hostname.trim();
    let host = if hostname.starts_with('[') {
        // Bracketed IPv6 literal, keep the brackets, drop the port.
        match hostname.find(']') {
            Some(end) => &hostname[..=end],
            None => hostname,
        }
    } else {
        match hostname.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => hostname,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Immutable mapping from listener address to priority-ordered rules.
#[derive(Debug, Default, Clone)]
pub struct RuleTable {
    by_listener: HashMap<String, Vec<Arc<Rule>>>,
}

impl RuleTable {
    /// Build a table from rules given in configuration order.
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        let mut by_listener: HashMap<String, Vec<Arc<Rule>>> = HashMap::new();
        for rule in rules {
            by_listener
                .entry(rule.listen_key.clone())
                .or_default()
                .push(Arc::new(rule));
        }

        // Stable sort keeps table order among equal priorities.
        for rules in by_listener.values_mut() {
            rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        Self { by_listener }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.proxy_rules.len() + config.gateway_rules.len());
        rules.extend(config.proxy_rules.iter().map(Rule::from_proxy_config));
        for rule in &config.gateway_rules {
            rules.push(Rule::from_gateway_config(rule)?);
        }
        Ok(Self::from_rules(rules))
    }

    /// Resolve a connection to a rule.
    ///
    /// An exact `match_key` hit with the same TLS-ness (and an accepting path
    /// pattern for gateway rules) wins; otherwise the first catch-all that
    /// satisfies the same conditions is returned.
    pub fn resolve(
        &self,
        listen_key: &str,
        tls: bool,
        identity: Option<&str>,
        path: Option<&str>,
    ) -> Option<Arc<Rule>> {
        let rules = self.by_listener.get(listen_key)?;

        if let Some(identity) = identity {
            let identity = normalize_hostname(identity);
            let exact = rules.iter().find(|rule| {
                rule.match_key.as_deref() == Some(identity.as_str())
                    && rule.tls_required == tls
                    && rule.path_matches(path)
            });
            if let Some(rule) = exact {
                return Some(Arc::clone(rule));
            }
        }

        rules
            .iter()
            .find(|rule| rule.is_catch_all() && rule.tls_required == tls && rule.path_matches(path))
            .cloned()
    }

    pub fn rules_for(&self, listen_key: &str) -> &[Arc<Rule>] {
        self.by_listener
            .get(listen_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every target named by some rule, duplicates included.
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.by_listener.values().flatten().map(|rule| &rule.target)
    }

    pub fn listeners(&self) -> impl Iterator<Item = &str> {
        self.by_listener.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_listener.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
