//! Configuration versions and the hot-reload controller.
//!
//! The controller compares the source's current version token with the one
//! the rule store last applied, at most once per check interval, and swaps
//! in a freshly built table only when the token changed. A configuration
//! that fails to load or validate leaves the active table in place.

use crate::config::{self, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::rules::RuleTable;
use crate::store::RuleStore;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Opaque configuration version token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigVersion(String);

impl ConfigVersion {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where rule configuration comes from.
pub trait ConfigSource: Send + Sync {
    /// Cheap query of the current version token.
    fn version(&self) -> Result<ConfigVersion>;

    /// Load and validate the full configuration.
    fn load(&self) -> Result<GatewayConfig>;
}

/// Configuration file on disk, versioned by modification time and length.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn version(&self) -> Result<ConfigVersion> {
        let metadata = fs::metadata(&self.path).map_err(|e| GatewayError::InvalidConfigFile {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        Ok(ConfigVersion(format!("{}-{}", modified, metadata.len())))
    }

    fn load(&self) -> Result<GatewayConfig> {
        config::load_config(&self.path)
    }
}

/// In-memory configuration whose version advances on every publish.
pub struct MemoryConfigSource {
    state: RwLock<(u64, GatewayConfig)>,
}

impl MemoryConfigSource {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            state: RwLock::new((1, config)),
        }
    }

    /// Replace the configuration and advance the version.
    pub fn publish(&self, config: GatewayConfig) -> ConfigVersion {
        let mut state = self.state.write();
        state.0 += 1;
        state.1 = config;
        ConfigVersion(state.0.to_string())
    }
}

impl ConfigSource for MemoryConfigSource {
    fn version(&self) -> Result<ConfigVersion> {
        Ok(ConfigVersion(self.state.read().0.to_string()))
    }

    fn load(&self) -> Result<GatewayConfig> {
        let config = self.state.read().1.clone();
        config.validate()?;
        Ok(config)
    }
}

/// Outcome of a reload check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadStatus {
    /// The interval has not elapsed, or another task is checking.
    NotDue,
    /// The version token matches the applied one.
    Unchanged,
    /// The version was already rejected; the previous table stays active.
    Rejected,
    /// A new table is now active.
    Reloaded(ConfigVersion),
}

pub struct HotReloader {
    source: Arc<dyn ConfigSource>,
    store: Arc<RuleStore>,
    interval: Duration,
    last_checked: Mutex<Instant>,
    last_rejected: Mutex<Option<ConfigVersion>>,
}

impl HotReloader {
    pub fn new(source: Arc<dyn ConfigSource>, store: Arc<RuleStore>, interval: Duration) -> Self {
        Self {
            source,
            store,
            interval,
            last_checked: Mutex::new(Instant::now()),
            last_rejected: Mutex::new(None),
        }
    }

    /// Build the initial table from the source and apply it.
    pub fn load_initial(&self) -> Result<GatewayConfig> {
        let version = self.source.version()?;
        let config = self.source.load()?;
        let table = RuleTable::from_config(&config)?;
        self.store.replace(table, version);
        *self.last_checked.lock() = Instant::now();
        Ok(config)
    }

    /// Check the source if the interval has elapsed.
    pub fn maybe_reload(&self) -> Result<ReloadStatus> {
        {
            let mut last_checked = match self.last_checked.try_lock() {
                Some(guard) => guard,
                None => return Ok(ReloadStatus::NotDue),
            };
            if last_checked.elapsed() < self.interval {
                return Ok(ReloadStatus::NotDue);
            }
            *last_checked = Instant::now();
        }

        self.check_now()
    }

    /// Run [`maybe_reload`](Self::maybe_reload) on the blocking pool.
    ///
    /// Version checks and rebuilds touch the filesystem and compile patterns,
    /// so async callers go through here.
    pub async fn maybe_reload_blocking(self: &Arc<Self>) -> Result<ReloadStatus> {
        let reloader = Arc::clone(self);
        tokio::task::spawn_blocking(move || reloader.maybe_reload())
            .await
            .map_err(|e| GatewayError::ConfigReloadFailed {
                reason: format!("reload task failed: {}", e),
            })?
    }

    /// Check the source immediately, ignoring the interval.
    pub fn check_now(&self) -> Result<ReloadStatus> {
        let version = self.source.version()?;

        if self.store.version().as_ref() == Some(&version) {
            debug!(version = %version, "Configuration unchanged");
            return Ok(ReloadStatus::Unchanged);
        }
        if self.last_rejected.lock().as_ref() == Some(&version) {
            return Ok(ReloadStatus::Rejected);
        }

        let built = self
            .source
            .load()
            .and_then(|config| RuleTable::from_config(&config));

        match built {
            Ok(table) => {
                self.store.replace(table, version.clone());
                *self.last_rejected.lock() = None;
                counter!("gateway.reload.applied", 1);
                info!(version = %version, "Configuration reloaded");
                Ok(ReloadStatus::Reloaded(version))
            }
            Err(e) => {
                *self.last_rejected.lock() = Some(version.clone());
                counter!("gateway.reload.failed", 1);
                warn!(version = %version, error = %e, "Configuration reload rejected, keeping previous rules");
                Err(GatewayError::ConfigReloadFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
