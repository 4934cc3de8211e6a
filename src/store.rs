//! Versioned rule store.
//!
//! Uses ArcSwap for lock-free whole-table replacement. Readers take a
//! snapshot and never observe a partially applied reload; a snapshot taken
//! before a swap stays valid until its last holder drops it.

use crate::reload::ConfigVersion;
use crate::rules::{Rule, RuleTable};
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// One consistent generation of the routing rules.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    pub table: RuleTable,
    pub version: Option<ConfigVersion>,
}

pub struct RuleStore {
    snapshot: ArcSwap<RuleSnapshot>,
}

impl RuleStore {
    pub fn new(table: RuleTable, version: Option<ConfigVersion>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSnapshot { table, version }),
        }
    }

    pub fn empty() -> Self {
        Self::new(RuleTable::default(), None)
    }

    /// Current generation of the rules.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.load_full()
    }

    /// Version token of the applied configuration.
    pub fn version(&self) -> Option<ConfigVersion> {
        self.snapshot.load().version.clone()
    }

    /// Replace the whole table in a single pointer swap.
    pub fn replace(&self, table: RuleTable, version: ConfigVersion) {
        let rule_count = table.len();
        self.snapshot.store(Arc::new(RuleSnapshot {
            table,
            version: Some(version.clone()),
        }));
        info!(rule_count, version = %version, "Rule table replaced");
    }

    /// Resolve against the current generation without retaining it.
    pub fn resolve(
        &self,
        listen_key: &str,
        tls: bool,
        identity: Option<&str>,
        path: Option<&str>,
    ) -> Option<Arc<Rule>> {
        self.snapshot.load().table.resolve(listen_key, tls, identity, path)
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::empty()
    }
}

/// Shared rule store reference.
pub type SharedRuleStore = Arc<RuleStore>;
