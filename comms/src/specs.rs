//! Shared run configuration. Constructed once by the operator-facing
//! layer and passed explicitly through every component and to every
//! worker; there is no ambient global.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The two work-distribution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistMode {
    /// Broadcast: every item goes to every node.
    Each,
    /// Load-balance: items are partitioned round-robin over available
    /// nodes.
    Load,
}

/// A local directory replicated to remote hosts before work starts.
/// `ignores` are sub-paths relative to `path` and only affect this
/// root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsyncRoot {
    pub path: PathBuf,
    #[serde(default)]
    pub ignores: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Worker specification strings, e.g. `popen`, `3*popen`,
    /// `ssh=host//chdir=cache`.
    #[serde(default)]
    pub specs: Vec<String>,
    pub dist: DistMode,
    #[serde(default)]
    pub rsync_roots: Vec<RsyncRoot>,
    /// Stop the run after this many failed reports. 0 means unlimited.
    #[serde(default)]
    pub maxfail: usize,
    /// Extra scheduling traces through the `log` facade.
    #[serde(default)]
    pub debug: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            specs: Vec::new(),
            dist: DistMode::Load,
            rsync_roots: Vec::new(),
            maxfail: 0,
            debug: false,
        }
    }
}
