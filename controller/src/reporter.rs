//! Notification boundary consumed by an external reporting layer.

use std::collections::BTreeMap;
use std::path::Path;

use log::{error, info};

use comms::msg::WorkReport;

use crate::gateway::PlatformInfo;
use crate::spec::WorkerSpec;

/// Run-level notifications. All methods have no-op defaults so a
/// reporting layer only implements what it cares about.
pub trait Reporter: Send + Sync {
    fn new_gateway(&self, _id: &str, _spec: &WorkerSpec, _platform: &PlatformInfo) {}

    fn rsync_start(&self, _source: &Path, _targets: &[String]) {}

    fn rsync_finish(&self, _source: &Path, _target: &str) {}

    /// Fired before a node is wired up, giving the reporting layer a
    /// chance to inject per-node input.
    fn node_configuring(&self, _node_id: &str, _workerinput: &mut BTreeMap<String, String>) {}

    fn node_ready(&self, _node_id: &str) {}

    fn node_down(&self, _node_id: &str, _error: Option<&str>) {}

    fn report(&self, _report: &WorkReport) {}

    fn internal_error(&self, _message: &str) {}
}

/// Forwards every notification through the `log` facade.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn new_gateway(&self, id: &str, spec: &WorkerSpec, platform: &PlatformInfo) {
        info!("[{id}] new gateway {spec:?} on {}/{}", platform.os, platform.arch);
    }

    fn rsync_start(&self, source: &Path, targets: &[String]) {
        info!("[{}] rsyncing: {}", targets.join(","), source.display());
    }

    fn rsync_finish(&self, source: &Path, target: &str) {
        info!("[{target}] rsync finished: {}", source.display());
    }

    fn node_ready(&self, node_id: &str) {
        info!("[{node_id}] node ready");
    }

    fn node_down(&self, node_id: &str, error: Option<&str>) {
        match error {
            Some(error) => info!("[{node_id}] node down: {error}"),
            None => info!("[{node_id}] node down"),
        }
    }

    fn report(&self, report: &WorkReport) {
        info!(
            "[{}] {:?}/{:?} {}",
            report.node_id.as_deref().unwrap_or("?"),
            report.phase,
            report.outcome,
            report.item_id,
        );
    }

    fn internal_error(&self, message: &str) {
        error!("internal error: {message}");
    }
}
