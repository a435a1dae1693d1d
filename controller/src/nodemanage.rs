//! Computes the sync scope, drives the sync and materializes one worker
//! node per gateway.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use tokio::fs;
use tokio::sync::watch;
use tokio::time::{self, Duration};

use comms::msg::Startup;
use comms::specs::RunConfig;

use crate::error::{ControllerError, Result};
use crate::event::EventSender;
use crate::gateway::GatewayManager;
use crate::node::WorkerNode;
use crate::reporter::Reporter;
use crate::spec::LaunchKind;

pub struct NodeManager {
    config: RunConfig,
    pub gwmanager: GatewayManager,
    reporter: Arc<dyn Reporter>,
    ready_counter: Arc<watch::Sender<usize>>,
    nodes: Vec<WorkerNode>,
    scratch_dirs: Vec<PathBuf>,
}

impl NodeManager {
    pub fn new(config: RunConfig, reporter: Arc<dyn Reporter>) -> Result<Self> {
        let gwmanager = GatewayManager::new(&config.specs, Arc::clone(&reporter))?;
        Ok(Self {
            config,
            gwmanager,
            reporter,
            ready_counter: Arc::new(watch::channel(0).0),
            nodes: Vec::new(),
            scratch_dirs: Vec::new(),
        })
    }

    /// Launches the gateways and replicates every sync root, in turn,
    /// before any work can be dispatched.
    pub async fn setup(&mut self) -> Result<()> {
        self.gwmanager.makegateways().await?;
        self.rsync_roots().await
    }

    /// Replicates each configured root. A root's ignore list only
    /// affects that root.
    pub async fn rsync_roots(&mut self) -> Result<()> {
        for root in self.config.rsync_roots.clone() {
            self.gwmanager.rsync(&root.path, &root.ignores).await?;
        }
        Ok(())
    }

    /// Builds one worker node per gateway, wired to the shared event
    /// queue. Handshakes keep completing in the background; block on
    /// them with `wait_all_ready`.
    pub async fn setup_nodes(&mut self, putevent: EventSender) -> Result<Vec<WorkerNode>> {
        let count = self.gwmanager.group().len();
        let mut nodes = Vec::with_capacity(count);

        for index in 0..count {
            let (id, kind, transport, kill) = {
                let gateway = &mut self.gwmanager.group_mut()[index];
                let transport = gateway.take_transport().ok_or_else(|| {
                    ControllerError::Io(std::io::Error::other(format!(
                        "transport of {} already taken",
                        gateway.id
                    )))
                })?;
                (
                    gateway.id.clone(),
                    gateway.spec.kind.clone(),
                    transport,
                    gateway.kill_handle(),
                )
            };

            let mut workerinput = BTreeMap::new();
            self.reporter.node_configuring(&id, &mut workerinput);

            let basetemp = if matches!(kind, LaunchKind::Popen) {
                let dir = std::env::temp_dir()
                    .join(format!("worker-{}-{}", std::process::id(), id));
                fs::create_dir_all(&dir).await?;
                self.scratch_dirs.push(dir.clone());
                Some(dir)
            } else {
                None
            };

            let startup = Startup {
                config: self.config.clone(),
                workerinput,
                basetemp,
                node_id: id.clone(),
            };

            debug!("[{id}] constructing node");
            let (rx, tx) = transport;
            let node = WorkerNode::setup(
                id,
                rx,
                tx,
                kill,
                startup,
                putevent.clone(),
                Arc::clone(&self.ready_counter),
            );
            self.nodes.push(node.clone());
            nodes.push(node);
        }

        Ok(nodes)
    }

    /// Blocks until every constructed node has reported ready or the
    /// timeout elapses.
    pub async fn wait_all_ready(&self, timeout: Duration) -> Result<()> {
        let expected = self.nodes.len();
        let mut ready = self.ready_counter.subscribe();
        let wait = ready.wait_for(|count| *count >= expected);
        match time::timeout(timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(ControllerError::SetupTimeout {
                what: "node readiness",
            }),
        }
    }

    /// Requests graceful shutdown from every node, exits the gateway
    /// manager and discards the scratch directories.
    pub async fn teardown_nodes(&mut self) {
        for node in &self.nodes {
            if let Err(e) = node.shutdown(false).await {
                debug!("[{}] shutdown request failed: {e}", node.id());
            }
        }
        self.nodes.clear();
        self.gwmanager.exit();
        for dir in self.scratch_dirs.drain(..) {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                debug!("could not remove scratch dir {}: {e}", dir.display());
            }
        }
        info!("all nodes torn down");
    }
}
