//! The scheduling core: one single-consumer loop over the session event
//! queue, dispatching work in either distribution mode and deciding the
//! final outcome of a run.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};

use comms::msg::{Phase, WorkItem, WorkReport};
use comms::specs::{DistMode, RunConfig};

use crate::error::Result;
use crate::event::{EventReceiver, EventSender, SessionEvent};
use crate::node::WorkerNode;
use crate::nodemanage::NodeManager;
use crate::reporter::Reporter;

/// A node is eligible for new work while it holds fewer than this many
/// outstanding items.
const LOAD_THRESHOLD_NEWITEMS: usize = 5;

/// Per-node batch size bounding a single load-dispatch round.
const ITEM_CHUNKSIZE: usize = 10;

/// Event queue poll timeout. Bounds how long an interrupt request can go
/// unnoticed.
const QUEUE_POLL: Duration = Duration::from_secs(2);

/// How long the full set of nodes may take to become ready.
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Final verdict of a run, with its conventional process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ok,
    TestsFailed,
    Interrupted,
    InternalError,
    NoHosts,
}

impl RunOutcome {
    pub fn code(self) -> i32 {
        match self {
            RunOutcome::Ok => 0,
            RunOutcome::TestsFailed => 1,
            RunOutcome::Interrupted => 2,
            RunOutcome::InternalError => 3,
            RunOutcome::NoHosts => 4,
        }
    }
}

/// Mutable loop bookkeeping, separate from the node topology.
#[derive(Default)]
struct LoopState {
    /// Items not yet handed to any node.
    pending: VecDeque<WorkItem>,
    /// Cleared when a dispatch round cannot place anything, set again by
    /// the next event. Prevents busy-looping against saturated nodes.
    dowork: bool,
    shutting_down: bool,
    failures: usize,
    exitstatus: Option<RunOutcome>,
}

/// The distributed session. Owns the event queue, the node topology and
/// the dispatch bookkeeping; everything runs on one consumer task.
pub struct DistSession {
    config: RunConfig,
    reporter: Arc<dyn Reporter>,
    putevent: EventSender,
    events: EventReceiver,
    /// Nodes constructed but not yet through their handshake.
    unregistered: BTreeMap<String, WorkerNode>,
    /// Ready nodes, in stable id order so dispatch is deterministic.
    nodes: BTreeMap<String, WorkerNode>,
    /// Items sent to a node and not yet completed there.
    node_pending: BTreeMap<String, Vec<WorkItem>>,
    /// Which nodes each in-flight item was sent to.
    item_nodes: HashMap<String, Vec<String>>,
    interrupt: Arc<AtomicBool>,
    state: LoopState,
}

impl DistSession {
    pub fn new(config: RunConfig, reporter: Arc<dyn Reporter>) -> Self {
        let (putevent, events) = mpsc::unbounded_channel();
        Self {
            config,
            reporter,
            putevent,
            events,
            unregistered: BTreeMap::new(),
            nodes: BTreeMap::new(),
            node_pending: BTreeMap::new(),
            item_nodes: HashMap::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            state: LoopState::default(),
        }
    }

    /// Shared flag an outer layer (signal handler) sets to request an
    /// orderly interrupt.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// A producer handle onto the session's event queue.
    pub fn putevent(&self) -> EventSender {
        self.putevent.clone()
    }

    /// Announces the nodes whose handshakes are in flight. Each becomes
    /// schedulable once its ready event arrives.
    pub fn register_expected(&mut self, nodes: Vec<WorkerNode>) {
        for node in nodes {
            self.unregistered.insert(node.id().to_string(), node);
        }
    }

    /// True when no item is queued or in flight anywhere.
    pub fn is_idle(&self) -> bool {
        self.state.pending.is_empty()
            && self.node_pending.values().all(Vec::is_empty)
            && self.item_nodes.is_empty()
    }

    /// Runs the whole pipeline: gateways, sync, nodes, the scheduling
    /// loop, teardown.
    pub async fn main(&mut self, items: Vec<WorkItem>) -> Result<RunOutcome> {
        if self.config.specs.is_empty() {
            warn!("no worker specs configured");
            return Ok(RunOutcome::NoHosts);
        }
        let mut manager = NodeManager::new(self.config.clone(), Arc::clone(&self.reporter))?;
        manager.setup().await?;
        let nodes = manager.setup_nodes(self.putevent()).await?;
        self.register_expected(nodes);
        manager.wait_all_ready(READY_TIMEOUT).await?;

        let outcome = self.run_loop(items).await;
        manager.teardown_nodes().await;
        Ok(outcome)
    }

    /// The scheduling loop proper. Consumes events until the run
    /// terminates one way or another.
    pub async fn run_loop(&mut self, items: Vec<WorkItem>) -> RunOutcome {
        info!(
            "running {} items on {} expected nodes",
            items.len(),
            self.unregistered.len() + self.nodes.len()
        );
        self.state.pending = items.into();
        self.state.dowork = true;
        loop {
            // an interrupt aborts regardless of phase; nodes may be
            // ignoring the shutdown sentinel and must not pin the loop.
            // teardown stays best-effort in `main`.
            if self.interrupt.load(Ordering::Relaxed) {
                info!("interrupt requested, aborting the loop");
                return RunOutcome::Interrupted;
            }
            if self.state.shutting_down {
                self.loop_once_shutdown().await;
            } else {
                self.loop_once().await;
            }
            if let Some(outcome) = self.check_termination().await {
                info!("session finished: {outcome:?}");
                return outcome;
            }
        }
    }

    async fn loop_once(&mut self) {
        if self.state.dowork && !self.state.pending.is_empty() && self.dispatch_ready() {
            self.trigger_dispatch().await;
        }
        // the bounded poll keeps interrupt checks regular
        match time::timeout(QUEUE_POLL, self.events.recv()).await {
            Ok(Some(event)) => {
                self.state.dowork = true;
                self.process_event(event);
            }
            Ok(None) | Err(_) => {}
        }
    }

    /// Once shutdown has begun no new work is placed; only node exits
    /// and late reports are consumed.
    async fn loop_once_shutdown(&mut self) {
        match time::timeout(QUEUE_POLL, self.events.recv()).await {
            Ok(Some(event)) => match event {
                SessionEvent::NodeDown {
                    node_id,
                    error,
                    output,
                } => self.handle_node_down(&node_id, error.as_deref(), &output),
                SessionEvent::Report(report) => self.reporter.report(&report),
                SessionEvent::TeardownError(report) => {
                    self.reporter.report(&report);
                    self.state.failures += 1;
                }
                SessionEvent::InternalError { message } => {
                    self.reporter.internal_error(&message);
                    self.state.exitstatus.get_or_insert(RunOutcome::InternalError);
                }
                other => debug!("ignored during shutdown: {other:?}"),
            },
            Ok(None) | Err(_) => {}
        }
    }

    fn process_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::NodeReady { node_id } => self.add_node(&node_id),
            SessionEvent::NodeDown {
                node_id,
                error,
                output,
            } => self.handle_node_down(&node_id, error.as_deref(), &output),
            SessionEvent::Report(report) => self.handle_report(report),
            SessionEvent::Reschedule(items) => self.handle_reschedule(items),
            SessionEvent::InternalError { message } => {
                self.reporter.internal_error(&message);
                self.state.exitstatus.get_or_insert(RunOutcome::InternalError);
            }
            SessionEvent::TeardownError(report) => {
                self.reporter.report(&report);
                self.note_failure();
            }
        }
    }

    /// Decides whether the loop is done, starting shutdown on the way
    /// when warranted.
    async fn check_termination(&mut self) -> Option<RunOutcome> {
        if !self.state.shutting_down {
            if self.state.exitstatus.is_some() {
                self.trigger_shutdown().await;
            } else if self.dispatch_ready()
                && self.state.pending.is_empty()
                && self.node_pending.values().all(Vec::is_empty)
                && self.events.is_empty()
            {
                // every item has completed everywhere and nothing is
                // queued; a still-queued reschedule event carries items
                // that must be dispatched first
                self.trigger_shutdown().await;
            } else if self.nodes.is_empty() && self.unregistered.is_empty() {
                // no hosts left to run anything; this outcome wins over
                // TestsFailed even when earlier crashes already counted
                // failures
                self.state.exitstatus.get_or_insert(RunOutcome::NoHosts);
                self.state.shutting_down = true;
            }
        }
        if self.state.shutting_down && self.nodes.is_empty() {
            let outcome = self.state.exitstatus.take().unwrap_or({
                if self.state.failures > 0 {
                    RunOutcome::TestsFailed
                } else {
                    RunOutcome::Ok
                }
            });
            return Some(outcome);
        }
        None
    }

    /// Dispatch needs the full topology: no handshake still in flight
    /// and at least one ready node.
    fn dispatch_ready(&self) -> bool {
        self.unregistered.is_empty() && !self.nodes.is_empty()
    }

    async fn trigger_shutdown(&mut self) {
        if self.state.shutting_down {
            return;
        }
        info!("triggering shutdown of {} nodes", self.nodes.len());
        self.state.shutting_down = true;
        self.state.pending.clear();
        for node in self.nodes.values() {
            if let Err(e) = node.shutdown(false).await {
                warn!("[{}] shutdown send failed: {e}", node.id());
            }
        }
    }

    async fn trigger_dispatch(&mut self) {
        match self.config.dist {
            DistMode::Each => self.send_each().await,
            DistMode::Load => self.send_load().await,
        }
    }

    /// Broadcast mode: every queued item goes to every node as one
    /// batch.
    async fn send_each(&mut self) {
        let items: Vec<WorkItem> = self.state.pending.drain(..).collect();
        if items.is_empty() {
            return;
        }
        for (node_id, node) in &self.nodes {
            if let Err(e) = node.send_batch(&items).await {
                warn!("[{node_id}] batch send failed: {e}");
                continue;
            }
            for item in &items {
                self.item_nodes
                    .entry(item.id.clone())
                    .or_default()
                    .push(node_id.clone());
            }
            if let Some(pending) = self.node_pending.get_mut(node_id) {
                pending.extend(items.iter().cloned());
            }
        }
        if self.config.debug {
            debug!("broadcast {} items to {} nodes", items.len(), self.nodes.len());
        }
    }

    /// Load mode: round-robin over nodes that are not saturated, capped
    /// per round; the unplaced remainder comes back through the queue as
    /// a reschedule event.
    async fn send_load(&mut self) {
        let available: Vec<String> = self
            .node_pending
            .iter()
            .filter(|(_, pending)| pending.len() < LOAD_THRESHOLD_NEWITEMS)
            .map(|(id, _)| id.clone())
            .collect();
        if available.is_empty() {
            // all nodes saturated; the next report wakes us up
            self.state.dowork = false;
            return;
        }

        let cap = available.len() * ITEM_CHUNKSIZE - 1;
        let mut sent = 0;
        while sent < cap {
            let Some(item) = self.state.pending.pop_front() else {
                break;
            };
            let node_id = &available[sent % available.len()];
            let Some(node) = self.nodes.get(node_id) else {
                self.state.pending.push_front(item);
                break;
            };
            if let Err(e) = node.send(&item).await {
                // the node's own down event will clean up; retry the
                // item next round
                warn!("[{node_id}] send failed: {e}");
                self.state.pending.push_front(item);
                break;
            }
            self.item_nodes
                .entry(item.id.clone())
                .or_default()
                .push(node_id.clone());
            if let Some(pending) = self.node_pending.get_mut(node_id) {
                pending.push(item);
            }
            sent += 1;
        }

        if self.config.debug {
            debug!("placed {sent} items over {} nodes", available.len());
        }
        if !self.state.pending.is_empty() && sent == cap {
            let leftovers: Vec<WorkItem> = self.state.pending.drain(..).collect();
            let _ = self.putevent.send(SessionEvent::Reschedule(leftovers));
        }
    }

    fn add_node(&mut self, node_id: &str) {
        if let Some(node) = self.unregistered.remove(node_id) {
            info!("[{node_id}] node registered");
            self.reporter.node_ready(node_id);
            self.nodes.insert(node_id.to_string(), node);
            self.node_pending.insert(node_id.to_string(), Vec::new());
        } else {
            warn!("[{node_id}] ready event from unknown node");
        }
    }

    /// Drops a node from the topology, returning the items it still
    /// owed.
    fn remove_node(&mut self, node_id: &str) -> Vec<WorkItem> {
        self.unregistered.remove(node_id);
        self.nodes.remove(node_id);
        let pending = self.node_pending.remove(node_id).unwrap_or_default();
        for item in &pending {
            self.forget_assignment(&item.id, node_id);
        }
        pending
    }

    fn forget_assignment(&mut self, item_id: &str, node_id: &str) {
        let emptied = if let Some(nodes) = self.item_nodes.get_mut(item_id) {
            nodes.retain(|n| n != node_id);
            nodes.is_empty()
        } else {
            false
        };
        if emptied {
            self.item_nodes.remove(item_id);
        }
    }

    fn handle_node_down(
        &mut self,
        node_id: &str,
        error: Option<&str>,
        output: &BTreeMap<String, String>,
    ) {
        self.reporter.node_down(node_id, error);
        if error.is_none() && !output.is_empty() {
            debug!("[{node_id}] finished with output: {output:?}");
        }

        let mut pending = self.remove_node(node_id);
        if pending.is_empty() {
            return;
        }
        match error {
            Some(error) => {
                // the item in flight when the worker died takes the
                // blame for the crash
                let first = pending.remove(0);
                let mut crash = WorkReport::failed(
                    &first.id,
                    format!("worker {node_id} crashed: {error}"),
                );
                crash.node_id = Some(node_id.to_string());
                self.reporter.report(&crash);
                self.note_failure();

                if self.state.shutting_down {
                    return;
                }
                match self.config.dist {
                    DistMode::Load => {
                        info!("[{node_id}] rescheduling {} items", pending.len());
                        self.state.pending.extend(pending);
                    }
                    DistMode::Each => {
                        // broadcast items were owed by this node alone
                        debug!("[{node_id}] dropping {} broadcast items", pending.len());
                    }
                }
            }
            None => {
                warn!(
                    "[{node_id}] finished with {} items outstanding",
                    pending.len()
                );
                if !self.state.shutting_down && self.config.dist == DistMode::Load {
                    self.state.pending.extend(pending);
                }
            }
        }
    }

    fn handle_report(&mut self, report: WorkReport) {
        self.reporter.report(&report);
        // a teardown report never completes the item
        if report.phase != Phase::Teardown {
            if let Some(node_id) = report.node_id.clone() {
                self.complete_item(&report.item_id, &node_id);
            }
        }
        if report.is_failed() {
            self.note_failure();
        }
    }

    fn complete_item(&mut self, item_id: &str, node_id: &str) {
        self.forget_assignment(item_id, node_id);
        if let Some(pending) = self.node_pending.get_mut(node_id) {
            if let Some(pos) = pending.iter().position(|item| item.id == item_id) {
                pending.remove(pos);
            }
        }
        self.state.dowork = true;
    }

    fn handle_reschedule(&mut self, items: Vec<WorkItem>) {
        for item in items.into_iter().rev() {
            self.state.pending.push_front(item);
        }
        if self.node_pending.values().any(|pending| !pending.is_empty()) {
            // avoid busywait, nodes still have work
            self.state.dowork = false;
        }
    }

    fn note_failure(&mut self) {
        self.state.failures += 1;
        if self.config.maxfail > 0 && self.state.failures >= self.config.maxfail {
            info!("stopping after {} failures", self.state.failures);
            self.state.exitstatus.get_or_insert(RunOutcome::Interrupted);
        }
    }
}
