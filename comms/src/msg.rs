//! The messages exchanged between the controlling process and a worker
//! once the channel is in framed mode.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::specs::RunConfig;

/// One unit of work. Identity lives entirely in `id`; `data` is an
/// opaque payload the distribution core never interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self { id: id.into(), data }
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkItem {}

impl Hash for WorkItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Which part of an item's lifecycle a report covers. Teardown reports
/// never count as the item's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Call,
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

/// Result of running one work item on one worker. The controlling side
/// stamps `node_id` when the report crosses the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkReport {
    pub item_id: String,
    pub phase: Phase,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub node_id: Option<String>,
}

impl WorkReport {
    pub fn passed(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            phase: Phase::Call,
            outcome: Outcome::Passed,
            detail: None,
            node_id: None,
        }
    }

    pub fn failed(item_id: &str, detail: String) -> Self {
        Self {
            item_id: item_id.to_string(),
            phase: Phase::Call,
            outcome: Outcome::Failed,
            detail: Some(detail),
            node_id: None,
        }
    }

    pub fn skipped(item_id: &str, detail: Option<String>) -> Self {
        Self {
            item_id: item_id.to_string(),
            phase: Phase::Call,
            outcome: Outcome::Skipped,
            detail,
            node_id: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }
}

/// First frame the controlling side sends after the bootstrap marker:
/// the shared run configuration, per-worker input, an optional scratch
/// directory and the worker's assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Startup {
    pub config: RunConfig,
    pub workerinput: BTreeMap<String, String>,
    pub basetemp: Option<PathBuf>,
    pub node_id: String,
}

/// Controller-to-worker messages. `Shutdown` is the graceful-shutdown
/// sentinel; end-of-stream is a channel-level condition, not a variant,
/// so the two can never be confused.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ToWorker {
    Startup(Startup),
    Run(WorkItem),
    RunBatch(Vec<WorkItem>),
    Shutdown,
}

/// Worker-to-controller event envelope. A closed set: frames with an
/// unknown tag fail to decode and are rejected at the channel layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "fields", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Handshake complete, the worker accepts work.
    Ready,
    /// Graceful finish, carrying the worker-side output map.
    Finished { output: BTreeMap<String, String> },
    Report { report: WorkReport },
    InternalError { message: String },
    TeardownError { report: WorkReport },
}
