//! The one queue everything funnels through: node receive tasks are the
//! producers, the session loop is the single consumer.

use std::collections::BTreeMap;

use comms::msg::{WorkItem, WorkReport};

/// Everything the scheduling loop can observe. A closed set; unknown
/// worker events are already rejected at the channel layer.
#[derive(Debug)]
pub enum SessionEvent {
    NodeReady {
        node_id: String,
    },
    /// The node terminated. `error` is `None` for a clean finish and
    /// carries the captured failure text otherwise.
    NodeDown {
        node_id: String,
        error: Option<String>,
        output: BTreeMap<String, String>,
    },
    Report(WorkReport),
    /// Items a dispatch round could not place; handed back to the loop.
    Reschedule(Vec<WorkItem>),
    InternalError {
        message: String,
    },
    TeardownError(WorkReport),
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;
