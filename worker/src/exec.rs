//! The seam between the protocol loop and whatever actually runs a work
//! item.

use comms::msg::{WorkItem, WorkReport};

/// Runs one work item and produces its reports. The item's payload is
/// entirely this layer's business; the protocol loop only relays what
/// comes back.
pub trait Execute: Send {
    fn execute(&mut self, item: &WorkItem) -> Vec<WorkReport>;
}

impl<F> Execute for F
where
    F: FnMut(&WorkItem) -> Vec<WorkReport> + Send,
{
    fn execute(&mut self, item: &WorkItem) -> Vec<WorkReport> {
        self(item)
    }
}

/// Executor driven by the item payload itself. An item carrying
/// `{"outcome": "failed", "detail": ...}` fails, `"skipped"` skips,
/// anything else passes.
///
/// # Returns
/// Exactly one call-phase report per item.
pub struct PayloadExecutor;

impl Execute for PayloadExecutor {
    fn execute(&mut self, item: &WorkItem) -> Vec<WorkReport> {
        let detail = item
            .data
            .get("detail")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        let report = match item.data.get("outcome").and_then(serde_json::Value::as_str) {
            Some("failed") => {
                WorkReport::failed(&item.id, detail.unwrap_or_else(|| "failed".to_string()))
            }
            Some("skipped") => WorkReport::skipped(&item.id, detail),
            _ => WorkReport::passed(&item.id),
        };
        vec![report]
    }
}
