pub mod error;
pub mod event;
pub mod gateway;
pub mod node;
pub mod nodemanage;
pub mod reporter;
pub mod rsync;
pub mod session;
pub mod spec;

pub use error::ControllerError;
pub use session::{DistSession, RunOutcome};

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;
    use std::sync::Mutex;

    use comms::msg::WorkReport;

    use crate::reporter::Reporter;

    /// Captures notifications for assertions.
    #[derive(Default)]
    pub struct RecordingReporter {
        reports: Mutex<Vec<WorkReport>>,
        node_downs: Mutex<Vec<(String, Option<String>)>>,
        rsync_starts: Mutex<Vec<Vec<String>>>,
        rsync_finishes: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        pub fn reports(&self) -> Vec<WorkReport> {
            self.reports.lock().unwrap().clone()
        }

        pub fn node_downs(&self) -> Vec<(String, Option<String>)> {
            self.node_downs.lock().unwrap().clone()
        }

        pub fn rsync_starts(&self) -> Vec<Vec<String>> {
            self.rsync_starts.lock().unwrap().clone()
        }

        pub fn rsync_finishes(&self) -> Vec<String> {
            self.rsync_finishes.lock().unwrap().clone()
        }
    }

    impl Reporter for RecordingReporter {
        fn rsync_start(&self, _source: &Path, targets: &[String]) {
            self.rsync_starts.lock().unwrap().push(targets.to_vec());
        }

        fn rsync_finish(&self, _source: &Path, target: &str) {
            self.rsync_finishes.lock().unwrap().push(target.to_string());
        }

        fn node_down(&self, node_id: &str, error: Option<&str>) {
            self.node_downs
                .lock()
                .unwrap()
                .push((node_id.to_string(), error.map(str::to_string)));
        }

        fn report(&self, report: &WorkReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }
}
