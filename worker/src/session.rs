//! Worker-side protocol loop: bootstrap, handshake, then work until the
//! controller says stop.

use std::collections::BTreeMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use comms::msg::{Phase, Startup, ToWorker, WorkItem, WorkReport, WorkerEvent};
use comms::{ChannelReceiver, ChannelSender};

use crate::exec::Execute;

/// One worker's lifetime on one channel. Emits the bootstrap marker,
/// waits for its startup frame, announces readiness and then executes
/// whatever arrives until shutdown.
pub struct WorkerSession<E> {
    executor: E,
}

impl<E: Execute> WorkerSession<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    /// Runs the session to completion.
    ///
    /// # Returns
    /// `Ok(())` after a graceful shutdown, and also when the controller
    /// disappears mid-run; there is nobody left to report to then.
    pub async fn run<R, W>(
        mut self,
        mut rx: ChannelReceiver<R>,
        mut tx: ChannelSender<W>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        tx.send_bootstrap().await?;

        let startup = loop {
            match rx.recv::<ToWorker>().await? {
                Some(ToWorker::Startup(startup)) => break startup,
                Some(other) => warn!("expected startup, got {other:?}"),
                None => return Ok(()),
            }
        };
        self.log_startup(&startup);
        tx.send(&WorkerEvent::Ready).await?;

        let mut items_run: usize = 0;
        loop {
            match rx.recv::<ToWorker>().await {
                Ok(Some(ToWorker::Run(item))) => {
                    self.run_one(&mut tx, &item).await?;
                    items_run += 1;
                }
                Ok(Some(ToWorker::RunBatch(items))) => {
                    for item in &items {
                        self.run_one(&mut tx, item).await?;
                        items_run += 1;
                    }
                }
                Ok(Some(ToWorker::Shutdown)) => break,
                Ok(Some(ToWorker::Startup(_))) => {
                    tx.send(&WorkerEvent::InternalError {
                        message: "duplicate startup frame".to_string(),
                    })
                    .await?;
                }
                Ok(None) => {
                    warn!("[{}] controller went away", startup.node_id);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("[{}] protocol error: {e}", startup.node_id);
                    tx.send(&WorkerEvent::InternalError {
                        message: e.to_string(),
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }

        let mut output = BTreeMap::new();
        output.insert("items_run".to_string(), items_run.to_string());
        tx.send(&WorkerEvent::Finished { output }).await?;
        info!("[{}] finished after {items_run} items", startup.node_id);
        tx.close().await
    }

    /// Executes one item, shielding the channel from executor panics,
    /// and relays every resulting report.
    async fn run_one<W>(&mut self, tx: &mut ChannelSender<W>, item: &WorkItem) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let reports = match panic::catch_unwind(AssertUnwindSafe(|| self.executor.execute(item))) {
            Ok(reports) => reports,
            Err(_) => vec![WorkReport::failed(&item.id, "executor panicked".to_string())],
        };
        for report in reports {
            let event = if report.phase == Phase::Teardown && report.is_failed() {
                WorkerEvent::TeardownError { report }
            } else {
                WorkerEvent::Report { report }
            };
            tx.send(&event).await?;
        }
        Ok(())
    }

    fn log_startup(&self, startup: &Startup) {
        info!(
            "[{}] configured, dist {:?}, {} worker input entries",
            startup.node_id,
            startup.config.dist,
            startup.workerinput.len()
        );
        if let Some(basetemp) = &startup.basetemp {
            debug!("[{}] scratch dir: {}", startup.node_id, basetemp.display());
        }
    }
}
