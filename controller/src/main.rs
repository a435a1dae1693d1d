use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::{env, io, process};

use log::info;
use tokio::signal;

use comms::msg::WorkItem;
use comms::specs::RunConfig;
use controller::DistSession;
use controller::reporter::LogReporter;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let config_path = args
        .next()
        .ok_or_else(|| io::Error::other("usage: controller <config.json> [item-id ...]"))?;
    let raw = tokio::fs::read(&config_path).await?;
    let config: RunConfig = serde_json::from_slice(&raw)?;
    let items: Vec<WorkItem> = args.map(WorkItem::new).collect();

    let mut session = DistSession::new(config, Arc::new(LogReporter));

    let interrupt = session.interrupt_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt signal received");
            interrupt.store(true, Ordering::Relaxed);
        }
    });

    let outcome = session
        .main(items)
        .await
        .map_err(|e| io::Error::other(e.to_string()))?;
    info!("run finished: {outcome:?}");
    process::exit(outcome.code());
}
