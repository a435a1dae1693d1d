use std::{env, io};

use log::info;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;

use comms::{ChannelReceiver, ChannelSender};
use worker::{PayloadExecutor, WorkerSession};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let mut listen = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => {
                listen = Some(
                    args.next()
                        .ok_or_else(|| io::Error::other("--listen requires an address"))?,
                );
            }
            other => return Err(io::Error::other(format!("unknown argument: {other}"))),
        }
    }

    match listen {
        Some(addr) => {
            let list = TcpListener::bind(&addr).await?;
            info!("listening at {addr}");

            let (stream, peer) = list.accept().await?;
            info!("controller connected from {peer}");
            let (rx, tx) = stream.into_split();
            let (rx, tx) = comms::channel(rx, tx);
            run_until_signal(rx, tx).await
        }
        None => {
            // launched as a subprocess: the channel is our stdio
            let (rx, tx) = comms::channel(tokio::io::stdin(), tokio::io::stdout());
            run_until_signal(rx, tx).await
        }
    }
}

async fn run_until_signal<R, W>(rx: ChannelReceiver<R>, tx: ChannelSender<W>) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let session = WorkerSession::new(PayloadExecutor);
    tokio::select! {
        ret = session.run(rx, tx) => {
            ret?;
            info!("wrapping up, disconnecting...");
        }
        _ = signal::ctrl_c() => {
            info!("received interrupt");
        }
    }
    Ok(())
}
