use std::time::Duration;

use tokio::io;

use comms::msg::{ToWorker, WorkItem, WorkerEvent};

#[tokio::test]
async fn send_recv_roundtrip() {
    const SIZE: usize = 4096;

    let (one, two) = io::duplex(SIZE);
    let (rx1, tx1) = io::split(one);
    let (_, mut tx) = comms::channel(rx1, tx1);
    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    let items = vec![WorkItem::new("a"), WorkItem::new("b")];
    tx.send(&ToWorker::RunBatch(items.clone())).await.unwrap();
    tx.send(&ToWorker::Shutdown).await.unwrap();

    match rx.recv::<ToWorker>().await.unwrap() {
        Some(ToWorker::RunBatch(got)) => assert_eq!(got, items),
        other => panic!("unexpected msg: {other:?}"),
    }
    match rx.recv::<ToWorker>().await.unwrap() {
        Some(ToWorker::Shutdown) => {}
        other => panic!("unexpected msg: {other:?}"),
    }
}

#[tokio::test]
async fn recv_returns_none_on_end_of_stream() {
    let (one, two) = io::duplex(64);
    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    drop(one);

    let got = rx.recv::<WorkerEvent>().await.unwrap();
    assert!(got.is_none());
}

#[tokio::test]
async fn end_of_stream_is_distinct_from_shutdown_sentinel() {
    let (one, two) = io::duplex(4096);
    let (rx1, tx1) = io::split(one);
    let (_, mut tx) = comms::channel(rx1, tx1);
    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    tx.send(&ToWorker::Shutdown).await.unwrap();
    tx.close().await.unwrap();
    drop(tx);

    // The sentinel arrives as an ordinary message, then the stream end.
    assert!(matches!(
        rx.recv::<ToWorker>().await.unwrap(),
        Some(ToWorker::Shutdown)
    ));
    assert!(rx.recv::<ToWorker>().await.unwrap().is_none());
}

#[tokio::test]
async fn bootstrap_marker_roundtrip() {
    let (one, two) = io::duplex(4096);
    let (rx1, tx1) = io::split(one);
    let (_, mut worker_tx) = comms::channel(rx1, tx1);
    let (rx2, tx2) = io::split(two);
    let (mut master_rx, _) = comms::channel(rx2, tx2);

    worker_tx.send_bootstrap().await.unwrap();
    worker_tx.send(&WorkerEvent::Ready).await.unwrap();

    master_rx
        .wait_bootstrap(Duration::from_secs(1))
        .await
        .unwrap();
    assert!(matches!(
        master_rx.recv::<WorkerEvent>().await.unwrap(),
        Some(WorkerEvent::Ready)
    ));
}

#[tokio::test]
async fn bootstrap_times_out_on_silent_peer() {
    let (_one, two) = io::duplex(64);
    let (rx2, tx2) = io::split(two);
    let (mut master_rx, _) = comms::channel(rx2, tx2);

    let err = master_rx
        .wait_bootstrap(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}

#[tokio::test]
async fn undecodable_frame_is_invalid_data_and_framing_survives() {
    let (one, two) = io::duplex(4096);
    let (rx1, tx1) = io::split(one);
    let (_, mut tx) = comms::channel(rx1, tx1);
    let (rx2, tx2) = io::split(two);
    let (mut rx, _) = comms::channel(rx2, tx2);

    // A frame that is valid JSON but not a WorkerEvent.
    tx.send(&serde_json::json!({"event": "bogus"})).await.unwrap();
    tx.send(&WorkerEvent::Ready).await.unwrap();

    let err = rx.recv::<WorkerEvent>().await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

    // The next frame still decodes.
    assert!(matches!(
        rx.recv::<WorkerEvent>().await.unwrap(),
        Some(WorkerEvent::Ready)
    ));
}
