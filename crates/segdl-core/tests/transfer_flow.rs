//! End-to-end transfer flow against an in-memory source

use segdl_core::{
    run_segmented_transfer, EventBus, MemorySource, QueueManager, RangeSource, SegdlCore, SegdlError,
    SegmentedTransfer, Transfer,
};
use segdl_types::{CoreEvent, EngineConfig, RemoteResource, TransferOptions, TransferState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn options(workers: usize, segment_size: u64) -> TransferOptions {
    TransferOptions {
        worker_count: workers,
        segment_size,
        read_chunk_size: 512,
        max_segment_retries: 2,
        retry_delay_ms: 1,
        extra_params: Vec::new(),
    }
}

fn resource(name: &str, size: usize) -> RemoteResource {
    RemoteResource::new(name, name, format!("mem://{}", name), size as u64)
}

#[tokio::test]
async fn queued_transfers_produce_exact_files() {
    let dir = tempfile::tempdir().unwrap();
    let data = MemorySource::pattern(10_000);
    let source = Arc::new(MemorySource::new(data.clone()).with_chunk_size(700));
    let runner = Arc::new(SegmentedTransfer::with_options(source, options(4, 1024), "part"));
    let queue = QueueManager::new(runner, EventBus::new(), Duration::from_millis(10));

    let progress_seen = Arc::new(AtomicU64::new(0));
    let max_seen = progress_seen.clone();
    queue.on_progress(move |t| {
        max_seen.fetch_max(t.bytes_transferred(), Ordering::SeqCst);
    });

    let transfers: Vec<Transfer> = ["one.bin", "two.bin", "three.bin"]
        .iter()
        .map(|name| Transfer::new(resource(name, data.len()), dir.path()))
        .collect();
    for t in &transfers {
        queue.enqueue(t.clone());
    }
    queue.start();
    queue.wait_idle().await;
    queue.events().flush().await;

    for t in &transfers {
        assert_eq!(t.state(), TransferState::Completed);
        assert_eq!(t.bytes_transferred(), data.len() as u64);
        assert!(t.started_at().unwrap() <= t.finished_at().unwrap());
        assert_eq!(std::fs::read(t.destination_path()).unwrap(), data);
    }
    assert_eq!(progress_seen.load(Ordering::SeqCst), data.len() as u64);
    queue.shutdown().await;
}

#[tokio::test]
async fn failed_transfer_keeps_partial_file_and_queue_moves_on() {
    let dir = tempfile::tempdir().unwrap();
    let data = MemorySource::pattern(4096);
    // Every read covering byte 3000 breaks, retries included
    let broken = Arc::new(MemorySource::new(data.clone()).fail_at(3000));
    let runner = Arc::new(SegmentedTransfer::with_options(broken, options(2, 1024), "part"));
    let queue = QueueManager::new(runner, EventBus::new(), Duration::from_millis(10));
    let mut events = queue.subscribe();

    let t = Transfer::new(resource("broken.bin", data.len()), dir.path());
    queue.enqueue(t.clone());
    queue.start();
    queue.wait_idle().await;
    queue.events().flush().await;

    assert_eq!(t.state(), TransferState::Failed);
    assert!(t.error().unwrap().contains("3000"));
    assert!(dir.path().join("broken.bin.part").exists());
    assert!(!dir.path().join("broken.bin").exists());
    assert_eq!(queue.list_failed().len(), 1);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::TransferFailed { transfer, .. } = event {
            assert_eq!(transfer.id, t.id());
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn chunk_consumer_failure_bounds_work() {
    let memory = Arc::new(MemorySource::new(MemorySource::pattern(500_000)).with_chunk_size(100));
    let source: Arc<dyn RangeSource> = memory.clone();
    let mut chunks = 0usize;
    let mut consumer = |_offset: u64, _bytes: &[u8]| -> Result<(), SegdlError> {
        chunks += 1;
        if chunks == 5 {
            return Err(SegdlError::Listener("display closed".into()));
        }
        Ok(())
    };

    let result = run_segmented_transfer(source, "mem://big", 500_000, &mut consumer, &options(4, 1000)).await;
    assert!(matches!(result, Err(SegdlError::Listener(_))));
    assert!(memory.requests().len() < 500);
}

#[tokio::test]
async fn core_facade_runs_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let data = MemorySource::pattern(3333);
    let config = EngineConfig {
        worker_count: 3,
        segment_size: 1000,
        read_chunk_size: 100,
        idle_poll_ms: 10,
        default_destination: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let core = SegdlCore::with_source(config, Arc::new(MemorySource::new(data.clone()))).unwrap();

    let first = core.add_transfer("mem://host/a.dat", None, None).await.unwrap();
    let second = core.add_transfer("mem://host/b.dat", Some(3333), None).await.unwrap();
    assert!(!core.is_empty());

    tokio::time::timeout(Duration::from_secs(10), core.wait_idle())
        .await
        .unwrap();
    assert_eq!(first.state(), TransferState::Completed);
    assert_eq!(second.state(), TransferState::Completed);
    assert_eq!(std::fs::read(dir.path().join("a.dat")).unwrap(), data);
    assert_eq!(std::fs::read(dir.path().join("b.dat")).unwrap(), data);
    core.shutdown().await;
}
