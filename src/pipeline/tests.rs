use super::*;
use crate::config::Config;
use crate::downloader::{BatchOrchestrator, BatchResult};
use crate::session::Session;
use crate::types::FileRef;
use std::sync::atomic::AtomicUsize;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn record(id: usize, files: Vec<FileRef>) -> Record {
    Record {
        id: id.to_string(),
        user: "u".into(),
        service: "svc".into(),
        title: String::new(),
        link: format!("https://site.example/svc/user/u/post/{id}"),
        page: 1,
        offset: 0,
        files,
    }
}

fn pipeline_config(capacity: usize, workers: usize) -> PipelineConfig {
    PipelineConfig {
        queue_capacity: capacity,
        pipeline_workers: workers,
        push_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        progress_interval: Duration::from_millis(20),
        ..PipelineConfig::default()
    }
}

/// Handler that parks every record until a permit is released
struct GatedHandler {
    gate: Semaphore,
    started: AtomicUsize,
}

#[async_trait::async_trait]
impl RecordHandler for GatedHandler {
    async fn handle(&self, _record: Record, _cancel: &CancellationToken) -> BatchResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.unwrap().forget();
        BatchResult {
            total: 1,
            downloaded: 1,
            ..BatchResult::default()
        }
    }
}

/// Handler that takes a fixed time per record
struct SlowHandler(Duration);

#[async_trait::async_trait]
impl RecordHandler for SlowHandler {
    async fn handle(&self, _record: Record, _cancel: &CancellationToken) -> BatchResult {
        tokio::time::sleep(self.0).await;
        BatchResult {
            total: 1,
            skipped: 1,
            ..BatchResult::default()
        }
    }
}

#[tokio::test]
async fn test_producer_stalls_when_queue_is_full() {
    let handler = Arc::new(GatedHandler {
        gate: Semaphore::new(0),
        started: AtomicUsize::new(0),
    });
    let pipeline = Arc::new(Pipeline::new(&pipeline_config(2, 1), handler.clone()));

    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = pulled.clone();
    let records = futures::stream::iter((1..=10).map(|i| record(i, Vec::new())))
        .inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .boxed();

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(records, &cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    // One record parked in the worker, two in the queue, one waiting to be pushed
    assert_eq!(handler.started.load(Ordering::SeqCst), 1);
    assert_eq!(pulled.load(Ordering::SeqCst), 4);
    assert_eq!(pipeline.stats().borrow().extracted, 3);
    assert_eq!(*pipeline.phase().borrow(), PipelinePhase::Running);

    handler.gate.add_permits(10);
    let stats = run.await.unwrap();
    assert_eq!(stats.extracted, 10);
    assert_eq!(stats.downloaded, 10);
    assert_eq!(pulled.load(Ordering::SeqCst), 10);
    assert_eq!(*pipeline.phase().borrow(), PipelinePhase::Done);
}

#[tokio::test]
async fn test_workers_drain_after_producer_finishes() {
    let pipeline = Pipeline::new(
        &pipeline_config(3, 4),
        Arc::new(SlowHandler(Duration::from_millis(5))),
    );
    let records = futures::stream::iter((1..=20).map(|i| record(i, Vec::new()))).boxed();

    let stats = pipeline.run(records, &CancellationToken::new()).await;
    assert_eq!(stats.extracted, 20);
    assert_eq!(stats.skipped, 20);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_empty_stream_finishes_immediately() {
    let pipeline = Pipeline::new(
        &pipeline_config(2, 3),
        Arc::new(SlowHandler(Duration::ZERO)),
    );
    let stats = pipeline
        .run(futures::stream::empty().boxed(), &CancellationToken::new())
        .await;
    assert_eq!(stats, PipelineStats::default());
    assert_eq!(*pipeline.phase().borrow(), PipelinePhase::Done);
}

#[tokio::test]
async fn test_cancellation_returns_partial_stats() {
    let pipeline = Pipeline::new(
        &pipeline_config(2, 1),
        Arc::new(SlowHandler(Duration::from_millis(20))),
    );
    let records = futures::stream::iter((1..=100).map(|i| record(i, Vec::new()))).boxed();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        trigger.cancel();
    });

    let stats = tokio::time::timeout(Duration::from_secs(5), pipeline.run(records, &cancel))
        .await
        .expect("pipeline should stop promptly after cancellation");
    assert!(stats.extracted < 100);
    assert!(stats.skipped <= stats.extracted);
    assert_eq!(*pipeline.phase().borrow(), PipelinePhase::Done);
}

#[tokio::test]
async fn test_events_are_emitted() {
    let (tx, mut rx) = broadcast::channel(64);
    let pipeline = Pipeline::new(
        &pipeline_config(2, 1),
        Arc::new(SlowHandler(Duration::ZERO)),
    )
    .with_events(tx);
    let records = futures::stream::iter(vec![record(
        1,
        vec![FileRef::new("a.png", "https://h/data/a.png")],
    )])
    .boxed();

    pipeline.run(records, &CancellationToken::new()).await;

    let mut extracted = None;
    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::RecordExtracted { id, files } => extracted = Some((id, files)),
            Event::PipelineFinished(stats) => finished = Some(stats),
            _ => {}
        }
    }
    assert_eq!(extracted, Some(("1".to_string(), 1)));
    assert_eq!(finished.map(|s| s.skipped), Some(1));
}

#[tokio::test]
async fn test_end_to_end_counts_with_one_existing_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/data/p\d/f\d\.bin$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 100]))
        .expect(5)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.download.download_dir = temp_dir.path().to_path_buf();
    config.download.post_delay = Duration::ZERO;
    config.retry.max_attempts = 1;

    let records: Vec<Record> = (1..=3)
        .map(|i| {
            record(
                i,
                (1..=2)
                    .map(|j| {
                        FileRef::new(
                            format!("f{j}.bin"),
                            format!("{}/data/p{i}/f{j}.bin", server.uri()),
                        )
                    })
                    .collect(),
            )
        })
        .collect();

    let existing = temp_dir.path().join("svc/u/posts/2/1-f1.bin");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, vec![7u8; 100]).unwrap();

    let orchestrator = BatchOrchestrator::new(Session::new().unwrap(), &config);
    let handler = Arc::new(RecordDownloader::new(orchestrator, &config.download));
    let pipeline = Pipeline::new(&pipeline_config(2, 3), handler);

    let stats = pipeline
        .run(futures::stream::iter(records).boxed(), &CancellationToken::new())
        .await;
    assert_eq!(
        stats,
        PipelineStats {
            extracted: 3,
            downloaded: 5,
            skipped: 1,
            failed: 0,
        }
    );
    for i in 1..=3 {
        for j in 1..=2 {
            let file = temp_dir.path().join(format!("svc/u/posts/{i}/{j}-f{j}.bin"));
            assert_eq!(std::fs::metadata(&file).unwrap().len(), 100);
        }
    }
}
