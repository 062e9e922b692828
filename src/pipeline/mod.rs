//! Producer/consumer pipeline overlapping extraction with downloads
//!
//! One producer task pulls records from a lazy stream and pushes them into a bounded
//! queue; when the queue is full the push waits, so a slow download side throttles
//! extraction instead of buffering without limit. `pipeline_workers` worker tasks pop
//! records and hand them to a [`RecordHandler`].
//!
//! Shutdown needs no sentinel values: the producer owns the only sender, so the
//! queue closes on every producer exit path (end of stream, cancellation, panic) and
//! workers leave once `recv` reports the queue closed and empty.

mod handler;

pub use handler::{RecordDownloader, RecordHandler};

use crate::config::PipelineConfig;
use crate::types::{Event, PipelineStats, Record};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one pipeline run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Not started
    #[default]
    Idle,
    /// Producer and workers are active
    Running,
    /// The producer finished; workers are emptying the queue
    Draining,
    /// Every worker exited
    Done,
}

/// Bounded producer/consumer coordinator
///
/// Stats and phase are published on `watch` channels: updates are serialized by the
/// channel, readers take cheap snapshots that may be slightly stale. Run one
/// pipeline at a time per instance; each run resets the counters.
pub struct Pipeline {
    handler: Arc<dyn RecordHandler>,
    queue_capacity: usize,
    workers: usize,
    push_timeout: Duration,
    poll_interval: Duration,
    progress_interval: Duration,
    events: Option<broadcast::Sender<Event>>,
    phase: Arc<watch::Sender<PipelinePhase>>,
    stats: Arc<watch::Sender<PipelineStats>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("queue_capacity", &self.queue_capacity)
            .field("workers", &self.workers)
            .field("phase", &*self.phase.borrow())
            .field("stats", &*self.stats.borrow())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a pipeline feeding `handler`
    pub fn new(config: &PipelineConfig, handler: Arc<dyn RecordHandler>) -> Self {
        Self {
            handler,
            queue_capacity: config.queue_capacity.max(1),
            workers: config.pipeline_workers.max(1),
            push_timeout: config.push_timeout,
            poll_interval: config.poll_interval,
            progress_interval: config.progress_interval,
            events: None,
            phase: Arc::new(watch::channel(PipelinePhase::Idle).0),
            stats: Arc::new(watch::channel(PipelineStats::default()).0),
        }
    }

    /// Emit record and progress events on this channel
    pub fn with_events(mut self, events: broadcast::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// Watch the run's phase
    pub fn phase(&self) -> watch::Receiver<PipelinePhase> {
        self.phase.subscribe()
    }

    /// Watch the run's counters
    pub fn stats(&self) -> watch::Receiver<PipelineStats> {
        self.stats.subscribe()
    }

    /// Drive `records` through the workers until the stream ends or `cancel` fires
    ///
    /// On cancellation the producer stops pulling, idle workers exit at their next
    /// poll, and records still queued are dropped; transfers in flight finish on
    /// their own. The returned counters cover the work actually done.
    pub async fn run(
        &self,
        records: BoxStream<'static, Record>,
        cancel: &CancellationToken,
    ) -> PipelineStats {
        self.stats.send_replace(PipelineStats::default());
        self.phase.send_replace(PipelinePhase::Running);
        tracing::info!(
            queue_capacity = self.queue_capacity,
            workers = self.workers,
            "Pipeline started"
        );

        let (tx, rx) = mpsc::channel::<Record>(self.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let processed = Arc::new(AtomicU64::new(0));

        let reporter_stop = CancellationToken::new();
        let reporter = self.spawn_reporter(reporter_stop.clone());

        let producer = tokio::spawn(produce(
            records,
            tx,
            Producer {
                cancel: cancel.clone(),
                push_timeout: self.push_timeout,
                stats: self.stats.clone(),
                events: self.events.clone(),
            },
        ));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            workers.spawn(consume(
                worker_id,
                rx.clone(),
                Worker {
                    handler: self.handler.clone(),
                    cancel: cancel.clone(),
                    poll_interval: self.poll_interval,
                    stats: self.stats.clone(),
                    processed: processed.clone(),
                },
            ));
        }

        if let Err(e) = producer.await {
            tracing::error!(error = %e, "Producer task failed");
        }
        self.phase.send_replace(PipelinePhase::Draining);
        let enqueued = self.stats.borrow().extracted;
        tracing::info!(enqueued, "Extraction complete, draining queue");

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Download worker failed");
            }
        }

        let done = processed.load(Ordering::SeqCst);
        if done != enqueued {
            if cancel.is_cancelled() {
                tracing::info!(
                    enqueued,
                    processed = done,
                    "Pipeline cancelled with records left in the queue"
                );
            } else {
                tracing::warn!(enqueued, processed = done, "Not every queued record was processed");
            }
        }

        reporter_stop.cancel();
        if let Err(e) = reporter.await {
            tracing::debug!(error = %e, "Progress reporter ended abnormally");
        }

        self.phase.send_replace(PipelinePhase::Done);
        let stats = *self.stats.borrow();
        tracing::info!(%stats, "Pipeline finished");
        if let Some(events) = &self.events {
            events.send(Event::PipelineFinished(stats)).ok();
        }
        stats
    }

    fn spawn_reporter(&self, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut snapshots = self.stats.subscribe();
        let events = self.events.clone();
        let period = self.progress_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = *snapshots.borrow_and_update();
                        tracing::debug!(%stats, "Pipeline progress");
                        if let Some(events) = &events {
                            events.send(Event::Progress(stats)).ok();
                        }
                    }
                }
            }
        })
    }
}

struct Producer {
    cancel: CancellationToken,
    push_timeout: Duration,
    stats: Arc<watch::Sender<PipelineStats>>,
    events: Option<broadcast::Sender<Event>>,
}

async fn produce(
    mut records: BoxStream<'static, Record>,
    tx: mpsc::Sender<Record>,
    ctx: Producer,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            record = records.next() => record,
        };
        let Some(record) = next else {
            break;
        };

        // Reserve a slot first so the record is never lost to a timed-out push
        let permit = loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    tracing::info!(post_id = %record.id, "Cancelled while waiting for queue space");
                    return;
                }
                reserved = tokio::time::timeout(ctx.push_timeout, tx.reserve()) => match reserved {
                    Ok(Ok(permit)) => break permit,
                    Ok(Err(_)) => {
                        tracing::warn!(post_id = %record.id, "Queue closed, stopping producer");
                        return;
                    }
                    Err(_) => {
                        tracing::warn!(
                            post_id = %record.id,
                            timeout_secs = ctx.push_timeout.as_secs_f64(),
                            "Queue full, still waiting to enqueue"
                        );
                    }
                },
            }
        };

        let (id, files) = (record.id.clone(), record.files.len());
        permit.send(record);
        ctx.stats.send_modify(|stats| stats.extracted += 1);
        if let Some(events) = &ctx.events {
            events.send(Event::RecordExtracted { id, files }).ok();
        }
    }
    tracing::debug!("Producer finished");
}

struct Worker {
    handler: Arc<dyn RecordHandler>,
    cancel: CancellationToken,
    poll_interval: Duration,
    stats: Arc<watch::Sender<PipelineStats>>,
    processed: Arc<AtomicU64>,
}

async fn consume(worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<Record>>>, ctx: Worker) {
    loop {
        if ctx.cancel.is_cancelled() {
            tracing::debug!(worker_id, "Worker stopping on cancellation");
            break;
        }

        let next = {
            let mut rx = rx.lock().await;
            tokio::time::timeout(ctx.poll_interval, rx.recv()).await
        };
        let record = match next {
            Ok(Some(record)) => record,
            Ok(None) => break,
            // Empty queue: re-check for cancellation
            Err(_) => continue,
        };

        let result = ctx.handler.handle(record, &ctx.cancel).await;
        ctx.stats.send_modify(|stats| {
            stats.downloaded += result.downloaded as u64;
            stats.skipped += result.skipped as u64;
            stats.failed += result.failed.len() as u64;
        });
        ctx.processed.fetch_add(1, Ordering::SeqCst);
    }
    tracing::debug!(worker_id, "Worker exited");
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
