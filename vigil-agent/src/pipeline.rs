//! Polling and reporting pipeline
//!
//! The poll loop pushes one batch per poll interval into a bounded channel and
//! blocks when it is full. The report loop wakes every report interval and
//! spawns up to `rate_limit` workers; each takes at most one batch and sends
//! it. A semaphore keeps the number of in-flight sends at `rate_limit` across
//! ticks. On shutdown the poll loop closes the channel and the report loop
//! drains whatever is still queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_common::Batch;

use crate::collector::Collector;
use crate::sender::MetricSender;

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Batch>>>;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub rate_limit: usize,
}

impl PipelineConfig {
    /// One report cycle worth of polls, plus one
    pub fn channel_capacity(&self) -> usize {
        let poll = self.poll_interval.as_millis().max(1);
        (self.report_interval.as_millis() / poll) as usize + 1
    }
}

pub struct Pipeline {
    collector: Collector,
    sender: Arc<dyn MetricSender>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(collector: Collector, sender: Arc<dyn MetricSender>, config: PipelineConfig) -> Self {
        Self {
            collector,
            sender,
            config,
        }
    }

    /// Run both loops until `shutdown` fires and every queued batch is sent.
    ///
    /// `abort` cancels sends that are still in flight.
    pub async fn run(self, shutdown: CancellationToken, abort: CancellationToken) {
        let capacity = self.config.channel_capacity();
        let rate_limit = self.config.rate_limit.max(1);
        info!(
            "Starting pipeline: poll every {:?}, report every {:?}, {} workers, {} queued batches max",
            self.config.poll_interval, self.config.report_interval, rate_limit, capacity
        );

        let (tx, rx) = mpsc::channel(capacity);
        let reporter = Reporter {
            rx: Arc::new(Mutex::new(rx)),
            sender: self.sender,
            permits: Arc::new(Semaphore::new(rate_limit)),
            rate_limit,
            abort,
        };

        tokio::join!(
            poll_loop(self.collector, tx, self.config.poll_interval, shutdown.clone()),
            reporter.run(self.config.report_interval, shutdown),
        );
        info!("Pipeline stopped");
    }
}

/// Poll every `period` until `shutdown`; dropping `tx` on return closes the
/// channel.
pub(crate) async fn poll_loop(
    mut collector: Collector,
    tx: mpsc::Sender<Batch>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = collector.poll();
        for e in &result.errors {
            warn!("Metric source failed: {}", e);
        }

        // Blocks while the channel is full
        if tx.send(result.batch).await.is_err() {
            error!("Batch channel closed unexpectedly");
            break;
        }
    }
    debug!("Poll loop stopped after {} polls", collector.poll_count());
}

struct Reporter {
    rx: SharedReceiver,
    sender: Arc<dyn MetricSender>,
    permits: Arc<Semaphore>,
    rate_limit: usize,
    abort: CancellationToken,
}

impl Reporter {
    async fn run(self, period: Duration, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for _ in 0..self.rate_limit {
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    debug!("All {} workers busy", self.rate_limit);
                    break;
                };
                workers.spawn(report_one(
                    self.rx.clone(),
                    self.sender.clone(),
                    self.abort.clone(),
                    permit,
                ));
            }

            while let Some(result) = workers.try_join_next() {
                log_worker_exit(result);
            }
        }

        while let Some(result) = workers.join_next().await {
            log_worker_exit(result);
        }

        info!("Flushing queued batches");
        for _ in 0..self.rate_limit {
            workers.spawn(drain(self.rx.clone(), self.sender.clone(), self.abort.clone()));
        }
        while let Some(result) = workers.join_next().await {
            log_worker_exit(result);
        }
    }
}

fn log_worker_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!("Report worker failed: {}", e);
    }
}

/// Take at most one batch without waiting and send it
async fn report_one(
    rx: SharedReceiver,
    sender: Arc<dyn MetricSender>,
    abort: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let next = rx.lock().await.try_recv();
    match next {
        Ok(batch) => deliver(sender.as_ref(), &batch, &abort).await,
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
    }
}

/// Send batches until the channel is closed and empty
async fn drain(rx: SharedReceiver, sender: Arc<dyn MetricSender>, abort: CancellationToken) {
    loop {
        let next = rx.lock().await.recv().await;
        match next {
            Some(batch) => deliver(sender.as_ref(), &batch, &abort).await,
            None => break,
        }
    }
}

async fn deliver(sender: &dyn MetricSender, batch: &Batch, abort: &CancellationToken) {
    match sender.send(batch, abort).await {
        Ok(()) => debug!("Delivered batch of {} metrics", batch.len()),
        Err(e) => warn!("Dropping batch of {} metrics: {}", batch.len(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SendError, SendResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vigil_common::{Metric, POLL_COUNT_METRIC};

    /// Records batches; each send takes `delay` and may fail
    #[derive(Default)]
    struct MockSender {
        delay: Duration,
        fail: bool,
        sent: std::sync::Mutex<Vec<Vec<Metric>>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl MetricSender for MockSender {
        async fn send(&self, batch: &[Metric], cancel: &CancellationToken) -> SendResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(SendError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {
                    if self.fail {
                        Err(SendError::Server(500))
                    } else {
                        self.sent.lock().unwrap().push(batch.to_vec());
                        Ok(())
                    }
                }
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl MockSender {
        fn sent(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    fn config(poll: u64, report: u64, rate_limit: usize) -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_secs(poll),
            report_interval: Duration::from_secs(report),
            rate_limit,
        }
    }

    #[test]
    fn test_channel_capacity() {
        assert_eq!(config(2, 10, 3).channel_capacity(), 6);
        assert_eq!(config(3, 10, 3).channel_capacity(), 4);
        assert_eq!(config(10, 2, 3).channel_capacity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_blocks_instead_of_dropping() {
        let capacity = config(1, 4, 1).channel_capacity();
        let (tx, mut rx) = mpsc::channel(capacity);
        let collector = Collector::with_sources(Vec::new());
        let polls = collector.poll_counter();
        let token = CancellationToken::new();

        let poller = tokio::spawn(poll_loop(collector, tx, Duration::from_secs(1), token.clone()));

        // Nobody reads: the loop stalls once the channel is full
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(polls.get(), capacity as u64 + 1);
        assert_eq!(rx.len(), capacity);

        token.cancel();
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        poller.await.unwrap();
        // The batch held while blocked is delivered too
        assert_eq!(received, capacity + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_every_queued_batch() {
        let sender = Arc::new(MockSender::default());
        // Report never fires before shutdown
        let pipeline = Pipeline::new(Collector::with_sources(Vec::new()), sender.clone(), config(1, 1000, 2));
        let shutdown = CancellationToken::new();

        let running = tokio::spawn(pipeline.run(shutdown.clone(), CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(sender.sent(), 0);

        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(sender.sent(), 10);
        for batch in sender.sent.lock().unwrap().iter() {
            assert!(batch.iter().any(|m| m.id == POLL_COUNT_METRIC));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_caps_concurrent_sends() {
        let sender = Arc::new(MockSender {
            delay: Duration::from_secs(7),
            ..Default::default()
        });
        let collector = Collector::with_sources(Vec::new());
        let polls = collector.poll_counter();
        let pipeline = Pipeline::new(collector, sender.clone(), config(1, 2, 3));
        let shutdown = CancellationToken::new();

        let running = tokio::spawn(pipeline.run(shutdown.clone(), CancellationToken::new()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(sender.max_in_flight.load(Ordering::SeqCst), 3);
        // Every poll made it out, the final flush included
        assert_eq!(sender.sent() as u64, polls.get());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sends_are_dropped() {
        let sender = Arc::new(MockSender {
            fail: true,
            ..Default::default()
        });
        let pipeline = Pipeline::new(Collector::with_sources(Vec::new()), sender.clone(), config(1, 2, 2));
        let shutdown = CancellationToken::new();

        let running = tokio::spawn(pipeline.run(shutdown.clone(), CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(9_500)).await;
        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(sender.sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_in_flight_sends() {
        let sender = Arc::new(MockSender {
            delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let pipeline = Pipeline::new(Collector::with_sources(Vec::new()), sender.clone(), config(1, 2, 1));
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();

        let running = tokio::spawn(pipeline.run(shutdown.clone(), abort.clone()));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        shutdown.cancel();
        abort.cancel();
        running.await.unwrap();

        assert_eq!(sender.sent(), 0);
        assert_eq!(sender.in_flight.load(Ordering::SeqCst), 0);
    }
}
