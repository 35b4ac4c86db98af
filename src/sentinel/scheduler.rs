//! Job queue
//!
//! The core depends on two operations only: `enqueue` and
//! `schedule_periodic`. `TokioScheduler` runs jobs on an in-process pool
//! bounded by a semaphore.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use super::drain::{DrainOrchestrator, DrainOutcome};
use super::error::{DrainError, SchedulerError};
use super::notifier::Notifier;
use super::reconciler::BalanceReconciler;
use super::shutdown::ShutdownSignal;

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Drain { symbol: String, address: String },
    RefreshBalances,
    /// Submitted by the payout side once a withdrawal is broadcast; nothing
    /// in the scanner produces it
    PayoutNotify { symbol: String, payload: Value },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Drain { .. } => "drain",
            Job::RefreshBalances => "refresh_balances",
            Job::PayoutNotify { .. } => "payout_notify",
        }
    }
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), SchedulerError>;

    /// Enqueue `job` every `every` until shutdown
    async fn schedule_periodic(&self, job: Job, every: Duration) -> Result<(), SchedulerError>;
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job);
}

pub struct TokioScheduler {
    tx: mpsc::Sender<Job>,
    shutdown: Arc<ShutdownSignal>,
}

impl TokioScheduler {
    pub fn new(capacity: usize, shutdown: Arc<ShutdownSignal>) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, shutdown }, rx)
    }

    /// Run queued jobs with at most `concurrency` in flight. Returns after
    /// shutdown once in-flight jobs have finished.
    pub async fn run(
        mut rx: mpsc::Receiver<Job>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        shutdown: Arc<ShutdownSignal>,
    ) {
        let concurrency = concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        info!("Job pool started with {} workers", concurrency);

        loop {
            let job = tokio::select! {
                job = rx.recv() => job,
                _ = shutdown.wait() => None,
            };
            let Some(job) = job else { break };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                debug!("Running job {}", job.name());
                handler.handle(job).await;
                drop(permit);
            });
        }

        // Wait for in-flight jobs
        if permits.acquire_many(concurrency as u32).await.is_err() {
            warn!("Job pool semaphore closed while draining");
        }
        info!("Job pool stopped");
    }
}

#[async_trait]
impl JobScheduler for TokioScheduler {
    async fn enqueue(&self, job: Job) -> Result<(), SchedulerError> {
        self.tx.send(job).await.map_err(|_| SchedulerError::Closed)
    }

    async fn schedule_periodic(&self, job: Job, every: Duration) -> Result<(), SchedulerError> {
        if self.tx.is_closed() {
            return Err(SchedulerError::Closed);
        }
        info!("Scheduling {} every {:?}", job.name(), every);

        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            while shutdown.sleep(every).await {
                if tx.send(job.clone()).await.is_err() {
                    break;
                }
            }
            debug!("Periodic {} stopped", job.name());
        });
        Ok(())
    }
}

/// Collects jobs instead of running them
#[derive(Default)]
pub struct RecordingScheduler {
    jobs: Mutex<Vec<Job>>,
    periodic: Mutex<Vec<(Job, Duration)>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().await.clone()
    }

    pub async fn periodic(&self) -> Vec<(Job, Duration)> {
        self.periodic.lock().await.clone()
    }

    /// Queued drain requests as `(symbol, address)`
    pub async fn drains(&self) -> Vec<(String, String)> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter_map(|job| match job {
                Job::Drain { symbol, address } => Some((symbol.clone(), address.clone())),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl JobScheduler for RecordingScheduler {
    async fn enqueue(&self, job: Job) -> Result<(), SchedulerError> {
        self.jobs.lock().await.push(job);
        Ok(())
    }

    async fn schedule_periodic(&self, job: Job, every: Duration) -> Result<(), SchedulerError> {
        self.periodic.lock().await.push((job, every));
        Ok(())
    }
}

/// Dispatches jobs to the component that owns them
pub struct JobRouter {
    drains: Arc<DrainOrchestrator>,
    reconciler: Arc<BalanceReconciler>,
    notifier: Arc<Notifier>,
}

impl JobRouter {
    pub fn new(
        drains: Arc<DrainOrchestrator>,
        reconciler: Arc<BalanceReconciler>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            drains,
            reconciler,
            notifier,
        }
    }
}

#[async_trait]
impl JobHandler for JobRouter {
    async fn handle(&self, job: Job) {
        match job {
            Job::Drain { symbol, address } => match self.drains.drain(&symbol, &address).await {
                Ok(DrainOutcome::Skipped) => debug!("Drain {} {} skipped", symbol, address),
                Ok(_) => {}
                Err(DrainError::UnsupportedSymbol(s)) => {
                    error!("Drain for {} dropped: symbol not configured", s)
                }
                Err(e) => warn!("Drain {} {} failed: {}", symbol, address, e),
            },
            Job::RefreshBalances => match self.reconciler.refresh().await {
                Ok(report) => info!(
                    "Balance refresh: {} addresses, {} drains requested",
                    report.addresses, report.drains_requested
                ),
                Err(e) => error!("Balance refresh failed: {}", e),
            },
            Job::PayoutNotify { symbol, payload } => {
                if let Err(e) = self.notifier.payoutnotify(&symbol, &payload).await {
                    warn!("payoutnotify {} abandoned: {}", symbol, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        running: AtomicUsize,
        peak: AtomicUsize,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: Job) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency_and_drains_on_shutdown() {
        let shutdown = Arc::new(ShutdownSignal::new());
        let (scheduler, rx) = TokioScheduler::new(64, shutdown.clone());
        let handler = Arc::new(CountingHandler {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        });

        for i in 0..10 {
            scheduler
                .enqueue(Job::Drain {
                    symbol: "ETH".to_string(),
                    address: format!("0x{:040x}", i),
                })
                .await
                .unwrap();
        }

        let pool = tokio::spawn(TokioScheduler::run(
            rx,
            handler.clone(),
            3,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.request_shutdown();
        tokio::time::timeout(Duration::from_secs(5), pool)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handler.handled.load(Ordering::SeqCst), 10);
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_periodic_job_reenqueued() {
        let shutdown = Arc::new(ShutdownSignal::new());
        let (scheduler, mut rx) = TokioScheduler::new(64, shutdown.clone());

        scheduler
            .schedule_periodic(Job::RefreshBalances, Duration::from_millis(10))
            .await
            .unwrap();

        for _ in 0..2 {
            let job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap();
            assert_eq!(job, Some(Job::RefreshBalances));
        }
        shutdown.request_shutdown();
    }

    #[tokio::test]
    async fn test_enqueue_after_receiver_dropped_fails() {
        let (scheduler, rx) = TokioScheduler::new(1, Arc::new(ShutdownSignal::new()));
        drop(rx);
        assert!(matches!(
            scheduler.enqueue(Job::RefreshBalances).await,
            Err(SchedulerError::Closed)
        ));
    }
}
