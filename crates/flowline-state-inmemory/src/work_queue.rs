//! Work queue and workers
//!
//! Units of work are kept in FIFO order. They are either drained
//! deterministically with [`drain`] or run by a [`WorkerPool`] of tokio
//! tasks. Work on one flow node never runs concurrently: every job holds
//! the lock of its flow node while it is handled.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use flowline_core::application::work::{ConnectorExecutor, ConnectorRequest, WorkDispatcher, WorkItem};
use flowline_core::{CoreError, CoreResult, EngineConfig, FlowNodeExecutor, FlowNodeInstanceId};

use crate::connectors::ConnectorRegistry;
use crate::error::InMemoryError;

/// A queued job
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// A unit of work for the flow node executor
    Work(WorkItem),
    /// A connector to run before reporting back to its flow node
    Connector(ConnectorRequest),
}

impl Job {
    /// Flow node the job is serialized on
    pub fn key(&self) -> &FlowNodeInstanceId {
        match self {
            Job::Work(work) => work.key(),
            Job::Connector(request) => &request.flow_node_instance_id,
        }
    }
}

/// In-memory FIFO of jobs
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    jobs: Mutex<VecDeque<Job>>,
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
    available: Notify,
}

impl InMemoryWorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, job: Job) -> CoreResult<()> {
        trace!(key = %job.key(), "job queued");
        self.jobs
            .lock()
            .map_err(|_| CoreError::StateStore("work queue poisoned".to_string()))?
            .push_back(job);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        Ok(())
    }

    /// Take the next job; it counts as in flight until [`finish`](Self::finish)
    pub fn pop(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock().ok()?;
        let job = jobs.pop_front()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(job)
    }

    /// A popped job was handled
    pub fn finish(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Jobs waiting to be taken
    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Whether no job is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether no job is waiting or being handled
    pub fn is_idle(&self) -> bool {
        match self.jobs.lock() {
            Ok(jobs) => jobs.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0,
            Err(_) => false,
        }
    }

    /// Jobs queued since the queue was created
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    async fn wait_for_job(&self, idle_poll: Duration) {
        let _ = tokio::time::timeout(idle_poll, self.available.notified()).await;
    }
}

#[async_trait]
impl WorkDispatcher for InMemoryWorkQueue {
    async fn dispatch(&self, work: WorkItem) -> Result<(), CoreError> {
        self.push(Job::Work(work))
    }
}

#[async_trait]
impl ConnectorExecutor for InMemoryWorkQueue {
    async fn execute_connector_in_work(&self, request: ConnectorRequest) -> Result<(), CoreError> {
        self.push(Job::Connector(request))
    }
}

/// Handles jobs: per flow node serialization and retries of retryable store errors
#[derive(Debug)]
pub struct JobRunner {
    executor: Arc<FlowNodeExecutor>,
    connectors: Arc<ConnectorRegistry>,
    max_retries: u32,
    backoff: Duration,
    locks: DashMap<FlowNodeInstanceId, Arc<tokio::sync::Mutex<()>>>,
}

impl JobRunner {
    /// Create a runner
    pub fn new(executor: Arc<FlowNodeExecutor>, connectors: Arc<ConnectorRegistry>, config: &EngineConfig) -> Self {
        Self {
            executor,
            connectors,
            max_retries: config.max_work_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            locks: DashMap::new(),
        }
    }

    /// Handle one job
    pub async fn run(&self, job: Job) {
        let key = job.key().clone();
        match job {
            Job::Work(work) => {
                let lock = self.lock_of(&key);
                let guard = lock.lock_owned().await;
                self.with_retries(&key, || self.executor.handle(work.clone())).await;
                drop(guard);
            }
            Job::Connector(request) => {
                // the connector itself runs outside of the flow node lock
                let result = self.connectors.execute(&request).await;
                if let Err(err) = &result {
                    warn!(connector = %request.definition.name, flow_node = %key, error = %err, "connector failed");
                }
                let lock = self.lock_of(&key);
                let guard = lock.lock_owned().await;
                self.with_retries(&key, || self.executor.connector_finished(&request, result.clone()))
                    .await;
                drop(guard);
            }
        }
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn lock_of(&self, key: &FlowNodeInstanceId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    async fn with_retries<F, Fut>(&self, key: &FlowNodeInstanceId, mut attempt: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<()>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Ok(()) => return,
                Err(err) if err.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    warn!(flow_node = %key, error = %err, retries, "retrying unit of work");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => {
                    error!(flow_node = %key, error = %err, "unit of work dropped");
                    return;
                }
            }
        }
    }
}

/// Run queued jobs one at a time until the queue is empty.
///
/// Returns the number of jobs handled, or an error once `limit` jobs were
/// handled and the queue is still not empty.
pub async fn drain(queue: &InMemoryWorkQueue, runner: &JobRunner, limit: usize) -> CoreResult<usize> {
    let mut handled = 0;
    while let Some(job) = queue.pop() {
        runner.run(job).await;
        queue.finish();
        handled += 1;
        if handled >= limit && !queue.is_empty() {
            return Err(InMemoryError::QueueStalled(handled).into());
        }
    }
    debug!(handled, "work queue drained");
    Ok(handled)
}

/// Tokio workers draining a queue until shut down
#[derive(Debug)]
pub struct WorkerPool {
    queue: Arc<InMemoryWorkQueue>,
    shutdown: Arc<AtomicBool>,
    idle_poll: Duration,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers
    pub fn start(queue: Arc<InMemoryWorkQueue>, runner: Arc<JobRunner>, config: &EngineConfig) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let idle_poll = Duration::from_millis(config.idle_poll_ms.max(1));
        let workers = (0..config.worker_count)
            .map(|worker| {
                let queue = queue.clone();
                let runner = runner.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(worker, "worker started");
                    while !shutdown.load(Ordering::SeqCst) {
                        match queue.pop() {
                            Some(job) => {
                                runner.run(job).await;
                                queue.finish();
                            }
                            None => queue.wait_for_job(idle_poll).await,
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self {
            queue,
            shutdown,
            idle_poll,
            workers,
        }
    }

    /// Wait until no job is queued or running; false when `limit` elapsed first
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let waiting = async {
            while !self.queue.is_idle() {
                tokio::time::sleep(self.idle_poll).await;
            }
        };
        tokio::time::timeout(limit, waiting).await.is_ok()
    }

    /// Stop the workers once their current job is done
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in futures::future::join_all(self.workers).await {
            if let Err(err) = worker {
                error!(error = %err, "worker panicked");
            }
        }
    }
}
