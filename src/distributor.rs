//! A fixed-size pool of worker threads draining a bounded task queue.
//!
//! Adapted from the thread pool of The Book
//! <https://doc.rust-lang.org/book/ch20-02-multithreaded.html>, with a result
//! channel, per-task retry, a stop sentinel and a batch timeout.

use crate::error::{BatchCancelled, EtlError, Retryable};
use crate::retry::RetryPolicy;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::thread;
use std::time::Duration;

/// Stops a batch. Once cancelled, a token stays cancelled.
///
/// Anything which commits work on behalf of a batch holds a [CancelToken::guard]
/// while doing so. [CancelToken::cancel] waits for those guards, so once it returns
/// nothing more is committed for the batch, not even by workers still running.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<RwLock<bool>>);

impl CancelToken {
    pub fn cancel(&self) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self) -> Result<(), BatchCancelled> {
        if self.is_cancelled() {
            Err(BatchCancelled)
        } else {
            Ok(())
        }
    }

    /// Hold off cancellation until the guard is dropped. Fails if already cancelled.
    ///
    /// Must not be called again by a thread which already holds a guard.
    pub fn guard(&self) -> Result<RwLockReadGuard<'_, bool>, BatchCancelled> {
        let guard = self.0.read().unwrap_or_else(PoisonError::into_inner);
        if *guard {
            Err(BatchCancelled)
        } else {
            Ok(guard)
        }
    }
}

/// Why a batch was abandoned.
#[derive(thiserror::Error, Debug)]
pub enum DistributeError<E: std::error::Error + 'static> {
    #[error("Task {index} failed: {source}")]
    Task { index: usize, source: E },

    #[error("No results from workers within {waited:?}")]
    Timeout { waited: Duration },

    #[error("A worker thread exited without reporting its result")]
    WorkerLost,
}

impl From<DistributeError<EtlError>> for EtlError {
    fn from(value: DistributeError<EtlError>) -> Self {
        match value {
            DistributeError::Task { source, .. } => source,
            DistributeError::Timeout { waited } => EtlError::BatchTimeout { waited },
            DistributeError::WorkerLost => EtlError::WorkerLost,
        }
    }
}

enum Message<T> {
    Task(usize, T),
    Stop,
}

/// Runs one function over a batch of items on `num_workers` threads.
#[derive(Debug, Clone)]
pub struct WorkDistributor {
    name: &'static str,
    num_workers: usize,
    queue_bound: usize,
    timeout: Duration,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl WorkDistributor {
    pub fn new(
        name: &'static str,
        num_workers: usize,
        queue_bound: usize,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name,
            num_workers: num_workers.max(1),
            queue_bound: queue_bound.max(1),
            timeout,
            retry,
            cancel: CancelToken::default(),
        }
    }

    /// Cancel `cancel` when a batch is abandoned, instead of a private token.
    ///
    /// Tasks which share the token can use it to stop committing.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Call `worker_fn(worker_id, &item)` for every item and return the results in
    /// the order of `items`. Worker ids start at 1.
    ///
    /// Transient failures are retried according to the retry policy. The first task
    /// which still fails, or a wait for results longer than the timeout, abandons the
    /// batch: the cancel token is cancelled and no further tasks are started. After a
    /// failure the pool is wound down before returning. After a timeout, workers
    /// which are still busy are detached.
    pub fn distribute<T, R, E, F>(&self, items: Vec<T>, worker_fn: F) -> Result<Vec<R>, DistributeError<E>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: std::error::Error + Retryable + Send + 'static,
        F: Fn(usize, &T) -> Result<R, E> + Send + Sync + 'static,
    {
        let total = items.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let size = self.num_workers.min(total);
        let (task_tx, task_rx) = mpsc::sync_channel::<Message<T>>(self.queue_bound);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, result_rx) = mpsc::channel::<(usize, Result<R, E>)>();
        let cancelled = self.cancel.clone();
        let worker_fn = Arc::new(worker_fn);

        let workers: Vec<_> = (1..=size)
            .map(|id| {
                Worker {
                    id,
                    pool_name: self.name,
                    receiver: Arc::clone(&task_rx),
                    results: result_tx.clone(),
                    cancelled: cancelled.clone(),
                    retry: self.retry.clone(),
                }
                .spawn(Arc::clone(&worker_fn))
            })
            .collect();
        drop(result_tx);

        let feeder = {
            let cancelled = cancelled.clone();
            thread::spawn(move || {
                for (index, item) in items.into_iter().enumerate() {
                    if cancelled.is_cancelled() || task_tx.send(Message::Task(index, item)).is_err() {
                        break;
                    }
                }
                for _ in 0..size {
                    if task_tx.send(Message::Stop).is_err() {
                        break;
                    }
                }
            })
        };

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut received = 0;
        while received < total {
            match result_rx.recv_timeout(self.timeout) {
                Ok((index, Ok(value))) => {
                    results[index] = Some(value);
                    received += 1;
                }
                Ok((index, Err(source))) => {
                    tracing::error!(
                        pool = self.name,
                        index,
                        error = source.to_string(),
                        "task failed, abandoning batch"
                    );
                    cancelled.cancel();
                    self.wind_down(&result_rx, workers, feeder);
                    return Err(DistributeError::Task { index, source });
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::error!(
                        pool = self.name,
                        waited = ?self.timeout,
                        received,
                        total,
                        "timed out waiting for workers, abandoning batch"
                    );
                    cancelled.cancel();
                    return Err(DistributeError::Timeout {
                        waited: self.timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::error!(pool = self.name, received, total, "all workers exited early");
                    cancelled.cancel();
                    return Err(DistributeError::WorkerLost);
                }
            }
        }
        self.wind_down(&result_rx, workers, feeder);
        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(DistributeError::WorkerLost)
    }

    /// Wait for in-flight tasks to finish and join every thread. Threads which do not
    /// finish within the timeout are detached.
    fn wind_down<R, E>(
        &self,
        results: &mpsc::Receiver<(usize, Result<R, E>)>,
        workers: Vec<thread::JoinHandle<()>>,
        feeder: thread::JoinHandle<()>,
    ) {
        loop {
            match results.recv_timeout(self.timeout) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(pool = self.name, "detaching workers which did not stop");
                    return;
                }
            }
        }
        for handle in workers.into_iter().chain(std::iter::once(feeder)) {
            if handle.join().is_err() {
                tracing::error!(pool = self.name, "a thread panicked");
            }
        }
    }
}

struct Worker<T, R, E> {
    id: usize,
    pool_name: &'static str,
    receiver: Arc<Mutex<mpsc::Receiver<Message<T>>>>,
    results: mpsc::Sender<(usize, Result<R, E>)>,
    cancelled: CancelToken,
    retry: RetryPolicy,
}

impl<T, R, E> Worker<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: std::error::Error + Retryable + Send + 'static,
{
    fn spawn<F>(self, worker_fn: Arc<F>) -> thread::JoinHandle<()>
    where
        F: Fn(usize, &T) -> Result<R, E> + Send + Sync + 'static,
    {
        thread::spawn(move || {
            let Worker {
                id,
                pool_name,
                receiver,
                results,
                cancelled,
                retry,
            } = self;
            tracing::info!("Starting worker {pool_name}/{id}");
            loop {
                let message = match receiver.lock() {
                    Ok(receiver) => receiver.recv(),
                    Err(_) => break,
                };
                match message {
                    Ok(Message::Task(index, item)) => {
                        if cancelled.is_cancelled() {
                            continue;
                        }
                        let result = retry.run(pool_name, |attempt| {
                            if attempt > 0 {
                                tracing::info!(worker = id, index, attempt, "retrying task");
                            }
                            worker_fn(id, &item)
                        });
                        if results.send((index, result)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Stop) | Err(_) => break,
                }
            }
            tracing::info!("Shutting down worker {pool_name}/{id}");
        })
    }
}
