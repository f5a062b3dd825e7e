use crate::blob::BlobStore;
use crate::distributor::CancelToken;
use crate::retry::RetryPolicy;
use crate::run_log::SuccessLog;
use crate::source::CollectionDois;
use crate::types::IdcVersion;
use std::sync::Arc;
use ulid::Ulid;

/// Everything a builder needs to know about the run it is part of.
///
/// Passed explicitly to every builder; there is no process-global state.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Identifies this run in the logs.
    pub run: Ulid,
    /// `0` for the driver thread, `1..=n` for pool workers.
    pub worker: usize,
    pub version: IdcVersion,
    pub previous_version: IdcVersion,
    pub retry: RetryPolicy,
    pub num_workers: usize,
    pub task_queue_bound: usize,
    pub batch_timeout: std::time::Duration,
    pub success_log: Arc<SuccessLog>,
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub prestaging_bucket_prefix: String,
    /// Cancelled when the batch this context works for is abandoned.
    pub cancel: CancelToken,
    /// DOIs of the collection being built.
    pub collection_dois: Arc<CollectionDois>,
}

impl ExecutionContext {
    /// A sequential, in-memory context, mostly useful for tests.
    pub fn new(version: IdcVersion, previous_version: IdcVersion) -> Self {
        Self {
            run: Ulid::new(),
            worker: 0,
            version,
            previous_version,
            retry: RetryPolicy::once(),
            num_workers: 0,
            task_queue_bound: 16,
            batch_timeout: std::time::Duration::from_secs(3600),
            success_log: Arc::new(SuccessLog::in_memory()),
            blob_store: None,
            prestaging_bucket_prefix: String::new(),
            cancel: CancelToken::default(),
            collection_dois: Default::default(),
        }
    }

    /// The same context, seen from pool worker `worker`.
    pub fn for_worker(&self, worker: usize) -> Self {
        Self {
            worker,
            ..self.clone()
        }
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        self.blob_store = Some(store);
        self.prestaging_bucket_prefix = prefix.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_collection_dois(mut self, dois: CollectionDois) -> Self {
        self.collection_dois = Arc::new(dois);
        self
    }

    pub fn with_success_log(mut self, log: Arc<SuccessLog>) -> Self {
        self.success_log = log;
        self
    }
}
