//! Shared priority queue feeding the worker pool.
//!
//! Jobs are ordered by priority (higher first), then submission
//! sequence (first-submitted-first-served). A job whose source has no
//! free concurrency permit is parked on a per-source wait list instead
//! of blocking the worker; it re-enters the heap when a call for that
//! source completes.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::{BatchShared, QueryJob};
use crate::connector::SourceId;

pub(crate) struct QueuedJob {
    pub job: QueryJob,
    /// Slot in the batch's outcome vector.
    pub index: usize,
    pub batch: Arc<BatchShared>,
    /// Cache TTL resolved for this job's source at submission.
    pub ttl: Duration,
    pub seq: u64,
}

impl QueuedJob {
    fn rank(&self) -> (i32, std::cmp::Reverse<u64>) {
        (self.job.priority, std::cmp::Reverse(self.seq))
    }

    pub fn expired(&self) -> bool {
        self.batch.cancel.is_cancelled()
            || self.job.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}
impl Eq for QueuedJob {}
impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank().cmp(&other.rank())
    }
}

/// Per-source in-flight ceilings, one semaphore per source, created
/// lazily with the configured or default ceiling.
pub(crate) struct SourceLimits {
    default_ceiling: usize,
    ceilings: HashMap<SourceId, usize>,
    semaphores: RwLock<HashMap<SourceId, Arc<Semaphore>>>,
}

impl SourceLimits {
    pub fn new(default_ceiling: usize, ceilings: HashMap<SourceId, usize>) -> Self {
        Self {
            default_ceiling: default_ceiling.max(1),
            ceilings,
            semaphores: RwLock::new(HashMap::new()),
        }
    }

    fn semaphore(&self, source: &SourceId) -> Arc<Semaphore> {
        if let Some(sem) = self.semaphores.read().unwrap().get(source) {
            return sem.clone();
        }
        let ceiling = self
            .ceilings
            .get(source)
            .copied()
            .unwrap_or(self.default_ceiling)
            .max(1);
        self.semaphores
            .write()
            .unwrap()
            .entry(source.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(ceiling)))
            .clone()
    }

    pub fn try_acquire(&self, source: &SourceId) -> Option<OwnedSemaphorePermit> {
        self.semaphore(source).try_acquire_owned().ok()
    }
}

pub(crate) enum Popped {
    /// Job plus its source concurrency permit.
    Ready(QueuedJob, OwnedSemaphorePermit),
    /// Batch cancelled or deadline elapsed before dispatch.
    Expired(QueuedJob),
}

struct QueueInner {
    heap: BinaryHeap<QueuedJob>,
    parked: HashMap<SourceId, VecDeque<QueuedJob>>,
}

pub(crate) struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                parked: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, job: QueuedJob) {
        self.inner.lock().unwrap().heap.push(job);
        self.notify.notify_one();
    }

    /// Jobs waiting for a worker, parked ones included.
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.heap.len() + inner.parked.values().map(VecDeque::len).sum::<usize>()
    }

    /// Take the highest-priority runnable job, parking any whose source
    /// is at its ceiling. Waits when nothing is runnable.
    pub async fn pop(&self, limits: &SourceLimits) -> Popped {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                while let Some(job) = inner.heap.pop() {
                    if job.expired() {
                        if !inner.heap.is_empty() {
                            self.notify.notify_one();
                        }
                        return Popped::Expired(job);
                    }
                    match limits.try_acquire(&job.job.source) {
                        Some(permit) => {
                            if !inner.heap.is_empty() {
                                self.notify.notify_one();
                            }
                            return Popped::Ready(job, permit);
                        }
                        None => {
                            inner
                                .parked
                                .entry(job.job.source.clone())
                                .or_default()
                                .push_back(job);
                        }
                    }
                }
            }
            notified.await;
        }
    }

    /// A permit for `source` was released; give one parked job its turn.
    pub fn unpark(&self, source: &SourceId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(waiting) = inner.parked.get_mut(source) else {
            return;
        };
        let job = waiting.pop_front();
        if waiting.is_empty() {
            inner.parked.remove(source);
        }
        if let Some(job) = job {
            inner.heap.push(job);
            drop(inner);
            self.notify.notify_one();
        }
    }
}
