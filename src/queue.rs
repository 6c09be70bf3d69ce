// Job Queue
//
// In-memory FIFO shared by pair discovery (producer) and the worker pool
// (consumers). Admission is deduplicated by job id against both pending and
// in-flight jobs, and failed jobs are re-queued at the tail until their retry
// budget runs out.

use crate::types::Job;
use alloy_primitives::Address;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// What happened to a job handed back through [`JobQueue::fail`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back at the tail; carries the job with its incremented retry count
    Requeued(Job),
    /// Retry budget spent; the job has been dropped
    Exhausted(Job),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: usize,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.queued + self.processing
    }
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<Job>,
    /// id -> job currently owned by a worker
    processing: HashMap<String, Job>,
}

impl Inner {
    fn contains(&self, id: &str) -> bool {
        self.processing.contains_key(id) || self.pending.iter().any(|job| job.id == id)
    }
}

pub struct JobQueue {
    inner: Mutex<Inner>,
    max_retries: u32,
    notify: Notify,
}

impl JobQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_retries,
            notify: Notify::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Append `job` unless a job with the same id is pending or in flight.
    /// Returns true when the job was admitted.
    pub async fn enqueue(&self, job: Job) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.contains(&job.id) {
            debug!("Job {} already queued, ignoring", job.id);
            return false;
        }

        debug!("Queued job {}", job);
        inner.pending.push_back(job);
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Move the head of the queue into the processing set.
    pub async fn dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.lock().await;
        let job = inner.pending.pop_front()?;
        inner.processing.insert(job.id.clone(), job.clone());
        Some(job)
    }

    /// Release a finished job. Returns false if it was not in flight.
    pub async fn complete(&self, id: &str) -> bool {
        self.inner.lock().await.processing.remove(id).is_some()
    }

    /// Release a failed job and re-queue it while it has retries left.
    pub async fn fail(&self, job: Job) -> FailOutcome {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(&job.id);

        if job.retries >= self.max_retries {
            warn!(
                "Job {} exhausted {} retries, dropping",
                job, self.max_retries
            );
            return FailOutcome::Exhausted(job);
        }

        let mut retried = job;
        retried.retries += 1;
        inner.pending.push_back(retried.clone());
        drop(inner);

        self.notify.notify_one();
        FailOutcome::Requeued(retried)
    }

    /// Whether any job of `pair` is pending or in flight
    pub async fn has_pair(&self, pair: &Address) -> bool {
        let inner = self.inner.lock().await;
        inner.pending.iter().any(|job| job.pair == *pair)
            || inner.processing.values().any(|job| job.pair == *pair)
    }

    pub async fn status(&self) -> QueueStatus {
        let inner = self.inner.lock().await;
        QueueStatus {
            queued: inner.pending.len(),
            processing: inner.processing.len(),
        }
    }

    /// Resolves after the next enqueue (or a pending wake-up).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Wake every idle waiter, used on shutdown.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const PAIR: Address = address!("00000000000000000000000000000000000000f1");

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new(3);
        assert!(queue.enqueue(Job::backfill(PAIR, 1, Some(10))).await);
        assert!(queue.enqueue(Job::subscribe(PAIR, 11)).await);

        assert_eq!(queue.dequeue().await.unwrap().from_block, 1);
        assert_eq!(queue.dequeue().await.unwrap().from_block, 11);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_dedup_against_pending_and_processing() {
        let queue = JobQueue::new(3);
        let job = Job::backfill(PAIR, 1, Some(10));

        assert!(queue.enqueue(job.clone()).await);
        assert!(!queue.enqueue(job.clone()).await);

        let taken = queue.dequeue().await.unwrap();
        assert!(!queue.enqueue(job.clone()).await);
        assert_eq!(queue.status().await, QueueStatus { queued: 0, processing: 1 });

        assert!(queue.complete(&taken.id).await);
        assert!(queue.enqueue(job).await);
    }

    #[tokio::test]
    async fn test_has_pair_covers_pending_and_processing() {
        let other = address!("00000000000000000000000000000000000000f2");
        let queue = JobQueue::new(3);
        assert!(!queue.has_pair(&PAIR).await);

        queue.enqueue(Job::backfill(PAIR, 1, Some(10))).await;
        assert!(queue.has_pair(&PAIR).await);
        assert!(!queue.has_pair(&other).await);

        let taken = queue.dequeue().await.unwrap();
        assert!(queue.has_pair(&PAIR).await);

        queue.complete(&taken.id).await;
        assert!(!queue.has_pair(&PAIR).await);
    }

    #[tokio::test]
    async fn test_fail_requeues_at_tail_with_retry_count() {
        let queue = JobQueue::new(3);
        queue.enqueue(Job::backfill(PAIR, 1, Some(10))).await;
        queue.enqueue(Job::subscribe(PAIR, 11)).await;

        let first = queue.dequeue().await.unwrap();
        match queue.fail(first).await {
            FailOutcome::Requeued(job) => assert_eq!(job.retries, 1),
            other => panic!("expected requeue, got {other:?}"),
        }

        assert_eq!(queue.dequeue().await.unwrap().from_block, 11);
        assert_eq!(queue.dequeue().await.unwrap().retries, 1);
    }

    #[tokio::test]
    async fn test_always_failing_job_retried_exactly_max_times() {
        let queue = JobQueue::new(3);
        queue.enqueue(Job::backfill(PAIR, 1, Some(10))).await;

        let mut attempts = 0;
        while let Some(job) = queue.dequeue().await {
            attempts += 1;
            if let FailOutcome::Exhausted(job) = queue.fail(job).await {
                assert_eq!(job.retries, 3);
            }
        }

        assert_eq!(attempts, 4);
        assert_eq!(queue.status().await.total(), 0);
    }
}
