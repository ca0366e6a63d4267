//! Scheduler / worker pool (spec §4.3, component C3): bounded-concurrency
//! dispatch, retry, backoff, and cooperative cancellation.
//!
//! Grounded in the teacher's `sig_down.rs` cancellation-token-plus-tracker
//! pattern, generalized from "shut the HTTP server down" to "drain every
//! worker and release every wallet lease before exiting".

use crate::job::{Job, JobRecord};
use crate::kv::KvStore;
use crate::lifecycle::{JobOutcome, LifecycleManager};
use crate::queue::PriorityQueue;
use crate::wallet::{LeaseOutcome, SelectionPolicy, WalletPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub idle_poll_interval: Duration,
    pub selection_policy: SelectionPolicy,
}

/// C3: runs `max_concurrent` workers pulling from C2, leasing from C4, and
/// delegating execution to C5.
pub struct Scheduler<S: KvStore> {
    queue: Arc<PriorityQueue<S>>,
    wallets: Arc<WalletPool>,
    lifecycle: Arc<LifecycleManager<S>>,
    job_store: Arc<JobStore<S>>,
    config: SchedulerConfig,
}

/// In-process job cache keyed by `job_id`, backed by the kv-persisted
/// `job:{job_id}` record (spec §6, §9): every insert/update mirrors the
/// `Job` to kv so a restart can reconcile rollback points against it, even
/// though the live `Job` itself (carrying the signed intent) is only ever
/// reconstructed from this in-process map.
pub struct JobStore<S: KvStore> {
    kv: Arc<S>,
    jobs: Mutex<HashMap<String, Job>>,
}

impl<S: KvStore> JobStore<S> {
    pub fn new(kv: Arc<S>) -> Self {
        Self {
            kv,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, job: Job) {
        self.persist(&job).await;
        self.jobs.lock().await.insert(job.job_id.clone(), job);
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    async fn update(&self, job: Job) {
        self.persist(&job).await;
        self.jobs.lock().await.insert(job.job_id.clone(), job);
    }

    async fn persist(&self, job: &Job) {
        let record = JobRecord::from(job);
        self.kv
            .set(
                &format!("job:{}", job.job_id),
                serde_json::to_string(&record).expect("JobRecord always serializes"),
                None,
            )
            .await;
    }
}

impl<S: KvStore + 'static> Scheduler<S> {
    pub fn new(
        queue: Arc<PriorityQueue<S>>,
        wallets: Arc<WalletPool>,
        lifecycle: Arc<LifecycleManager<S>>,
        job_store: Arc<JobStore<S>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            wallets,
            lifecycle,
            job_store,
            config,
        }
    }

    /// Spawns `max_concurrent` worker loops, each observing `cancel` at
    /// every suspension point (spec §4.3 "concurrency shape"). Returns when
    /// every worker has exited, which happens only after `cancel` fires and
    /// all in-flight leases are released.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(self.config.max_concurrent);
        for worker_id in 0..self.config.max_concurrent {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[instrument(skip(self, cancel), fields(worker_id))]
    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now = now_millis();
            let popped = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job_id = self.queue.pop(now) => job_id,
            };
            let Some(job_id) = popped else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                }
                continue;
            };
            self.process_job(worker_id, &job_id, &cancel).await;
        }
        info!(worker_id, "worker exited");
    }

    async fn process_job(&self, worker_id: usize, job_id: &str, cancel: &CancellationToken) {
        let Some(mut job) = self.job_store.get(job_id).await else {
            warn!(job_id, "popped job_id with no matching record");
            return;
        };

        let lease = tokio::select! {
            _ = cancel.cancelled() => {
                self.requeue_unleased(job).await;
                return;
            }
            lease = self.acquire_with_wait(job_id) => lease,
        };

        info!(worker_id, job_id, "leased wallet, running lifecycle");
        let outcome = self.lifecycle.run(&mut job, &lease).await;

        let lease_outcome = match &outcome {
            JobOutcome::Confirmed { .. } => LeaseOutcome::Success,
            _ => LeaseOutcome::Failure,
        };
        lease.release(lease_outcome).await;

        match outcome {
            JobOutcome::Confirmed { .. } => {
                self.job_store.update(job).await;
            }
            JobOutcome::Retry { .. } => {
                job.attempt += 1;
                let delay = backoff_delay(job.attempt, self.config.base_retry_delay, self.config.max_retry_delay);
                let priority = job.priority;
                self.job_store.update(job.clone()).await;
                if self
                    .queue
                    .enqueue(job_id, priority, now_millis(), Some(delay))
                    .await
                    .is_err()
                {
                    warn!(job_id, "failed to re-enqueue after retry: queue full");
                }
            }
            JobOutcome::Failed { .. } => {
                self.job_store.update(job).await;
            }
        }
    }

    async fn acquire_with_wait(&self, job_id: &str) -> crate::wallet::WalletLease {
        loop {
            if let Some(lease) = self.wallets.acquire(job_id, self.config.selection_policy).await {
                return lease;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// On shutdown before a lease was acquired, the job simply returns to
    /// `queued` at its original priority (spec §4.3 "cancellation").
    async fn requeue_unleased(&self, job: Job) {
        let priority = job.priority;
        let job_id = job.job_id.clone();
        self.job_store.update(job).await;
        let _ = self.queue.enqueue(&job_id, priority, now_millis(), None).await;
    }
}

/// `base_delay · 2^(attempt-1)`, capped at `max_delay` (spec §4.2 backoff re-entry).
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base.saturating_mul(multiplier as u32).min(max)
}

fn now_millis() -> u64 {
    crate::timestamp::UnixMillis::try_now()
        .map(|t| t.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(5));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(10));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(20));
        assert_eq!(backoff_delay(10, base, max), max);
    }

    #[tokio::test]
    async fn job_store_round_trips() {
        use crate::kv::InMemoryKvStore;
        use crate::queue::Priority;
        let kv = Arc::new(InMemoryKvStore::new());
        let store = JobStore::new(kv.clone());
        let intent = crate::test_support::signed_intent("C", "N1", "0.25", 1_000);
        let job = Job::new("job-1".into(), intent, Priority::Normal, 1_000);
        store.insert(job.clone()).await;
        let fetched = store.get("job-1").await.unwrap();
        assert_eq!(fetched.job_id, "job-1");
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn job_store_insert_persists_kv_record() {
        use crate::kv::InMemoryKvStore;
        use crate::queue::Priority;
        let kv = Arc::new(InMemoryKvStore::new());
        let store = JobStore::new(kv.clone());
        let intent = crate::test_support::signed_intent("C", "N1", "0.25", 1_000);
        let job = Job::new("job-1".into(), intent, Priority::Normal, 1_000);
        store.insert(job).await;
        assert!(kv.get("job:job-1").await.is_some());
    }
}
