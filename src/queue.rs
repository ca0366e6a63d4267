//! Priority queue and backlog (spec §4.2, component C2).
//!
//! The kv store is the source of truth; this module only encodes the
//! priority-class list keys and the backoff "not before" skip-on-pop logic
//! on top of the `lpush`/`rpop` FIFO primitive from [`crate::kv`]. An
//! in-memory mirror is deliberately not kept — every call reads through to
//! the store, matching spec §4.2's "durable... in-memory mirror is a soft
//! cache" by simply not building the cache at all until profiling calls for
//! one.

use crate::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Priority classes, ordered `Urgent > High > Normal > Low` (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub const ALL_HIGH_TO_LOW: [Priority; 4] =
        [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low];

    fn queue_key(&self) -> &'static str {
        match self {
            Priority::Urgent => "queue:urgent",
            Priority::High => "queue:high",
            Priority::Normal => "queue:normal",
            Priority::Low => "queue:low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
    job_id: String,
    not_before_millis: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue_full")]
    QueueFull,
}

/// C2: the durable, priority-ordered backlog of admitted jobs.
#[derive(Debug)]
pub struct PriorityQueue<S: KvStore> {
    kv: Arc<S>,
    max_queue_size: u64,
}

impl<S: KvStore> PriorityQueue<S> {
    pub fn new(kv: Arc<S>, max_queue_size: u64) -> Self {
        Self { kv, max_queue_size }
    }

    /// Total items across every priority class, including those not yet
    /// eligible to pop because of a pending backoff delay.
    pub async fn visible_len(&self) -> u64 {
        let mut total = 0;
        for priority in Priority::ALL_HIGH_TO_LOW {
            total += self.kv.llen(priority.queue_key()).await;
        }
        total
    }

    pub async fn size_by_priority(&self) -> Vec<(Priority, u64)> {
        let mut sizes = Vec::with_capacity(4);
        for priority in Priority::ALL_HIGH_TO_LOW {
            sizes.push((priority, self.kv.llen(priority.queue_key()).await));
        }
        sizes
    }

    /// Enqueues `job_id` under `priority`, with no delay. Used both for
    /// fresh admission (spec §4.1 step 7) and, with a non-zero `delay`, for
    /// backoff re-entry (spec §4.2) — both push via the same `lpush`
    /// primitive, which is what makes re-entry "at the tail" well-defined.
    pub async fn enqueue(
        &self,
        job_id: &str,
        priority: Priority,
        now_millis: u64,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        if self.visible_len().await >= self.max_queue_size {
            return Err(QueueError::QueueFull);
        }
        let not_before_millis = now_millis + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        let entry = QueueEntry {
            job_id: job_id.to_string(),
            not_before_millis,
        };
        let encoded = serde_json::to_string(&entry).expect("queue entry always serializable");
        self.kv.lpush(priority.queue_key(), encoded).await;
        Ok(())
    }

    /// Pops the next eligible job, honoring strict class precedence and
    /// skipping entries whose backoff delay has not elapsed yet. Skipped
    /// entries are pushed back to the tail of their own class so ordering
    /// among the remaining eligible entries is preserved.
    pub async fn pop(&self, now_millis: u64) -> Option<String> {
        for priority in Priority::ALL_HIGH_TO_LOW {
            if let Some(job_id) = self.pop_from_class(priority, now_millis).await {
                return Some(job_id);
            }
        }
        None
    }

    async fn pop_from_class(&self, priority: Priority, now_millis: u64) -> Option<String> {
        let key = priority.queue_key();
        let len = self.kv.llen(key).await;
        let mut deferred = Vec::new();
        let mut found = None;
        for _ in 0..len {
            let raw = self.kv.rpop(key).await?;
            let entry: QueueEntry =
                serde_json::from_str(&raw).expect("queue entries are always well-formed");
            if entry.not_before_millis <= now_millis {
                found = Some(entry.job_id);
                break;
            }
            deferred.push(raw);
        }
        for raw in deferred {
            self.kv.lpush(key, raw).await;
        }
        found
    }
}
