//! Job status records and the in-memory subscriber fanout (spec §4.5
//! "status publication", spec §5 "in-memory status subscribers").

use crate::money::Amount;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Leased,
    Submitted,
    Confirmed,
    Failed,
    RolledBack,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Confirmed | JobState::Failed | JobState::RolledBack
        )
    }
}

/// A status record written on every transition (spec §4.5). Monotonic per
/// `job_id`: once a terminal status is written, nothing overwrites it (spec §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub status: JobState,
    pub attempt: u32,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub error: Option<String>,
    pub debited_amount: Option<Amount>,
}

/// Fanout of `job_id -> subscriber channels` (spec §5). Publish is
/// non-blocking: a lagging subscriber drops messages rather than stalling
/// the publisher, matching the "drop on full buffer" contract.
#[derive(Debug, Default)]
pub struct StatusBus {
    channels: Mutex<HashMap<String, broadcast::Sender<JobStatus>>>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<JobStatus> {
        let mut channels = self.channels.lock().expect("status bus mutex poisoned");
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(32).0)
            .subscribe()
    }

    /// Publishes `status` to any subscribers for its `job_id`. A send error
    /// just means nobody is listening, which is expected and not a fault.
    pub fn publish(&self, status: &JobStatus) {
        let channels = self.channels.lock().expect("status bus mutex poisoned");
        if let Some(sender) = channels.get(&status.job_id) {
            let _ = sender.send(status.clone());
        }
    }

    /// Drops the channel for a terminal job once no subscribers remain, to
    /// keep the map from growing unboundedly over the process lifetime.
    pub fn retire(&self, job_id: &str) {
        let mut channels = self.channels.lock().expect("status bus mutex poisoned");
        if let Some(sender) = channels.get(job_id) {
            if sender.receiver_count() == 0 {
                channels.remove(job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_active_subscriber() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe("job-1");
        bus.publish(&JobStatus {
            job_id: "job-1".into(),
            status: JobState::Confirmed,
            attempt: 0,
            tx_hash: Some("0xabc".into()),
            block_number: Some(1),
            gas_used: Some(21_000),
            error: None,
            debited_amount: None,
        });
        let received = rx.try_recv().unwrap();
        assert_eq!(received.status, JobState::Confirmed);
    }

    #[test]
    fn publish_with_no_subscriber_does_not_panic() {
        let bus = StatusBus::new();
        bus.publish(&JobStatus {
            job_id: "job-none".into(),
            status: JobState::Queued,
            attempt: 0,
            tx_hash: None,
            block_number: None,
            gas_used: None,
            error: None,
            debited_amount: None,
        });
    }

    #[test]
    fn is_terminal_classifies_correctly() {
        assert!(JobState::Confirmed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::RolledBack.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Leased.is_terminal());
        assert!(!JobState::Submitted.is_terminal());
    }
}
