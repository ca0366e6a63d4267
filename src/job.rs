//! The `Job` entity (spec §3) and its persisted-record encoding under
//! `job:{job_id}` (spec §6 "Persisted state layout").

use crate::intent::PaymentIntent;
use crate::queue::Priority;
use crate::status::JobState;
use serde::{Deserialize, Serialize};

/// A work item produced by admission (spec §3 "Job"). Mutable only by C3/C5.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub intent: PaymentIntent,
    pub priority: Priority,
    pub created_at_millis: u64,
    pub attempt: u32,
    pub status: JobState,
    pub assigned_wallet: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(job_id: String, intent: PaymentIntent, priority: Priority, created_at_millis: u64) -> Self {
        Self {
            job_id,
            intent,
            priority,
            created_at_millis,
            attempt: 0,
            status: JobState::Queued,
            assigned_wallet: None,
            tx_hash: None,
            block_number: None,
            gas_used: None,
            last_error: None,
        }
    }

    /// `tx_hash` is set iff `status ∈ {submitted, confirmed}` (spec §3 invariant).
    pub fn has_consistent_tx_hash(&self) -> bool {
        let expects_hash = matches!(self.status, JobState::Submitted | JobState::Confirmed);
        self.tx_hash.is_some() == expects_hash
    }
}

/// The subset of `Job` that survives a (de)serialize round trip through the
/// kv store, keyed by `job:{job_id}` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub client_id: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: String,
    pub priority: Priority,
    pub created_at_millis: u64,
    pub attempt: u32,
    pub status: JobState,
    pub assigned_wallet: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub last_error: Option<String>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        JobRecord {
            job_id: job.job_id.clone(),
            client_id: job.intent.client_id.clone(),
            from_address: format!("{:#x}", job.intent.from_address),
            to_address: format!("{:#x}", job.intent.to_address),
            amount: job.intent.amount.to_string(),
            priority: job.priority,
            created_at_millis: job.created_at_millis,
            attempt: job.attempt,
            status: job.status,
            assigned_wallet: job.assigned_wallet.clone(),
            tx_hash: job.tx_hash.clone(),
            block_number: job.block_number,
            gas_used: job.gas_used,
            last_error: job.last_error.clone(),
        }
    }
}
