//! `RelayerCore`: the language-neutral public API surface (spec §6) the
//! core exposes to the HTTP layer. Contains no business logic of its own —
//! every method delegates to C1/C2/C4/C5 — it exists purely to give the
//! ambient HTTP layer (`src/http.rs`) one object to depend on, the same
//! role the teacher's `Facilitator` trait plays for `handlers.rs`.

use crate::admission::{AdmissionGate, RejectReason};
use crate::intent::{IntentError, PaymentIntent, RawPaymentIntent};
use crate::job::{Job, JobRecord};
use crate::kv::KvStore;
use crate::lifecycle::force_rollback;
use crate::money::Amount;
use crate::queue::{Priority, PriorityQueue};
use crate::scheduler::JobStore;
use crate::status::{JobStatus, StatusBus};
use crate::wallet::{WalletInfo, WalletPool};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitError {
    pub kind: RejectReason,
    pub message: String,
}

impl From<RejectReason> for SubmitError {
    fn from(kind: RejectReason) -> Self {
        SubmitError {
            message: kind.message().to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued_by_priority: Vec<(Priority, u64)>,
    pub in_flight: u64,
    pub max_concurrent: usize,
    pub in_flight_ids: Vec<String>,
}

/// The facade spec §6 names. Owns references to every component but
/// implements none of their logic.
pub struct RelayerCore<S: KvStore> {
    admission: Arc<AdmissionGate<S>>,
    queue: Arc<PriorityQueue<S>>,
    wallets: Arc<WalletPool>,
    status_bus: Arc<StatusBus>,
    job_store: Arc<JobStore<S>>,
    kv: Arc<S>,
    max_concurrent: usize,
}

impl<S: KvStore> RelayerCore<S> {
    pub fn new(
        admission: Arc<AdmissionGate<S>>,
        queue: Arc<PriorityQueue<S>>,
        wallets: Arc<WalletPool>,
        status_bus: Arc<StatusBus>,
        job_store: Arc<JobStore<S>>,
        kv: Arc<S>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            admission,
            queue,
            wallets,
            status_bus,
            job_store,
            kv,
            max_concurrent,
        }
    }

    /// `submit_intent(intent) -> {job_id} | RejectReason` (spec §6).
    pub async fn submit_intent(
        &self,
        raw: RawPaymentIntent,
        priority: Priority,
    ) -> Result<String, SubmitError> {
        let intent: PaymentIntent = raw
            .parse()
            .map_err(|_: IntentError| SubmitError::from(RejectReason::Malformed))?;
        let job_id = self.admission.admit(intent.clone(), priority).await?;
        let now = crate::timestamp::UnixMillis::try_now()
            .map(|t| t.as_millis())
            .unwrap_or(0);
        self.job_store
            .insert(Job::new(job_id.clone(), intent, priority, now))
            .await;
        Ok(job_id)
    }

    /// `get_job_status(job_id) -> JobStatus | NotFound` (spec §6).
    pub async fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        let raw = self.kv.get(&format!("job_status:{job_id}")).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn get_job_record(&self, job_id: &str) -> Option<JobRecord> {
        self.job_store.get(job_id).await.map(|job| JobRecord::from(&job))
    }

    /// `get_queue_status() -> {...}` (spec §6).
    pub async fn get_queue_status(&self) -> QueueStatus {
        let queued_by_priority = self.queue.size_by_priority().await;
        let wallets = self.wallets.snapshot().await;
        let in_flight: u64 = wallets.iter().map(|w| w.pending_count as u64).sum();
        let in_flight_ids: Vec<String> = wallets.iter().flat_map(|w| w.in_flight.iter().cloned()).collect();
        QueueStatus {
            queued_by_priority,
            in_flight,
            max_concurrent: self.max_concurrent,
            in_flight_ids,
        }
    }

    /// `list_wallets() -> [WalletInfo]` (spec §6; secrets never included —
    /// enforced structurally since `WalletInfo` has no key field).
    pub async fn list_wallets(&self) -> Vec<WalletInfo> {
        self.wallets.snapshot().await
    }

    /// `credit_prepaid(client_id, amount) -> new_balance` (spec §6).
    pub async fn credit_prepaid(&self, client_id: &str, amount: Amount) -> Amount {
        self.admission.credit_prepaid(client_id, amount).await
    }

    /// `get_prepaid_balance(client_id) -> balance` (spec §6).
    pub async fn get_prepaid_balance(&self, client_id: &str) -> Amount {
        self.admission.get_prepaid_balance(client_id).await
    }

    /// `force_rollback(job_id) -> applied | not_applicable` (privileged, spec §6).
    pub async fn force_rollback(&self, job_id: &str, client_id: &str) -> bool {
        force_rollback(&self.admission, self.kv.as_ref(), job_id, client_id).await
    }

    /// `subscribe_status(job_id) -> stream<JobStatus>` (spec §6).
    pub fn subscribe_status(&self, job_id: &str) -> broadcast::Receiver<JobStatus> {
        self.status_bus.subscribe(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::audit::InMemoryAuditLog;
    use crate::chain::mock::MockChainAdapter;
    use crate::chain::ChainAdapter;
    use crate::kv::InMemoryKvStore;
    use crate::wallet::WalletPool;
    use alloy_primitives::U256;
    use alloy_signer::Signer;
    use alloy_signer_local::PrivateKeySigner;
    use std::str::FromStr;
    use std::time::Duration;

    async fn core() -> RelayerCore<InMemoryKvStore> {
        let kv = Arc::new(InMemoryKvStore::new());
        let queue = Arc::new(PriorityQueue::new(kv.clone(), 10_000));
        let audit = Arc::new(InMemoryAuditLog::new(100));
        let admission = Arc::new(AdmissionGate::new(
            kv.clone(),
            queue.clone(),
            audit,
            AdmissionConfig {
                api_key: "key".into(),
                max_requests_per_minute: 100,
                signature_window: Duration::from_secs(300),
                replay_ttl: Duration::from_secs(360),
                max_transaction_amount: Amount::from_str("1.0").unwrap(),
                rollback_ttl: Duration::from_secs(3600),
            },
        ));
        let mock = MockChainAdapter::new();
        let signer = PrivateKeySigner::random();
        mock.set_balance(signer.address(), U256::from(1_000_000u64));
        let chain: Arc<dyn ChainAdapter> = Arc::new(mock);
        let wallets = Arc::new(WalletPool::from_keys(vec![signer], chain).await.unwrap());
        let status_bus = Arc::new(StatusBus::new());
        let job_store = Arc::new(JobStore::new(kv.clone()));
        RelayerCore::new(admission, queue, wallets, status_bus, job_store, kv, 4)
    }

    fn raw_intent(from: &alloy_signer_local::PrivateKeySigner, amount: &str, nonce: &str) -> RawPaymentIntent {
        use crate::chain::RecoverableSignature;
        use alloy_signer::SignerSync;
        let to = "0x00000000000000000000000000000000000000bb";
        let timestamp = 1_000u64;
        let message = format!("{:#x}:{}:{}:{}", from.address(), to, amount, timestamp);
        let hash = alloy_primitives::keccak256(message.as_bytes());
        let sig = from.sign_hash_sync(&hash).unwrap();
        let _ = RecoverableSignature(sig.as_bytes());
        RawPaymentIntent {
            from_address: format!("{:#x}", from.address()),
            to_address: to.to_string(),
            amount: amount.to_string(),
            nonce: nonce.to_string(),
            timestamp,
            signature: format!("0x{}", hex::encode(sig.as_bytes())),
            client_id: "C".to_string(),
            api_key: "key".to_string(),
        }
    }

    #[tokio::test]
    async fn submit_intent_rejects_malformed_amount() {
        let core = core().await;
        let signer = PrivateKeySigner::random();
        let mut raw = raw_intent(&signer, "0.25", "N1");
        raw.amount = "not-a-number".into();
        let result = core.submit_intent(raw, Priority::Normal).await;
        assert_eq!(result.unwrap_err().kind, RejectReason::Malformed);
    }

    #[tokio::test]
    async fn submit_intent_happy_path_returns_job_id_and_queues() {
        let core = core().await;
        core.credit_prepaid("C", Amount::from_str("1.0").unwrap()).await;
        let signer = PrivateKeySigner::random();
        let raw = raw_intent(&signer, "0.25", "N1");
        let job_id = core.submit_intent(raw, Priority::Normal).await.unwrap();
        assert!(job_id.starts_with("job-"));
        let status = core.get_queue_status().await;
        let normal_count = status
            .queued_by_priority
            .iter()
            .find(|(p, _)| *p == Priority::Normal)
            .map(|(_, c)| *c)
            .unwrap_or(0);
        assert_eq!(normal_count, 1);
    }

    #[tokio::test]
    async fn unknown_job_status_is_none() {
        let core = core().await;
        assert!(core.get_job_status("missing").await.is_none());
    }
}
