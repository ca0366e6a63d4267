//! Transaction lifecycle manager (spec §4.5, component C5): drives a leased
//! job through build+sign+send, confirmation wait, and rollback-on-failure.
//!
//! Grounded in the teacher's `facilitator_local.rs` settle/verify split
//! (build → submit → await outcome) and its `PaymentError` → response
//! mapping, generalized into the `queued → leased → submitted →
//! {confirmed, retry, failed → rolled_back}` state machine spec §4.5 names.

use crate::admission::AdmissionGate;
use crate::audit::{AuditEvent, AuditLog};
use crate::chain::{ChainAdapter, ChainError};
use crate::job::Job;
use crate::kv::KvStore;
use crate::money::Amount;
use crate::status::{JobState, JobStatus, StatusBus};
use crate::timestamp::UnixMillis;
use crate::wallet::{build_signed_transaction, LeaseOutcome, WalletLease, WalletPool};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Outcome of one `run` (spec §4.5 contract).
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Confirmed {
        tx_hash: String,
        block_number: u64,
        gas_used: u64,
    },
    Retry {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

/// Configuration C5 consults (subset of spec §6 relevant to the lifecycle).
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub gas_limit: u64,
    pub gas_price_multiplier: f64,
    pub confirmation_blocks: u64,
    pub max_attempts: u32,
    pub processing_timeout: Duration,
}

/// C5: the state machine that owns a leased job until it reaches a terminal
/// status.
pub struct LifecycleManager<S: KvStore> {
    chain: Arc<dyn ChainAdapter>,
    kv: Arc<S>,
    wallets: Arc<WalletPool>,
    status_bus: Arc<StatusBus>,
    audit: Arc<dyn AuditLog>,
    config: LifecycleConfig,
}

impl<S: KvStore> LifecycleManager<S> {
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        kv: Arc<S>,
        wallets: Arc<WalletPool>,
        status_bus: Arc<StatusBus>,
        audit: Arc<dyn AuditLog>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            chain,
            kv,
            wallets,
            status_bus,
            audit,
            config,
        }
    }

    /// Drives `job` from `leased` to a terminal or retryable outcome (spec
    /// §4.5 `run`). The caller (C3) owns re-enqueue and wallet release.
    #[instrument(skip(self, job, lease), fields(job_id = %job.job_id, attempt = job.attempt))]
    pub async fn run(&self, job: &mut Job, lease: &WalletLease) -> JobOutcome {
        job.status = JobState::Leased;
        job.assigned_wallet = Some(format!("{:#x}", lease.address));
        self.publish(job, None).await;

        let outcome = tokio::time::timeout(self.config.processing_timeout, self.submit_and_confirm(job, lease))
            .await
            .unwrap_or(JobOutcome::Retry {
                reason: "processing_timeout".to_string(),
            });

        match &outcome {
            JobOutcome::Confirmed {
                tx_hash,
                block_number,
                gas_used,
            } => {
                job.status = JobState::Confirmed;
                job.tx_hash = Some(tx_hash.clone());
                job.block_number = Some(*block_number);
                job.gas_used = Some(*gas_used);
                self.consume_rollback_point(&job.job_id).await;
                self.publish(job, None).await;
            }
            JobOutcome::Retry { reason } => {
                job.last_error = Some(reason.clone());
                if job.attempt + 1 >= self.config.max_attempts {
                    self.fail_and_roll_back(job, reason.clone()).await;
                    return JobOutcome::Failed {
                        reason: reason.clone(),
                    };
                }
            }
            JobOutcome::Failed { reason } => {
                self.fail_and_roll_back(job, reason.clone()).await;
            }
        }
        outcome
    }

    async fn submit_and_confirm(&self, job: &mut Job, lease: &WalletLease) -> JobOutcome {
        let fees = match self.chain.suggest_fees().await {
            Ok(f) => f,
            Err(e) => return self.classify(e),
        };
        let max_fee = (fees.max_fee_per_gas as f64 * self.config.gas_price_multiplier) as u128;
        let max_priority_fee =
            (fees.max_priority_fee_per_gas as f64 * self.config.gas_price_multiplier) as u128;

        // The chain adapter is an abstract external collaborator (spec §1);
        // amounts are carried through as their unscaled integer mantissa
        // rather than re-derived against a concrete token's decimals.
        let signed = build_signed_transaction(
            lease,
            job.intent.to_address,
            alloy_primitives::U256::from(job.intent.amount.inner().mantissa().unsigned_abs()),
            self.config.gas_limit,
            max_fee,
            max_priority_fee,
        );

        // Idempotency: the intended tx_hash is implied by (wallet, nonce); a
        // "duplicate" send error is treated as success (spec §4.5, §7).
        let tx_hash = match self.chain.send_raw(signed).await {
            Ok(hash) => hash,
            Err(ChainError::Duplicate) => [0u8; 32],
            Err(e) => {
                if matches!(e, ChainError::NonceTooLow | ChainError::NonceTooHigh) {
                    self.wallets.mark_diverged(&lease.address).await;
                }
                return self.classify(e);
            }
        };
        let tx_hash_hex = format!("0x{}", hex::encode(tx_hash));
        job.status = JobState::Submitted;
        job.tx_hash = Some(tx_hash_hex.clone());
        self.publish(job, None).await;
        info!(tx_hash = %tx_hash_hex, "transaction submitted");

        match self
            .chain
            .wait_confirmation(tx_hash, self.config.confirmation_blocks)
            .await
        {
            Ok(confirmation) => JobOutcome::Confirmed {
                tx_hash: tx_hash_hex,
                block_number: confirmation.block_number,
                gas_used: confirmation.gas_used,
            },
            Err(e) => self.classify(e),
        }
    }

    fn classify(&self, error: ChainError) -> JobOutcome {
        if error.is_transient() {
            JobOutcome::Retry {
                reason: error.to_string(),
            }
        } else if error.is_wallet_state() {
            JobOutcome::Retry {
                reason: error.to_string(),
            }
        } else {
            // Permanent classes, plus anything unclassified defaults to the
            // most conservative class (spec §7 "unknown errors default to
            // permanent + rollback, and are flagged in the audit log for
            // operator attention"). The flagging happens in
            // `fail_and_roll_back`, which every `Failed` outcome flows into.
            JobOutcome::Failed {
                reason: error.to_string(),
            }
        }
    }

    async fn fail_and_roll_back(&self, job: &mut Job, reason: String) {
        job.status = JobState::Failed;
        job.last_error = Some(reason.clone());
        self.publish(job, Some(reason.clone())).await;
        let credited = self.take_rollback_amount(&job.job_id).await;
        if let Some(amount) = credited {
            self.credit_back(&job.intent.client_id, amount).await;
            self.kv.del(&format!("rollback:{}", job.job_id)).await;
        }
        job.status = JobState::RolledBack;
        self.publish(job, None).await;
        self.audit
            .append(AuditEvent {
                ts: UnixMillis::try_now().unwrap_or(UnixMillis(0)),
                subject: job.intent.client_id.clone(),
                kind: "permanent_failure_rolled_back".to_string(),
                data: json!({
                    "job_id": job.job_id,
                    "reason": reason,
                    "credited_amount": credited.map(|a| a.to_string()),
                }),
            })
            .await;
    }

    async fn take_rollback_amount(&self, job_id: &str) -> Option<Amount> {
        let raw = self.kv.get(&format!("rollback:{job_id}")).await?;
        let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
        parsed["amount"].as_str()?.parse::<Amount>().ok()
    }

    async fn credit_back(&self, client_id: &str, amount: Amount) {
        let key = format!("prepaid:{client_id}");
        let current = match self.kv.get(&key).await {
            Some(raw) => raw.parse::<Amount>().unwrap_or(Amount::ZERO),
            None => Amount::ZERO,
        };
        let next = current
            .checked_add(amount)
            .expect("prepaid balances stay within representable range");
        self.kv.set(&key, next.to_string(), None).await;
    }

    /// Consumes the RollbackPoint without applying it on confirmation (spec
    /// §4.5 "the debit stands").
    async fn consume_rollback_point(&self, job_id: &str) {
        self.kv.del(&format!("rollback:{job_id}")).await;
    }

    async fn publish(&self, job: &Job, error: Option<String>) {
        let record = JobStatus {
            job_id: job.job_id.clone(),
            status: job.status,
            attempt: job.attempt,
            tx_hash: job.tx_hash.clone(),
            block_number: job.block_number,
            gas_used: job.gas_used,
            error,
            debited_amount: Some(job.intent.amount),
        };
        self.kv
            .set(
                &format!("job_status:{}", job.job_id),
                json!(&record).to_string(),
                Some(Duration::from_secs(3600)),
            )
            .await;
        self.status_bus.publish(&record);
        if record.status.is_terminal() {
            self.status_bus.retire(&job.job_id);
        }
    }
}

/// Gates the privileged `force_rollback` API (spec §6, §9): only a job in
/// `failed` status without a prior rollback may be force-rolled-back. A job
/// still `queued`/`leased`/`submitted`, or already `confirmed`/`rolled_back`,
/// is refused even if a `rollback:{job_id}` record happens to exist.
pub async fn force_rollback<S: KvStore>(
    admission: &AdmissionGate<S>,
    kv: &S,
    job_id: &str,
    client_id: &str,
) -> bool {
    let Some(status_raw) = kv.get(&format!("job_status:{job_id}")).await else {
        return false;
    };
    let Ok(status) = serde_json::from_str::<JobStatus>(&status_raw) else {
        return false;
    };
    if status.status != JobState::Failed {
        return false;
    }

    let rollback_key = format!("rollback:{job_id}");
    let Some(raw) = kv.get(&rollback_key).await else {
        return false;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return false;
    };
    let Some(amount_str) = parsed["amount"].as_str() else {
        return false;
    };
    let Ok(amount) = amount_str.parse::<Amount>() else {
        return false;
    };
    admission.credit_prepaid(client_id, amount).await;
    kv.del(&rollback_key).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionConfig, AdmissionGate};
    use crate::audit::InMemoryAuditLog;
    use crate::chain::mock::MockChainAdapter;
    use crate::kv::InMemoryKvStore;
    use crate::queue::{Priority, PriorityQueue};
    use crate::test_support::signed_intent;
    use crate::wallet::SelectionPolicy;
    use alloy_primitives::U256;
    use alloy_signer_local::PrivateKeySigner;
    use std::str::FromStr;

    fn lifecycle_config() -> LifecycleConfig {
        LifecycleConfig {
            gas_limit: 21_000,
            gas_price_multiplier: 1.1,
            confirmation_blocks: 1,
            max_attempts: 3,
            processing_timeout: Duration::from_secs(5),
        }
    }

    async fn setup() -> (
        LifecycleManager<InMemoryKvStore>,
        Arc<WalletPool>,
        Arc<InMemoryKvStore>,
        Arc<MockChainAdapter>,
    ) {
        let mock = Arc::new(MockChainAdapter::new());
        let chain: Arc<dyn ChainAdapter> = mock.clone();
        let signer = PrivateKeySigner::random();
        mock.set_balance(signer.address(), U256::from(1_000_000u64));
        let wallets = Arc::new(WalletPool::from_keys(vec![signer], chain.clone()).await.unwrap());
        let kv = Arc::new(InMemoryKvStore::new());
        let bus = Arc::new(StatusBus::new());
        let audit = Arc::new(InMemoryAuditLog::new(100));
        let manager = LifecycleManager::new(chain, kv.clone(), wallets.clone(), bus, audit, lifecycle_config());
        (manager, wallets, kv, mock)
    }

    #[tokio::test]
    async fn confirmed_job_consumes_rollback_without_crediting() {
        let (manager, wallets, kv, _mock) = setup().await;
        let intent = signed_intent("C", "N1", "0.25", 1_000);
        kv.set(
            "rollback:job-1",
            json!({ "client_id": "C", "amount": "0.25", "created_at": 1000 }).to_string(),
            None,
        )
        .await;
        let mut job = Job::new("job-1".into(), intent, Priority::Normal, 1_000);
        let lease = wallets
            .acquire(
                "job-1",
                SelectionPolicy {
                    min_balance_threshold: U256::ZERO,
                },
            )
            .await
            .unwrap();
        let outcome = manager.run(&mut job, &lease).await;
        lease.release(LeaseOutcome::Success).await;
        assert!(matches!(outcome, JobOutcome::Confirmed { .. }));
        assert_eq!(job.status, JobState::Confirmed);
        assert_eq!(kv.get("rollback:job-1").await, None);
        assert_eq!(kv.get("prepaid:C").await, None);
    }

    #[tokio::test]
    async fn permanent_failure_rolls_back_credit() {
        let (manager, wallets, kv, mock) = setup().await;
        let intent = signed_intent("C", "N1", "0.25", 1_000);
        kv.set(
            "rollback:job-2",
            json!({ "client_id": "C", "amount": "0.25", "created_at": 1000 }).to_string(),
            None,
        )
        .await;
        let mut job = Job::new("job-2".into(), intent.clone(), Priority::Normal, 1_000);
        let lease = wallets
            .acquire(
                "job-2",
                SelectionPolicy {
                    min_balance_threshold: U256::ZERO,
                },
            )
            .await
            .unwrap();
        mock.queue_send_failures(lease.address, vec![ChainError::Reverted]);
        let outcome = manager.run(&mut job, &lease).await;
        lease.release(LeaseOutcome::Failure).await;
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        assert_eq!(job.status, JobState::RolledBack);
        assert_eq!(kv.get("rollback:job-2").await, None);
        assert_eq!(
            kv.get("prepaid:C").await.unwrap().parse::<Amount>().unwrap(),
            Amount::from_str("0.25").unwrap()
        );
    }

    #[tokio::test]
    async fn force_rollback_applies_once() {
        let (_manager, _wallets, kv, _mock) = setup().await;
        let queue = Arc::new(PriorityQueue::new(kv.clone(), 10_000));
        let audit = Arc::new(InMemoryAuditLog::new(100));
        let admission = AdmissionGate::new(
            kv.clone(),
            queue,
            audit,
            AdmissionConfig {
                api_key: "key".into(),
                max_requests_per_minute: 100,
                signature_window: Duration::from_secs(300),
                replay_ttl: Duration::from_secs(360),
                max_transaction_amount: Amount::from_str("1.0").unwrap(),
                rollback_ttl: Duration::from_secs(3600),
            },
        );
        kv.set(
            "rollback:job-3",
            json!({ "client_id": "C", "amount": "0.25", "created_at": 1000 }).to_string(),
            None,
        )
        .await;
        kv.set(
            "job_status:job-3",
            json!(&JobStatus {
                job_id: "job-3".to_string(),
                status: JobState::Failed,
                attempt: 1,
                tx_hash: None,
                block_number: None,
                gas_used: None,
                error: Some("reverted".to_string()),
                debited_amount: Some(Amount::from_str("0.25").unwrap()),
            })
            .to_string(),
            None,
        )
        .await;
        assert!(force_rollback(&admission, kv.as_ref(), "job-3", "C").await);
        assert!(!force_rollback(&admission, kv.as_ref(), "job-3", "C").await);
        assert_eq!(
            admission.get_prepaid_balance("C").await,
            Amount::from_str("0.25").unwrap()
        );
    }

    #[tokio::test]
    async fn force_rollback_refuses_a_job_still_in_flight() {
        let (_manager, _wallets, kv, _mock) = setup().await;
        let queue = Arc::new(PriorityQueue::new(kv.clone(), 10_000));
        let audit = Arc::new(InMemoryAuditLog::new(100));
        let admission = AdmissionGate::new(
            kv.clone(),
            queue,
            audit,
            AdmissionConfig {
                api_key: "key".into(),
                max_requests_per_minute: 100,
                signature_window: Duration::from_secs(300),
                replay_ttl: Duration::from_secs(360),
                max_transaction_amount: Amount::from_str("1.0").unwrap(),
                rollback_ttl: Duration::from_secs(3600),
            },
        );
        kv.set(
            "rollback:job-4",
            json!({ "client_id": "C", "amount": "0.25", "created_at": 1000 }).to_string(),
            None,
        )
        .await;
        kv.set(
            "job_status:job-4",
            json!(&JobStatus {
                job_id: "job-4".to_string(),
                status: JobState::Submitted,
                attempt: 0,
                tx_hash: Some("0xabc".to_string()),
                block_number: None,
                gas_used: None,
                error: None,
                debited_amount: Some(Amount::from_str("0.25").unwrap()),
            })
            .to_string(),
            None,
        )
        .await;
        assert!(!force_rollback(&admission, kv.as_ref(), "job-4", "C").await);
        assert_eq!(admission.get_prepaid_balance("C").await, Amount::ZERO);
    }
}
