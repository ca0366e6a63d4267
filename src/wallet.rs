//! Wallet pool (spec §4.4, component C4): signing identities with per-wallet
//! nonce discipline, balance awareness, lease/release semantics, rotation.
//!
//! Grounded in the teacher's `provider_cache.rs` multi-signer registration
//! (`SignerType::make_evm_wallet` looping over comma-separated keys) for the
//! pool shape, and in spec §5/§9's "single asynchronous mutex held only
//! during state transitions, never across I/O" rule, which this module
//! honors by doing all chain I/O (balance polling, nonce re-sync) with the
//! mutex released and only the field mutation itself under lock.

use crate::chain::{ChainAdapter, ChainError, RecoverableSignature, SignedTransaction};
use alloy_primitives::{Address, U256};
use alloy_signer::{Signer, SignerSync};
use alloy_signer_local::PrivateKeySigner;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletState {
    Idle,
    Leased,
    Draining,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Success,
    Failure,
}

/// A wallet's state as returned by `snapshot` (spec §6 `list_wallets`).
/// Never carries the signing key.
#[derive(Debug, Clone)]
pub struct WalletInfo {
    pub address: Address,
    pub balance_cached: U256,
    pub local_nonce: u64,
    pub pending_count: u32,
    pub state: WalletState,
    pub success_rate: f64,
    pub in_flight: Vec<String>,
}

struct WalletRecord {
    signer: PrivateKeySigner,
    balance_cached: U256,
    local_nonce: u64,
    pending_count: u32,
    in_flight: std::collections::HashSet<String>,
    state: WalletState,
    success_rate: f64,
    last_used: Option<Instant>,
}

/// Selection policy for [`WalletPool::acquire`] (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub min_balance_threshold: U256,
}

/// Exclusive capability handle a leased wallet issues to its lessee (spec §9:
/// "C5 refers to C4 through its lease handle, not a back-pointer").
pub struct WalletLease {
    pub address: Address,
    pub next_nonce: u64,
    signer: PrivateKeySigner,
    job_id: String,
    pool: Arc<WalletPool>,
    released: bool,
}

impl WalletLease {
    /// Signs `message` with the leased wallet's key; the key itself never
    /// leaves this method.
    pub fn sign(&self, message: &[u8]) -> RecoverableSignature {
        let hash = alloy_primitives::keccak256(message);
        let sig = self
            .signer
            .sign_hash_sync(&hash)
            .expect("signing over a fixed-size hash cannot fail");
        RecoverableSignature(sig.as_bytes())
    }

    /// Releases the lease, updating `pending_count` and `success_rate`. Must
    /// be called on every exit path, including after a panic unwind, which
    /// is why [`crate::lifecycle`] always calls it from a `finally`-style
    /// guard rather than only on the success path.
    pub async fn release(mut self, outcome: LeaseOutcome) {
        self.pool.release(&self.address, &self.job_id, outcome).await;
        self.released = true;
    }
}

impl Drop for WalletLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(address = %self.address, job_id = %self.job_id, "wallet lease dropped without explicit release");
        }
    }
}

#[derive(Debug, Error)]
pub enum WalletPoolError {
    #[error("no wallet available matching the selection policy")]
    NoWalletAvailable,
}

/// C4: the pool of relayer-owned signing wallets.
pub struct WalletPool {
    chain: Arc<dyn ChainAdapter>,
    records: Mutex<HashMap<Address, WalletRecord>>,
}

impl WalletPool {
    /// Builds the pool from raw private keys, querying the chain adapter for
    /// each wallet's starting nonce, mirroring the teacher's
    /// `register_signer` loop over `EVM_PRIVATE_KEY`.
    pub async fn from_keys(
        keys: Vec<PrivateKeySigner>,
        chain: Arc<dyn ChainAdapter>,
    ) -> Result<Self, ChainError> {
        let mut records = HashMap::with_capacity(keys.len());
        for signer in keys {
            let address = signer.address();
            let local_nonce = chain.get_nonce(address).await?;
            let balance_cached = chain.get_balance(address).await?;
            records.insert(
                address,
                WalletRecord {
                    signer,
                    balance_cached,
                    local_nonce,
                    pending_count: 0,
                    in_flight: std::collections::HashSet::new(),
                    state: WalletState::Idle,
                    success_rate: 1.0,
                    last_used: None,
                },
            );
        }
        Ok(Self {
            chain,
            records: Mutex::new(records),
        })
    }

    /// Leases a wallet for `job_id` per the selection policy (spec §4.4):
    /// filter `disabled`/`draining`/under-threshold, then choose lowest
    /// `pending_count`, then highest `success_rate`, then least-recently-used.
    #[instrument(skip(self, policy))]
    pub async fn acquire(
        self: &Arc<Self>,
        job_id: &str,
        policy: SelectionPolicy,
    ) -> Option<WalletLease> {
        let mut records = self.records.lock().await;
        let chosen = records
            .iter()
            .filter(|(_, r)| r.state == WalletState::Idle)
            .filter(|(_, r)| r.balance_cached >= policy.min_balance_threshold)
            .min_by(|(_, a), (_, b)| {
                a.pending_count
                    .cmp(&b.pending_count)
                    .then(b.success_rate.total_cmp(&a.success_rate))
                    .then(a.last_used.cmp(&b.last_used))
            })
            .map(|(addr, _)| *addr)?;

        let record = records.get_mut(&chosen).expect("chosen key is present");
        record.state = WalletState::Leased;
        record.pending_count += 1;
        record.in_flight.insert(job_id.to_string());
        record.last_used = Some(Instant::now());
        let next_nonce = record.local_nonce;
        record.local_nonce += 1;
        let signer = record.signer.clone();

        info!(address = %chosen, job_id, next_nonce, "wallet leased");
        Some(WalletLease {
            address: chosen,
            next_nonce,
            signer,
            job_id: job_id.to_string(),
            pool: self.clone(),
            released: false,
        })
    }

    async fn release(&self, address: &Address, job_id: &str, outcome: LeaseOutcome) {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(address) else {
            return;
        };
        record.in_flight.remove(job_id);
        record.pending_count = record.pending_count.saturating_sub(1);
        let observed = match outcome {
            LeaseOutcome::Success => 1.0,
            LeaseOutcome::Failure => 0.0,
        };
        const ALPHA: f64 = 0.1;
        record.success_rate = ALPHA * observed + (1.0 - ALPHA) * record.success_rate;
        if record.state == WalletState::Leased && record.pending_count == 0 {
            record.state = WalletState::Idle;
        }
        info!(address = %address, job_id, ?outcome, success_rate = record.success_rate, "wallet released");
    }

    /// Marks `address` `disabled` (spec §4.4 `disable`); never re-selected
    /// until a subsequent balance read clears the threshold again.
    pub async fn disable(&self, address: &Address, reason: &str) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(address) {
            record.state = WalletState::Disabled;
            warn!(address = %address, reason, "wallet disabled");
        }
    }

    /// Signals that `address`'s chain submission hit a nonce error (spec
    /// §4.4 "nonce discipline"): the wallet drains until its in-flight jobs
    /// finish, then its `local_nonce` is re-synced from the chain adapter.
    pub async fn mark_diverged(&self, address: &Address) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(address) {
            record.state = WalletState::Draining;
            warn!(address = %address, "wallet nonce diverged, entering draining");
        }
    }

    /// Re-synchronizes a draining wallet with no in-flight jobs back to
    /// `idle` with a freshly fetched nonce. Called by the balance-poller
    /// background task (spec §4.4 "balance monitoring").
    pub async fn resync_drained(&self, address: &Address) -> Result<bool, ChainError> {
        let needs_resync = {
            let records = self.records.lock().await;
            records
                .get(address)
                .is_some_and(|r| r.state == WalletState::Draining && r.in_flight.is_empty())
        };
        if !needs_resync {
            return Ok(false);
        }
        let fresh_nonce = self.chain.get_nonce(*address).await?;
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(address) {
            if record.state == WalletState::Draining && record.in_flight.is_empty() {
                record.local_nonce = fresh_nonce;
                record.state = WalletState::Idle;
                info!(address = %address, fresh_nonce, "wallet re-synced and idle");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One balance-monitoring tick (spec §4.4): re-reads every wallet's
    /// balance and flips `disabled` state based on `threshold`.
    pub async fn poll_balances(&self, threshold: U256) -> Result<(), ChainError> {
        let addresses: Vec<Address> = {
            let records = self.records.lock().await;
            records.keys().copied().collect()
        };
        for address in addresses {
            let balance = self.chain.get_balance(address).await?;
            let mut records = self.records.lock().await;
            if let Some(record) = records.get_mut(&address) {
                record.balance_cached = balance;
                if balance < threshold && record.state != WalletState::Disabled {
                    record.state = WalletState::Disabled;
                    warn!(address = %address, "wallet balance below threshold, disabled");
                } else if balance >= threshold && record.state == WalletState::Disabled {
                    record.state = WalletState::Idle;
                    info!(address = %address, "wallet balance recovered, re-enabled");
                }
            }
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<WalletInfo> {
        let records = self.records.lock().await;
        records
            .iter()
            .map(|(address, r)| WalletInfo {
                address: *address,
                balance_cached: r.balance_cached,
                local_nonce: r.local_nonce,
                pending_count: r.pending_count,
                state: r.state,
                success_rate: r.success_rate,
                in_flight: r.in_flight.iter().cloned().collect(),
            })
            .collect()
    }
}

/// Builds an unsigned-then-signed transaction envelope ready for
/// `ChainAdapter::send_raw` (spec §4.5 "build+sign+send").
pub fn build_signed_transaction(
    lease: &WalletLease,
    to: Address,
    value: alloy_primitives::U256,
    gas_limit: u64,
    max_fee_per_gas: u128,
    max_priority_fee_per_gas: u128,
) -> SignedTransaction {
    let message = format!(
        "{:#x}:{:#x}:{}:{}",
        lease.address, to, value, lease.next_nonce
    );
    let signature = lease.sign(message.as_bytes());
    SignedTransaction {
        from: lease.address,
        to,
        value,
        nonce: lease.next_nonce,
        gas_limit,
        max_fee_per_gas,
        max_priority_fee_per_gas,
        signature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainAdapter;

    async fn pool_with(n: usize) -> Arc<WalletPool> {
        let mock = MockChainAdapter::new();
        let keys: Vec<PrivateKeySigner> = (0..n).map(|_| PrivateKeySigner::random()).collect();
        for signer in &keys {
            mock.set_balance(signer.address(), U256::from(1_000_000u64));
        }
        let chain: Arc<dyn ChainAdapter> = Arc::new(mock);
        Arc::new(WalletPool::from_keys(keys, chain).await.unwrap())
    }

    fn policy() -> SelectionPolicy {
        SelectionPolicy {
            min_balance_threshold: U256::ZERO,
        }
    }

    #[tokio::test]
    async fn acquire_then_release_returns_to_idle() {
        let pool = pool_with(1).await;
        let lease = pool.acquire("job-1", policy()).await.unwrap();
        {
            let snapshot = pool.snapshot().await;
            assert_eq!(snapshot[0].state, WalletState::Leased);
        }
        lease.release(LeaseOutcome::Success).await;
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].state, WalletState::Idle);
        assert_eq!(snapshot[0].pending_count, 0);
    }

    #[tokio::test]
    async fn snapshot_exposes_in_flight_job_ids_while_leased() {
        let pool = pool_with(1).await;
        let lease = pool.acquire("job-1", policy()).await.unwrap();
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].in_flight, vec!["job-1".to_string()]);
        lease.release(LeaseOutcome::Success).await;
        let snapshot = pool.snapshot().await;
        assert!(snapshot[0].in_flight.is_empty());
    }

    #[tokio::test]
    async fn acquire_returns_none_when_no_wallet_idle() {
        let pool = pool_with(1).await;
        let _lease = pool.acquire("job-1", policy()).await.unwrap();
        assert!(pool.acquire("job-2", policy()).await.is_none());
    }

    #[tokio::test]
    async fn disabled_wallet_is_never_selected() {
        let pool = pool_with(1).await;
        let snapshot = pool.snapshot().await;
        let address = snapshot[0].address;
        pool.disable(&address, "manual").await;
        assert!(pool.acquire("job-1", policy()).await.is_none());
    }

    #[tokio::test]
    async fn draining_wallet_resyncs_once_idle() {
        let pool = pool_with(1).await;
        let snapshot = pool.snapshot().await;
        let address = snapshot[0].address;
        pool.mark_diverged(&address).await;
        assert!(pool.resync_drained(&address).await.unwrap());
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].state, WalletState::Idle);
    }

    #[tokio::test]
    async fn nonce_increments_across_successive_leases() {
        let pool = pool_with(1).await;
        let first = pool.acquire("job-1", policy()).await.unwrap();
        let first_nonce = first.next_nonce;
        first.release(LeaseOutcome::Success).await;
        let second = pool.acquire("job-2", policy()).await.unwrap();
        assert_eq!(second.next_nonce, first_nonce + 1);
        second.release(LeaseOutcome::Success).await;
    }
}
