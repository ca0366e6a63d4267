//! The blockchain RPC capability the core depends on (spec §6, "Chain
//! adapter"). Spec §1 explicitly treats the chain client as an external
//! collaborator, so this module defines the trait contract plus the small
//! pieces of chain-specific logic that legitimately live on this side of the
//! boundary — address/signature types and signature recovery, which the
//! admission gate needs directly (spec §4.1 step 4) — grounded in the
//! teacher's `src/chain/eip155/mod.rs` and its EIP-712 recovery code in
//! `src/facilitator_local.rs`.

use alloy_primitives::{Address, Signature, U256, keccak256};
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// A 65-byte recoverable ECDSA signature over a canonical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature(pub [u8; 65]);

/// Recovers the signer address from `signature` over `message`, using the
/// same prehash-recovery approach as the teacher's `assert_signature`, but
/// against this protocol's canonical message hash rather than an EIP-712
/// struct hash.
pub fn verify_message(
    message: &[u8],
    signature: &RecoverableSignature,
) -> Result<Address, SignatureError> {
    let sig = Signature::from_raw_array(&signature.0)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let hash = keccak256(message);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| SignatureError::Malformed(e.to_string()))
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed signature: {0}")]
    Malformed(String),
}

/// Fee suggestion returned by `suggest_fees` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSuggestion {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// A transaction built and signed by the lifecycle manager (spec §4.5),
/// ready to hand to the chain adapter's `send_raw`.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub signature: RecoverableSignature,
}

/// Result of a confirmed submission (spec §6 `wait_confirmation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub block_number: u64,
    pub gas_used: u64,
}

/// The taxonomy `send_raw`/`wait_confirmation` errors are classified into
/// (spec §6, §7). Exhaustive matching on this enum is the error-handling
/// discipline spec §9 calls for.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("transaction already known to the network")]
    Duplicate,
    #[error("transaction underpriced")]
    Underpriced,
    #[error("nonce too low")]
    NonceTooLow,
    #[error("nonce too high")]
    NonceTooHigh,
    #[error("insufficient funds on sending wallet")]
    InsufficientFunds,
    #[error("transaction reverted on-chain")]
    Reverted,
    #[error("network error: {0}")]
    Network(String),
    #[error("operation timed out")]
    Timeout,
}

impl ChainError {
    /// Transient classes (spec §7): retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Network(_) | ChainError::Timeout | ChainError::Underpriced
        )
    }

    /// Wallet-state classes (spec §7): retry on a different or re-synced wallet.
    pub fn is_wallet_state(&self) -> bool {
        matches!(
            self,
            ChainError::NonceTooLow
                | ChainError::NonceTooHigh
                | ChainError::InsufficientFunds
        )
    }

    /// Permanent classes (spec §7): fail the job and roll back.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ChainError::Reverted)
    }
}

/// The blockchain RPC capability (spec §6). One instance serves every chain
/// the relayer's wallets operate on.
#[async_trait]
pub trait ChainAdapter: Send + Sync + Debug {
    async fn suggest_fees(&self) -> Result<FeeSuggestion, ChainError>;
    async fn get_nonce(&self, address: Address) -> Result<u64, ChainError>;
    async fn get_balance(&self, address: Address) -> Result<U256, ChainError>;
    async fn send_raw(&self, tx: SignedTransaction) -> Result<[u8; 32], ChainError>;
    async fn wait_confirmation(
        &self,
        tx_hash: [u8; 32],
        min_blocks: u64,
    ) -> Result<Confirmation, ChainError>;
}

/// A deterministic, scriptable [`ChainAdapter`] used as the reference
/// implementation for tests and default local wiring — the same role
/// `ProviderCache` fills for the teacher's alloy-backed providers, but
/// without requiring a live RPC endpoint. Behavior is controlled by the
/// `script` the caller configures; by default every call succeeds.
pub mod mock {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    pub struct MockChainAdapter {
        nonces: DashMap<Address, u64>,
        balances: DashMap<Address, U256>,
        send_failures: DashMap<Address, Vec<ChainError>>,
        confirm_delay: Duration,
        next_block: AtomicU64,
    }

    impl MockChainAdapter {
        pub fn new() -> Self {
            Self {
                confirm_delay: Duration::ZERO,
                next_block: AtomicU64::new(1),
                ..Default::default()
            }
        }

        pub fn set_nonce(&self, address: Address, nonce: u64) {
            self.nonces.insert(address, nonce);
        }

        pub fn set_balance(&self, address: Address, balance: U256) {
            self.balances.insert(address, balance);
        }

        /// Queues errors to return from `send_raw` for `address`, in order,
        /// before falling through to success. Used to script the "transient
        /// then success" and "permanent failure" scenarios (spec §8).
        pub fn queue_send_failures(&self, address: Address, errors: Vec<ChainError>) {
            self.send_failures.entry(address).or_default().extend(errors);
        }
    }

    #[async_trait]
    impl ChainAdapter for MockChainAdapter {
        async fn suggest_fees(&self) -> Result<FeeSuggestion, ChainError> {
            Ok(FeeSuggestion {
                max_fee_per_gas: 2_000_000_000,
                max_priority_fee_per_gas: 1_000_000_000,
            })
        }

        async fn get_nonce(&self, address: Address) -> Result<u64, ChainError> {
            Ok(*self.nonces.get(&address).as_deref().unwrap_or(&0))
        }

        async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
            Ok(*self.balances.get(&address).as_deref().unwrap_or(&U256::ZERO))
        }

        async fn send_raw(&self, tx: SignedTransaction) -> Result<[u8; 32], ChainError> {
            if let Some(mut queued) = self.send_failures.get_mut(&tx.from) {
                if !queued.is_empty() {
                    return Err(queued.remove(0));
                }
            }
            let recorded_nonce = self.nonces.get(&tx.from).map(|n| *n).unwrap_or(0);
            if tx.nonce < recorded_nonce {
                return Err(ChainError::NonceTooLow);
            }
            if tx.nonce > recorded_nonce {
                return Err(ChainError::NonceTooHigh);
            }
            self.nonces.insert(tx.from, recorded_nonce + 1);
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&tx.nonce.to_be_bytes());
            hash[8..28].copy_from_slice(tx.from.as_slice());
            Ok(hash)
        }

        async fn wait_confirmation(
            &self,
            _tx_hash: [u8; 32],
            _min_blocks: u64,
        ) -> Result<Confirmation, ChainError> {
            if self.confirm_delay > Duration::ZERO {
                tokio::time::sleep(self.confirm_delay).await;
            }
            let block_number = self.next_block.fetch_add(1, Ordering::SeqCst);
            Ok(Confirmation {
                block_number,
                gas_used: 21_000,
            })
        }
    }
}
