//! Inbound payment intents (spec §3, "PaymentIntent").
//!
//! Intents arrive over the HTTP boundary as plain strings (addresses as hex,
//! amounts as decimal strings, signatures as hex) and are parsed into typed
//! values here. Parsing failure is exactly the `malformed` reject kind from
//! spec §4.1's admission algorithm, so [`RawPaymentIntent::parse`] is the
//! single place that produces it.

use crate::chain::RecoverableSignature;
use crate::money::Amount;
use crate::timestamp::UnixMillis;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Wire-shaped intent as received from the HTTP layer, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPaymentIntent {
    pub from_address: String,
    pub to_address: String,
    pub amount: String,
    pub nonce: String,
    pub timestamp: u64,
    pub signature: String,
    pub client_id: String,
    pub api_key: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntentError {
    #[error("invalid from_address: {0}")]
    InvalidFromAddress(String),
    #[error("invalid to_address: {0}")]
    InvalidToAddress(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("intent nonce must not be empty")]
    EmptyNonce,
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// A parsed, immutable payment intent (spec §3). Construction is the only
/// place field types are validated; everything downstream trusts this shape.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub from_address: Address,
    pub to_address: Address,
    pub amount: Amount,
    pub nonce: String,
    pub timestamp: UnixMillis,
    pub signature: RecoverableSignature,
    pub client_id: String,
    pub api_key: String,
}

impl RawPaymentIntent {
    pub fn parse(self) -> Result<PaymentIntent, IntentError> {
        let from_address = Address::from_str(&self.from_address)
            .map_err(|e| IntentError::InvalidFromAddress(e.to_string()))?;
        let to_address = Address::from_str(&self.to_address)
            .map_err(|e| IntentError::InvalidToAddress(e.to_string()))?;
        let amount = Amount::from_str(&self.amount)
            .map_err(|e| IntentError::InvalidAmount(e.to_string()))?;
        if self.nonce.is_empty() {
            return Err(IntentError::EmptyNonce);
        }
        let sig_bytes = hex::decode(self.signature.trim_start_matches("0x"))
            .map_err(|e| IntentError::InvalidSignature(e.to_string()))?;
        let sig_array: [u8; 65] = sig_bytes
            .try_into()
            .map_err(|_| IntentError::InvalidSignature("expected 65 bytes".to_string()))?;
        Ok(PaymentIntent {
            from_address,
            to_address,
            amount,
            nonce: self.nonce,
            timestamp: UnixMillis(self.timestamp),
            signature: RecoverableSignature(sig_array),
            client_id: self.client_id,
            api_key: self.api_key,
        })
    }
}

impl PaymentIntent {
    /// The canonical message the signer recovers over (spec §3:
    /// "recovering the signer over the canonical message `from:to:amount:timestamp`").
    pub fn canonical_message(&self) -> Vec<u8> {
        format!(
            "{:#x}:{:#x}:{}:{}",
            self.from_address, self.to_address, self.amount, self.timestamp
        )
        .into_bytes()
    }

    /// The key this intent's replay record is stored under.
    pub fn replay_key(&self) -> String {
        format!("nonce_seen:{:#x}:{}", self.from_address, self.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawPaymentIntent {
        RawPaymentIntent {
            from_address: "0x00000000000000000000000000000000000000aa".into(),
            to_address: "0x00000000000000000000000000000000000000bb".into(),
            amount: "0.25".into(),
            nonce: "N1".into(),
            timestamp: 1_000,
            signature: format!("0x{}", "00".repeat(65)),
            client_id: "C".into(),
            api_key: "key".into(),
        }
    }

    #[test]
    fn parses_well_formed_intent() {
        let intent = raw().parse().unwrap();
        assert_eq!(intent.nonce, "N1");
        assert!(!intent.amount.is_zero());
    }

    #[test]
    fn rejects_malformed_amount() {
        let mut r = raw();
        r.amount = "not-a-number".into();
        assert!(matches!(r.parse(), Err(IntentError::InvalidAmount(_))));
    }

    #[test]
    fn rejects_malformed_address() {
        let mut r = raw();
        r.from_address = "not-an-address".into();
        assert!(matches!(r.parse(), Err(IntentError::InvalidFromAddress(_))));
    }

    #[test]
    fn rejects_wrong_length_signature() {
        let mut r = raw();
        r.signature = "0xaabb".into();
        assert!(matches!(r.parse(), Err(IntentError::InvalidSignature(_))));
    }

    #[test]
    fn canonical_message_is_deterministic() {
        let intent = raw().parse().unwrap();
        let a = intent.canonical_message();
        let b = intent.canonical_message();
        assert_eq!(a, b);
    }
}
