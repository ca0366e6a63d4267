//! Shared test fixtures for constructing signed [`PaymentIntent`]s without
//! repeating the signing dance in every module's `#[cfg(test)]` block.

#![cfg(test)]

use crate::chain::RecoverableSignature;
use crate::intent::PaymentIntent;
use crate::money::Amount;
use crate::timestamp::UnixMillis;
use alloy_primitives::Address;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use std::str::FromStr;

/// Builds a well-formed, validly-signed intent from `client_id`.
/// `from_address` is a freshly generated signer's own address, so
/// [`crate::chain::verify_message`] always recovers it.
pub fn signed_intent(client_id: &str, nonce: &str, amount: &str, timestamp: u64) -> PaymentIntent {
    let signer = PrivateKeySigner::random();
    let from_address = signer.address();
    let to_address = Address::from_str("0x00000000000000000000000000000000000000bb").unwrap();
    let mut intent = PaymentIntent {
        from_address,
        to_address,
        amount: Amount::from_str(amount).unwrap(),
        nonce: nonce.to_string(),
        timestamp: UnixMillis(timestamp),
        signature: RecoverableSignature([0u8; 65]),
        client_id: client_id.to_string(),
        api_key: "key".to_string(),
    };
    let hash = alloy_primitives::keccak256(intent.canonical_message());
    let sig = signer.sign_hash_sync(&hash).unwrap();
    intent.signature = RecoverableSignature(sig.as_bytes());
    intent
}
