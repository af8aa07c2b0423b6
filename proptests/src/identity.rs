//! Property-based tests for peer identity signatures.
//!
//! Tests the following invariants:
//! - A signature from the staking key verifies for the signed peer id
//! - Tampered signatures, other peer ids and other keys are rejected

use bucket::identity::{StakingIdentity, verify_peer_identity};
use ed25519_dalek::SigningKey;
use proptest::prelude::*;

fn identity(seed: [u8; 32]) -> StakingIdentity {
    StakingIdentity::from_signing_key(SigningKey::from_bytes(&seed))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_signature_verifies(
        key_seed in prop::array::uniform32(any::<u8>()),
        peer_id in "[a-z0-9]{8,64}",
    ) {
        let id = identity(key_seed);
        let sig = id.sign_peer_identity(peer_id.as_bytes()).to_bytes();
        prop_assert!(verify_peer_identity(&id.public_key(), peer_id.as_bytes(), &sig));

        // The hex forms used on the wire round-trip.
        let account = hex::decode(id.account_hex()).unwrap();
        let public_key = id.public_key();
        prop_assert_eq!(account.as_slice(), public_key.as_slice());
    }

    #[test]
    fn prop_tampered_signature_rejected(
        key_seed in prop::array::uniform32(any::<u8>()),
        peer_id in "[a-z0-9]{8,64}",
        tamper_byte in 0usize..64,
        tamper_bit in 0u8..8,
    ) {
        let id = identity(key_seed);
        let mut sig = id.sign_peer_identity(peer_id.as_bytes()).to_bytes();
        sig[tamper_byte] ^= 1 << tamper_bit;
        prop_assert!(!verify_peer_identity(&id.public_key(), peer_id.as_bytes(), &sig));
    }

    #[test]
    fn prop_signature_bound_to_peer_and_key(
        seed1 in prop::array::uniform32(any::<u8>()),
        seed2 in prop::array::uniform32(any::<u8>()),
        peer_a in "[a-z0-9]{8,64}",
        peer_b in "[a-z0-9]{8,64}",
    ) {
        prop_assume!(seed1 != seed2);
        prop_assume!(peer_a != peer_b);

        let signer = identity(seed1);
        let other = identity(seed2);
        let sig = signer.sign_peer_identity(peer_a.as_bytes()).to_bytes();

        prop_assert!(!verify_peer_identity(&signer.public_key(), peer_b.as_bytes(), &sig));
        prop_assert!(!verify_peer_identity(&other.public_key(), peer_a.as_bytes(), &sig));
    }
}
