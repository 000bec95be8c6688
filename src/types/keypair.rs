/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [Keypair] type as an object used to sign revisions and access the public key.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};

use super::crypto_primitives::hash_all;
use super::data_types::{CryptoHash, HostPublicKey, SignatureBytes};

/// A wrapper around [SigningKey](ed25519_dalek::SigningKey) which implements a
/// [convenience method](Keypair::sign) for creating signatures.
#[derive(Clone)]
pub struct Keypair(pub(crate) SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Convenience method for creating signatures over hashes.
    pub fn sign(&self, message: &CryptoHash) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(&message.bytes()).to_bytes())
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    pub fn public_key(&self) -> HostPublicKey {
        HostPublicKey::from(self.0.verifying_key())
    }
}

/// Seed from which every contract signing key of the renter is derived. Recovering the seed is enough to
/// find the renter's contracts on the blockchain again.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RenterSeed([u8; 32]);

impl RenterSeed {
    /// Derive the renter seed from the wallet's primary seed.
    pub fn from_wallet_seed(wallet_seed: &[u8; 32]) -> RenterSeed {
        RenterSeed(hash_all(&[b"renter", wallet_seed]).bytes())
    }

    /// The keypair the renter uses for contracts with `host`.
    pub fn contract_keypair(&self, host: &HostPublicKey) -> Keypair {
        let secret = hash_all(&[&self.0, &host.bytes()]);
        Keypair::new(SigningKey::from_bytes(&secret.bytes()))
    }
}
