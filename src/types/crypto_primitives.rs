/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.

use super::data_types::CryptoHash;

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

/// Hash the concatenation of every slice in `parts`.
pub fn hash_all(parts: &[&[u8]]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    for part in parts {
        hasher.update(part);
    }
    CryptoHash::new(hasher.finalize().into())
}

/// Hash a single byte slice.
pub fn hash_bytes(bytes: &[u8]) -> CryptoHash {
    hash_all(&[bytes])
}

/// A 16-byte, zero-padded ASCII tag used to domain-separate hashes and to label persisted files.
pub type Specifier = [u8; 16];

/// Build a [`Specifier`] from `s`, truncating it to 16 bytes.
pub const fn new_specifier(s: &str) -> Specifier {
    let bytes = s.as_bytes();
    let mut spec = [0u8; 16];
    let mut i = 0;
    while i < bytes.len() && i < 16 {
        spec[i] = bytes[i];
        i += 1;
    }
    spec
}
