/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    net::IpAddr,
    ops::{Add, AddAssign, Sub},
};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};

use super::crypto_primitives::{Signature, SignatureError, VerifyingKey};

/// 32-byte cryptographic hash.
///
/// Within the renter these are always SHA256 hashes: sector Merkle roots, contract file roots, and the
/// identifiers derived from them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Whether every byte of this hash is zero. The zero hash marks empty slots in piece tables.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", STANDARD_NO_PAD.encode(self.0))
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Merkle root of a single sector.
pub type SectorRoot = CryptoHash;

/// Identifier of a file contract. Derived from the hash of the transaction that formed it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshDeserialize, BorshSerialize)]
pub struct ContractID([u8; 32]);

impl ContractID {
    /// Create a new `ContractID` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `ContractID`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl From<CryptoHash> for ContractID {
    fn from(hash: CryptoHash) -> Self {
        ContractID(hash.bytes())
    }
}

impl Display for ContractID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", STANDARD_NO_PAD.encode(self.0))
    }
}

impl Debug for ContractID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Ed25519 public key of a host, stored as bytes so that it can be hashed, ordered, and persisted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshDeserialize, BorshSerialize)]
pub struct HostPublicKey([u8; 32]);

impl HostPublicKey {
    /// Create a new `HostPublicKey` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `HostPublicKey`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Convert into a `VerifyingKey` so that signatures made by the host can be checked.
    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }
}

impl From<VerifyingKey> for HostPublicKey {
    fn from(key: VerifyingKey) -> Self {
        HostPublicKey(key.to_bytes())
    }
}

impl Display for HostPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ed25519:{}", STANDARD_NO_PAD.encode(self.0))
    }
}

impl Debug for HostPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Ed25519 digital signature.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }

    /// Get the `ed25519_dalek` representation of this signature.
    pub fn signature(&self) -> Signature {
        Signature::from_bytes(&self.0)
    }
}

impl Default for SignatureBytes {
    fn default() -> Self {
        SignatureBytes([0u8; 64])
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", STANDARD_NO_PAD.encode(self.0))
    }
}

/// Height of a block in the blockchain the contracts are anchored in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshDeserialize, BorshSerialize)]
pub struct BlockHeight(u64);

impl BlockHeight {
    /// Create a new `BlockHeight` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `BlockHeight`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Number of blocks between `earlier` and `self`, or 0 if `earlier` is not earlier.
    pub fn saturating_sub(&self, earlier: BlockHeight) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<u64> for BlockHeight {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Add<u64> for BlockHeight {
    type Output = BlockHeight;
    fn add(self, rhs: u64) -> Self::Output {
        BlockHeight::new(self.0.saturating_add(rhs))
    }
}

impl Sub<u64> for BlockHeight {
    type Output = BlockHeight;
    fn sub(self, rhs: u64) -> Self::Output {
        BlockHeight::new(self.0.saturating_sub(rhs))
    }
}

/// Identifier of a consensus change delivered by the [consensus set](crate::collaborators::ConsensusSet).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, BorshDeserialize, BorshSerialize)]
pub struct ConsensusChangeID(CryptoHash);

impl ConsensusChangeID {
    /// The ID that asks a consensus set to deliver every change since genesis.
    pub const BEGINNING: ConsensusChangeID = ConsensusChangeID(CryptoHash::new([0u8; 32]));

    /// Create a new `ConsensusChangeID` wrapping `hash`.
    pub const fn new(hash: CryptoHash) -> Self {
        Self(hash)
    }

    /// Get the inner hash.
    pub const fn hash(&self) -> CryptoHash {
        self.0
    }
}

/// Network address of a host in `host:port` form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Debug, BorshDeserialize, BorshSerialize)]
pub struct NetAddress(String);

impl NetAddress {
    /// Create a new `NetAddress` from `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host part of the address, without the port and without IPv6 brackets.
    pub fn host(&self) -> &str {
        let host = match self.0.rfind(':') {
            Some(idx) if !self.0[..idx].is_empty() => &self.0[..idx],
            _ => &self.0,
        };
        host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Key identifying the subnet this address lives in: the /24 for IPv4 addresses and the /54 for IPv6
    /// addresses. Returns `None` if the host part is not an IP literal.
    pub fn subnet(&self) -> Option<Vec<u8>> {
        let ip: IpAddr = self.host().parse().ok()?;
        match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                Some(vec![4, octets[0], octets[1], octets[2]])
            }
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                // 54 bits: six full bytes and the top six bits of the seventh.
                let mut key = vec![6];
                key.extend_from_slice(&octets[..6]);
                key.push(octets[6] & 0b1111_1100);
                Some(key)
            }
        }
    }
}

impl Display for NetAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_hosts_in_the_same_slash_24_share_a_subnet() {
        let a = NetAddress::new("10.0.1.5:9982");
        let b = NetAddress::new("10.0.1.200:9982");
        let c = NetAddress::new("10.0.2.5:9982");
        assert_eq!(a.subnet(), b.subnet());
        assert_ne!(a.subnet(), c.subnet());
    }

    #[test]
    fn ipv6_subnet_ignores_the_low_bits_of_the_seventh_byte() {
        let a = NetAddress::new("[2001:db8:1:0203::1]:9982");
        let b = NetAddress::new("[2001:db8:1:0200::1]:9982");
        let c = NetAddress::new("[2001:db8:1:0600::1]:9982");
        assert_eq!(a.host(), "2001:db8:1:0203::1");
        assert_eq!(a.subnet(), b.subnet());
        assert_ne!(a.subnet(), c.subnet());
    }

    #[test]
    fn hostnames_have_no_subnet() {
        assert_eq!(NetAddress::new("host.example:9982").subnet(), None);
    }
}
