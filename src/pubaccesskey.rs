/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pubaccesskeys: named symmetric keys for pubfiles.
//!
//! A key's entropy is a 32-byte key followed by a 24-byte nonce. Subkeys keep the key and swap the
//! nonce, so every subkey of a key shares its [ID](Pubaccesskey::id), which hashes only the key.
//!
//! ## Text form
//!
//! `pubaccesskey:<url-safe base64 of type byte and entropy>?name=<name>`. The query is left out for
//! unnamed keys, and the scheme may be left out when parsing.

pub mod manager;

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use rand_core::{OsRng, RngCore};

use crate::types::crypto_primitives::{hash_all, new_specifier, Specifier};

pub use manager::PubaccesskeyManager;

pub const PUBACCESSKEY_SCHEME: &str = "pubaccesskey";

pub const PUBACCESSKEY_ID_LEN: usize = 16;

/// Longest name a key may have, in bytes.
pub const MAX_KEY_NAME_LEN: usize = 128;

pub const KEY_SIZE: usize = 32;

pub const NONCE_SIZE: usize = 24;

pub const ENTROPY_SIZE: usize = KEY_SIZE + NONCE_SIZE;

const PUBACCESSKEY_SPECIFIER: Specifier = new_specifier("Pubaccesskey");

#[derive(Debug, thiserror::Error)]
pub enum PubaccesskeyError {
    #[error("pubaccesskey name is {0} bytes long, more than the {} allowed", MAX_KEY_NAME_LEN)]
    NameTooLong(usize),

    #[error("a pubaccesskey named '{0}' already exists")]
    NameExists(String),

    #[error("a pubaccesskey with ID {0} already exists")]
    IdExists(PubaccesskeyID),

    #[error("invalid pubaccesskey type '{0}'")]
    InvalidType(String),

    #[error("pubaccesskey entropy must be {} bytes, got {0}", ENTROPY_SIZE)]
    InvalidEntropyLength(usize),

    #[error("nonce must be {} bytes, got {0}", NONCE_SIZE)]
    InvalidNonceLength(usize),

    #[error("invalid pubaccesskey encoding: {0}")]
    InvalidEncoding(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PubaccesskeyType {
    /// Files encrypted with the key reveal its ID.
    PublicID,
    /// Files encrypted with the key carry an identifier only the key holder can recognise.
    PrivateID,
}

impl PubaccesskeyType {
    pub fn tag(&self) -> u8 {
        match self {
            PubaccesskeyType::PublicID => 0x01,
            PubaccesskeyType::PrivateID => 0x02,
        }
    }

    pub fn from_tag(tag: u8) -> Option<PubaccesskeyType> {
        match tag {
            0x01 => Some(PubaccesskeyType::PublicID),
            0x02 => Some(PubaccesskeyType::PrivateID),
            _ => None,
        }
    }
}

impl Display for PubaccesskeyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PubaccesskeyType::PublicID => write!(f, "public-id"),
            PubaccesskeyType::PrivateID => write!(f, "private-id"),
        }
    }
}

impl FromStr for PubaccesskeyType {
    type Err = PubaccesskeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public-id" => Ok(PubaccesskeyType::PublicID),
            "private-id" => Ok(PubaccesskeyType::PrivateID),
            other => Err(PubaccesskeyError::InvalidType(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubaccesskeyID([u8; PUBACCESSKEY_ID_LEN]);

impl PubaccesskeyID {
    pub fn bytes(&self) -> [u8; PUBACCESSKEY_ID_LEN] {
        self.0
    }
}

impl Display for PubaccesskeyID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE.encode(self.0))
    }
}

impl fmt::Debug for PubaccesskeyID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for PubaccesskeyID {
    type Err = PubaccesskeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_base64(s)?;
        let id: [u8; PUBACCESSKEY_ID_LEN] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| PubaccesskeyError::InvalidEncoding(format!("ID of {} bytes", bytes.len())))?;
        Ok(PubaccesskeyID(id))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Pubaccesskey {
    pub name: String,
    pub key_type: PubaccesskeyType,
    entropy: [u8; ENTROPY_SIZE],
}

impl Pubaccesskey {
    /// A key with fresh random entropy.
    pub fn generate(name: &str, key_type: PubaccesskeyType) -> Result<Pubaccesskey, PubaccesskeyError> {
        check_name(name)?;
        let mut entropy = [0u8; ENTROPY_SIZE];
        OsRng.fill_bytes(&mut entropy);
        Ok(Pubaccesskey {
            name: name.to_string(),
            key_type,
            entropy,
        })
    }

    pub fn from_entropy(name: &str, key_type: PubaccesskeyType, entropy: &[u8]) -> Result<Pubaccesskey, PubaccesskeyError> {
        check_name(name)?;
        let entropy = entropy
            .try_into()
            .map_err(|_| PubaccesskeyError::InvalidEntropyLength(entropy.len()))?;
        Ok(Pubaccesskey {
            name: name.to_string(),
            key_type,
            entropy,
        })
    }

    pub fn entropy(&self) -> &[u8; ENTROPY_SIZE] {
        &self.entropy
    }

    pub fn key(&self) -> &[u8] {
        &self.entropy[..KEY_SIZE]
    }

    pub fn nonce(&self) -> &[u8] {
        &self.entropy[KEY_SIZE..]
    }

    /// First 16 bytes of the hash of the specifier, the type and the key. The nonce is left out.
    pub fn id(&self) -> PubaccesskeyID {
        let hash = hash_all(&[&PUBACCESSKEY_SPECIFIER[..], &[self.key_type.tag()][..], self.key()]);
        let mut id = [0u8; PUBACCESSKEY_ID_LEN];
        id.copy_from_slice(&hash.bytes()[..PUBACCESSKEY_ID_LEN]);
        PubaccesskeyID(id)
    }

    /// The same key with `nonce`.
    pub fn subkey_with_nonce(&self, nonce: &[u8]) -> Result<Pubaccesskey, PubaccesskeyError> {
        if nonce.len() != NONCE_SIZE {
            return Err(PubaccesskeyError::InvalidNonceLength(nonce.len()));
        }
        let mut entropy = self.entropy;
        entropy[KEY_SIZE..].copy_from_slice(nonce);
        Ok(Pubaccesskey {
            name: self.name.clone(),
            key_type: self.key_type,
            entropy,
        })
    }

    /// The subkey whose nonce is derived from this key's nonce and `derivation`. Deterministic.
    pub fn derive_subkey(&self, derivation: &[u8]) -> Pubaccesskey {
        let hash = hash_all(&[self.nonce(), derivation]);
        let mut entropy = self.entropy;
        entropy[KEY_SIZE..].copy_from_slice(&hash.bytes()[..NONCE_SIZE]);
        Pubaccesskey {
            name: self.name.clone(),
            key_type: self.key_type,
            entropy,
        }
    }

    /// A subkey with a random nonce, for encrypting a single file.
    pub fn generate_file_specific_subkey(&self) -> Pubaccesskey {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let mut entropy = self.entropy;
        entropy[KEY_SIZE..].copy_from_slice(&nonce);
        Pubaccesskey {
            name: self.name.clone(),
            key_type: self.key_type,
            entropy,
        }
    }

    /// Whether the two keys hold the same type and entropy, names aside.
    pub fn equal_data(&self, other: &Pubaccesskey) -> bool {
        self.key_type == other.key_type && self.entropy == other.entropy
    }
}

impl fmt::Debug for Pubaccesskey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pubaccesskey")
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .field("id", &self.id())
            .finish()
    }
}

impl Display for Pubaccesskey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut data = Vec::with_capacity(1 + ENTROPY_SIZE);
        data.push(self.key_type.tag());
        data.extend_from_slice(&self.entropy);
        write!(f, "{}:{}", PUBACCESSKEY_SCHEME, URL_SAFE.encode(data))?;
        if !self.name.is_empty() {
            write!(f, "?name={}", escape_query(&self.name))?;
        }
        Ok(())
    }
}

impl FromStr for Pubaccesskey {
    type Err = PubaccesskeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = match s.split_once(':') {
            Some((PUBACCESSKEY_SCHEME, rest)) => rest,
            Some((scheme, _)) => {
                return Err(PubaccesskeyError::InvalidEncoding(format!("unknown scheme '{}'", scheme)));
            }
            None => s,
        };
        let (data, query) = s.split_once('?').unwrap_or((s, ""));
        let mut name = String::new();
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            if let Some(("name", value)) = pair.split_once('=') {
                name = unescape_query(value)?;
            }
        }

        let data = decode_base64(data)?;
        let (tag, entropy) = data
            .split_first()
            .ok_or_else(|| PubaccesskeyError::InvalidEncoding("empty key".into()))?;
        let key_type = PubaccesskeyType::from_tag(*tag)
            .ok_or_else(|| PubaccesskeyError::InvalidType(format!("tag {:#04x}", tag)))?;
        Pubaccesskey::from_entropy(&name, key_type, entropy)
    }
}

pub(crate) fn check_name(name: &str) -> Result<(), PubaccesskeyError> {
    if name.len() > MAX_KEY_NAME_LEN {
        return Err(PubaccesskeyError::NameTooLong(name.len()));
    }
    Ok(())
}

fn decode_base64(s: &str) -> Result<Vec<u8>, PubaccesskeyError> {
    URL_SAFE
        .decode(s)
        .or_else(|_| URL_SAFE_NO_PAD.decode(s))
        .map_err(|err| PubaccesskeyError::InvalidEncoding(err.to_string()))
}

/// Percent-encode everything but unreserved URL characters.
fn escape_query(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => escaped.push(byte as char),
            b' ' => escaped.push('+'),
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

fn unescape_query(value: &str) -> Result<String, PubaccesskeyError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = value
                    .get(i + 1..i + 3)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| PubaccesskeyError::InvalidEncoding(format!("bad escape in '{}'", value)))?;
                out.push(hex);
                i += 2;
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8(out).map_err(|err| PubaccesskeyError::InvalidEncoding(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subkeys_share_the_id_of_their_key() {
        let key = Pubaccesskey::generate("key", PubaccesskeyType::PrivateID).unwrap();
        let file_key = key.generate_file_specific_subkey();
        assert_eq!(file_key.id(), key.id());
        assert_eq!(file_key.key(), key.key());
        assert_ne!(file_key.nonce(), key.nonce());

        let derived = key.derive_subkey(b"fanout");
        assert_eq!(derived, key.derive_subkey(b"fanout"));
        assert_ne!(derived, key.derive_subkey(b"base sector"));
        assert_eq!(derived.id(), key.id());

        assert!(matches!(
            key.subkey_with_nonce(&[0u8; 12]),
            Err(PubaccesskeyError::InvalidNonceLength(12))
        ));
        assert_eq!(key.subkey_with_nonce(&[9u8; NONCE_SIZE]).unwrap().nonce(), &[9u8; NONCE_SIZE]);
    }

    #[test]
    fn the_type_is_part_of_the_id() {
        let key = Pubaccesskey::generate("", PubaccesskeyType::PublicID).unwrap();
        let other = Pubaccesskey::from_entropy("", PubaccesskeyType::PrivateID, key.entropy()).unwrap();
        assert_ne!(key.id(), other.id());
    }

    #[test]
    fn text_form_round_trips_names_and_rejects_garbage() {
        let key = Pubaccesskey::generate("my key & more", PubaccesskeyType::PublicID).unwrap();
        let text = key.to_string();
        assert!(text.starts_with("pubaccesskey:"));
        assert!(text.ends_with("?name=my+key+%26+more"));
        assert_eq!(text.parse::<Pubaccesskey>().unwrap(), key);

        let unnamed = Pubaccesskey::generate("", PubaccesskeyType::PrivateID).unwrap();
        assert!(!unnamed.to_string().contains('?'));
        let bare = unnamed.to_string().trim_start_matches("pubaccesskey:").to_string();
        assert_eq!(bare.parse::<Pubaccesskey>().unwrap(), unnamed);

        assert!("http:abc".parse::<Pubaccesskey>().is_err());
        assert!("pubaccesskey:AAAA".parse::<Pubaccesskey>().is_err());

        let id = key.id();
        assert_eq!(id.to_string().parse::<PubaccesskeyID>().unwrap(), id);
    }

    #[test]
    fn long_names_are_rejected() {
        let name = "n".repeat(MAX_KEY_NAME_LEN + 1);
        assert!(matches!(
            Pubaccesskey::generate(&name, PubaccesskeyType::PublicID),
            Err(PubaccesskeyError::NameTooLong(129))
        ));
    }
}
