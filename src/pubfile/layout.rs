/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fixed header at the start of every base sector, and assembling and parsing base sectors.
//!
//! A base sector is `layout [99] | fanout | metadata JSON | inline payload`, zero-padded to a sector.
//! The inline payload is only present when the fanout is empty.

use super::metadata::PubfileMetadata;
use super::PubfileError;
use crate::filesystem::siafile::CipherType;
use crate::types::constants::SECTOR_SIZE;

/// Size of an encoded [`PubfileLayout`].
pub const LAYOUT_SIZE: usize = 99;

/// The only layout version this crate writes and reads.
pub const PUBFILE_VERSION: u8 = 1;

const CIPHER_TYPE_LEN: usize = 8;

const CIPHER_KEY_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PubfileLayout {
    pub version: u8,
    pub filesize: u64,
    pub metadata_size: u64,
    pub fanout_size: u64,
    pub fanout_data_pieces: u8,
    pub fanout_parity_pieces: u8,
    pub cipher_type: CipherType,
    pub cipher_key: [u8; CIPHER_KEY_LEN],
}

impl PubfileLayout {
    /// Layout of a pubfile with its data inline in the base sector.
    pub fn small(filesize: u64, metadata_size: u64) -> PubfileLayout {
        PubfileLayout {
            version: PUBFILE_VERSION,
            filesize,
            metadata_size,
            fanout_size: 0,
            fanout_data_pieces: 0,
            fanout_parity_pieces: 0,
            cipher_type: CipherType::Plaintext,
            cipher_key: [0u8; CIPHER_KEY_LEN],
        }
    }

    pub fn encode(&self) -> [u8; LAYOUT_SIZE] {
        let mut bytes = [0u8; LAYOUT_SIZE];
        let mut offset = 0;
        bytes[offset] = self.version;
        offset += 1;
        bytes[offset..offset + 8].copy_from_slice(&self.filesize.to_le_bytes());
        offset += 8;
        bytes[offset..offset + 8].copy_from_slice(&self.metadata_size.to_le_bytes());
        offset += 8;
        bytes[offset..offset + 8].copy_from_slice(&self.fanout_size.to_le_bytes());
        offset += 8;
        bytes[offset] = self.fanout_data_pieces;
        offset += 1;
        bytes[offset] = self.fanout_parity_pieces;
        offset += 1;
        bytes[offset] = self.cipher_type.tag();
        offset += CIPHER_TYPE_LEN;
        bytes[offset..offset + CIPHER_KEY_LEN].copy_from_slice(&self.cipher_key);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<PubfileLayout, PubfileError> {
        if bytes.len() < LAYOUT_SIZE {
            return Err(PubfileError::TruncatedLayout(bytes.len()));
        }
        let u64_at = |offset: usize| {
            let mut int = [0u8; 8];
            int.copy_from_slice(&bytes[offset..offset + 8]);
            u64::from_le_bytes(int)
        };
        let cipher_bytes = &bytes[27..27 + CIPHER_TYPE_LEN];
        let cipher_type = match CipherType::from_tag(cipher_bytes[0]) {
            Some(cipher_type) if cipher_bytes[1..].iter().all(|byte| *byte == 0) => cipher_type,
            _ => return Err(PubfileError::UnsupportedCipher(cipher_bytes.to_vec())),
        };
        let mut cipher_key = [0u8; CIPHER_KEY_LEN];
        cipher_key.copy_from_slice(&bytes[35..35 + CIPHER_KEY_LEN]);
        Ok(PubfileLayout {
            version: bytes[0],
            filesize: u64_at(1),
            metadata_size: u64_at(9),
            fanout_size: u64_at(17),
            fanout_data_pieces: bytes[25],
            fanout_parity_pieces: bytes[26],
            cipher_type,
            cipher_key,
        })
    }
}

/// Concatenate the parts of a base sector into a zero-padded sector. Returns the sector and the number
/// of meaningful bytes at its start.
pub fn build_base_sector(layout: &PubfileLayout, fanout: &[u8], metadata: &[u8], payload: &[u8]) -> (Vec<u8>, u64) {
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    let mut offset = 0;
    for part in [&layout.encode()[..], fanout, metadata, payload] {
        sector[offset..offset + part.len()].copy_from_slice(part);
        offset += part.len();
    }
    (sector, offset as u64)
}

/// A parsed base sector.
#[derive(Clone, Debug, PartialEq)]
pub struct BaseSector {
    pub layout: PubfileLayout,
    pub fanout: Vec<u8>,
    pub metadata: PubfileMetadata,
    /// The file's data, if it is stored inline.
    pub payload: Option<Vec<u8>>,
}

/// Parse the first bytes of a base sector, as fetched through a publink.
pub fn parse_base_sector(bytes: &[u8]) -> Result<BaseSector, PubfileError> {
    if bytes.len() as u64 > SECTOR_SIZE {
        return Err(PubfileError::OversizedBaseSector(bytes.len() as u64));
    }
    let layout = PubfileLayout::decode(bytes)?;
    if layout.version != PUBFILE_VERSION {
        return Err(PubfileError::UnsupportedVersion(layout.version));
    }
    let available = bytes.len() as u64;
    let exceeds = PubfileError::HeaderExceedsBaseSector {
        fanout_size: layout.fanout_size,
        metadata_size: layout.metadata_size,
    };
    if layout.fanout_size > SECTOR_SIZE || layout.metadata_size > SECTOR_SIZE {
        return Err(exceeds);
    }
    if LAYOUT_SIZE as u64 + layout.fanout_size + layout.metadata_size > available {
        return Err(exceeds);
    }
    let fanout_start = LAYOUT_SIZE;
    let metadata_start = fanout_start + layout.fanout_size as usize;
    let payload_start = metadata_start + layout.metadata_size as usize;
    let fanout = bytes[fanout_start..metadata_start].to_vec();
    let metadata = PubfileMetadata::from_json(&bytes[metadata_start..payload_start])?;

    let payload = if layout.fanout_size == 0 {
        let truncated = PubfileError::TruncatedPayload {
            expected: layout.filesize,
            found: available - payload_start as u64,
        };
        let payload_end = match (payload_start as u64).checked_add(layout.filesize) {
            Some(end) if end <= available => end,
            _ => return Err(truncated),
        };
        Some(bytes[payload_start..payload_end as usize].to_vec())
    } else {
        None
    };
    Ok(BaseSector {
        layout,
        fanout,
        metadata,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_encoding_is_fixed_size_and_reversible() {
        let layout = PubfileLayout {
            version: 1,
            filesize: 123_456_789,
            metadata_size: 42,
            fanout_size: 6400,
            fanout_data_pieces: 1,
            fanout_parity_pieces: 9,
            cipher_type: CipherType::Plaintext,
            cipher_key: [0u8; 64],
        };
        let bytes = layout.encode();
        assert_eq!(bytes.len(), LAYOUT_SIZE);
        assert_eq!(PubfileLayout::decode(&bytes).unwrap(), layout);
    }

    #[test]
    fn small_base_sectors_carry_their_payload() {
        let metadata = PubfileMetadata::for_file("hello", 0o644, 5).to_json().unwrap();
        let layout = PubfileLayout::small(5, metadata.len() as u64);
        let (sector, fetch_size) = build_base_sector(&layout, &[], &metadata, b"hello");
        assert_eq!(sector.len() as u64, SECTOR_SIZE);
        assert_eq!(fetch_size, (LAYOUT_SIZE + metadata.len() + 5) as u64);

        let parsed = parse_base_sector(&sector[..fetch_size as usize]).unwrap();
        assert_eq!(parsed.layout, layout);
        assert_eq!(parsed.metadata.filename, "hello");
        assert_eq!(parsed.payload.as_deref(), Some(&b"hello"[..]));

        assert!(matches!(
            parse_base_sector(&sector[..fetch_size as usize - 1]),
            Err(PubfileError::TruncatedPayload { expected: 5, found: 4 })
        ));
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let mut layout = PubfileLayout::small(0, 2);
        layout.version = 2;
        let (sector, fetch_size) = build_base_sector(&layout, &[], b"{}", &[]);
        assert!(matches!(
            parse_base_sector(&sector[..fetch_size as usize]),
            Err(PubfileError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn oversized_header_fields_are_rejected() {
        let mut layout = PubfileLayout::small(0, 2);
        layout.fanout_size = u64::MAX;
        let (sector, _) = build_base_sector(&layout, &[], b"{}", &[]);
        assert!(matches!(
            parse_base_sector(&sector[..200]),
            Err(PubfileError::HeaderExceedsBaseSector { fanout_size: u64::MAX, .. })
        ));

        let mut layout = PubfileLayout::small(0, 2);
        layout.metadata_size = u64::MAX - LAYOUT_SIZE as u64;
        let (sector, _) = build_base_sector(&layout, &[], b"{}", &[]);
        assert!(matches!(
            parse_base_sector(&sector[..200]),
            Err(PubfileError::HeaderExceedsBaseSector { .. })
        ));
    }

    #[test]
    fn oversized_filesize_is_a_truncated_payload() {
        let layout = PubfileLayout::small(u64::MAX, 2);
        let (sector, fetch_size) = build_base_sector(&layout, &[], b"{}", b"abc");
        assert!(matches!(
            parse_base_sector(&sector[..fetch_size as usize]),
            Err(PubfileError::TruncatedPayload { expected: u64::MAX, found: 3 })
        ));
    }
}
