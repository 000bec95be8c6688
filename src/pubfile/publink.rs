/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Publinks: 34-byte content addresses of a range of a base sector.
//!
//! ## Binary layout
//!
//! `bitfield u16 LE | merkle root [32]`. The bitfield packs the version and the `(offset, fetch size)`
//! range, from the least significant bit up:
//!
//! 1. Two bits holding `version - 1`.
//! 2. The **mode** `m` in unary: `m` one bits followed by a zero bit. `m` ranges over `0..=7`.
//! 3. Three bits `f` selecting the fetch size.
//! 4. The remaining `10 - m` bits holding the offset in units of the alignment.
//!
//! In mode `m` the alignment is `4096 << m`. Mode 0 fetches `(f + 1) × 4 KiB`, from 4 KiB to 32 KiB.
//! Every higher mode starts where the one below it ends and fetches `4 × align + (f + 1) × align`, so
//! that mode 7 reaches a full sector. Fetch sizes are rounded up to the alignment of the smallest mode
//! that holds them, and offsets must be multiples of that alignment.
//!
//! ## Text form
//!
//! URL-safe base64 without padding, 46 characters. Parsing also accepts a leading `scp://`.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use super::PubfileError;
use crate::types::constants::SECTOR_SIZE;
use crate::types::data_types::SectorRoot;

/// Length of an encoded publink.
pub const PUBLINK_SIZE: usize = 34;

/// Length of the text form of a publink.
pub const ENCODED_PUBLINK_LEN: usize = 46;

const URI_PREFIX: &str = "scp://";

const BASE_ALIGN: u64 = 4096;

const MAX_MODE: u16 = 7;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Publink {
    bitfield: u16,
    merkle_root: SectorRoot,
}

impl Publink {
    /// A version 1 publink for `fetch_size` bytes at `offset` of the sector with `merkle_root`.
    /// `fetch_size` is rounded up to the publink's alignment.
    pub fn new_v1(merkle_root: SectorRoot, offset: u64, fetch_size: u64) -> Result<Publink, PubfileError> {
        if fetch_size == 0 || offset + fetch_size > SECTOR_SIZE {
            return Err(PubfileError::InvalidPublinkRange { offset, fetch_size });
        }
        let mode = (0..=MAX_MODE)
            .find(|&mode| fetch_size <= max_fetch_size(mode))
            .ok_or(PubfileError::InvalidPublinkRange { offset, fetch_size })?;
        let align = BASE_ALIGN << mode;
        if offset % align != 0 {
            return Err(PubfileError::InvalidPublinkRange { offset, fetch_size });
        }
        let base = min_fetch_size(mode) - align;
        let fetch_bits = ((fetch_size - base + align - 1) / align - 1) as u16;

        let mut bitfield = (offset / align) as u16;
        bitfield <<= 3;
        bitfield |= fetch_bits;
        bitfield <<= 1;
        for _ in 0..mode {
            bitfield = (bitfield << 1) | 1;
        }
        bitfield <<= 2;

        let publink = Publink { bitfield, merkle_root };
        // Ranges that do not fit the sector were rejected above, so this only guards the encoding.
        publink.offset_and_fetch_size()?;
        Ok(publink)
    }

    pub fn merkle_root(&self) -> SectorRoot {
        self.merkle_root
    }

    pub fn bitfield(&self) -> u16 {
        self.bitfield
    }

    pub fn version(&self) -> u16 {
        (self.bitfield & 3) + 1
    }

    /// The range of the base sector this publink addresses.
    pub fn offset_and_fetch_size(&self) -> Result<(u64, u64), PubfileError> {
        if self.version() != 1 {
            return Err(PubfileError::UnsupportedPublinkVersion(self.version()));
        }
        let mut bitfield = self.bitfield >> 2;
        let mut mode = 0u16;
        while bitfield & 1 == 1 {
            mode += 1;
            bitfield >>= 1;
        }
        if mode > MAX_MODE {
            return Err(PubfileError::InvalidBitfield(self.bitfield));
        }
        bitfield >>= 1;

        let align = BASE_ALIGN << mode;
        let fetch_bits = (bitfield & 7) as u64 + 1;
        bitfield >>= 3;
        let fetch_size = min_fetch_size(mode) - align + fetch_bits * align;
        let offset = bitfield as u64 * align;
        if fetch_size > max_fetch_size(mode) || offset + fetch_size > SECTOR_SIZE {
            return Err(PubfileError::InvalidBitfield(self.bitfield));
        }
        Ok((offset, fetch_size))
    }

    pub fn to_bytes(&self) -> [u8; PUBLINK_SIZE] {
        let mut bytes = [0u8; PUBLINK_SIZE];
        bytes[..2].copy_from_slice(&self.bitfield.to_le_bytes());
        bytes[2..].copy_from_slice(&self.merkle_root.bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Publink, PubfileError> {
        if bytes.len() != PUBLINK_SIZE {
            return Err(PubfileError::InvalidPublinkLength(bytes.len()));
        }
        let bitfield = u16::from_le_bytes([bytes[0], bytes[1]]);
        let mut root = [0u8; 32];
        root.copy_from_slice(&bytes[2..]);
        let publink = Publink {
            bitfield,
            merkle_root: SectorRoot::new(root),
        };
        publink.offset_and_fetch_size()?;
        Ok(publink)
    }
}

/// Smallest fetch size mode `mode` encodes.
fn min_fetch_size(mode: u16) -> u64 {
    let align = BASE_ALIGN << mode;
    if mode == 0 {
        align
    } else {
        5 * align
    }
}

/// Largest fetch size mode `mode` is used for. Mode 0 covers 1 to 8 alignments, every other mode 5 to 8.
fn max_fetch_size(mode: u16) -> u64 {
    8 * (BASE_ALIGN << mode)
}

impl Display for Publink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.to_bytes()))
    }
}

impl fmt::Debug for Publink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Publink {
    type Err = PubfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix(URI_PREFIX).unwrap_or(s);
        // Anything after the link itself, like a path into a directory pubfile, is not part of it.
        let s = s.split(['/', '?']).next().unwrap_or(s);
        if s.len() != ENCODED_PUBLINK_LEN {
            return Err(PubfileError::InvalidPublinkLength(s.len()));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|err| PubfileError::InvalidPublinkEncoding(err.to_string()))?;
        Publink::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> SectorRoot {
        SectorRoot::new([7u8; 32])
    }

    #[test]
    fn ranges_survive_encoding() {
        let cases = [
            (0, 4096),
            (4096, 8192),
            (0, 32 * 1024),
            (0, 40 * 1024),
            (64 * 1024, 64 * 1024),
            (0, 1 << 20),
            (0, SECTOR_SIZE),
            (SECTOR_SIZE - 4096, 4096),
        ];
        for (offset, fetch_size) in cases {
            let publink = Publink::new_v1(root(), offset, fetch_size).unwrap();
            assert_eq!(publink.offset_and_fetch_size().unwrap(), (offset, fetch_size), "{} {}", offset, fetch_size);
            let parsed: Publink = publink.to_string().parse().unwrap();
            assert_eq!(parsed, publink);
            assert_eq!(publink.to_string().len(), ENCODED_PUBLINK_LEN);
        }
    }

    #[test]
    fn fetch_sizes_round_up_to_the_alignment() {
        let publink = Publink::new_v1(root(), 0, 99 + 30 + 13).unwrap();
        assert_eq!(publink.offset_and_fetch_size().unwrap(), (0, 4096));

        let publink = Publink::new_v1(root(), 0, 33 * 1024).unwrap();
        assert_eq!(publink.offset_and_fetch_size().unwrap(), (0, 40 * 1024));

        let publink = Publink::new_v1(root(), 0, SECTOR_SIZE - 1).unwrap();
        assert_eq!(publink.offset_and_fetch_size().unwrap(), (0, SECTOR_SIZE));
    }

    #[test]
    fn ranges_outside_the_sector_are_rejected() {
        assert!(Publink::new_v1(root(), 0, 0).is_err());
        assert!(Publink::new_v1(root(), 4096, SECTOR_SIZE).is_err());
        // Large fetches need coarse offsets.
        assert!(Publink::new_v1(root(), 4096, 1 << 20).is_err());
    }

    #[test]
    fn text_form_accepts_prefix_and_rejects_garbage() {
        let publink = Publink::new_v1(root(), 0, 4096).unwrap();
        let text = format!("scp://{}", publink);
        assert_eq!(text.parse::<Publink>().unwrap(), publink);
        assert_eq!(format!("{}/index.html", publink).parse::<Publink>().unwrap(), publink);
        assert!("not a publink".parse::<Publink>().is_err());

        let mut bytes = publink.to_bytes();
        bytes[0] |= 1;
        assert!(matches!(
            Publink::from_bytes(&bytes),
            Err(PubfileError::UnsupportedPublinkVersion(2))
        ));
    }
}
