/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Length-prefixed borsh framing of protocol messages.

use std::io::{self, Read, Write};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::RenterError;
use crate::types::constants::SECTOR_SIZE;

/// Largest message either side accepts: a sector of data plus generous room for proofs and headers.
pub const MAX_MESSAGE_SIZE: usize = 2 * SECTOR_SIZE as usize + (1 << 20);

/// Write `message` as `[len u32 LE][borsh bytes]` and flush.
pub fn write_message<T: BorshSerialize>(stream: &mut (impl Write + ?Sized), message: &T) -> Result<(), RenterError> {
    let bytes = message
        .try_to_vec()
        .map_err(|err| RenterError::Encoding(err.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(RenterError::InvalidArgument(format!(
            "message of {} bytes exceeds the protocol limit",
            bytes.len()
        )));
    }
    let mut framed = Vec::with_capacity(4 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    framed.extend_from_slice(&bytes);
    stream.write_all(&framed).map_err(network_error)?;
    stream.flush().map_err(network_error)
}

/// Read one message written by [`write_message`].
pub fn read_message<T: BorshDeserialize>(stream: &mut (impl Read + ?Sized)) -> Result<T, RenterError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).map_err(network_error)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RenterError::HostProtocolViolation(format!(
            "peer sent a {} byte message, limit is {}",
            len, MAX_MESSAGE_SIZE
        )));
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).map_err(network_error)?;
    T::try_from_slice(&bytes).map_err(|err| RenterError::HostProtocolViolation(format!("undecodable message: {}", err)))
}

/// Classify an I/O failure on a host connection.
pub fn network_error(err: io::Error) -> RenterError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RenterError::Timeout,
        _ => RenterError::Transient(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_length_prefix_is_a_protocol_violation() {
        let mut bytes = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        let err = read_message::<u64>(&mut bytes.as_slice()).unwrap_err();
        assert!(err.is_contract_fatal());
    }

    #[test]
    fn truncated_stream_is_transient() {
        let mut buf = Vec::new();
        write_message(&mut buf, &(7u64, String::from("sector"))).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(read_message::<(u64, String)>(&mut buf.as_slice()).unwrap_err().is_transient());
    }
}
