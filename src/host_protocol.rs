/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The wire protocol spoken between the renter and hosts.
//!
//! ## Connections
//!
//! The renter reaches hosts through a pluggable [`HostDialer`], which turns a host's announced
//! [`NetAddress`] into a byte stream. Every stream is wrapped in a
//! [`RateLimitedStream`](rate_limit::RateLimitedStream) sharing the renter's global rate limits. One
//! connection carries exactly one RPC.
//!
//! ## Messages
//!
//! Every message is a borsh-encoded value framed by a little-endian `u32` length ([`framing`]). An RPC
//! starts with a [`Request`](messages::Request); every answer of the host is a
//! `Result<_, RpcError>` so that the host can refuse at any step.
//!
//! ## Programs
//!
//! Sector-level operations are expressed as programs of [`Instruction`](program::Instruction)s executed
//! by the host against a contract, quoted against a [`PriceTable`](price_table::PriceTable) and paid for
//! up front with a contract revision. A program that changes the contract's sectors ends with a
//! finalisation step in which both parties sign a revision committing to the new sector roots.

pub mod framing;

pub mod messages;

pub mod price_table;

pub mod program;

pub mod rate_limit;

pub mod session;

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::types::data_types::NetAddress;

/// A bidirectional byte stream to a host.
pub trait HostStream: Read + Write + Send {
    /// Bound how long a single read or write may block. `None` removes the bound.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let _ = timeout;
        Ok(())
    }
}

/// Opens connections to hosts.
pub trait HostDialer: Send + Sync {
    fn dial(&self, address: &NetAddress) -> io::Result<Box<dyn HostStream>>;
}

impl HostStream for TcpStream {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

/// Dials hosts over TCP.
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        TcpDialer {
            connect_timeout: Duration::from_secs(45),
        }
    }
}

impl HostDialer for TcpDialer {
    fn dial(&self, address: &NetAddress) -> io::Result<Box<dyn HostStream>> {
        let socket_address = address
            .as_str()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", address)))?;
        let stream = TcpStream::connect_timeout(&socket_address, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
