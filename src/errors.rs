/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The closed set of ways a renter operation can fail.
//!
//! Every fallible public function in this crate returns a [`RenterError`]. The variants map one-to-one
//! onto the kinds of failure callers need to tell apart:
//!
//! | Variant | Reaction |
//! |---|---|
//! | [`Transient`](RenterError::Transient) | retry with backoff, counts towards cooldown |
//! | [`HostProtocolViolation`](RenterError::HostProtocolViolation), [`HostSignatureInvalid`](RenterError::HostSignatureInvalid) | mark the contract bad |
//! | [`PriceGouging`](RenterError::PriceGouging) | exclude the host for this period, raise an alert |
//! | [`RevisionMismatch`](RenterError::RevisionMismatch) | set the worker's suspect flag and resync |
//! | [`InsufficientFunds`](RenterError::InsufficientFunds) | refresh the contract |
//! | [`NotFound`](RenterError::NotFound) | surfaced to the caller |
//! | [`Blacklisted`](RenterError::Blacklisted) | surfaced verbatim to the caller |
//! | [`StorageObligationNotFound`](RenterError::StorageObligationNotFound) | the host lost our data; mark the contract bad |
//!
//! Context is attached with [`RenterError::add_context`] (or [`ResultExt::context`]), and several
//! failures are folded into one with [`RenterError::compose`]. The `is_*` predicates look through both
//! wrappers, so a caller can ask "was this ultimately a not-found?" without unwrapping by hand.

use std::fmt::{self, Display, Formatter};

use crate::contractor::allowance::AllowanceError;
use crate::filesystem::path::PathError;
use crate::pubaccesskey::PubaccesskeyError;
use crate::pubfile::PubfileError;
use crate::refcounter::RefcounterError;
use crate::types::data_types::{ContractID, HostPublicKey, SectorRoot};

#[derive(Debug, thiserror::Error)]
pub enum RenterError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("host violated the protocol: {0}")]
    HostProtocolViolation(String),

    #[error("host signature is invalid")]
    HostSignatureInvalid,

    #[error("price gouging detected: {0}")]
    PriceGouging(String),

    #[error("revision mismatch: renter has revision {ours}, host has revision {theirs}")]
    RevisionMismatch { ours: u64, theirs: u64 },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("{0} not found")]
    NotFound(NotFoundKind),

    #[error("publink is blacklisted")]
    Blacklisted,

    #[error("host has no storage obligation for this contract")]
    StorageObligationNotFound,

    #[error("{0} already exists")]
    Exists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Allowance(#[from] AllowanceError),

    #[error(transparent)]
    Refcounter(#[from] RefcounterError),

    #[error(transparent)]
    Pubfile(#[from] PubfileError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Pubaccesskey(#[from] PubaccesskeyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("renter is shutting down")]
    Shutdown,

    #[error("critical: {0}")]
    Critical(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<RenterError>,
    },

    #[error("{}", join_errors(.0))]
    Composite(Vec<RenterError>),
}

/// What could not be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFoundKind {
    File(String),
    Directory(String),
    Contract(ContractID),
    Host(HostPublicKey),
    Worker(HostPublicKey),
    Sector(SectorRoot),
    BlacklistEntry(SectorRoot),
    Backup(String),
    Pubaccesskey(String),
}

impl Display for NotFoundKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundKind::File(path) => write!(f, "file '{}'", path),
            NotFoundKind::Directory(path) => write!(f, "directory '{}'", path),
            NotFoundKind::Contract(id) => write!(f, "contract {}", id),
            NotFoundKind::Host(host) => write!(f, "host {}", host),
            NotFoundKind::Worker(host) => write!(f, "worker for host {}", host),
            NotFoundKind::Sector(root) => write!(f, "sector {}", root),
            NotFoundKind::BlacklistEntry(root) => write!(f, "blacklist entry {}", root),
            NotFoundKind::Backup(name) => write!(f, "backup '{}'", name),
            NotFoundKind::Pubaccesskey(key) => write!(f, "pubaccesskey '{}'", key),
        }
    }
}

fn join_errors(errors: &[RenterError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl RenterError {
    /// Wrap `self` with a human-readable description of what was being attempted.
    pub fn add_context(self, context: impl Into<String>) -> RenterError {
        RenterError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Fold any number of optional errors into one. Returns `None` if every input is `None`, the error
    /// itself if exactly one is present, and a [`Composite`](RenterError::Composite) otherwise.
    pub fn compose(errors: impl IntoIterator<Item = Option<RenterError>>) -> Option<RenterError> {
        let mut present: Vec<RenterError> = errors.into_iter().flatten().collect();
        match present.len() {
            0 => None,
            1 => present.pop(),
            _ => Some(RenterError::Composite(present)),
        }
    }

    /// Whether any error in the chain satisfies `pred`.
    pub fn any(&self, pred: &dyn Fn(&RenterError) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            RenterError::Context { source, .. } => source.any(pred),
            RenterError::Composite(errors) => errors.iter().any(|err| err.any(pred)),
            _ => false,
        }
    }

    /// The innermost error under any context wrappers.
    pub fn root_cause(&self) -> &RenterError {
        match self {
            RenterError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.any(&|err| matches!(err, RenterError::NotFound(_)))
    }

    pub fn is_blacklisted(&self) -> bool {
        self.any(&|err| matches!(err, RenterError::Blacklisted))
    }

    pub fn is_revision_mismatch(&self) -> bool {
        self.any(&|err| matches!(err, RenterError::RevisionMismatch { .. }))
    }

    pub fn is_price_gouging(&self) -> bool {
        self.any(&|err| matches!(err, RenterError::PriceGouging(_)))
    }

    pub fn is_insufficient_funds(&self) -> bool {
        self.any(&|err| matches!(err, RenterError::InsufficientFunds(_)))
    }

    pub fn is_transient(&self) -> bool {
        self.any(&|err| matches!(err, RenterError::Transient(_) | RenterError::Timeout | RenterError::Io(_)))
    }

    pub fn is_shutdown(&self) -> bool {
        self.any(&|err| matches!(err, RenterError::Shutdown | RenterError::Cancelled))
    }

    pub fn is_exists(&self) -> bool {
        self.any(&|err| matches!(err, RenterError::Exists(_)))
    }

    /// Errors after which the contract involved must never be used for I/O again this period.
    pub fn is_contract_fatal(&self) -> bool {
        self.any(&|err| {
            matches!(
                err,
                RenterError::HostProtocolViolation(_)
                    | RenterError::HostSignatureInvalid
                    | RenterError::StorageObligationNotFound
            )
        })
    }
}

impl From<serde_json::Error> for RenterError {
    fn from(err: serde_json::Error) -> Self {
        RenterError::Encoding(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for RenterError {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        RenterError::HostSignatureInvalid
    }
}

/// Attach context to the error half of a `Result`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, RenterError>;
}

impl<T, E: Into<RenterError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, RenterError> {
        self.map_err(|err| err.into().add_context(context))
    }
}

/// Report a programmer error. Always logged; aborts only in debug builds when `abort` is set.
pub fn critical(abort: bool, message: impl Display) -> RenterError {
    log::error!("Critical, {}", message);
    if cfg!(debug_assertions) && abort {
        panic!("critical: {}", message);
    }
    RenterError::Critical(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_look_through_context_and_composites() {
        let err = RenterError::NotFound(NotFoundKind::File("a/b".into())).add_context("opening file");
        assert!(err.is_not_found());
        assert!(!err.is_blacklisted());
        assert_eq!(err.to_string(), "opening file: file 'a/b' not found");

        let composed = RenterError::compose(vec![
            None,
            Some(RenterError::Blacklisted),
            Some(RenterError::Timeout.add_context("deleting extended file")),
        ])
        .unwrap();
        assert!(composed.is_blacklisted());
        assert!(composed.is_transient());
    }

    #[test]
    fn compose_of_nothing_is_nothing() {
        assert!(RenterError::compose(vec![None, None]).is_none());
        let single = RenterError::compose(vec![Some(RenterError::Cancelled)]).unwrap();
        assert!(matches!(single, RenterError::Cancelled));
    }
}
