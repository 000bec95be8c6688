/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use super::Worker;
use crate::contract_set::{ContractSet, ResyncOutcome};
use crate::errors::RenterError;
use crate::events::{Event, FixRevisionMismatchEvent};
use crate::host_protocol::session::HostSession;
use crate::types::data_types::ContractID;
use crate::types::transactions::SignedRevision;

/// The RPCs a resync exchanges with the host.
pub(crate) trait RevisionHost {
    fn latest_revision(&mut self, contract: ContractID) -> Result<SignedRevision, RenterError>;
    fn recover_revision(&mut self, revision: SignedRevision) -> Result<(), RenterError>;
}

impl RevisionHost for HostSession {
    fn latest_revision(&mut self, contract: ContractID) -> Result<SignedRevision, RenterError> {
        HostSession::latest_revision(self, contract)
    }

    fn recover_revision(&mut self, revision: SignedRevision) -> Result<(), RenterError> {
        HostSession::recover_revision(self, revision)
    }
}

/// Reconcile contract `id` with the host reached through `connect`. Returns our revision number, the
/// host's, and the outcome.
///
/// The contract is held from before the host is asked for its revision until the outcome is persisted,
/// so no payment through the contract can interleave with the exchange.
pub(crate) fn resync_contract<H: RevisionHost>(
    contracts: &Arc<ContractSet>,
    id: ContractID,
    connect: impl FnOnce() -> Result<H, RenterError>,
) -> Result<(u64, u64, ResyncOutcome), RenterError> {
    let mut handle = contracts.acquire(&id)?;
    let mut host = connect()?;
    let host_revision = host.latest_revision(id)?;
    let theirs = host_revision.revision.revision_number;
    let ours = handle.last_revision().revision.revision_number;
    let outcome = handle.resync(host_revision)?;
    if outcome == ResyncOutcome::HostBehind {
        host.recover_revision(handle.last_revision().clone())?;
    }
    Ok((ours, theirs, outcome))
}

impl Worker {
    /// Fetch the host's latest revision of the worker's contract and reconcile ours with it.
    pub(crate) fn try_fix_revision_mismatch(&self) {
        let id = match self.cache().contract_id {
            Some(id) => id,
            None => {
                self.suspect_revision_mismatch.store(false, Ordering::SeqCst);
                return;
            }
        };

        let result = resync_contract(self.env.contractor.contract_set(), id, || self.connect());

        match result {
            Ok((ours, theirs, outcome)) => {
                log::info!(
                    "Resynced contract {} with host {}: ours {}, theirs {}, {:?}",
                    id,
                    self.host,
                    ours,
                    theirs,
                    outcome
                );
                self.suspect_revision_mismatch.store(false, Ordering::SeqCst);
                self.refresh_cache();
                Event::publish(
                    &self.env.event_publisher,
                    Event::FixRevisionMismatch(FixRevisionMismatchEvent {
                        timestamp: SystemTime::now(),
                        contract: id,
                        host: self.host,
                        ours,
                        theirs,
                        fixed: true,
                    }),
                );
            }
            Err(err) if err.is_transient() || err.is_shutdown() => {
                // Try again on the next iteration of the work loop.
                log::debug!("Could not reach host {} to resync contract {}: {}", self.host, id, err);
            }
            Err(err) if err.is_not_found() => {
                log::debug!("Dropping resync of contract {} with host {}: {}", id, self.host, err);
                self.suspect_revision_mismatch.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                log::warn!("Contract {} cannot be resynced with host {}: {}", id, self.host, err);
                self.suspect_revision_mismatch.store(false, Ordering::SeqCst);
                if let Err(mark_err) = self.env.contractor.mark_contract_bad(&id) {
                    log::warn!("Failed to mark contract {} bad: {}", id, mark_err);
                }
                self.refresh_cache();
                Event::publish(
                    &self.env.event_publisher,
                    Event::FixRevisionMismatch(FixRevisionMismatchEvent {
                        timestamp: SystemTime::now(),
                        contract: id,
                        host: self.host,
                        ours: 0,
                        theirs: 0,
                        fixed: false,
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::contract_set::tests::{fixture, pay};
    use crate::types::currency::Currency;

    /// A host that answers with a fixed revision, and checks whether the contract can be taken by someone
    /// else while it is being asked.
    struct FakeHost {
        contracts: Arc<ContractSet>,
        revision: SignedRevision,
        taken_during_query: Arc<Mutex<Option<bool>>>,
        recovered: Arc<Mutex<Option<SignedRevision>>>,
    }

    impl RevisionHost for FakeHost {
        fn latest_revision(&mut self, contract: ContractID) -> Result<SignedRevision, RenterError> {
            let (sender, receiver) = mpsc::channel();
            let contracts = self.contracts.clone();
            // The thread finishes once the resync releases the contract.
            thread::spawn(move || {
                let _handle = contracts.acquire(&contract);
                let _ = sender.send(());
            });
            let taken = receiver.recv_timeout(Duration::from_millis(200)).is_ok();
            *self.taken_during_query.lock().unwrap() = Some(taken);
            Ok(self.revision.clone())
        }

        fn recover_revision(&mut self, revision: SignedRevision) -> Result<(), RenterError> {
            *self.recovered.lock().unwrap() = Some(revision);
            Ok(())
        }
    }

    #[test]
    fn contract_is_held_while_the_host_is_asked() {
        // 1. Pay once, so that a host still holding the initial revision is behind.
        let fixture = fixture();
        let mut handle = fixture.set.acquire(&fixture.id).unwrap();
        let initial = handle.last_revision().clone();
        let ours = pay(&fixture, &mut handle, Currency::coins(1));
        drop(handle);

        // 2. Resync against that host.
        let taken_during_query = Arc::new(Mutex::new(None));
        let recovered = Arc::new(Mutex::new(None));
        let host = FakeHost {
            contracts: fixture.set.clone(),
            revision: initial,
            taken_during_query: taken_during_query.clone(),
            recovered: recovered.clone(),
        };
        let result = resync_contract(&fixture.set, fixture.id, || Ok(host)).unwrap();

        // 3. Nobody else got the contract while the host was asked, and the host was sent our revision.
        assert_eq!(result, (1, 0, ResyncOutcome::HostBehind));
        assert_eq!(*taken_during_query.lock().unwrap(), Some(false));
        assert_eq!(*recovered.lock().unwrap(), Some(ours));

        // 4. The contract is released afterwards.
        assert_eq!(fixture.set.acquire(&fixture.id).unwrap().last_revision().revision.revision_number, 1);
    }

    #[test]
    fn contract_is_released_when_the_host_cannot_be_reached() {
        let fixture = fixture();
        let result = resync_contract(&fixture.set, fixture.id, || -> Result<FakeHost, RenterError> {
            Err(RenterError::Transient("connection refused".to_string()))
        });
        assert!(result.unwrap_err().is_transient());
        assert!(fixture.set.acquire(&fixture.id).is_ok());
    }
}
