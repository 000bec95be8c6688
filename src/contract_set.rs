/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persistent set of the renter's contracts.
//!
//! ## Records
//!
//! Each contract is stored as one [`ContractRecord`](record::ContractRecord) under
//! `contracts/<id>.contract`: the [header](record::ContractHeader) (keys, heights, spending, utility, and
//! the last revision signed by both parties), the contract's sector roots, and the payment intents that
//! are still outstanding. Its sector reference counts live next to it in `refcounters/<id>.rc`. Every
//! change to a record goes through the shared WAL, together with the refcounter updates it implies, so a
//! crash never leaves a record and its refcounter out of step.
//!
//! ## Exclusive access
//!
//! [`acquire`](ContractSet::acquire) hands out a [`ContractHandle`], blocking while another handle to the
//! same contract is alive. All mutation goes through the handle. Dropping the handle releases the
//! contract. Readers never block on handles: [`view`](ContractSet::view) and
//! [`view_all`](ContractSet::view_all) return point-in-time copies of the last persisted state.
//!
//! ## Payment intents
//!
//! A revision is a two-phase write. Before a signed revision leaves the renter,
//! [`record_payment_intent`](ContractHandle::record_payment_intent) persists it. Once the host's
//! signature is back, [`commit_payment_intent`](ContractHandle::commit_payment_intent) makes it the last
//! revision and clears the intent. If the connection fails between the two, the intent stays recorded;
//! the next [`resync`](ContractHandle::resync) against the host's view of the contract adopts it if the
//! host did accept it.

pub mod record;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use self::record::{
    ContractHeader, ContractMetadata, ContractRecord, ContractUtility, PaymentIntent, RootsOp, SpendingKind,
};
use crate::errors::{NotFoundKind, RenterError, ResultExt};
use crate::host_protocol::rate_limit::{RateLimit, RateLimits};
use crate::merkle;
use crate::persist::versioned_file::{self, Metadata};
use crate::persist::wal::{create_and_apply_transaction, Update, Wal};
use crate::persist::create_dir_all;
use crate::refcounter::{self, RefCounter};
use crate::types::constants::SECTOR_SIZE;
use crate::types::crypto_primitives::new_specifier;
use crate::types::currency::Currency;
use crate::types::data_types::{ContractID, CryptoHash, SectorRoot, SignatureBytes};
use crate::types::keypair::Keypair;
use crate::types::transactions::{FileContractRevision, SignedRevision};

const CONTRACT_METADATA: Metadata = Metadata::new(new_specifier("Contract"), new_specifier("1.0.0"));
const RATE_LIMITS_METADATA: Metadata = Metadata::new(new_specifier("RateLimits"), new_specifier("1.0.0"));

const CONTRACT_EXTENSION: &str = "contract";
const REFCOUNTER_EXTENSION: &str = "rc";

struct Slot {
    record: ContractRecord,
    refcounter: Arc<RefCounter>,
    acquired: bool,
}

pub struct ContractSet {
    contracts_dir: PathBuf,
    refcounters_dir: PathBuf,
    wal: Arc<Wal>,
    slots: Mutex<HashMap<ContractID, Slot>>,
    released: Condvar,
    rate_limit: Arc<RateLimit>,
}

/// How [`ContractHandle::resync`] reconciled the renter's revision with the host's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// Both sides already agreed.
    InSync,
    /// The host had accepted an outstanding payment intent, which is now committed.
    AppliedIntent,
    /// The host held a newer revision signed by both parties, which is now ours.
    AdoptedHostRevision,
    /// The host is behind; it should be sent our last revision.
    HostBehind,
}

/// Hex encoding used for file names. Base64 would need a path-safe alphabet.
fn file_stem(id: &ContractID) -> String {
    id.bytes().iter().map(|byte| format!("{:02x}", byte)).collect()
}

impl ContractSet {
    /// Load every contract under `persist_dir`. Outstanding WAL transactions must have been applied
    /// before this is called.
    pub fn new(persist_dir: &Path, wal: Arc<Wal>) -> Result<Arc<ContractSet>, RenterError> {
        let contracts_dir = persist_dir.join("contracts");
        let refcounters_dir = persist_dir.join("refcounters");
        create_dir_all(&contracts_dir).context("creating contracts directory")?;
        create_dir_all(&refcounters_dir).context("creating refcounters directory")?;

        let limits = match versioned_file::load::<RateLimits>(&RATE_LIMITS_METADATA, &contracts_dir.join("ratelimits.dat")) {
            Ok(limits) => limits,
            Err(err) if err.is_not_found() => RateLimits::default(),
            Err(err) => return Err(err),
        };

        let mut slots = HashMap::new();
        for entry in fs::read_dir(&contracts_dir).context("listing contracts")? {
            let path = entry.context("listing contracts")?.path();
            if path.extension().map_or(true, |ext| ext != CONTRACT_EXTENSION) {
                continue;
            }
            let record: ContractRecord = versioned_file::load(&CONTRACT_METADATA, &path)?;
            let rc_path = refcounters_dir.join(format!("{}.{}", file_stem(&record.header.id), REFCOUNTER_EXTENSION));
            let refcounter = if rc_path.exists() {
                RefCounter::load(&rc_path, wal.clone())?
            } else {
                log::warn!("Refcounter of contract {} is missing, recreating it", record.header.id);
                RefCounter::new(&rc_path, record.roots.len() as u64, wal.clone())?
            };
            slots.insert(
                record.header.id,
                Slot {
                    record,
                    refcounter: Arc::new(refcounter),
                    acquired: false,
                },
            );
        }

        Ok(Arc::new(ContractSet {
            contracts_dir,
            refcounters_dir,
            wal,
            slots: Mutex::new(slots),
            released: Condvar::new(),
            rate_limit: Arc::new(RateLimit::new(limits)),
        }))
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ContractID, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_path(&self, id: &ContractID) -> PathBuf {
        self.contracts_dir.join(format!("{}.{}", file_stem(id), CONTRACT_EXTENSION))
    }

    fn refcounter_path(&self, id: &ContractID) -> PathBuf {
        self.refcounters_dir.join(format!("{}.{}", file_stem(id), REFCOUNTER_EXTENSION))
    }

    /// Add a newly formed contract that already stores `roots`.
    pub fn insert(&self, header: ContractHeader, roots: Vec<SectorRoot>) -> Result<ContractMetadata, RenterError> {
        let id = header.id;
        if self.slots().contains_key(&id) {
            return Err(RenterError::Exists(format!("contract {}", id)));
        }
        let record = ContractRecord {
            header,
            roots,
            intents: Vec::new(),
            next_intent: 0,
        };
        let refcounter = RefCounter::new(&self.refcounter_path(&id), record.roots.len() as u64, self.wal.clone())?;
        let update = versioned_file::save_update(&CONTRACT_METADATA, &record, &self.record_path(&id))?;
        create_and_apply_transaction(&self.wal, vec![update], refcounter::apply_updates)
            .context(format!("saving contract {}", id))?;

        let metadata = ContractMetadata::from(&record);
        self.slots().insert(
            id,
            Slot {
                record,
                refcounter: Arc::new(refcounter),
                acquired: false,
            },
        );
        Ok(metadata)
    }

    /// Take exclusive access to contract `id`, waiting for any other holder to release it.
    pub fn acquire(self: &Arc<Self>, id: &ContractID) -> Result<ContractHandle, RenterError> {
        let mut slots = self.slots();
        loop {
            match slots.get_mut(id) {
                None => return Err(RenterError::NotFound(NotFoundKind::Contract(*id))),
                Some(slot) if !slot.acquired => {
                    slot.acquired = true;
                    return Ok(ContractHandle {
                        set: self.clone(),
                        record: slot.record.clone(),
                        refcounter: slot.refcounter.clone(),
                        deleted: false,
                    });
                }
                Some(_) => {
                    slots = self
                        .released
                        .wait(slots)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    /// Release a handle. Equivalent to dropping it.
    pub fn return_handle(&self, handle: ContractHandle) {
        drop(handle)
    }

    fn release(&self, id: &ContractID) {
        if let Some(slot) = self.slots().get_mut(id) {
            slot.acquired = false;
        }
        self.released.notify_all();
    }

    fn publish(&self, record: &ContractRecord) {
        if let Some(slot) = self.slots().get_mut(&record.header.id) {
            slot.record = record.clone();
        }
    }

    pub fn view(&self, id: &ContractID) -> Option<ContractMetadata> {
        self.slots().get(id).map(|slot| ContractMetadata::from(&slot.record))
    }

    pub fn view_all(&self) -> Vec<ContractMetadata> {
        self.slots()
            .values()
            .map(|slot| ContractMetadata::from(&slot.record))
            .collect()
    }

    /// The sector roots of contract `id`, as of the last commit.
    pub fn roots(&self, id: &ContractID) -> Option<Vec<SectorRoot>> {
        self.slots().get(id).map(|slot| slot.record.roots.clone())
    }

    pub fn refcounter(&self, id: &ContractID) -> Option<Arc<RefCounter>> {
        self.slots().get(id).map(|slot| slot.refcounter.clone())
    }

    pub fn ids(&self) -> Vec<ContractID> {
        self.slots().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bandwidth limits applied to every host stream.
    pub fn rate_limits(&self) -> RateLimits {
        self.rate_limit.limits()
    }

    pub fn set_rate_limits(&self, read_bps: u64, write_bps: u64, packet_size: u64) -> Result<(), RenterError> {
        let limits = RateLimits {
            read_bps,
            write_bps,
            packet_size,
        };
        versioned_file::save(&RATE_LIMITS_METADATA, &limits, &self.contracts_dir.join("ratelimits.dat"))?;
        self.rate_limit.set_limits(limits);
        Ok(())
    }

    /// The shared limiter behind [`rate_limits`](Self::rate_limits).
    pub fn rate_limit(&self) -> Arc<RateLimit> {
        self.rate_limit.clone()
    }
}

/// Exclusive access to one contract. Dropping the handle releases the contract.
pub struct ContractHandle {
    set: Arc<ContractSet>,
    record: ContractRecord,
    refcounter: Arc<RefCounter>,
    deleted: bool,
}

impl std::fmt::Debug for ContractHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractHandle")
            .field("id", &self.id())
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

impl ContractHandle {
    pub fn id(&self) -> ContractID {
        self.record.header.id
    }

    pub fn header(&self) -> &ContractHeader {
        &self.record.header
    }

    pub fn metadata(&self) -> ContractMetadata {
        ContractMetadata::from(&self.record)
    }

    pub fn last_revision(&self) -> &SignedRevision {
        &self.record.header.last_revision
    }

    pub fn roots(&self) -> &[SectorRoot] {
        &self.record.roots
    }

    pub fn refcounter(&self) -> &Arc<RefCounter> {
        &self.refcounter
    }

    pub fn intents(&self) -> &[PaymentIntent] {
        &self.record.intents
    }

    pub fn keypair(&self) -> Keypair {
        Keypair::new(ed25519_dalek::SigningKey::from_bytes(&self.record.header.secret_key))
    }

    /// Sign `hash` with the contract's renter key.
    pub fn sign(&self, hash: &CryptoHash) -> SignatureBytes {
        self.keypair().sign(hash)
    }

    /// The revision that pays `amount` and applies `ops` to the contract's sectors, without recording
    /// anything. Fails with [`RenterError::InsufficientFunds`] if the contract cannot cover `amount`.
    pub fn next_revision(&self, amount: Currency, ops: &[RootsOp]) -> Result<FileContractRevision, RenterError> {
        let last = &self.record.header.last_revision.revision;
        let mut revision = last.payment_revision(amount).ok_or_else(|| {
            RenterError::InsufficientFunds(format!(
                "contract {} has {} left, {} needed",
                self.id(),
                last.renter_funds,
                amount
            ))
        })?;
        if !ops.is_empty() {
            let mut roots = self.record.roots.clone();
            RootsOp::apply(ops, &mut roots);
            revision.file_size = roots.len() as u64 * SECTOR_SIZE;
            revision.file_merkle_root = merkle::roots_root(&roots);
        }
        Ok(revision)
    }

    fn save(&self, record: &ContractRecord) -> Result<Update, RenterError> {
        versioned_file::save_update(&CONTRACT_METADATA, record, &self.set.record_path(&record.header.id))
    }

    fn persist(&mut self, record: ContractRecord) -> Result<(), RenterError> {
        let update = self.save(&record)?;
        create_and_apply_transaction(&self.set.wal, vec![update], refcounter::apply_updates)
            .context(format!("saving contract {}", record.header.id))?;
        self.set.publish(&record);
        self.record = record;
        Ok(())
    }

    /// Durably record that `revision` is about to be sent to the host. Returns the intent's ID.
    pub fn record_payment_intent(
        &mut self,
        revision: FileContractRevision,
        amount: Currency,
        spending: SpendingKind,
        roots_ops: Vec<RootsOp>,
    ) -> Result<u64, RenterError> {
        let last = self.record.header.last_revision.revision.revision_number;
        if revision.revision_number <= last {
            return Err(RenterError::InvalidArgument(format!(
                "revision {} does not follow revision {}",
                revision.revision_number, last
            )));
        }
        let mut record = self.record.clone();
        let id = record.next_intent;
        record.next_intent += 1;
        let renter_signature = self.sign(&revision.sig_hash());
        record.intents.push(PaymentIntent {
            id,
            revision,
            renter_signature,
            amount,
            spending,
            roots_ops,
        });
        self.persist(record)?;
        Ok(id)
    }

    /// The recorded intent `id`.
    pub fn intent(&self, id: u64) -> Option<&PaymentIntent> {
        self.record.intents.iter().find(|intent| intent.id == id)
    }

    /// Make intent `id` the contract's last revision now that the host signed it.
    pub fn commit_payment_intent(&mut self, id: u64, host_signature: SignatureBytes) -> Result<(), RenterError> {
        let intent = self
            .intent(id)
            .cloned()
            .ok_or_else(|| RenterError::InvalidArgument(format!("no payment intent {}", id)))?;
        let signed = SignedRevision {
            revision: intent.revision.clone(),
            renter_signature: intent.renter_signature,
            host_signature,
        };
        if !signed.is_correct() {
            return Err(RenterError::HostSignatureInvalid);
        }
        self.commit(intent, signed)
    }

    fn commit(&mut self, intent: PaymentIntent, signed: SignedRevision) -> Result<(), RenterError> {
        let mut record = self.record.clone();
        let number = signed.revision.revision_number;
        record.header.last_revision = signed;
        record.header.spending.add(intent.spending, intent.amount);
        RootsOp::apply(&intent.roots_ops, &mut record.roots);
        // Intents at or below the committed number can never be accepted any more.
        record.intents.retain(|other| other.revision.revision_number > number);

        let refcounter = self.refcounter.clone();
        let mut session = refcounter.start_update()?;
        let mut updates = Vec::new();
        for op in &intent.roots_ops {
            match *op {
                RootsOp::Append(_) => updates.push(session.append()),
                RootsOp::Swap(first, second) => updates.extend(session.swap(first, second)?),
                RootsOp::Drop(count) => updates.push(session.drop_sectors(count)?),
            }
        }
        updates.push(self.save(&record)?);
        session.apply(updates).context(format!("committing revision {} of {}", number, record.header.id))?;

        self.set.publish(&record);
        self.record = record;
        Ok(())
    }

    /// Forget intent `id`. Used when the host explicitly refused the revision.
    pub fn discard_payment_intent(&mut self, id: u64) -> Result<(), RenterError> {
        if self.intent(id).is_none() {
            return Ok(());
        }
        let mut record = self.record.clone();
        record.intents.retain(|intent| intent.id != id);
        self.persist(record)
    }

    /// Reconcile the contract with `host_revision`, the host's view of its latest revision.
    pub fn resync(&mut self, host_revision: SignedRevision) -> Result<ResyncOutcome, RenterError> {
        let ours = self.record.header.last_revision.revision.revision_number;
        let theirs = host_revision.revision.revision_number;
        if host_revision.revision.parent_id != self.id() {
            return Err(RenterError::HostProtocolViolation(format!(
                "host returned a revision of another contract for {}",
                self.id()
            )));
        }

        if theirs == ours {
            if host_revision.revision != self.record.header.last_revision.revision {
                return Err(RenterError::HostProtocolViolation(format!(
                    "host holds a different revision {} of {}",
                    theirs,
                    self.id()
                )));
            }
            if !self.record.intents.is_empty() {
                let mut record = self.record.clone();
                record.intents.clear();
                self.persist(record)?;
            }
            return Ok(ResyncOutcome::InSync);
        }

        if theirs < ours {
            return Ok(ResyncOutcome::HostBehind);
        }

        let matching = self
            .record
            .intents
            .iter()
            .find(|intent| intent.revision == host_revision.revision)
            .cloned();
        if let Some(intent) = matching {
            let signed = SignedRevision {
                revision: intent.revision.clone(),
                renter_signature: intent.renter_signature,
                host_signature: host_revision.host_signature,
            };
            if !signed.is_correct() {
                return Err(RenterError::HostSignatureInvalid);
            }
            self.commit(intent, signed)?;
            return Ok(ResyncOutcome::AppliedIntent);
        }

        // A revision we have no intent for can only be adopted if it is fully signed with our key and
        // still describes the sectors we know of.
        let roots_match = host_revision.revision.file_merkle_root == merkle::roots_root(&self.record.roots)
            && host_revision.revision.file_size == self.record.roots.len() as u64 * SECTOR_SIZE;
        if host_revision.is_correct() && host_revision.revision.renter_key == self.record.header.renter_key && roots_match {
            let mut record = self.record.clone();
            let paid = record
                .header
                .last_revision
                .revision
                .renter_funds
                .saturating_sub(host_revision.revision.renter_funds);
            record.header.spending.add(SpendingKind::Fees, paid);
            record.header.last_revision = host_revision;
            record.intents.retain(|intent| intent.revision.revision_number > theirs);
            self.persist(record)?;
            return Ok(ResyncOutcome::AdoptedHostRevision);
        }

        Err(RenterError::HostProtocolViolation(format!(
            "host revision {} of {} cannot be reconciled with ours ({})",
            theirs,
            self.id(),
            ours
        )))
    }

    /// Replace the contract's utility flags.
    pub fn update_utility(&mut self, utility: ContractUtility) -> Result<(), RenterError> {
        if self.record.header.utility == utility {
            return Ok(());
        }
        let mut record = self.record.clone();
        record.header.utility = utility;
        self.persist(record)
    }

    /// Remove the contract and its refcounter from the set. Returns the final state of the contract.
    pub fn delete(mut self) -> Result<(ContractMetadata, Vec<SectorRoot>), RenterError> {
        let id = self.id();
        let refcounter = self.refcounter.clone();
        let mut session = refcounter.start_update()?;
        let updates = vec![
            versioned_file::delete_file_update(&self.set.record_path(&id)),
            session.delete(),
        ];
        session.apply(updates).context(format!("deleting contract {}", id))?;
        self.set.slots().remove(&id);
        self.deleted = true;
        self.set.released.notify_all();
        Ok((ContractMetadata::from(&self.record), std::mem::take(&mut self.record.roots)))
    }
}

impl Drop for ContractHandle {
    fn drop(&mut self) {
        if !self.deleted {
            self.set.release(&self.record.header.id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use ed25519_dalek::SigningKey;
    use tempfile::TempDir;

    use super::*;
    use crate::types::data_types::{BlockHeight, HostPublicKey};
    use crate::types::transactions::{contract_unlock_hash, FileContract};

    /// A contract set holding one empty contract, together with both parties' keys.
    pub(crate) struct Fixture {
        pub(crate) dir: TempDir,
        pub(crate) set: Arc<ContractSet>,
        pub(crate) renter: Keypair,
        pub(crate) host: Keypair,
        pub(crate) id: ContractID,
    }

    pub(crate) fn signed_by_both(renter: &Keypair, host: &Keypair, revision: FileContractRevision) -> SignedRevision {
        let hash = revision.sig_hash();
        SignedRevision {
            renter_signature: renter.sign(&hash),
            host_signature: host.sign(&hash),
            revision,
        }
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _) = Wal::open(&dir.path().join("renter.wal")).unwrap();
        let set = ContractSet::new(dir.path(), wal).unwrap();

        let renter = Keypair::new(SigningKey::from_bytes(&[1; 32]));
        let host = Keypair::new(SigningKey::from_bytes(&[2; 32]));
        let contract = FileContract {
            renter_key: renter.public_key(),
            host_key: host.public_key(),
            file_size: 0,
            file_merkle_root: merkle::roots_root(&[]),
            start_height: BlockHeight::new(10),
            window_start: BlockHeight::new(100),
            window_end: BlockHeight::new(110),
            renter_funds: Currency::coins(100),
            host_valid_payout: Currency::coins(10),
            host_missed_payout: Currency::coins(10),
            unlock_hash: contract_unlock_hash(&renter.public_key(), &host.public_key()),
            nonce: 7,
        };
        let id = contract.id();
        let header = ContractHeader {
            id,
            host: host.public_key(),
            renter_key: renter.public_key(),
            secret_key: renter.0.to_bytes(),
            start_height: BlockHeight::new(10),
            end_height: BlockHeight::new(100),
            initial_renter_funds: Currency::coins(100),
            total_cost: Currency::coins(101),
            spending: Default::default(),
            utility: ContractUtility {
                good_for_upload: true,
                good_for_renew: true,
                ..Default::default()
            },
            last_revision: signed_by_both(&renter, &host, contract.initial_revision()),
        };
        set.insert(header, Vec::new()).unwrap();

        Fixture {
            dir,
            set,
            renter,
            host,
            id,
        }
    }

    /// Pay `amount` through the contract, with the host signing the revision.
    pub(crate) fn pay(fixture: &Fixture, handle: &mut ContractHandle, amount: Currency) -> SignedRevision {
        let revision = handle.next_revision(amount, &[]).unwrap();
        let intent = handle
            .record_payment_intent(revision.clone(), amount, SpendingKind::Download, Vec::new())
            .unwrap();
        handle
            .commit_payment_intent(intent, fixture.host.sign(&revision.sig_hash()))
            .unwrap();
        handle.last_revision().clone()
    }

    #[test]
    fn payment_intents_must_follow_the_last_revision() {
        let fixture = fixture();
        let mut handle = fixture.set.acquire(&fixture.id).unwrap();

        // Equal to the last revision.
        let stale = handle.last_revision().revision.clone();
        let result = handle.record_payment_intent(stale, Currency::coins(1), SpendingKind::Download, Vec::new());
        assert!(matches!(result, Err(RenterError::InvalidArgument(_))));

        let committed = pay(&fixture, &mut handle, Currency::coins(1));
        assert_eq!(committed.revision.revision_number, 1);

        // Below the last revision.
        let mut older = committed.revision.clone();
        older.revision_number = 0;
        let result = handle.record_payment_intent(older, Currency::coins(1), SpendingKind::Download, Vec::new());
        assert!(matches!(result, Err(RenterError::InvalidArgument(_))));
        assert!(handle.intents().is_empty());

        let next = handle.next_revision(Currency::coins(1), &[]).unwrap();
        assert_eq!(next.revision_number, 2);
        handle
            .record_payment_intent(next, Currency::coins(1), SpendingKind::Download, Vec::new())
            .unwrap();
        assert_eq!(handle.intents().len(), 1);
        assert_eq!(fixture.set.view(&fixture.id).unwrap().pending_intents, 1);
    }

    #[test]
    fn acquire_blocks_until_the_handle_is_returned() {
        let fixture = fixture();
        let handle = fixture.set.acquire(&fixture.id).unwrap();

        let (sender, receiver) = mpsc::channel();
        let set = fixture.set.clone();
        let id = fixture.id;
        let waiter = thread::spawn(move || {
            let second = set.acquire(&id).unwrap();
            sender.send(second.last_revision().revision.revision_number).unwrap();
        });

        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
        // Views never wait on the handle.
        assert_eq!(fixture.set.view(&fixture.id).unwrap().revision_number, 0);

        fixture.set.return_handle(handle);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        waiter.join().unwrap();

        assert!(fixture.set.acquire(&ContractID::new([9; 32])).unwrap_err().is_not_found());
    }

    #[test]
    fn resync_when_both_sides_agree() {
        let fixture = fixture();
        let mut handle = fixture.set.acquire(&fixture.id).unwrap();

        // An intent the host never saw is dropped once the host is known to hold our last revision.
        let next = handle.next_revision(Currency::coins(1), &[]).unwrap();
        handle
            .record_payment_intent(next, Currency::coins(1), SpendingKind::Download, Vec::new())
            .unwrap();

        let ours = handle.last_revision().clone();
        assert_eq!(handle.resync(ours).unwrap(), ResyncOutcome::InSync);
        assert!(handle.intents().is_empty());
        assert_eq!(handle.last_revision().revision.revision_number, 0);
    }

    #[test]
    fn resync_when_the_host_is_behind() {
        let fixture = fixture();
        let mut handle = fixture.set.acquire(&fixture.id).unwrap();
        let initial = handle.last_revision().clone();
        pay(&fixture, &mut handle, Currency::coins(1));

        assert_eq!(handle.resync(initial).unwrap(), ResyncOutcome::HostBehind);
        assert_eq!(handle.last_revision().revision.revision_number, 1);
    }

    #[test]
    fn resync_applies_the_intent_the_host_accepted() {
        let fixture = fixture();
        let mut handle = fixture.set.acquire(&fixture.id).unwrap();

        // 1. Record an upload the host signed, but whose signature never reached us.
        let root = CryptoHash::new([5; 32]);
        let ops = vec![RootsOp::Append(root)];
        let revision = handle.next_revision(Currency::coins(3), &ops).unwrap();
        let intent = handle
            .record_payment_intent(revision.clone(), Currency::coins(3), SpendingKind::Upload, ops)
            .unwrap();
        let renter_signature = handle.intent(intent).unwrap().renter_signature;

        // 2. The host reports the revision as its latest.
        let host_revision = SignedRevision {
            host_signature: fixture.host.sign(&revision.sig_hash()),
            renter_signature,
            revision,
        };
        assert_eq!(handle.resync(host_revision).unwrap(), ResyncOutcome::AppliedIntent);

        // 3. The upload is committed, with its sector counted once.
        assert_eq!(handle.last_revision().revision.revision_number, 1);
        assert_eq!(handle.roots(), &[root]);
        assert!(handle.intents().is_empty());
        assert_eq!(handle.refcounter().count(0).unwrap(), 1);
        assert_eq!(handle.metadata().spending.upload, Currency::coins(3));

        // 4. The commit survives a reload of the set.
        drop(handle);
        let (wal, _) = Wal::open(&fixture.dir.path().join("renter.wal")).unwrap();
        let reloaded = ContractSet::new(fixture.dir.path(), wal).unwrap();
        let metadata = reloaded.view(&fixture.id).unwrap();
        assert_eq!(metadata.revision_number, 1);
        assert_eq!(metadata.num_sectors, 1);
        assert_eq!(reloaded.roots(&fixture.id).unwrap(), vec![root]);
    }

    #[test]
    fn resync_adopts_a_newer_revision_signed_by_both() {
        let fixture = fixture();
        let mut handle = fixture.set.acquire(&fixture.id).unwrap();

        let newer = handle.last_revision().revision.payment_revision(Currency::coins(2)).unwrap();
        let host_revision = signed_by_both(&fixture.renter, &fixture.host, newer);
        assert_eq!(handle.resync(host_revision.clone()).unwrap(), ResyncOutcome::AdoptedHostRevision);

        assert_eq!(handle.last_revision(), &host_revision);
        assert_eq!(handle.metadata().renter_funds, Currency::coins(98));
        assert_eq!(handle.metadata().spending.fees, Currency::coins(2));
    }

    #[test]
    fn resync_rejects_revisions_that_cannot_be_reconciled() {
        let fixture = fixture();
        let mut handle = fixture.set.acquire(&fixture.id).unwrap();
        let ours = handle.last_revision().revision.clone();

        // 1. Same number, different content.
        let mut forked = ours.clone();
        forked.renter_funds = Currency::coins(50);
        let result = handle.resync(signed_by_both(&fixture.renter, &fixture.host, forked));
        assert!(matches!(result, Err(RenterError::HostProtocolViolation(_))));

        // 2. A revision of another contract.
        let mut other = ours.payment_revision(Currency::coins(1)).unwrap();
        other.parent_id = ContractID::new([9; 32]);
        let result = handle.resync(signed_by_both(&fixture.renter, &fixture.host, other));
        assert!(matches!(result, Err(RenterError::HostProtocolViolation(_))));

        // 3. A newer revision we never signed.
        let stranger = Keypair::new(SigningKey::from_bytes(&[3; 32]));
        let newer = ours.payment_revision(Currency::coins(1)).unwrap();
        let result = handle.resync(signed_by_both(&stranger, &fixture.host, newer));
        assert!(matches!(result, Err(RenterError::HostProtocolViolation(_))));

        // 4. A newer revision that drops sectors we know of.
        let newer = ours.storage_revision(SECTOR_SIZE, CryptoHash::new([4; 32]));
        let result = handle.resync(signed_by_both(&fixture.renter, &fixture.host, newer));
        assert!(matches!(result, Err(RenterError::HostProtocolViolation(_))));

        assert_eq!(handle.last_revision().revision, ours);
        assert_eq!(handle.last_revision().revision.renter_key, HostPublicKey::from(fixture.renter.public()));
    }
}
