use std::{
    collections::HashMap,
    io::{self, Read, Write},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use renter_rs::{
    errors::RenterError,
    host_protocol::{
        framing::{read_message, write_message},
        messages::{
            ContractSignatures, FormContractRequest, HostSettings, PayByContractRequest, PaymentRequest,
            PaymentResponse, ProgramRequest, ProgramResponse, RenewContractRequest, Request, RpcError,
            RpcErrorKind,
        },
        price_table::PriceTable,
        program::{apply_to_roots, program_cost, Instruction, InstructionOutput},
        HostDialer, HostStream,
    },
    merkle,
    types::{
        constants::{SECTOR_SIZE, SEGMENT_SIZE},
        crypto_primitives::Verifier,
        currency::Currency,
        data_types::{
            BlockHeight, ContractID, CryptoHash, HostPublicKey, NetAddress, SectorRoot, SignatureBytes,
        },
        keypair::Keypair,
        transactions::{FileContract, HostAnnouncement, SignedRevision},
    },
};

use super::logging::first_seven_base64_chars;

/// One end of an in-memory, bidirectional byte pipe.
pub(crate) struct PipeStream {
    outbox: Sender<Vec<u8>>,
    inbox: Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    position: usize,
    timeout: Option<Duration>,
}

/// Create two connected ends of a pipe.
pub(crate) fn pipe() -> (PipeStream, PipeStream) {
    let (a_to_b, b_from_a) = mpsc::channel();
    let (b_to_a, a_from_b) = mpsc::channel();
    let end = |outbox, inbox| PipeStream {
        outbox,
        inbox,
        buffer: Vec::new(),
        position: 0,
        timeout: None,
    };
    (end(a_to_b, a_from_b), end(b_to_a, b_from_a))
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position == self.buffer.len() {
            let received = match self.timeout {
                Some(timeout) => self.inbox.recv_timeout(timeout).map_err(|err| match err {
                    RecvTimeoutError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "pipe read timed out"),
                    RecvTimeoutError::Disconnected => io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed"),
                }),
                None => self
                    .inbox
                    .recv()
                    .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed")),
            };
            match received {
                Ok(bytes) => {
                    self.buffer = bytes;
                    self.position = 0;
                }
                // A closed pipe reads as end of stream.
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(err) => return Err(err),
            }
        }
        let n = buf.len().min(self.buffer.len() - self.position);
        buf[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbox
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl HostStream for PipeStream {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}

/// The settings every mock host starts with: cheap enough that no allowance used in tests considers the
/// host to be gouging.
pub(crate) fn default_settings(net_address: NetAddress) -> HostSettings {
    HostSettings {
        net_address,
        version: "1.5.0".into(),
        accepting_contracts: true,
        max_duration: 100_000,
        window_size: 144,
        collateral: Currency::new(1),
        max_collateral: Currency::coins(100),
        contract_price: Currency::coins(1),
        storage_price: Currency::new(1),
        upload_bandwidth_price: Currency::new(1),
        download_bandwidth_price: Currency::new(1),
        base_rpc_price: Currency::new(1),
        sector_access_price: Currency::new(1),
        remaining_storage: 1 << 40,
        total_storage: 1 << 40,
        sector_size: SECTOR_SIZE,
    }
}

struct HostContract {
    revision: SignedRevision,
    roots: Vec<SectorRoot>,
}

struct HostState {
    settings: HostSettings,
    contracts: HashMap<ContractID, HostContract>,
    sectors: HashMap<SectorRoot, Vec<u8>>,
    price_tables: HashMap<[u8; 16], PriceTable>,
    online: bool,
    drop_next_payment_response: bool,
    rpcs_served: u64,
}

/// An in-memory host that speaks the host protocol over [PipeStream]s. Each connection is served on its
/// own thread.
#[derive(Clone)]
pub(crate) struct MockHost {
    keypair: Keypair,
    address: NetAddress,
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub(crate) fn new(address: NetAddress) -> MockHost {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng {}));
        MockHost {
            keypair,
            address: address.clone(),
            state: Arc::new(Mutex::new(HostState {
                settings: default_settings(address),
                contracts: HashMap::new(),
                sectors: HashMap::new(),
                price_tables: HashMap::new(),
                online: true,
                drop_next_payment_response: false,
                rpcs_served: 0,
            })),
        }
    }

    pub(crate) fn public_key(&self) -> HostPublicKey {
        self.keypair.public_key()
    }

    pub(crate) fn address(&self) -> &NetAddress {
        &self.address
    }

    pub(crate) fn announcement(&self) -> HostAnnouncement {
        HostAnnouncement {
            public_key: self.public_key(),
            net_address: self.address.clone(),
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.state.lock().unwrap().online = online;
    }

    fn is_online(&self) -> bool {
        self.state.lock().unwrap().online
    }

    /// Apply and sign the next payment revision, but hang up before the renter sees the signature.
    pub(crate) fn drop_next_payment_response(&self) {
        self.state.lock().unwrap().drop_next_payment_response = true;
    }

    pub(crate) fn num_sectors(&self) -> usize {
        self.state.lock().unwrap().sectors.len()
    }

    /// The revision number of `contract` the host holds.
    pub(crate) fn revision_number(&self, contract: &ContractID) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .contracts
            .get(contract)
            .map(|contract| contract.revision.revision.revision_number)
    }

    pub(crate) fn rpcs_served(&self) -> u64 {
        self.state.lock().unwrap().rpcs_served
    }

    /// Serve one connection on a new thread.
    fn accept(&self, mut stream: PipeStream) {
        let host = self.clone();
        thread::spawn(move || {
            stream.timeout = Some(Duration::from_secs(30));
            if let Err(err) = host.serve(&mut stream) {
                log::trace!(
                    "Mock host {} closed a connection: {}",
                    first_seven_base64_chars(&host.public_key().bytes()),
                    err
                );
            }
        });
    }

    fn serve(&self, stream: &mut PipeStream) -> Result<(), RenterError> {
        let request: Request = read_message(stream)?;
        self.state.lock().unwrap().rpcs_served += 1;
        match request {
            Request::Settings => {
                let settings = self.state.lock().unwrap().settings.clone();
                write_message(stream, &Ok::<_, RpcError>(settings))
            }
            Request::UpdatePriceTable => {
                let mut state = self.state.lock().unwrap();
                let uid: [u8; 16] = rand::random();
                let price_table =
                    PriceTable::from_settings(&state.settings, uid, BlockHeight::new(0), Duration::from_secs(600));
                state.price_tables.insert(uid, price_table.clone());
                drop(state);
                write_message(stream, &Ok::<_, RpcError>(price_table))
            }
            Request::FormContract(request) => {
                let reply = self.form_contract(request);
                write_message(stream, &reply)
            }
            Request::RenewContract(request) => {
                let reply = self.renew_contract(request);
                write_message(stream, &reply)
            }
            Request::LatestRevision(id) => {
                let reply = match self.state.lock().unwrap().contracts.get(&id) {
                    Some(contract) => Ok(contract.revision.clone()),
                    None => Err(obligation_not_found(&id)),
                };
                write_message(stream, &reply)
            }
            Request::RecoverRevision(revision) => {
                let reply = self.recover_revision(revision);
                write_message(stream, &reply)
            }
            Request::SectorRoots(id) => {
                let reply = match self.state.lock().unwrap().contracts.get(&id) {
                    Some(contract) => Ok(contract.roots.clone()),
                    None => Err(obligation_not_found(&id)),
                };
                write_message(stream, &reply)
            }
            Request::ExecuteProgram(program) => self.execute_program(stream, program),
        }
    }

    fn sign_contract(
        &self,
        contract: FileContract,
        roots: Vec<SectorRoot>,
        revision_signature: SignatureBytes,
    ) -> Result<ContractSignatures, RpcError> {
        let initial = contract.initial_revision();
        let renter_key = contract
            .renter_key
            .verifying_key()
            .map_err(|err| RpcError::new(RpcErrorKind::InvalidSignature, err.to_string()))?;
        renter_key
            .verify(&initial.sig_hash().bytes(), &revision_signature.signature())
            .map_err(|err| RpcError::new(RpcErrorKind::InvalidSignature, err.to_string()))?;
        if contract.file_merkle_root != merkle::roots_root(&roots) && !roots.is_empty() {
            return Err(RpcError::new(RpcErrorKind::Rejected, "contract does not commit to the carried sectors"));
        }

        let signatures = ContractSignatures {
            contract_signature: self.keypair.sign(&contract.sig_hash()),
            revision_signature: self.keypair.sign(&initial.sig_hash()),
        };
        let signed = SignedRevision {
            revision: initial,
            renter_signature: revision_signature,
            host_signature: signatures.revision_signature,
        };
        self.state
            .lock()
            .unwrap()
            .contracts
            .insert(contract.id(), HostContract { revision: signed, roots });
        Ok(signatures)
    }

    fn form_contract(&self, request: FormContractRequest) -> Result<ContractSignatures, RpcError> {
        if !self.state.lock().unwrap().settings.accepting_contracts {
            return Err(RpcError::new(RpcErrorKind::Rejected, "not accepting contracts"));
        }
        self.sign_contract(request.contract, Vec::new(), request.revision_signature)
    }

    fn renew_contract(&self, request: RenewContractRequest) -> Result<ContractSignatures, RpcError> {
        let roots = match self.state.lock().unwrap().contracts.get(&request.old_contract) {
            Some(old) => old.roots.clone(),
            None => return Err(obligation_not_found(&request.old_contract)),
        };
        self.sign_contract(request.new_contract, roots, request.revision_signature)
    }

    fn recover_revision(&self, revision: SignedRevision) -> Result<(), RpcError> {
        if !revision.is_correct() {
            return Err(RpcError::new(RpcErrorKind::InvalidSignature, "revision is not signed by both parties"));
        }
        let mut state = self.state.lock().unwrap();
        let id = revision.revision.parent_id;
        let contract = state.contracts.get_mut(&id).ok_or_else(|| obligation_not_found(&id))?;
        if revision.revision.revision_number > contract.revision.revision.revision_number {
            contract.revision = revision;
        }
        Ok(())
    }

    fn execute_program(&self, stream: &mut PipeStream, program: ProgramRequest) -> Result<(), RenterError> {
        let payment: PaymentRequest = read_message(stream)?;
        let PaymentRequest::PayByContract(payment) = payment;

        let accepted = self.accept_payment(&program, payment);
        let (host_signature, roots, drop_response) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => return write_message(stream, &Err::<PaymentResponse, _>(err)),
        };
        if drop_response {
            log::debug!("Mock host {} hangs up before answering a payment", self.address);
            return Ok(());
        }
        write_message(stream, &Ok::<_, RpcError>(PaymentResponse { host_signature }))?;

        let outputs = self.run_instructions(&program, &roots);
        let response = outputs.map(|outputs| ProgramResponse {
            outputs,
            new_size: roots.len() as u64 * SECTOR_SIZE,
            new_merkle_root: merkle::roots_root(&roots),
        });
        write_message(stream, &response)
    }

    /// Check the payment revision against the program, then store both the revision and the program's
    /// new sectors.
    fn accept_payment(
        &self,
        program: &ProgramRequest,
        payment: PayByContractRequest,
    ) -> Result<(SignatureBytes, Vec<SectorRoot>, bool), RpcError> {
        let mut state = self.state.lock().unwrap();
        let price_table = state
            .price_tables
            .get(&program.price_table)
            .cloned()
            .ok_or_else(|| RpcError::new(RpcErrorKind::PriceTableNotFound, "unknown price table"))?;
        let contract = state
            .contracts
            .get(&payment.contract)
            .ok_or_else(|| obligation_not_found(&payment.contract))?;
        let last = &contract.revision.revision;
        if payment.new_revision_number <= last.revision_number {
            return Err(RpcError::new(
                RpcErrorKind::RevisionMismatch {
                    renter_revision: payment.new_revision_number,
                    host_revision: last.revision_number,
                },
                "renter is behind",
            ));
        }

        let mut roots = contract.roots.clone();
        apply_to_roots(&mut roots, &program.instructions, &program.data)
            .map_err(|err| RpcError::new(RpcErrorKind::Rejected, err.to_string()))?;
        if payment.new_file_size != roots.len() as u64 * SECTOR_SIZE
            || payment.new_file_merkle_root != merkle::roots_root(&roots)
        {
            return Err(RpcError::new(RpcErrorKind::Rejected, "revision does not commit to the program's sectors"));
        }

        let paid = last
            .renter_funds
            .checked_sub(payment.new_renter_funds)
            .ok_or_else(|| RpcError::new(RpcErrorKind::Rejected, "revision adds renter funds"))?;
        let cost = program_cost(&price_table, &program.instructions, 0);
        if paid < cost {
            return Err(RpcError::new(
                RpcErrorKind::InsufficientFunds,
                format!("program costs {}, {} paid", cost, paid),
            ));
        }

        let mut revision = last.clone();
        revision.revision_number = payment.new_revision_number;
        revision.renter_funds = payment.new_renter_funds;
        revision.host_valid_payout = payment.new_host_valid_payout;
        revision.host_missed_payout = payment.new_host_missed_payout;
        revision.file_size = payment.new_file_size;
        revision.file_merkle_root = payment.new_file_merkle_root;
        let renter_key = revision
            .renter_key
            .verifying_key()
            .map_err(|err| RpcError::new(RpcErrorKind::InvalidSignature, err.to_string()))?;
        renter_key
            .verify(&revision.sig_hash().bytes(), &payment.signature.signature())
            .map_err(|err| RpcError::new(RpcErrorKind::InvalidSignature, err.to_string()))?;

        let host_signature = self.keypair.sign(&revision.sig_hash());
        let signed = SignedRevision {
            revision,
            renter_signature: payment.signature,
            host_signature,
        };
        for sector in program.data.chunks(SECTOR_SIZE as usize) {
            state.sectors.insert(merkle::sector_root(sector), sector.to_vec());
        }
        if let Some(contract) = state.contracts.get_mut(&payment.contract) {
            contract.revision = signed;
            contract.roots = roots.clone();
        }
        let drop_response = std::mem::replace(&mut state.drop_next_payment_response, false);
        Ok((host_signature, roots, drop_response))
    }

    fn run_instructions(&self, program: &ProgramRequest, roots: &[SectorRoot]) -> Result<Vec<InstructionOutput>, RpcError> {
        let state = self.state.lock().unwrap();
        let mut appended = program.data.chunks(SECTOR_SIZE as usize);
        let mut outputs = Vec::with_capacity(program.instructions.len());
        for instruction in &program.instructions {
            let output = match instruction {
                Instruction::HasSector { root } => InstructionOutput::HasSector(state.sectors.contains_key(root)),
                Instruction::ReadSector {
                    root,
                    offset,
                    length,
                    proof,
                } => {
                    let sector = state
                        .sectors
                        .get(root)
                        .ok_or_else(|| RpcError::new(RpcErrorKind::SectorNotFound, format!("no sector {}", root)))?;
                    let (data, proof) = read_range(sector, *offset, *length, *proof)?;
                    InstructionOutput::ReadSector { data, proof }
                }
                Instruction::ReadOffset { offset, length, proof } => {
                    let sector_index = offset / SECTOR_SIZE;
                    let sector_root = *roots
                        .get(sector_index as usize)
                        .ok_or_else(|| RpcError::new(RpcErrorKind::SectorNotFound, format!("no sector at {}", offset)))?;
                    let sector = state
                        .sectors
                        .get(&sector_root)
                        .ok_or_else(|| RpcError::new(RpcErrorKind::SectorNotFound, format!("lost sector {}", sector_root)))?;
                    let (data, proof) = read_range(sector, offset % SECTOR_SIZE, *length, *proof)?;
                    let index = sector_index as usize;
                    InstructionOutput::ReadOffset {
                        data,
                        proof,
                        sector_index,
                        sector_root,
                        roots_proof: merkle::range_proof(&merkle::roots_leaves(roots), index, index + 1),
                    }
                }
                Instruction::Revision => {
                    let contract = state
                        .contracts
                        .get(&program.contract)
                        .ok_or_else(|| obligation_not_found(&program.contract))?;
                    InstructionOutput::Revision(contract.revision.clone())
                }
                Instruction::Append => {
                    let sector = appended.next().unwrap_or_default();
                    InstructionOutput::Append {
                        root: merkle::sector_root(sector),
                    }
                }
                Instruction::DropSectors { .. } => InstructionOutput::DropSectors,
                Instruction::SwapSectors { .. } => InstructionOutput::SwapSectors,
            };
            outputs.push(output);
        }
        Ok(outputs)
    }
}

fn obligation_not_found(id: &ContractID) -> RpcError {
    RpcError::new(RpcErrorKind::StorageObligationNotFound, format!("no contract {}", id))
}

/// `length` bytes at `offset` of `sector`, plus a range proof over the segments they cover.
fn read_range(sector: &[u8], offset: u64, length: u64, proof: bool) -> Result<(Vec<u8>, Vec<CryptoHash>), RpcError> {
    if length == 0 || offset + length > SECTOR_SIZE || offset % SEGMENT_SIZE != 0 || length % SEGMENT_SIZE != 0 {
        return Err(RpcError::new(
            RpcErrorKind::Rejected,
            format!("cannot read {} bytes at {}", length, offset),
        ));
    }
    let data = sector[offset as usize..(offset + length) as usize].to_vec();
    let proof = if proof {
        let (start, end) = merkle::segment_bounds(offset, length);
        merkle::sector_range_proof(sector, start, end)
    } else {
        Vec::new()
    };
    Ok((data, proof))
}

/// Routes connections to the mock host announced at each address.
#[derive(Default)]
pub(crate) struct MockDialer {
    hosts: Mutex<HashMap<NetAddress, MockHost>>,
}

impl MockDialer {
    pub(crate) fn new() -> Arc<MockDialer> {
        Arc::new(MockDialer::default())
    }

    pub(crate) fn register(&self, host: MockHost) {
        self.hosts.lock().unwrap().insert(host.address().clone(), host);
    }
}

impl HostDialer for MockDialer {
    fn dial(&self, address: &NetAddress) -> io::Result<Box<dyn HostStream>> {
        let host = self
            .hosts
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, format!("nobody at {}", address)))?;
        if !host.is_online() {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, format!("{} is offline", address)));
        }
        let (renter_end, host_end) = pipe();
        host.accept(host_end);
        Ok(Box::new(renter_end))
    }
}
