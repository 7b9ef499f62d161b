//! An in-process ledger and FHE coprocessor.
//!
//! Ciphertexts are plaintexts kept behind opaque handles, and proofs are
//! hashes keyed by a secret only the coprocessor holds. That is enough for
//! the ledger to enforce every rule the real contract does (input proofs
//! bound to contract and signer, one vote per account, creator-only close,
//! verified result submission) without any real cryptography.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration as StdDuration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address, H256, U256};
use sha2::{Digest, Sha256};

use crate::{
    clock::{Clock, ManualClock},
    config::FhevmNetwork,
    engine::{FheEngine, FheInstance, FheSdk, RawDecryption, RawEncryptedInput, RetryPolicy, SdkError},
    error::{Error, Result},
    ledger::{EventBatch, LedgerEvent, LedgerGateway, PollRecord, Receipt},
    model::{
        ballot::EncryptedBallot,
        cleartext,
        handle::CiphertextHandle,
        poll::{PollId, PollSpec},
    },
};

/// How long creating an FHE instance takes.
const INIT_DELAY: StdDuration = StdDuration::from_millis(10);

/// Longest poll the simulated contract accepts, in minutes.
const MAX_DURATION_MINUTES: u64 = 10 * 365 * 24 * 60;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let digest = parts
        .iter()
        .fold(Sha256::new(), |hasher, part| hasher.chain_update(part))
        .finalize();
    let mut bytes = [0; 32];
    bytes.copy_from_slice(&digest);
    bytes
}

/// A deterministic account address for a name.
pub fn address_of(name: &str) -> Address {
    Address::from_slice(&sha256(&[b"account", name.as_bytes()])[12..])
}

/// Holds every plaintext and the key its proofs are made with.
struct Coprocessor {
    key: [u8; 32],
    values: HashMap<CiphertextHandle, u64>,
    public: HashSet<CiphertextHandle>,
    counter: u64,
}

impl Coprocessor {
    fn new() -> Self {
        Self {
            key: rand::random(),
            values: HashMap::new(),
            public: HashSet::new(),
            counter: 0,
        }
    }

    fn store(&mut self, value: u64) -> CiphertextHandle {
        self.counter += 1;
        let handle = CiphertextHandle::from_bytes(sha256(&[
            &self.key,
            b"handle",
            &self.counter.to_be_bytes(),
        ]));
        self.values.insert(handle, value);
        handle
    }

    /// Homomorphically add one to `tally` if `input` encrypts `option`.
    fn add_if_equal(
        &mut self,
        tally: CiphertextHandle,
        input: CiphertextHandle,
        option: u8,
    ) -> Option<CiphertextHandle> {
        let count = *self.values.get(&tally)?;
        let choice = *self.values.get(&input)?;
        Some(self.store(count + u64::from(choice == u64::from(option))))
    }

    fn input_proof(&self, contract: Address, user: Address, handle: &CiphertextHandle) -> Vec<u8> {
        sha256(&[
            &self.key,
            b"input",
            contract.as_bytes(),
            user.as_bytes(),
            handle.as_bytes(),
        ])
        .to_vec()
    }

    fn decryption_proof(&self, handles: &[CiphertextHandle], encoded: &[u8]) -> Vec<u8> {
        let mut parts: Vec<&[u8]> = vec![&self.key[..], &b"decrypt"[..]];
        parts.extend(handles.iter().map(|handle| &handle.as_bytes()[..]));
        parts.push(encoded);
        sha256(&parts).to_vec()
    }
}

struct SimPoll {
    record: PollRecord,
    tallies: Vec<CiphertextHandle>,
    voters: HashSet<Address>,
    final_results: Vec<u64>,
}

#[derive(Default)]
struct Chain {
    polls: BTreeMap<PollId, SimPoll>,
    next_poll_id: PollId,
    block: u64,
    events: Vec<(u64, LedgerEvent)>,
    corrupted: HashMap<(PollId, u8), Vec<u8>>,
    submit_calls: usize,
}

struct State {
    coprocessor: Coprocessor,
    chain: Chain,
}

/// A simulated chain with its coprocessor and clock.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct Network {
    state: Arc<Mutex<State>>,
    clock: ManualClock,
    fhe: SimulatedFhe,
    contract: Address,
}

impl Network {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        let state = Arc::new(Mutex::new(State {
            coprocessor: Coprocessor::new(),
            chain: Chain {
                next_poll_id: 1,
                ..Chain::default()
            },
        }));
        Self {
            fhe: SimulatedFhe::new(state.clone()),
            state,
            clock: ManualClock::new(start),
            contract: address_of("SecretBallot"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// The chain's clock. Advancing it expires polls.
    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    /// The FHE SDK connected to this network's coprocessor.
    pub fn fhe(&self) -> SimulatedFhe {
        self.fhe.clone()
    }

    /// A fresh engine over [`Self::fhe`].
    pub fn engine(&self) -> Arc<FheEngine> {
        Arc::new(FheEngine::new(
            Arc::new(self.fhe()),
            FhevmNetwork::default(),
            RetryPolicy::default(),
        ))
    }

    /// A gateway signing as the named account.
    pub fn account(&self, name: &str) -> Account {
        Account {
            network: self.clone(),
            name: name.to_string(),
            address: address_of(name),
        }
    }

    /// The latest mined block.
    pub fn block_number(&self) -> u64 {
        self.lock().chain.block
    }

    /// How many result submissions have been attempted, successful or not.
    pub fn submit_calls(&self) -> usize {
        self.lock().chain.submit_calls
    }

    /// Make `getVoteCount` return `bytes` for one option.
    pub fn corrupt_vote_count(&self, poll_id: PollId, option: u8, bytes: Vec<u8>) {
        self.lock().chain.corrupted.insert((poll_id, option), bytes);
    }

    /// Store a publicly decryptable ciphertext of `value`.
    pub fn coprocessor_handle(&self, value: u64) -> CiphertextHandle {
        let mut state = self.lock();
        let handle = state.coprocessor.store(value);
        state.coprocessor.public.insert(handle);
        handle
    }

    /// Encrypt a vote for `voter` without going through an engine.
    pub fn ballot(&self, voter: &Account, option: u8) -> EncryptedBallot {
        let mut state = self.lock();
        let handle = state.coprocessor.store(option.into());
        let proof = state.coprocessor.input_proof(self.contract, voter.address, &handle);
        EncryptedBallot { handle, proof }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`LedgerGateway`] on a [`Network`], signing as one account.
#[derive(Clone)]
pub struct Account {
    network: Network,
    name: String,
    address: Address,
}

impl Account {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply a transaction. Events are recorded and a block is mined only if
    /// `apply` succeeds.
    fn transact<T>(
        &self,
        action: &'static str,
        apply: impl FnOnce(&mut State, DateTime<Utc>) -> Result<(T, LedgerEvent)>,
    ) -> Result<(T, Receipt)> {
        let now = self.network.clock.now();
        let mut state = self.network.lock();
        let (value, event) = apply(&mut *state, now).map_err(|e| {
            debug!("{} failed to {action}: {e}", self.name);
            e
        })?;

        state.chain.block += 1;
        let block = state.chain.block;
        state.chain.events.push((block, event));
        debug!("{} did {action} in block {block}", self.name);

        Ok((
            value,
            Receipt {
                tx_hash: H256(sha256(&[&block.to_be_bytes(), self.address.as_bytes()])),
                block_number: block,
                gas_used: None,
            },
        ))
    }

    fn read<T>(&self, read: impl FnOnce(&State) -> Result<T>) -> Result<T> {
        read(&*self.network.lock())
    }
}

fn poll_mut(chain: &mut Chain, poll_id: PollId) -> Result<&mut SimPoll> {
    chain
        .polls
        .get_mut(&poll_id)
        .ok_or(Error::PollNotFound(poll_id))
}

fn poll(chain: &Chain, poll_id: PollId) -> Result<&SimPoll> {
    chain.polls.get(&poll_id).ok_or(Error::PollNotFound(poll_id))
}

#[async_trait]
impl LedgerGateway for Account {
    fn account(&self) -> Address {
        self.address
    }

    fn contract_address(&self) -> Address {
        self.network.contract
    }

    async fn create_poll(&self, spec: &PollSpec) -> Result<(PollId, Receipt)> {
        let creator = self.address;
        self.transact("create poll", |state, now| {
            if spec.duration_minutes() > MAX_DURATION_MINUTES {
                return Err(Error::rejected("create poll", "Duration too long"));
            }
            let end_time = now + Duration::minutes(spec.duration_minutes() as i64);

            let poll_id = state.chain.next_poll_id;
            state.chain.next_poll_id += 1;
            let tallies = spec
                .options()
                .iter()
                .map(|_| state.coprocessor.store(0))
                .collect();
            state.chain.polls.insert(
                poll_id,
                SimPoll {
                    record: PollRecord {
                        question: spec.question().to_string(),
                        options: spec.options().to_vec(),
                        creator,
                        end_time,
                        is_active: true,
                    },
                    tallies,
                    voters: HashSet::new(),
                    final_results: vec![],
                },
            );

            let event = LedgerEvent::PollCreated {
                poll_id,
                creator,
                question: spec.question().to_string(),
                end_time,
            };
            Ok((poll_id, event))
        })
    }

    async fn vote(&self, poll_id: PollId, ballot: EncryptedBallot) -> Result<Receipt> {
        let voter = self.address;
        let contract = self.network.contract;
        let ((), receipt) = self.transact("vote", |state, now| {
            let poll = poll_mut(&mut state.chain, poll_id)?;
            if !poll.record.is_active || now >= poll.record.end_time {
                return Err(Error::rejected("vote", "Poll is not active"));
            }
            if poll.voters.contains(&voter) {
                return Err(Error::AlreadyVoted { poll_id, voter });
            }
            if ballot.proof != state.coprocessor.input_proof(contract, voter, &ballot.handle) {
                return Err(Error::rejected("vote", "Invalid input proof"));
            }

            let tallies = poll
                .tallies
                .iter()
                .enumerate()
                .map(|(option, tally)| {
                    state
                        .coprocessor
                        .add_if_equal(*tally, ballot.handle, option as u8)
                        .ok_or_else(|| Error::rejected("vote", "Unknown ciphertext"))
                })
                .collect::<Result<Vec<_>>>()?;
            poll.tallies = tallies;
            poll.voters.insert(voter);

            Ok(((), LedgerEvent::VoteCast { poll_id, voter }))
        })?;
        Ok(receipt)
    }

    async fn close_poll(&self, poll_id: PollId) -> Result<Receipt> {
        let caller = self.address;
        let ((), receipt) = self.transact("close poll", |state, _| {
            let poll = poll_mut(&mut state.chain, poll_id)?;
            if poll.record.creator != caller {
                return Err(Error::rejected("close poll", "Only creator can close"));
            }
            if !poll.record.is_active {
                return Err(Error::rejected("close poll", "Poll already closed"));
            }
            poll.record.is_active = false;
            state.coprocessor.public.extend(poll.tallies.iter().copied());

            Ok(((), LedgerEvent::PollClosed { poll_id }))
        })?;
        Ok(receipt)
    }

    async fn delete_poll(&self, poll_id: PollId) -> Result<Receipt> {
        let caller = self.address;
        let ((), receipt) = self.transact("delete poll", |state, _| {
            if poll(&state.chain, poll_id)?.record.creator != caller {
                return Err(Error::rejected("delete poll", "Only creator can delete"));
            }
            state.chain.polls.remove(&poll_id);
            Ok(((), LedgerEvent::PollDeleted { poll_id }))
        })?;
        Ok(receipt)
    }

    async fn submit_results(
        &self,
        poll_id: PollId,
        encoded: &[u8],
        proof: &[u8],
    ) -> Result<Receipt> {
        let ((), receipt) = self.transact("submit results", |state, _| {
            state.chain.submit_calls += 1;
            let poll = poll_mut(&mut state.chain, poll_id)?;
            if poll.record.is_active {
                return Err(Error::rejected("submit results", "Poll is still active"));
            }
            if !poll.final_results.is_empty() {
                return Err(Error::rejected("submit results", "Results already submitted"));
            }
            if proof != state.coprocessor.decryption_proof(&poll.tallies, encoded) {
                return Err(Error::rejected("submit results", "Invalid decryption proof"));
            }
            let results = cleartext::decode_counts(encoded, poll.tallies.len())
                .map_err(|e| Error::rejected("submit results", e.to_string()))?;
            poll.final_results = results.clone();

            Ok(((), LedgerEvent::ResultsSubmitted { poll_id, results }))
        })?;
        Ok(receipt)
    }

    async fn get_poll(&self, poll_id: PollId) -> Result<PollRecord> {
        self.read(|state| Ok(poll(&state.chain, poll_id)?.record.clone()))
    }

    async fn get_final_results(&self, poll_id: PollId) -> Result<Vec<u64>> {
        self.read(|state| Ok(poll(&state.chain, poll_id)?.final_results.clone()))
    }

    async fn get_vote_count(&self, poll_id: PollId, option: u8) -> Result<Vec<u8>> {
        self.read(|state| {
            let tally = poll(&state.chain, poll_id)?
                .tallies
                .get(usize::from(option))
                .ok_or_else(|| Error::rejected("get vote count", "Invalid option"))?;
            Ok(match state.chain.corrupted.get(&(poll_id, option)) {
                Some(bytes) => bytes.clone(),
                None => tally.as_bytes().to_vec(),
            })
        })
    }

    async fn has_voted(&self, poll_id: PollId, voter: Address) -> Result<bool> {
        self.read(|state| Ok(poll(&state.chain, poll_id)?.voters.contains(&voter)))
    }

    async fn poll_ids(&self) -> Result<Vec<PollId>> {
        self.read(|state| Ok(state.chain.polls.keys().copied().collect()))
    }

    async fn events_since(&self, from_block: u64) -> Result<EventBatch> {
        self.read(|state| {
            let events = state
                .chain
                .events
                .iter()
                .filter(|(block, _)| *block >= from_block)
                .map(|(_, event)| event.clone())
                .collect();
            Ok(EventBatch {
                events,
                next_block: (state.chain.block + 1).max(from_block),
            })
        })
    }
}

type Tamper = Arc<dyn Fn(&[String], &mut RawDecryption) + Send + Sync>;

struct FheControl {
    init_failures: VecDeque<SdkError>,
    encrypt_failures: VecDeque<SdkError>,
    create_calls: usize,
    encrypt_calls: usize,
    decrypt_calls: usize,
    handle_width: usize,
    tamper: Option<Tamper>,
}

/// An FHE SDK backed by a [`Network`]'s coprocessor, with hooks for
/// injecting faults and counters for observing calls.
///
/// Clones share the same counters and hooks.
#[derive(Clone)]
pub struct SimulatedFhe {
    state: Arc<Mutex<State>>,
    control: Arc<Mutex<FheControl>>,
}

impl SimulatedFhe {
    fn new(state: Arc<Mutex<State>>) -> Self {
        Self {
            state,
            control: Arc::new(Mutex::new(FheControl {
                init_failures: VecDeque::new(),
                encrypt_failures: VecDeque::new(),
                create_calls: 0,
                encrypt_calls: 0,
                decrypt_calls: 0,
                handle_width: 32,
                tamper: None,
            })),
        }
    }

    fn control(&self) -> MutexGuard<'_, FheControl> {
        lock(&self.control)
    }

    /// Fail the next instance creations with these errors, in order.
    pub fn fail_init(&self, failures: impl IntoIterator<Item = SdkError>) {
        self.control().init_failures.extend(failures);
    }

    /// Fail the next encryptions with these errors, in order.
    pub fn fail_encrypt(&self, failures: impl IntoIterator<Item = SdkError>) {
        self.control().encrypt_failures.extend(failures);
    }

    /// Make encryption produce handles of this many bytes.
    pub fn set_handle_width(&self, width: usize) {
        self.control().handle_width = width;
    }

    /// Rewrite every decryption result before it is returned. The hook is
    /// given the requested handles in order.
    pub fn tamper_decryption(
        &self,
        tamper: impl Fn(&[String], &mut RawDecryption) + Send + Sync + 'static,
    ) {
        self.control().tamper = Some(Arc::new(tamper));
    }

    pub fn create_calls(&self) -> usize {
        self.control().create_calls
    }

    pub fn encrypt_calls(&self) -> usize {
        self.control().encrypt_calls
    }

    pub fn decrypt_calls(&self) -> usize {
        self.control().decrypt_calls
    }
}

#[async_trait]
impl FheSdk for SimulatedFhe {
    async fn create_instance(
        &self,
        network: &FhevmNetwork,
    ) -> std::result::Result<Arc<dyn FheInstance>, SdkError> {
        let failure = {
            let mut control = self.control();
            control.create_calls += 1;
            control.init_failures.pop_front()
        };
        tokio::time::sleep(INIT_DELAY).await;

        match failure {
            Some(err) => Err(err),
            None => {
                debug!("Simulated FHE instance ready for chain {}", network.chain_id);
                Ok(Arc::new(self.clone()))
            }
        }
    }
}

#[async_trait]
impl FheInstance for SimulatedFhe {
    async fn encrypt_u8(
        &self,
        contract: Address,
        user: Address,
        value: u8,
    ) -> std::result::Result<RawEncryptedInput, SdkError> {
        let (width, failure) = {
            let mut control = self.control();
            control.encrypt_calls += 1;
            (control.handle_width, control.encrypt_failures.pop_front())
        };
        if let Some(err) = failure {
            return Err(err);
        }

        let mut state = lock(&self.state);
        let handle = state.coprocessor.store(value.into());
        let input_proof = state.coprocessor.input_proof(contract, user, &handle);

        let mut raw = handle.as_bytes().to_vec();
        raw.resize(width, 0xee);
        Ok(RawEncryptedInput {
            handles: vec![raw],
            input_proof,
        })
    }

    async fn public_decrypt(
        &self,
        handles: &[String],
    ) -> std::result::Result<RawDecryption, SdkError> {
        let tamper = {
            let mut control = self.control();
            control.decrypt_calls += 1;
            control.tamper.clone()
        };

        let parsed = handles
            .iter()
            .map(|text| {
                text.parse::<CiphertextHandle>()
                    .map_err(|e| SdkError::Permanent(format!("invalid handle {text}: {e}")))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut raw = {
            let state = lock(&self.state);
            let values = parsed
                .iter()
                .map(|handle| {
                    state
                        .coprocessor
                        .public
                        .contains(handle)
                        .then(|| state.coprocessor.values.get(handle).copied())
                        .flatten()
                        .ok_or_else(|| {
                            SdkError::Permanent(format!("{handle} is not publicly decryptable"))
                        })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let encoded = cleartext::encode_counts(&values);
            RawDecryption {
                clear_values: parsed
                    .iter()
                    .zip(&values)
                    .map(|(handle, value)| (handle.to_hex(), U256::from(*value)))
                    .collect(),
                decryption_proof: state.coprocessor.decryption_proof(&parsed, &encoded),
                abi_encoded_clear_values: encoded,
            }
        };

        if let Some(tamper) = tamper {
            tamper(handles, &mut raw);
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[ballot_test]
    async fn votes_are_tallied_homomorphically(network: Network, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        alice.vote(poll_id, network.ballot(&alice, 1)).await.unwrap();
        bob.vote(poll_id, network.ballot(&bob, 1)).await.unwrap();

        assert!(alice.has_voted(poll_id, bob.account()).await.unwrap());
        alice.close_poll(poll_id).await.unwrap();

        let handles = [
            alice.get_vote_count(poll_id, 0).await.unwrap(),
            alice.get_vote_count(poll_id, 1).await.unwrap(),
        ]
        .map(|bytes| CiphertextHandle::try_from(bytes.as_slice()).unwrap().to_hex());
        let raw = network.fhe().public_decrypt(&handles).await.unwrap();
        assert_eq!(raw.abi_encoded_clear_values, cleartext::encode_counts(&[0, 2]));
    }

    #[ballot_test]
    async fn ballots_are_bound_to_their_voter(network: Network, alice: Account, mallory: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        let err = mallory
            .vote(poll_id, network.ballot(&alice, 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerRejected);
        assert!(!alice.has_voted(poll_id, mallory.account()).await.unwrap());
    }

    #[ballot_test]
    async fn counts_are_private_until_closed(network: Network, alice: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        let handle = CiphertextHandle::try_from(
            alice.get_vote_count(poll_id, 0).await.unwrap().as_slice(),
        )
        .unwrap();
        let err = network.fhe().public_decrypt(&[handle.to_hex()]).await.unwrap_err();
        assert!(matches!(err, SdkError::Permanent(_)));
    }

    #[ballot_test]
    async fn only_the_creator_closes_and_deletes(alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        assert_eq!(
            bob.close_poll(poll_id).await.unwrap_err().kind(),
            ErrorKind::LedgerRejected
        );
        assert_eq!(
            bob.delete_poll(poll_id).await.unwrap_err().kind(),
            ErrorKind::LedgerRejected
        );

        alice.delete_poll(poll_id).await.unwrap();
        assert!(alice.poll_ids().await.unwrap().is_empty());
        assert!(matches!(
            bob.get_poll(poll_id).await,
            Err(Error::PollNotFound(id)) if id == poll_id
        ));
    }

    #[ballot_test]
    async fn failed_transactions_mine_nothing(network: Network, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        let block = network.block_number();
        bob.close_poll(poll_id).await.unwrap_err();
        assert_eq!(network.block_number(), block);
        assert_eq!(alice.events_since(block + 1).await.unwrap().events, vec![]);
    }

    #[test]
    fn addresses_are_deterministic() {
        assert_eq!(address_of("alice"), address_of("alice"));
        assert_ne!(address_of("alice"), address_of("bob"));
    }
}
