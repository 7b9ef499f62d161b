//! The boundary to the ledger holding polls, ballots and results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::{
        ballot::EncryptedBallot,
        poll::{PollId, PollSpec},
    },
};

pub use events::{EventBatch, EventFeed, LedgerEvent};
pub use rpc::RpcLedger;

pub mod events;
pub mod rpc;

/// A poll's stored fields, as returned by `getPoll`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRecord {
    pub question: String,
    pub options: Vec<String>,
    pub creator: Address,
    pub end_time: DateTime<Utc>,
    pub is_active: bool,
}

/// Evidence that a transaction was included and succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub gas_used: Option<U256>,
}

/// Reads and signed writes against the poll contract.
///
/// Writes resolve only once the transaction has a successful receipt; a
/// reverted or unconfirmed transaction is an error.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// The account that signs transactions.
    fn account(&self) -> Address;

    /// The poll contract, which encrypted inputs are bound to.
    fn contract_address(&self) -> Address;

    /// Create a poll, returning the id assigned by the ledger.
    async fn create_poll(&self, spec: &PollSpec) -> Result<(PollId, Receipt)>;

    async fn vote(&self, poll_id: PollId, ballot: EncryptedBallot) -> Result<Receipt>;

    /// Creator only. Makes the poll's counts publicly decryptable.
    async fn close_poll(&self, poll_id: PollId) -> Result<Receipt>;

    /// Creator only.
    async fn delete_poll(&self, poll_id: PollId) -> Result<Receipt>;

    /// Submit revealed counts as an ABI-encoded tuple, with the decryption
    /// proof the ledger checks them against.
    async fn submit_results(
        &self,
        poll_id: PollId,
        encoded: &[u8],
        proof: &[u8],
    ) -> Result<Receipt>;

    async fn get_poll(&self, poll_id: PollId) -> Result<PollRecord>;

    /// Empty until results are submitted.
    async fn get_final_results(&self, poll_id: PollId) -> Result<Vec<u64>>;

    /// The raw handle of an option's encrypted running count.
    async fn get_vote_count(&self, poll_id: PollId, option: u8) -> Result<Vec<u8>>;

    async fn has_voted(&self, poll_id: PollId, voter: Address) -> Result<bool>;

    /// Every poll that has not been deleted.
    async fn poll_ids(&self) -> Result<Vec<PollId>>;

    /// Events emitted from block `from_block` onwards.
    async fn events_since(&self, from_block: u64) -> Result<EventBatch>;
}
