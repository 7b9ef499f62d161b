//! [`LedgerGateway`] over JSON-RPC, signing with a local key.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::{
    abi::Detokenize,
    contract::{abigen, ContractCall, ContractError, EthLogDecode},
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, Bytes, TransactionReceipt, U256, U64},
};

use crate::{
    config::Config,
    error::{Error, Result},
    ledger::{EventBatch, LedgerEvent, LedgerGateway, PollRecord, Receipt},
    model::{
        ballot::EncryptedBallot,
        poll::{PollId, PollSpec},
    },
};

abigen!(
    SecretBallotContract,
    r#"[
        function createPoll(string question, string[] options, uint256 durationMinutes) returns (uint256)
        function vote(uint256 pollId, bytes32 encryptedVote, bytes inputProof)
        function closePoll(uint256 pollId)
        function deletePoll(uint256 pollId)
        function submitResults(uint256 pollId, bytes abiEncodedResults, bytes decryptionProof)
        function getPoll(uint256 pollId) view returns (string question, string[] options, address creator, uint256 endTime, bool isActive)
        function getFinalResults(uint256 pollId) view returns (uint256[])
        function getVoteCount(uint256 pollId, uint8 optionIndex) view returns (bytes32)
        function hasVoted(uint256 pollId, address voter) view returns (bool)
        function getAllPollIds() view returns (uint256[])
        event PollCreated(uint256 indexed pollId, address indexed creator, string question, uint256 endTime)
        event VoteCast(uint256 indexed pollId, address indexed voter)
        event PollClosed(uint256 indexed pollId)
        event ResultsSubmitted(uint256 indexed pollId, uint256[] results)
        event PollDeleted(uint256 indexed pollId)
    ]"#
);

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// The deployed poll contract, reached over HTTP JSON-RPC.
pub struct RpcLedger {
    contract: SecretBallotContract<Client>,
    client: Arc<Client>,
    /// Without a configured key, writes are refused before reaching the node.
    can_sign: bool,
    confirmations: usize,
    receipt_timeout: std::time::Duration,
}

impl RpcLedger {
    pub fn connect(config: &Config) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url())
            .map_err(|e| Error::Configuration(format!("invalid RPC URL: {e}")))?;

        let (wallet, can_sign) = match config.private_key() {
            Some(key) => (
                key.trim_start_matches("0x")
                    .parse::<LocalWallet>()
                    .map_err(|e| Error::Configuration(format!("invalid private key: {e}")))?,
                true,
            ),
            None => (LocalWallet::new(&mut rand::thread_rng()), false),
        };
        let wallet = wallet.with_chain_id(config.chain_id());

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = SecretBallotContract::new(config.contract_address(), client.clone());
        let receipt_timeout = config
            .receipt_timeout()
            .to_std()
            .map_err(|e| Error::Configuration(format!("invalid receipt timeout: {e}")))?;

        info!(
            "Connected to contract {:?} on chain {} as {:?}{}",
            config.contract_address(),
            config.chain_id(),
            client.address(),
            if can_sign { "" } else { " (read-only)" }
        );

        Ok(Self {
            contract,
            client,
            can_sign,
            confirmations: config.confirmations(),
            receipt_timeout,
        })
    }

    /// Send a transaction and wait for a successful receipt.
    async fn send<D: Detokenize>(
        &self,
        action: &'static str,
        poll_id: Option<PollId>,
        call: ContractCall<Client, D>,
    ) -> Result<TransactionReceipt> {
        if !self.can_sign {
            return Err(Error::Configuration(format!(
                "cannot {action} without a private key"
            )));
        }

        let pending = call
            .send()
            .await
            .map_err(|e| self.contract_error(action, poll_id, e))?;
        let tx_hash = pending.tx_hash();
        debug!("Sent {action} transaction {tx_hash:?}, awaiting receipt");

        let receipt = tokio::time::timeout(
            self.receipt_timeout,
            pending.confirmations(self.confirmations),
        )
        .await
        .map_err(|_| {
            Error::rejected(
                action,
                format!(
                    "no receipt for {tx_hash:?} after {}s",
                    self.receipt_timeout.as_secs()
                ),
            )
        })?
        .map_err(|e| Error::rejected(action, e.to_string()))?
        .ok_or_else(|| Error::rejected(action, format!("transaction {tx_hash:?} was dropped")))?;

        if receipt.status != Some(U64::one()) {
            return Err(Error::rejected(
                action,
                format!("transaction {tx_hash:?} reverted"),
            ));
        }
        Ok(receipt)
    }

    fn contract_error(
        &self,
        action: &'static str,
        poll_id: Option<PollId>,
        err: ContractError<Client>,
    ) -> Error {
        match err.decode_revert::<String>() {
            Some(reason) => classify_revert(action, poll_id, self.account(), reason),
            None if err.is_revert() => Error::rejected(action, err.to_string()),
            None => Error::unavailable(action, err.to_string()),
        }
    }
}

/// Map a revert reason to the most specific error available.
fn classify_revert(
    action: &'static str,
    poll_id: Option<PollId>,
    account: Address,
    reason: String,
) -> Error {
    let lower = reason.to_lowercase();
    match poll_id {
        Some(poll_id) if lower.contains("already voted") => Error::AlreadyVoted {
            poll_id,
            voter: account,
        },
        Some(poll_id) if lower.contains("not exist") || lower.contains("not found") => {
            Error::PollNotFound(poll_id)
        }
        _ => Error::rejected(action, reason),
    }
}

fn u256_to_u64(value: U256, what: &str) -> Result<u64> {
    if value > U256::from(u64::MAX) {
        return Err(Error::unavailable(
            "decode",
            format!("{what} {value} does not fit in 64 bits"),
        ));
    }
    Ok(value.as_u64())
}

fn timestamp(value: U256) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(u256_to_u64(value, "timestamp")?)
        .map_err(|_| Error::unavailable("decode", format!("timestamp {value} out of range")))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::unavailable("decode", format!("timestamp {value} out of range")))
}

impl From<&TransactionReceipt> for Receipt {
    fn from(receipt: &TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|n| n.as_u64()).unwrap_or_default(),
            gas_used: receipt.gas_used,
        }
    }
}

impl TryFrom<SecretBallotContractEvents> for LedgerEvent {
    type Error = Error;

    fn try_from(event: SecretBallotContractEvents) -> Result<Self> {
        let id = |poll_id| u256_to_u64(poll_id, "poll id");
        Ok(match event {
            SecretBallotContractEvents::PollCreatedFilter(e) => LedgerEvent::PollCreated {
                poll_id: id(e.poll_id)?,
                creator: e.creator,
                question: e.question,
                end_time: timestamp(e.end_time)?,
            },
            SecretBallotContractEvents::VoteCastFilter(e) => LedgerEvent::VoteCast {
                poll_id: id(e.poll_id)?,
                voter: e.voter,
            },
            SecretBallotContractEvents::PollClosedFilter(e) => LedgerEvent::PollClosed {
                poll_id: id(e.poll_id)?,
            },
            SecretBallotContractEvents::ResultsSubmittedFilter(e) => LedgerEvent::ResultsSubmitted {
                poll_id: id(e.poll_id)?,
                results: e
                    .results
                    .into_iter()
                    .map(|count| u256_to_u64(count, "result"))
                    .collect::<Result<_>>()?,
            },
            SecretBallotContractEvents::PollDeletedFilter(e) => LedgerEvent::PollDeleted {
                poll_id: id(e.poll_id)?,
            },
        })
    }
}

#[async_trait]
impl LedgerGateway for RpcLedger {
    fn account(&self) -> Address {
        self.client.address()
    }

    fn contract_address(&self) -> Address {
        self.contract.address()
    }

    async fn create_poll(&self, spec: &PollSpec) -> Result<(PollId, Receipt)> {
        let call = self.contract.create_poll(
            spec.question().to_string(),
            spec.options().to_vec(),
            U256::from(spec.duration_minutes()),
        );
        let receipt = self.send("create poll", None, call).await?;

        let contract = self.contract.address();
        let poll_id = receipt
            .logs
            .iter()
            .filter(|log| log.address == contract)
            .find_map(|log| match SecretBallotContractEvents::decode_log(&log.clone().into()) {
                Ok(SecretBallotContractEvents::PollCreatedFilter(e)) => Some(e.poll_id),
                _ => None,
            })
            .ok_or_else(|| Error::rejected("create poll", "no PollCreated event in receipt"))?;
        let poll_id = u256_to_u64(poll_id, "poll id")?;

        info!("Created poll {poll_id} in {:?}", receipt.transaction_hash);
        Ok((poll_id, Receipt::from(&receipt)))
    }

    async fn vote(&self, poll_id: PollId, ballot: EncryptedBallot) -> Result<Receipt> {
        let call = self.contract.vote(
            U256::from(poll_id),
            ballot.handle.into(),
            Bytes::from(ballot.proof),
        );
        let receipt = self.send("vote", Some(poll_id), call).await?;
        Ok(Receipt::from(&receipt))
    }

    async fn close_poll(&self, poll_id: PollId) -> Result<Receipt> {
        let call = self.contract.close_poll(U256::from(poll_id));
        let receipt = self.send("close poll", Some(poll_id), call).await?;
        Ok(Receipt::from(&receipt))
    }

    async fn delete_poll(&self, poll_id: PollId) -> Result<Receipt> {
        let call = self.contract.delete_poll(U256::from(poll_id));
        let receipt = self.send("delete poll", Some(poll_id), call).await?;
        Ok(Receipt::from(&receipt))
    }

    async fn submit_results(
        &self,
        poll_id: PollId,
        encoded: &[u8],
        proof: &[u8],
    ) -> Result<Receipt> {
        let call = self.contract.submit_results(
            U256::from(poll_id),
            Bytes::from(encoded.to_vec()),
            Bytes::from(proof.to_vec()),
        );
        let receipt = self.send("submit results", Some(poll_id), call).await?;
        Ok(Receipt::from(&receipt))
    }

    async fn get_poll(&self, poll_id: PollId) -> Result<PollRecord> {
        let (question, options, creator, end_time, is_active) = self
            .contract
            .get_poll(U256::from(poll_id))
            .call()
            .await
            .map_err(|e| self.contract_error("get poll", Some(poll_id), e))?;
        Ok(PollRecord {
            question,
            options,
            creator,
            end_time: timestamp(end_time)?,
            is_active,
        })
    }

    async fn get_final_results(&self, poll_id: PollId) -> Result<Vec<u64>> {
        self.contract
            .get_final_results(U256::from(poll_id))
            .call()
            .await
            .map_err(|e| self.contract_error("get final results", Some(poll_id), e))?
            .into_iter()
            .map(|count| u256_to_u64(count, "result"))
            .collect()
    }

    async fn get_vote_count(&self, poll_id: PollId, option: u8) -> Result<Vec<u8>> {
        let handle = self
            .contract
            .get_vote_count(U256::from(poll_id), option)
            .call()
            .await
            .map_err(|e| self.contract_error("get vote count", Some(poll_id), e))?;
        Ok(handle.to_vec())
    }

    async fn has_voted(&self, poll_id: PollId, voter: Address) -> Result<bool> {
        self.contract
            .has_voted(U256::from(poll_id), voter)
            .call()
            .await
            .map_err(|e| self.contract_error("check vote", Some(poll_id), e))
    }

    async fn poll_ids(&self) -> Result<Vec<PollId>> {
        self.contract
            .get_all_poll_ids()
            .call()
            .await
            .map_err(|e| self.contract_error("list polls", None, e))?
            .into_iter()
            .map(|id| u256_to_u64(id, "poll id"))
            .collect()
    }

    async fn events_since(&self, from_block: u64) -> Result<EventBatch> {
        let latest = self
            .client
            .get_block_number()
            .await
            .map_err(|e| Error::unavailable("fetch events", e.to_string()))?
            .as_u64();
        if from_block > latest {
            return Ok(EventBatch {
                events: vec![],
                next_block: from_block,
            });
        }

        let events = self
            .contract
            .events()
            .from_block(from_block)
            .to_block(latest)
            .query()
            .await
            .map_err(|e| self.contract_error("fetch events", None, e))?
            .into_iter()
            .map(LedgerEvent::try_from)
            .collect::<Result<_>>()?;

        Ok(EventBatch {
            events,
            next_block: latest + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::H256;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn revert_reasons_are_classified() {
        let account = Address::repeat_byte(0xaa);

        let err = classify_revert("vote", Some(3), account, "Already voted".to_string());
        assert!(matches!(
            err,
            Error::AlreadyVoted { poll_id: 3, voter } if voter == account
        ));

        let err = classify_revert("get poll", Some(9), account, "Poll does not exist".to_string());
        assert!(matches!(err, Error::PollNotFound(9)));

        let err = classify_revert("close poll", Some(3), account, "Only creator".to_string());
        assert_eq!(err.kind(), ErrorKind::LedgerRejected);
        assert!(err.to_string().contains("Only creator"));

        let err = classify_revert("list polls", None, account, "already voted".to_string());
        assert_eq!(err.kind(), ErrorKind::LedgerRejected);
    }

    #[test]
    fn numbers_must_fit() {
        assert_eq!(u256_to_u64(U256::from(7), "count").unwrap(), 7);
        assert!(u256_to_u64(U256::MAX, "count").is_err());
        assert_eq!(timestamp(U256::from(1_700_000_000)).unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn contract_events_convert() {
        let event = SecretBallotContractEvents::ResultsSubmittedFilter(ResultsSubmittedFilter {
            poll_id: U256::from(4),
            results: vec![U256::from(2), U256::from(0)],
        });
        assert_eq!(
            LedgerEvent::try_from(event).unwrap(),
            LedgerEvent::ResultsSubmitted {
                poll_id: 4,
                results: vec![2, 0]
            }
        );
    }

    #[test]
    fn receipts_convert() {
        let receipt = TransactionReceipt {
            transaction_hash: H256::repeat_byte(1),
            block_number: Some(U64::from(12)),
            gas_used: Some(U256::from(21000)),
            ..Default::default()
        };
        assert_eq!(
            Receipt::from(&receipt),
            Receipt {
                tx_hash: H256::repeat_byte(1),
                block_number: 12,
                gas_used: Some(U256::from(21000)),
            }
        );
    }

    #[test]
    fn read_only_connection() {
        let ledger = RpcLedger::connect(&Config::default()).unwrap();
        assert!(!ledger.can_sign);
        assert_eq!(ledger.contract_address(), Config::default().contract_address());
    }
}
