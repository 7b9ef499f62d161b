use std::sync::Arc;

use crate::{
    clock::Clock,
    engine::FheEngine,
    error::{Error, Result},
    ledger::{LedgerGateway, Receipt},
    lifecycle::PollPhase,
    model::poll::{Poll, PollId},
};

/// Casts encrypted votes as the ledger's signing account.
pub struct VoteSubmission {
    ledger: Arc<dyn LedgerGateway>,
    engine: Arc<FheEngine>,
    clock: Arc<dyn Clock>,
}

impl VoteSubmission {
    pub fn new(ledger: Arc<dyn LedgerGateway>, engine: Arc<FheEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            engine,
            clock,
        }
    }

    /// Encrypt a vote for the option at `option_index` and cast it on poll
    /// `poll_id`.
    ///
    /// The poll is re-read first, and every precondition is checked before
    /// anything is encrypted. The ledger still has the final say on whether
    /// the vote counts, so a late rejection is returned as-is.
    pub async fn submit_vote(&self, poll_id: PollId, option_index: usize) -> Result<Receipt> {
        let voter = self.ledger.account();
        let poll = Poll::fetch(self.ledger.as_ref(), poll_id).await?;

        let phase = poll.phase(self.clock.now());
        if phase != PollPhase::Active {
            return Err(Error::PollNotOpen { poll_id, phase });
        }
        let option = poll.option(option_index)?;
        if self.ledger.has_voted(poll_id, voter).await? {
            return Err(Error::AlreadyVoted { poll_id, voter });
        }

        debug!("Encrypting vote for option {option} of poll {poll_id}");
        let ballot = self
            .engine
            .encrypt_vote(self.ledger.contract_address(), voter, option)
            .await?;

        let receipt = self.ledger.vote(poll_id, ballot).await.map_err(|e| {
            error!("Vote on poll {poll_id} failed: {e}");
            e
        })?;
        info!(
            "{voter:?} voted on poll {poll_id} in block {}",
            receipt.block_number
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        clock::ManualClock,
        engine::SdkError,
        error::ErrorKind,
        model::poll::PollSpec,
        simulation::{Account, Network},
    };

    fn voting(network: &Network, voter: &Account) -> VoteSubmission {
        VoteSubmission::new(
            Arc::new(voter.clone()),
            network.engine(),
            Arc::new(network.clock()),
        )
    }

    #[ballot_test]
    async fn vote_is_recorded(network: Network, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();

        let receipt = voting(&network, &bob).submit_vote(poll_id, 1).await.unwrap();
        assert_eq!(receipt.block_number, network.block_number());
        assert!(alice.has_voted(poll_id, bob.account()).await.unwrap());
        assert!(!alice.has_voted(poll_id, alice.account()).await.unwrap());
        assert_eq!(network.fhe().encrypt_calls(), 1);
    }

    #[ballot_test]
    async fn closed_poll_is_never_encrypted_for(network: Network, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        alice.close_poll(poll_id).await.unwrap();

        let voting = voting(&network, &bob);
        let err = voting.submit_vote(poll_id, 0).await.unwrap_err();
        assert!(matches!(
            err,
            Error::PollNotOpen {
                phase: PollPhase::AwaitingDecryption,
                ..
            }
        ));
        assert_eq!(network.fhe().encrypt_calls(), 0);
        assert_eq!(network.fhe().create_calls(), 0);
    }

    #[ballot_test]
    async fn expired_poll_is_not_open(network: Network, clock: ManualClock, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        clock.advance(Duration::minutes(60));

        let err = voting(&network, &bob).submit_vote(poll_id, 0).await.unwrap_err();
        assert!(matches!(
            err,
            Error::PollNotOpen {
                phase: PollPhase::AwaitingClose,
                ..
            }
        ));
        assert_eq!(network.fhe().encrypt_calls(), 0);
    }

    #[ballot_test]
    async fn option_must_exist(network: Network, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();

        let err = voting(&network, &bob).submit_vote(poll_id, 2).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidOption {
                index: 2,
                options: 2,
                ..
            }
        ));
        assert_eq!(network.fhe().encrypt_calls(), 0);
    }

    #[ballot_test]
    async fn second_vote_is_caught_before_encryption(network: Network, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        let voting = voting(&network, &bob);
        voting.submit_vote(poll_id, 0).await.unwrap();

        let err = voting.submit_vote(poll_id, 1).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyVoted { voter, .. } if voter == bob.account()));
        assert_eq!(network.fhe().encrypt_calls(), 1);
    }

    #[ballot_test]
    async fn ledger_rejection_is_authoritative(network: Network, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        let voting = voting(&network, &bob);

        // Both attempts pass the client-side check while the engine starts up.
        let (first, second) = tokio::join!(
            voting.submit_vote(poll_id, 0),
            voting.submit_vote(poll_id, 1)
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(e) if e.kind() == ErrorKind::AlreadyVoted)));
        assert_eq!(network.fhe().encrypt_calls(), 2);
        assert_eq!(network.fhe().create_calls(), 1);
    }

    #[ballot_test]
    async fn encryption_failure_is_not_retried(network: Network, alice: Account, bob: Account) {
        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        let block = network.block_number();
        network
            .fhe()
            .fail_encrypt([SdkError::Transient("relayer unreachable".to_string())]);
        let voting = voting(&network, &bob);

        let err = voting.submit_vote(poll_id, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encryption);
        assert_eq!(network.fhe().encrypt_calls(), 1);
        assert_eq!(network.block_number(), block);
        assert!(!alice.has_voted(poll_id, bob.account()).await.unwrap());

        // Trying again is up to the caller, and encrypts afresh.
        voting.submit_vote(poll_id, 0).await.unwrap();
        assert_eq!(network.fhe().encrypt_calls(), 2);
    }

    #[ballot_test]
    async fn missing_poll_is_not_found(network: Network, bob: Account) {
        let err = voting(&network, &bob).submit_vote(42, 0).await.unwrap_err();
        assert!(matches!(err, Error::PollNotFound(42)));
    }
}
