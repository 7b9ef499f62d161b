use std::sync::Arc;

use ethers::types::Address;
use futures::future::join_all;

use crate::{
    clock::Clock,
    error::{Error, Result},
    ledger::{LedgerGateway, Receipt},
    lifecycle,
    model::poll::{sort_for_display, Poll, PollFilter, PollId, PollSpec},
};

/// Creates, closes, deletes and lists polls. None of this needs the FHE
/// engine.
pub struct PollManager {
    ledger: Arc<dyn LedgerGateway>,
    clock: Arc<dyn Clock>,
}

impl PollManager {
    pub fn new(ledger: Arc<dyn LedgerGateway>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// The account polls are created and closed as.
    pub fn account(&self) -> Address {
        self.ledger.account()
    }

    pub async fn create_poll(&self, spec: &PollSpec) -> Result<(PollId, Receipt)> {
        debug!(
            "Creating poll {:?} with {} options for {} minutes",
            spec.question(),
            spec.options().len(),
            spec.duration_minutes()
        );
        let (poll_id, receipt) = self.ledger.create_poll(spec).await?;
        info!("Created poll {poll_id} in block {}", receipt.block_number);
        Ok((poll_id, receipt))
    }

    pub async fn poll(&self, poll_id: PollId) -> Result<Poll> {
        Poll::fetch(self.ledger.as_ref(), poll_id).await
    }

    /// Whether this manager's account has voted on the poll.
    pub async fn has_voted(&self, poll_id: PollId) -> Result<bool> {
        self.ledger.has_voted(poll_id, self.account()).await
    }

    /// Close an expired poll, making its tallies publicly decryptable.
    ///
    /// Only the creator may close a poll, and only once it has expired.
    pub async fn close_poll(&self, poll_id: PollId) -> Result<Receipt> {
        let account = self.account();
        let poll = self.poll(poll_id).await?;
        if !poll.is_creator(account) {
            return Err(Error::NotCreator { poll_id, account });
        }
        let now = self.clock.now();
        if !lifecycle::can_close(&poll, now) {
            let phase = poll.phase(now);
            return Err(Error::CannotClose { poll_id, phase });
        }

        let receipt = self.ledger.close_poll(poll_id).await?;
        info!("Closed poll {poll_id} in block {}", receipt.block_number);
        Ok(receipt)
    }

    /// Delete a poll in any phase. Only the creator may delete it.
    pub async fn delete_poll(&self, poll_id: PollId) -> Result<Receipt> {
        let account = self.account();
        let poll = self.poll(poll_id).await?;
        if !poll.is_creator(account) {
            return Err(Error::NotCreator { poll_id, account });
        }

        let receipt = self.ledger.delete_poll(poll_id).await?;
        info!("Deleted poll {poll_id} in block {}", receipt.block_number);
        Ok(receipt)
    }

    /// Every poll matching `filter`, votable polls first.
    ///
    /// Polls that fail to load are left out rather than failing the listing.
    pub async fn list_polls(&self, filter: PollFilter) -> Result<Vec<Poll>> {
        let ids = self.ledger.poll_ids().await?;
        let fetched = join_all(ids.iter().map(|id| self.poll(*id))).await;

        let now = self.clock.now();
        let mut polls = ids
            .into_iter()
            .zip(fetched)
            .filter_map(|(id, poll)| match poll {
                Ok(poll) => Some(poll),
                Err(e) => {
                    warn!("Skipping poll {id}: {e}");
                    None
                }
            })
            .filter(|poll| filter.matches(poll, now))
            .collect::<Vec<_>>();
        sort_for_display(&mut polls, now);
        Ok(polls)
    }
}
