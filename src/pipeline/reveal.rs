use std::sync::Arc;

use futures::future::try_join_all;

use crate::{
    clock::Clock,
    engine::FheEngine,
    error::{Error, Result},
    ledger::LedgerGateway,
    lifecycle::PollPhase,
    model::{
        ballot::HandleList,
        handle::CiphertextHandle,
        poll::{Poll, PollId},
    },
};

/// Decrypts a closed poll's tallies and publishes them to the ledger.
///
/// The handle list fetched from the ledger is the only ordering used: it is
/// passed to the decryption service, checked against the decrypted bundle,
/// and the bundle's encoding is what gets submitted.
pub struct ResultReveal {
    ledger: Arc<dyn LedgerGateway>,
    engine: Arc<FheEngine>,
    clock: Arc<dyn Clock>,
}

impl ResultReveal {
    pub fn new(ledger: Arc<dyn LedgerGateway>, engine: Arc<FheEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            engine,
            clock,
        }
    }

    /// Reveal the results of poll `poll_id`, returning one count per option.
    ///
    /// Nothing is submitted unless the decrypted values cover every handle
    /// and agree with their encoded form.
    pub async fn reveal_results(&self, poll_id: PollId) -> Result<Vec<u64>> {
        let poll = Poll::fetch(self.ledger.as_ref(), poll_id).await?;
        let phase = poll.phase(self.clock.now());
        if phase != PollPhase::AwaitingDecryption {
            return Err(Error::PollNotClosed { poll_id, phase });
        }

        let handles = self.fetch_handles(&poll).await?;
        debug!("Decrypting {} tallies of poll {poll_id}", handles.len());
        let bundle = self.engine.decrypt(handles).await?;
        let results = bundle.verify().map_err(|e| {
            error!("Refusing to submit results for poll {poll_id}: {e}");
            e
        })?;

        let receipt = self
            .ledger
            .submit_results(poll_id, bundle.encoded(), bundle.proof())
            .await?;
        info!(
            "Revealed results {results:?} for poll {poll_id} in block {}",
            receipt.block_number
        );
        Ok(results)
    }

    /// Fetch the aggregate handle of every option, concurrently but returned
    /// in option order.
    async fn fetch_handles(&self, poll: &Poll) -> Result<HandleList> {
        let fetches = (0..poll.options.len()).map(|index| async move {
            let option = poll.option(index)?;
            let bytes = self.ledger.get_vote_count(poll.id, option).await?;
            CiphertextHandle::try_from(bytes.as_slice())
                .map_err(|e| e.at(format!("tally of option {index} of poll {}", poll.id)))
        });
        HandleList::new(try_join_all(fetches).await?)
    }
}
