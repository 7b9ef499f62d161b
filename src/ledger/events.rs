use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{ledger::LedgerGateway, model::poll::PollId};

/// Something that happened to a poll on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    PollCreated {
        poll_id: PollId,
        creator: Address,
        question: String,
        end_time: DateTime<Utc>,
    },
    VoteCast {
        poll_id: PollId,
        voter: Address,
    },
    PollClosed {
        poll_id: PollId,
    },
    ResultsSubmitted {
        poll_id: PollId,
        results: Vec<u64>,
    },
    PollDeleted {
        poll_id: PollId,
    },
}

impl LedgerEvent {
    pub fn poll_id(&self) -> PollId {
        match self {
            Self::PollCreated { poll_id, .. }
            | Self::VoteCast { poll_id, .. }
            | Self::PollClosed { poll_id }
            | Self::ResultsSubmitted { poll_id, .. }
            | Self::PollDeleted { poll_id } => *poll_id,
        }
    }
}

impl Display for LedgerEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PollCreated {
                poll_id,
                creator,
                question,
                end_time,
            } => write!(
                f,
                "Poll {poll_id} created by {creator:?}: {question:?}, ends {end_time}"
            ),
            Self::VoteCast { poll_id, voter } => write!(f, "{voter:?} voted on poll {poll_id}"),
            Self::PollClosed { poll_id } => write!(f, "Poll {poll_id} closed"),
            Self::ResultsSubmitted { poll_id, results } => {
                write!(f, "Poll {poll_id} revealed {results:?}")
            }
            Self::PollDeleted { poll_id } => write!(f, "Poll {poll_id} deleted"),
        }
    }
}

/// Events from a range of blocks, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventBatch {
    pub events: Vec<LedgerEvent>,
    /// Where the next query should start.
    pub next_block: u64,
}

/// A best-effort live feed of ledger events.
///
/// A background task polls the ledger and forwards new events. Polling
/// errors are logged and retried on the next tick; no event is guaranteed
/// to be delivered. The task stops when the feed is dropped.
pub struct EventFeed {
    receiver: mpsc::Receiver<LedgerEvent>,
    task: JoinHandle<()>,
}

impl EventFeed {
    pub fn spawn(ledger: Arc<dyn LedgerGateway>, from_block: u64, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(64);

        let task = tokio::spawn(async move {
            let mut next_block = from_block;
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let batch = match ledger.events_since(next_block).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("Failed to fetch events from block {next_block}: {e}");
                        continue;
                    }
                };
                next_block = batch.next_block;
                for event in batch.events {
                    if sender.send(event).await.is_err() {
                        debug!("Event feed closed, stopping");
                        return;
                    }
                }
            }
        });

        Self { receiver, task }
    }

    /// The next event, or `None` once the feed has stopped.
    pub async fn next(&mut self) -> Option<LedgerEvent> {
        self.receiver.recv().await
    }

    /// Stop polling. Events already received can still be drained.
    pub fn stop(&mut self) {
        self.task.abort();
    }
}

impl Drop for EventFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::poll::PollSpec,
        simulation::{Account, Network},
    };

    #[ballot_test]
    async fn feed_delivers_events_in_order(network: Network, alice: Account, bob: Account) {
        let mut feed = EventFeed::spawn(Arc::new(bob.clone()), 0, Duration::from_millis(5));

        let (poll_id, _) = alice.create_poll(&PollSpec::example()).await.unwrap();
        let ballot = network.ballot(&bob, 1);
        bob.vote(poll_id, ballot).await.unwrap();

        match feed.next().await.unwrap() {
            LedgerEvent::PollCreated {
                poll_id: id,
                creator,
                question,
                ..
            } => {
                assert_eq!(id, poll_id);
                assert_eq!(creator, alice.account());
                assert_eq!(question, "Tabs or spaces?");
            }
            other => panic!("Unexpected event {other:?}"),
        }
        assert_eq!(
            feed.next().await.unwrap(),
            LedgerEvent::VoteCast {
                poll_id,
                voter: bob.account()
            }
        );
    }

    #[test]
    fn events_display() {
        let event = LedgerEvent::ResultsSubmitted {
            poll_id: 4,
            results: vec![2, 0, 1],
        };
        assert_eq!(event.to_string(), "Poll 4 revealed [2, 0, 1]");
        assert_eq!(LedgerEvent::PollClosed { poll_id: 4 }.to_string(), "Poll 4 closed");
    }

    #[ballot_test]
    async fn feed_starts_from_the_given_block(network: Network, alice: Account) {
        alice.create_poll(&PollSpec::example()).await.unwrap();
        let from = network.block_number() + 1;
        let (second, _) = alice.create_poll(&PollSpec::example()).await.unwrap();

        let mut feed = EventFeed::spawn(Arc::new(alice.clone()), from, Duration::from_millis(5));
        let event = feed.next().await.unwrap();
        assert_eq!(event.poll_id(), second);

        feed.stop();
        assert_eq!(feed.next().await, None);
    }
}
