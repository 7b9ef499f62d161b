use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    ledger::{LedgerGateway, PollRecord},
    lifecycle::{self, PollPhase},
};

pub use listing::{sort_for_display, PollFilter};
pub use spec::PollSpec;
pub use tally::{OptionTally, Tally};

pub mod listing;
pub mod spec;
pub mod tally;

/// Ledger-assigned poll identifier.
pub type PollId = u64;

/// Fewest options a poll may have.
pub const MIN_OPTIONS: usize = 2;

/// Most options a poll may have.
pub const MAX_OPTIONS: usize = 5;

/// A snapshot of one poll as the ledger reported it.
///
/// Snapshots are only ever used for display and gating; every pipeline
/// re-reads the ledger before acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub question: String,
    /// Option labels, in ballot order.
    pub options: Vec<String>,
    pub creator: Address,
    pub end_time: DateTime<Utc>,
    /// Cleared only by an explicit close from the creator, never by time.
    pub is_active: bool,
    /// Empty until results have been revealed.
    pub final_results: Vec<u64>,
}

impl Poll {
    /// Read the authoritative state of a poll.
    pub async fn fetch(ledger: &dyn LedgerGateway, id: PollId) -> Result<Self> {
        let (record, final_results) =
            futures::try_join!(ledger.get_poll(id), ledger.get_final_results(id))?;
        Ok(Self::from_record(id, record, final_results))
    }

    pub fn from_record(id: PollId, record: PollRecord, final_results: Vec<u64>) -> Self {
        Self {
            id,
            question: record.question,
            options: record.options,
            creator: record.creator,
            end_time: record.end_time,
            is_active: record.is_active,
            final_results,
        }
    }

    pub fn phase(&self, now: DateTime<Utc>) -> PollPhase {
        lifecycle::phase(self, now)
    }

    pub fn is_creator(&self, account: Address) -> bool {
        self.creator == account
    }

    /// Validate an option index, returning it in the ledger's `uint8` form.
    pub fn option(&self, index: usize) -> Result<u8> {
        if index >= self.options.len() {
            return Err(Error::InvalidOption {
                poll_id: self.id,
                index,
                options: self.options.len(),
            });
        }
        u8::try_from(index).map_err(|_| Error::InvalidOption {
            poll_id: self.id,
            index,
            options: self.options.len(),
        })
    }

    /// Human-readable time left before the poll expires, or `None` if it
    /// already has.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<String> {
        let remaining = self.end_time - now;
        if remaining <= chrono::Duration::zero() {
            return None;
        }
        let days = remaining.num_days();
        let hours = remaining.num_hours() % 24;
        let minutes = remaining.num_minutes() % 60;
        Some(if days > 0 {
            format!("{days}d {hours}h remaining")
        } else if hours > 0 {
            format!("{hours}h {minutes}m remaining")
        } else {
            format!("{minutes}m remaining")
        })
    }
}

/// Example data for tests.
#[cfg(test)]
pub(crate) mod examples {
    use chrono::{Duration, TimeZone};

    use super::*;

    impl Poll {
        pub fn example(now: DateTime<Utc>) -> Self {
            Self {
                id: 7,
                question: "Best sorting algorithm?".to_string(),
                options: vec![
                    "Quicksort".to_string(),
                    "Mergesort".to_string(),
                    "Bogosort".to_string(),
                ],
                creator: Address::repeat_byte(0xc0),
                end_time: now + Duration::hours(1),
                is_active: true,
                final_results: vec![],
            }
        }
    }

    pub fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::examples::epoch;
    use super::*;

    #[test]
    fn option_bounds() {
        let poll = Poll::example(epoch());
        assert_eq!(poll.option(0).unwrap(), 0);
        assert_eq!(poll.option(2).unwrap(), 2);
        assert!(matches!(
            poll.option(3),
            Err(Error::InvalidOption {
                poll_id: 7,
                index: 3,
                options: 3
            })
        ));
    }

    #[test]
    fn time_remaining_formats() {
        let now = epoch();
        let mut poll = Poll::example(now);

        poll.end_time = now + Duration::days(2) + Duration::hours(3) + Duration::minutes(5);
        assert_eq!(poll.time_remaining(now).unwrap(), "2d 3h remaining");

        poll.end_time = now + Duration::hours(4) + Duration::minutes(30);
        assert_eq!(poll.time_remaining(now).unwrap(), "4h 30m remaining");

        poll.end_time = now + Duration::minutes(9) + Duration::seconds(59);
        assert_eq!(poll.time_remaining(now).unwrap(), "9m remaining");

        poll.end_time = now;
        assert_eq!(poll.time_remaining(now), None);
    }
}
