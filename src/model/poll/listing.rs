use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::{lifecycle::PollPhase, model::poll::Poll};

/// Which polls a listing should show.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PollFilter {
    #[default]
    All,
    /// Polls that can still be voted on.
    Active,
    /// Polls that expired or were closed, revealed or not.
    Ended,
    CreatedBy(Address),
}

impl PollFilter {
    pub fn matches(&self, poll: &Poll, now: DateTime<Utc>) -> bool {
        match self {
            Self::All => true,
            Self::Active => poll.phase(now) == PollPhase::Active,
            Self::Ended => poll.phase(now) != PollPhase::Active,
            Self::CreatedBy(account) => poll.is_creator(*account),
        }
    }
}

/// Order polls for display: votable polls first, then by end time, latest
/// first.
pub fn sort_for_display(polls: &mut [Poll], now: DateTime<Utc>) {
    polls.sort_by_key(|poll| (poll.phase(now) != PollPhase::Active, Reverse(poll.end_time)));
}
