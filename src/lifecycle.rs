//! The state machine of a single poll.
//!
//! Nothing here is stored: the phase is recomputed from the poll's
//! ledger-reported fields and the current time on every call.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::poll::Poll;

/// Derived lifecycle stage of a poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollPhase {
    /// Open and before its end time.
    Active,
    /// Past its end time, but not yet closed by the creator.
    AwaitingClose,
    /// Closed, with no results submitted.
    AwaitingDecryption,
    /// Results have been submitted.
    Revealed,
}

impl Display for PollPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::AwaitingClose => "awaiting close",
            Self::AwaitingDecryption => "awaiting decryption",
            Self::Revealed => "revealed",
        };
        write!(f, "{name}")
    }
}

/// The phase of a poll at time `now`.
pub fn phase(poll: &Poll, now: DateTime<Utc>) -> PollPhase {
    phase_of(
        poll.is_active,
        poll.end_time,
        !poll.final_results.is_empty(),
        now,
    )
}

/// The phase decision table over raw fields.
///
/// Submitted results take precedence over the active flag, which takes
/// precedence over the end time.
pub fn phase_of(
    is_active: bool,
    end_time: DateTime<Utc>,
    revealed: bool,
    now: DateTime<Utc>,
) -> PollPhase {
    if revealed {
        PollPhase::Revealed
    } else if !is_active {
        PollPhase::AwaitingDecryption
    } else if now >= end_time {
        PollPhase::AwaitingClose
    } else {
        PollPhase::Active
    }
}

pub fn can_vote(poll: &Poll, now: DateTime<Utc>) -> bool {
    phase(poll, now) == PollPhase::Active
}

/// Whether the poll is expired but still open. Who may close it is the
/// ledger's concern.
pub fn can_close(poll: &Poll, now: DateTime<Utc>) -> bool {
    phase(poll, now) == PollPhase::AwaitingClose
}

pub fn can_reveal(poll: &Poll, now: DateTime<Utc>) -> bool {
    phase(poll, now) == PollPhase::AwaitingDecryption
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::poll::examples::epoch;

    #[test]
    fn every_combination_has_exactly_one_phase() {
        let now = epoch();
        let before = now + Duration::minutes(1);
        let after = now - Duration::minutes(1);

        let table = [
            (true, before, false, PollPhase::Active),
            (true, after, false, PollPhase::AwaitingClose),
            (false, before, false, PollPhase::AwaitingDecryption),
            (false, after, false, PollPhase::AwaitingDecryption),
            (true, before, true, PollPhase::Revealed),
            (true, after, true, PollPhase::Revealed),
            (false, before, true, PollPhase::Revealed),
            (false, after, true, PollPhase::Revealed),
        ];
        for (is_active, end_time, revealed, expected) in table {
            assert_eq!(
                phase_of(is_active, end_time, revealed, now),
                expected,
                "is_active={is_active} end_time={end_time} revealed={revealed}"
            );
        }
    }

    #[test]
    fn end_time_is_exclusive() {
        let now = epoch();
        assert_eq!(phase_of(true, now, false, now), PollPhase::AwaitingClose);
    }

    #[test]
    fn projections() {
        let now = epoch();
        let mut poll = Poll::example(now);

        assert!(can_vote(&poll, now));
        assert!(!can_close(&poll, now));
        assert!(!can_reveal(&poll, now));

        let later = poll.end_time + Duration::seconds(1);
        assert!(!can_vote(&poll, later));
        assert!(can_close(&poll, later));

        poll.is_active = false;
        assert!(can_reveal(&poll, later));
        assert!(!can_close(&poll, later));

        poll.final_results = vec![1, 0, 0];
        assert!(!can_reveal(&poll, later));
        assert_eq!(phase(&poll, later), PollPhase::Revealed);
    }
}
