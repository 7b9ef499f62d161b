//! The operations a poll participant performs, each re-reading the ledger
//! before it acts.

pub use manage::PollManager;
pub use reveal::ResultReveal;
pub use vote::VoteSubmission;

pub mod manage;
pub mod reveal;
pub mod vote;
