use ethers::types::Address;
use thiserror::Error;

use crate::{
    lifecycle::PollPhase,
    model::{handle::HandleError, poll::PollId},
};

pub type Result<T> = std::result::Result<T, Error>;

/// Every way a poll operation can fail.
///
/// Precondition failures are raised before any external call is made.
/// Each variant carries enough context (poll, option, handle, or step) to
/// build a user-facing message.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed ciphertext handle ({context}): {source}")]
    MalformedHandle {
        context: String,
        #[source]
        source: HandleError,
    },
    #[error("Option {index} does not exist on poll {poll_id}, which has {options} options")]
    InvalidOption {
        poll_id: PollId,
        index: usize,
        options: usize,
    },
    #[error("Poll {poll_id} is not open for voting (phase: {phase})")]
    PollNotOpen { poll_id: PollId, phase: PollPhase },
    #[error("Poll {poll_id} is not awaiting decryption (phase: {phase})")]
    PollNotClosed { poll_id: PollId, phase: PollPhase },
    #[error("Poll {poll_id} cannot be closed yet (phase: {phase})")]
    CannotClose { poll_id: PollId, phase: PollPhase },
    #[error("{voter:?} has already voted on poll {poll_id}")]
    AlreadyVoted { poll_id: PollId, voter: Address },
    #[error("Incomplete decryption: expected {expected} values, got {received}")]
    IncompleteDecryption { expected: usize, received: usize },
    #[error("Decryption mismatch: {0}")]
    DecryptionMismatch(String),
    #[error("Encryption engine not ready: {0}")]
    EngineNotReady(String),
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed: {0}")]
    Decryption(String),
    #[error("Ledger rejected {action}: {reason}")]
    LedgerRejected { action: &'static str, reason: String },
    #[error("Ledger unavailable during {action}: {reason}")]
    LedgerUnavailable { action: &'static str, reason: String },
    #[error("Poll {0} not found")]
    PollNotFound(PollId),
    #[error("{account:?} is not the creator of poll {poll_id}")]
    NotCreator { poll_id: PollId, account: Address },
    #[error("Invalid poll: {0}")]
    InvalidPoll(String),
    #[error(transparent)]
    Figment(#[from] figment::Error),
    #[error("Bad configuration: {0}")]
    Configuration(String),
}

/// The class of an [`Error`], without its context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedHandle,
    InvalidOption,
    PollNotOpen,
    PollNotClosed,
    CannotClose,
    AlreadyVoted,
    IncompleteDecryption,
    DecryptionMismatch,
    EngineNotReady,
    Encryption,
    Decryption,
    LedgerRejected,
    LedgerUnavailable,
    PollNotFound,
    NotCreator,
    InvalidPoll,
    Configuration,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedHandle { .. } => ErrorKind::MalformedHandle,
            Self::InvalidOption { .. } => ErrorKind::InvalidOption,
            Self::PollNotOpen { .. } => ErrorKind::PollNotOpen,
            Self::PollNotClosed { .. } => ErrorKind::PollNotClosed,
            Self::CannotClose { .. } => ErrorKind::CannotClose,
            Self::AlreadyVoted { .. } => ErrorKind::AlreadyVoted,
            Self::IncompleteDecryption { .. } => ErrorKind::IncompleteDecryption,
            Self::DecryptionMismatch(_) => ErrorKind::DecryptionMismatch,
            Self::EngineNotReady(_) => ErrorKind::EngineNotReady,
            Self::Encryption(_) => ErrorKind::Encryption,
            Self::Decryption(_) => ErrorKind::Decryption,
            Self::LedgerRejected { .. } => ErrorKind::LedgerRejected,
            Self::LedgerUnavailable { .. } => ErrorKind::LedgerUnavailable,
            Self::PollNotFound(_) => ErrorKind::PollNotFound,
            Self::NotCreator { .. } => ErrorKind::NotCreator,
            Self::InvalidPoll(_) => ErrorKind::InvalidPoll,
            Self::Figment(_) | Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn rejected(action: &'static str, reason: impl Into<String>) -> Self {
        Self::LedgerRejected {
            action,
            reason: reason.into(),
        }
    }

    pub fn unavailable(action: &'static str, reason: impl Into<String>) -> Self {
        Self::LedgerUnavailable {
            action,
            reason: reason.into(),
        }
    }
}
