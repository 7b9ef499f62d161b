//! The binary form of revealed results: a tuple of `uint256` words, encoded
//! with the ledger's ABI rules. The ledger verifies the decryption proof over
//! exactly these bytes.

use ethers::{
    abi::{self, ParamType, Token},
    types::U256,
};
use thiserror::Error;

/// Width of one ABI word in bytes.
pub const WORD_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TupleError {
    #[error("expected {expected} bytes for a {arity}-tuple, got {actual}")]
    Length {
        arity: usize,
        expected: usize,
        actual: usize,
    },
    #[error("element {index} does not fit in 64 bits")]
    Overflow { index: usize },
    #[error("ABI decoding failed: {0}")]
    Abi(String),
}

/// Encode counts as a static `(uint256, ...)` tuple.
pub fn encode_counts(counts: &[u64]) -> Vec<u8> {
    let tokens = counts
        .iter()
        .map(|count| Token::Uint(U256::from(*count)))
        .collect::<Vec<_>>();
    abi::encode(&tokens)
}

/// Decode a static `(uint256, ...)` tuple of the given arity.
///
/// The input must be exactly `arity` words long; trailing bytes are an error.
pub fn decode_counts(bytes: &[u8], arity: usize) -> Result<Vec<u64>, TupleError> {
    let expected = arity * WORD_LEN;
    if bytes.len() != expected {
        return Err(TupleError::Length {
            arity,
            expected,
            actual: bytes.len(),
        });
    }

    let types = vec![ParamType::Uint(256); arity];
    let tokens = abi::decode(&types, bytes).map_err(|e| TupleError::Abi(e.to_string()))?;

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| match token {
            Token::Uint(value) if value <= U256::from(u64::MAX) => Ok(value.as_u64()),
            _ => Err(TupleError::Overflow { index }),
        })
        .collect()
}
