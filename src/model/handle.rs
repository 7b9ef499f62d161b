//! Conversions between the ledger's ciphertext handles, fixed-width binary,
//! and `0x`-prefixed hex text.
//!
//! Handles read back from the ledger or the decryption service must be
//! exactly [`HANDLE_LEN`] bytes. Only handles produced by the encryption SDK
//! on the vote path are normalised with [`CiphertextHandle::normalize`], which
//! truncates or zero-pads to the ledger's `bytes32` field width.

use std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
};

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;

/// Width of a ciphertext handle in bytes.
pub const HANDLE_LEN: usize = 32;

/// Width of a ciphertext handle in hex characters, excluding the prefix.
const HEX_LEN: usize = HANDLE_LEN * 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
    #[error("expected 64 hex characters, got {0}")]
    TextLength(usize),
    #[error("invalid hex: {0}")]
    Hex(String),
}

impl HandleError {
    /// Attach the location of the bad handle.
    pub fn at(self, context: impl Into<String>) -> Error {
        Error::MalformedHandle {
            context: context.into(),
            source: self,
        }
    }
}

/// An opaque reference to one encrypted value held by the ledger.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CiphertextHandle([u8; HANDLE_LEN]);

impl CiphertextHandle {
    pub const fn from_bytes(bytes: [u8; HANDLE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HANDLE_LEN] {
        &self.0
    }

    /// Fit an SDK-produced handle into the ledger's fixed-width field.
    ///
    /// Oversized input keeps its first 32 bytes; undersized input is
    /// right-padded with zeroes. This is lossy, and is only used on the vote
    /// path.
    pub fn normalize(raw: &[u8]) -> Self {
        let mut bytes = [0; HANDLE_LEN];
        let len = raw.len().min(HANDLE_LEN);
        bytes[..len].copy_from_slice(&raw[..len]);
        Self(bytes)
    }

    /// Lower-case `0x`-prefixed hex.
    pub fn to_hex(&self) -> String {
        to_hex_text(&self.0)
    }
}

/// Render arbitrary bytes as lower-case `0x`-prefixed hex.
pub fn to_hex_text(bytes: &[u8]) -> String {
    format!("0x{}", HEXLOWER.encode(bytes))
}

/// Parse `0x`-prefixed (or bare) hex text of any length.
pub fn from_hex_text(text: &str) -> Result<Vec<u8>, HandleError> {
    HEXLOWER_PERMISSIVE
        .decode(strip_prefix(text).as_bytes())
        .map_err(|e| HandleError::Hex(e.to_string()))
}

fn strip_prefix(text: &str) -> &str {
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text)
}

/// Strict parse: exactly 64 hex digits after an optional prefix, either case.
impl FromStr for CiphertextHandle {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = strip_prefix(s);
        if digits.len() != HEX_LEN {
            return Err(HandleError::TextLength(digits.len()));
        }
        let decoded = from_hex_text(digits)?;
        Self::try_from(decoded.as_slice())
    }
}

/// Strict conversion: the slice must be exactly 32 bytes.
impl TryFrom<&[u8]> for CiphertextHandle {
    type Error = HandleError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; HANDLE_LEN] = bytes
            .try_into()
            .map_err(|_| HandleError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for CiphertextHandle {
    type Error = HandleError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CiphertextHandle> for String {
    fn from(handle: CiphertextHandle) -> Self {
        handle.to_hex()
    }
}

impl From<[u8; HANDLE_LEN]> for CiphertextHandle {
    fn from(bytes: [u8; HANDLE_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<CiphertextHandle> for [u8; HANDLE_LEN] {
    fn from(handle: CiphertextHandle) -> Self {
        handle.0
    }
}

impl From<H256> for CiphertextHandle {
    fn from(hash: H256) -> Self {
        Self(hash.0)
    }
}

impl Display for CiphertextHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for CiphertextHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CiphertextHandle({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "0x00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    #[test]
    fn bytes_round_trip_through_text() {
        let mut bytes = [0u8; HANDLE_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i * 7 + 3) as u8;
        }
        let text = to_hex_text(&bytes);
        let handle: CiphertextHandle = text.parse().unwrap();
        assert_eq!(handle.as_bytes(), &bytes);
    }

    #[test]
    fn text_is_case_insensitive_and_lower_cased() {
        let upper = format!("0X{}", TEXT[2..].to_uppercase());
        let from_upper: CiphertextHandle = upper.parse().unwrap();
        let from_lower: CiphertextHandle = TEXT.parse().unwrap();
        assert_eq!(from_upper, from_lower);
        assert_eq!(from_upper.to_hex(), TEXT);

        // The prefix is optional.
        let bare: CiphertextHandle = TEXT[2..].parse().unwrap();
        assert_eq!(bare, from_lower);
    }

    #[test]
    fn strict_parsing_rejects_wrong_lengths() {
        assert_eq!(
            "0xabcd".parse::<CiphertextHandle>(),
            Err(HandleError::TextLength(4))
        );
        let long = format!("{TEXT}00");
        assert_eq!(
            long.parse::<CiphertextHandle>(),
            Err(HandleError::TextLength(66))
        );
        assert_eq!(
            CiphertextHandle::try_from(&[1u8; 31][..]),
            Err(HandleError::Length(31))
        );
        assert_eq!(
            CiphertextHandle::try_from(&[1u8; 33][..]),
            Err(HandleError::Length(33))
        );
    }

    #[test]
    fn strict_parsing_rejects_non_hex() {
        let bad = format!("0x{}zz", &TEXT[2..64]);
        assert!(matches!(
            bad.parse::<CiphertextHandle>(),
            Err(HandleError::Hex(_))
        ));
    }

    #[test]
    fn undersized_source_is_zero_padded_on_the_right() {
        let source: Vec<u8> = (1..=16).collect();
        let handle = CiphertextHandle::normalize(&source);

        let mut expected = [0u8; HANDLE_LEN];
        expected[..16].copy_from_slice(&source);
        assert_eq!(handle.as_bytes(), &expected);
        assert_eq!(
            handle.to_hex(),
            "0x0102030405060708090a0b0c0d0e0f1000000000000000000000000000000000"
        );
    }

    #[test]
    fn oversized_source_keeps_the_first_32_bytes() {
        let source: Vec<u8> = (1..=40).collect();
        let handle = CiphertextHandle::normalize(&source);
        assert_eq!(&handle.as_bytes()[..], &source[..32]);
        assert_eq!(handle.as_bytes()[31], 32);
    }
}
