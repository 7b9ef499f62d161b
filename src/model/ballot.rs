use std::{collections::HashMap, ops::Deref};

use crate::{
    error::{Error, Result},
    model::{cleartext, handle::CiphertextHandle},
};

/// One encrypted vote, ready for submission.
///
/// Deliberately not `Clone`: a ballot is consumed by exactly one vote
/// transaction.
#[derive(Debug, PartialEq, Eq)]
pub struct EncryptedBallot {
    /// Normalised to the ledger's `bytes32` width.
    pub handle: CiphertextHandle,
    /// Validity proof binding the handle to the contract and the signer.
    pub proof: Vec<u8>,
}

/// The aggregate handles of a poll, one per option, in option order.
///
/// This is the only ordering used between fetching, decrypting, and
/// submitting results; it is never rebuilt from another source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleList(Vec<CiphertextHandle>);

impl HandleList {
    pub fn new(handles: Vec<CiphertextHandle>) -> Result<Self> {
        if handles.is_empty() {
            return Err(Error::Decryption("no handles to decrypt".to_string()));
        }
        Ok(Self(handles))
    }
}

impl Deref for HandleList {
    type Target = [CiphertextHandle];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The result of publicly decrypting a [`HandleList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionBundle {
    handles: HandleList,
    values: HashMap<CiphertextHandle, u64>,
    encoded: Vec<u8>,
    proof: Vec<u8>,
}

impl DecryptionBundle {
    pub fn new(
        handles: HandleList,
        values: HashMap<CiphertextHandle, u64>,
        encoded: Vec<u8>,
        proof: Vec<u8>,
    ) -> Self {
        Self {
            handles,
            values,
            encoded,
            proof,
        }
    }

    pub fn handles(&self) -> &HandleList {
        &self.handles
    }

    pub fn values(&self) -> &HashMap<CiphertextHandle, u64> {
        &self.values
    }

    /// Cleartext values as the ABI-encoded tuple the ledger verifies.
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn proof(&self) -> &[u8] {
        &self.proof
    }

    /// Check the bundle before anything is submitted, returning the values in
    /// option order.
    ///
    /// The mapping must cover exactly the requested handles, and the encoded
    /// tuple, decoded independently, must agree with it element by element.
    pub fn verify(&self) -> Result<Vec<u64>> {
        let mapped = self.mapped_values()?;

        let decoded = cleartext::decode_counts(&self.encoded, self.handles.len())
            .map_err(|e| Error::DecryptionMismatch(format!("encoded values: {e}")))?;

        for (index, (encoded, mapped)) in decoded.iter().zip(&mapped).enumerate() {
            if encoded != mapped {
                return Err(Error::DecryptionMismatch(format!(
                    "option {index} ({}) decodes to {encoded} but maps to {mapped}",
                    self.handles[index]
                )));
            }
        }
        Ok(mapped)
    }

    fn mapped_values(&self) -> Result<Vec<u64>> {
        let incomplete = || Error::IncompleteDecryption {
            expected: self.handles.len(),
            received: self.values.len(),
        };
        if self.values.len() != self.handles.len() {
            return Err(incomplete());
        }
        self.handles
            .iter()
            .map(|handle| self.values.get(handle).copied().ok_or_else(incomplete))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn handles(n: u8) -> HandleList {
        HandleList::new(
            (1..=n)
                .map(|i| CiphertextHandle::from_bytes([i; 32]))
                .collect(),
        )
        .unwrap()
    }

    fn bundle(values: &[u64], encoded: &[u64]) -> DecryptionBundle {
        let handles = handles(values.len() as u8);
        let values = handles.iter().copied().zip(values.iter().copied()).collect();
        DecryptionBundle::new(
            handles,
            values,
            cleartext::encode_counts(encoded),
            vec![0xaa],
        )
    }

    #[test]
    fn consistent_bundle_verifies_in_handle_order() {
        let bundle = bundle(&[5, 12, 3], &[5, 12, 3]);
        assert_eq!(bundle.verify().unwrap(), vec![5, 12, 3]);
    }

    #[test]
    fn disagreement_is_a_mismatch() {
        let bundle = bundle(&[5, 12, 4], &[5, 12, 3]);
        let err = bundle.verify().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionMismatch);
        assert!(err.to_string().contains("option 2"));
    }

    #[test]
    fn wrong_arity_is_a_mismatch() {
        let bundle = bundle(&[5, 12, 3], &[5, 12]);
        assert_eq!(bundle.verify().unwrap_err().kind(), ErrorKind::DecryptionMismatch);
    }

    #[test]
    fn missing_value_is_incomplete() {
        let handles = handles(3);
        let values = handles.iter().take(2).map(|h| (*h, 1)).collect();
        let bundle = DecryptionBundle::new(
            handles,
            values,
            cleartext::encode_counts(&[1, 1, 1]),
            vec![0xaa],
        );
        assert!(matches!(
            bundle.verify(),
            Err(Error::IncompleteDecryption {
                expected: 3,
                received: 2
            })
        ));
    }

    #[test]
    fn foreign_value_is_incomplete() {
        let handles = handles(2);
        let mut values: HashMap<_, _> = handles.iter().take(1).map(|h| (*h, 1)).collect();
        values.insert(CiphertextHandle::from_bytes([9; 32]), 1);
        let bundle = DecryptionBundle::new(
            handles,
            values,
            cleartext::encode_counts(&[1, 1]),
            vec![0xaa],
        );
        assert_eq!(
            bundle.verify().unwrap_err().kind(),
            ErrorKind::IncompleteDecryption
        );
    }

    #[test]
    fn empty_handle_list_is_rejected() {
        assert!(HandleList::new(vec![]).is_err());
    }
}
