//! The boundary to the FHE client SDK.
//!
//! The SDK instance is expensive to create (it loads the TFHE engine and
//! fetches network keys), so [`FheEngine`] creates it lazily, exactly once,
//! behind a latch that concurrent callers share.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{
    config::FhevmNetwork,
    error::{Error, Result},
    model::{
        ballot::{DecryptionBundle, EncryptedBallot, HandleList},
        handle::{CiphertextHandle, HANDLE_LEN},
    },
};

pub use retry::RetryPolicy;

pub mod retry;

/// A failure reported by the SDK.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
    /// Worth retrying, e.g. the relayer was unreachable.
    #[error("{0} (transient)")]
    Transient(String),
    /// Retrying will not help, e.g. the network configuration is wrong.
    #[error("{0}")]
    Permanent(String),
}

impl SdkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The SDK's output for one encrypted input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEncryptedInput {
    /// One handle per encrypted value, at whatever width the SDK produces.
    pub handles: Vec<Vec<u8>>,
    pub input_proof: Vec<u8>,
}

/// The SDK's output for a public decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDecryption {
    /// Cleartext values keyed by handle text, in whatever case the service
    /// chose.
    pub clear_values: HashMap<String, U256>,
    pub abi_encoded_clear_values: Vec<u8>,
    pub decryption_proof: Vec<u8>,
}

/// Entry point of an FHE client SDK.
#[async_trait]
pub trait FheSdk: Send + Sync {
    /// Load the engine and connect it to `network`.
    async fn create_instance(
        &self,
        network: &FhevmNetwork,
    ) -> std::result::Result<Arc<dyn FheInstance>, SdkError>;
}

/// An initialised SDK instance.
#[async_trait]
pub trait FheInstance: Send + Sync {
    /// Encrypt `value` as a `uint8` input that only `contract` may consume,
    /// on behalf of `user`.
    async fn encrypt_u8(
        &self,
        contract: Address,
        user: Address,
        value: u8,
    ) -> std::result::Result<RawEncryptedInput, SdkError>;

    /// Publicly decrypt the given handles through the relayer.
    async fn public_decrypt(
        &self,
        handles: &[String],
    ) -> std::result::Result<RawDecryption, SdkError>;
}

/// Lazily-initialised, shared access to an FHE SDK.
pub struct FheEngine {
    sdk: Arc<dyn FheSdk>,
    network: FhevmNetwork,
    retry: RetryPolicy,
    instance: OnceCell<Arc<dyn FheInstance>>,
}

impl FheEngine {
    pub fn new(sdk: Arc<dyn FheSdk>, network: FhevmNetwork, retry: RetryPolicy) -> Self {
        Self {
            sdk,
            network,
            retry,
            instance: OnceCell::new(),
        }
    }

    /// Whether the SDK instance has been created.
    pub fn is_ready(&self) -> bool {
        self.instance.initialized()
    }

    /// Get the SDK instance, creating it first if needed.
    ///
    /// Concurrent callers wait on a single initialisation. If it fails, the
    /// next call starts a fresh one.
    pub async fn ready(&self) -> Result<Arc<dyn FheInstance>> {
        self.instance
            .get_or_try_init(|| self.initialize())
            .await
            .cloned()
    }

    async fn initialize(&self) -> Result<Arc<dyn FheInstance>> {
        info!(
            "Initialising FHE engine for chain {} via {}",
            self.network.chain_id, self.network.relayer_url
        );
        let instance = self
            .retry
            .run(
                |attempt| {
                    debug!("Creating FHE instance, attempt {attempt}");
                    self.sdk.create_instance(&self.network)
                },
                SdkError::is_transient,
            )
            .await
            .map_err(|e| {
                error!("FHE engine initialisation failed: {e}");
                Error::EngineNotReady(e.to_string())
            })?;
        info!("FHE engine ready");
        Ok(instance)
    }

    /// Encrypt a vote for `option`, bound to `contract` and `voter`.
    ///
    /// The SDK's first handle is normalised to the ledger's field width.
    /// Failures are not retried.
    pub async fn encrypt_vote(
        &self,
        contract: Address,
        voter: Address,
        option: u8,
    ) -> Result<EncryptedBallot> {
        let instance = self.ready().await?;
        let raw = instance
            .encrypt_u8(contract, voter, option)
            .await
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let handle = match raw.handles.first() {
            Some(handle) if !handle.is_empty() => handle,
            _ => return Err(Error::Encryption("SDK returned no handle".to_string())),
        };
        if raw.input_proof.is_empty() {
            return Err(Error::Encryption("SDK returned an empty input proof".to_string()));
        }
        if handle.len() != HANDLE_LEN {
            warn!(
                "Normalising {}-byte handle from SDK to {HANDLE_LEN} bytes",
                handle.len()
            );
        }

        Ok(EncryptedBallot {
            handle: CiphertextHandle::normalize(handle),
            proof: raw.input_proof,
        })
    }

    /// Publicly decrypt `handles`, returning an unverified bundle.
    ///
    /// Every key in the SDK's result must be a well-formed handle; values
    /// must fit in 64 bits.
    pub async fn decrypt(&self, handles: HandleList) -> Result<DecryptionBundle> {
        let instance = self.ready().await?;
        let texts = handles.iter().map(CiphertextHandle::to_hex).collect::<Vec<_>>();
        let raw = instance
            .public_decrypt(&texts)
            .await
            .map_err(|e| Error::Decryption(e.to_string()))?;

        if raw.decryption_proof.is_empty() {
            return Err(Error::Decryption(
                "decryption proof missing from results".to_string(),
            ));
        }

        let values = raw
            .clear_values
            .into_iter()
            .map(|(key, value)| {
                let handle = key
                    .parse::<CiphertextHandle>()
                    .map_err(|e| e.at(format!("decryption result key {key}")))?;
                if value > U256::from(u64::MAX) {
                    return Err(Error::Decryption(format!(
                        "value for {handle} does not fit in 64 bits"
                    )));
                }
                Ok((handle, value.as_u64()))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(DecryptionBundle::new(
            handles,
            values,
            raw.abi_encoded_clear_values,
            raw.decryption_proof,
        ))
    }
}
