use std::fmt::{Debug, Formatter};

use chrono::Duration;
use ethers::types::{Address, H160};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Profile,
};
use serde::{Deserialize, Serialize};

use crate::{
    engine::RetryPolicy,
    error::{Error, Result},
};

/// Default location of the configuration file, overridden by `BALLOT_CONFIG`.
pub const CONFIG_FILE: &str = "Ballot.toml";

/// Prefix of every configuration environment variable.
pub const ENV_PREFIX: &str = "BALLOT_";

/// Longest receipt timeout accepted, in seconds (one day).
pub const MAX_RECEIPT_TIMEOUT: u64 = 24 * 60 * 60;

/// Application configuration, derived from `Ballot.toml` and `BALLOT_*`
/// environment variables. Nested keys use a double underscore, e.g.
/// `BALLOT_FHEVM__RELAYER_URL`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    // non-secrets
    rpc_url: String,
    contract_address: Address,
    chain_id: u64,
    confirmations: usize,
    receipt_timeout: u64,
    event_poll_interval: u64,
    fhevm: FhevmNetwork,
    retry: RetryPolicy,
    // secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
}

impl Config {
    /// The layered configuration sources, before extraction.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(Env::var_or("BALLOT_CONFIG", CONFIG_FILE)).nested())
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&["PROFILE", "CONFIG"])
                    .split("__")
                    .global(),
            )
            .select(Profile::from_env_or("BALLOT_PROFILE", Profile::Default))
    }

    /// Load and validate the configuration for the selected profile.
    pub fn load() -> Result<Self> {
        Self::from_figment(&Self::figment())
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.receipt_timeout == 0 {
            return Err(Error::Configuration(
                "`receipt_timeout` must be at least one second".to_string(),
            ));
        }
        if self.receipt_timeout > MAX_RECEIPT_TIMEOUT {
            return Err(Error::Configuration(format!(
                "`receipt_timeout` must be at most {MAX_RECEIPT_TIMEOUT} seconds"
            )));
        }
        if self.event_poll_interval == 0 {
            return Err(Error::Configuration(
                "`event_poll_interval` must be at least one millisecond".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration(
                "`retry.max_attempts` must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// JSON-RPC endpoint of the ledger.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Address of the deployed poll contract.
    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    /// Chain id used when signing transactions.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Blocks to wait for after a transaction is mined.
    pub fn confirmations(&self) -> usize {
        self.confirmations
    }

    /// How long to wait for a transaction receipt, in seconds.
    pub fn receipt_timeout(&self) -> Duration {
        Duration::seconds(self.receipt_timeout as i64)
    }

    /// How often the event feed polls the ledger, in milliseconds.
    pub fn event_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.event_poll_interval)
    }

    /// Where the FHE engine finds its contracts and relayer.
    pub fn fhevm(&self) -> &FhevmNetwork {
        &self.fhevm
    }

    /// Backoff for FHE engine initialisation.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Hex-encoded signing key. Without one, only read operations are
    /// available.
    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "https://ethereum-sepolia-rpc.publicnode.com".to_string(),
            contract_address: SECRET_BALLOT_CONTRACT,
            chain_id: SEPOLIA_CHAIN_ID,
            confirmations: 1,
            receipt_timeout: 120,
            event_poll_interval: 4000,
            fhevm: FhevmNetwork::default(),
            retry: RetryPolicy::default(),
            private_key: None,
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("rpc_url", &self.rpc_url)
            .field("contract_address", &self.contract_address)
            .field("chain_id", &self.chain_id)
            .field("confirmations", &self.confirmations)
            .field("receipt_timeout", &self.receipt_timeout)
            .field("event_poll_interval", &self.event_poll_interval)
            .field("fhevm", &self.fhevm)
            .field("retry", &self.retry)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

const SEPOLIA_CHAIN_ID: u64 = 11155111;

/// The public SecretBallot deployment on Sepolia.
const SECRET_BALLOT_CONTRACT: Address = address("0xE499c6B91908Bb99b603D77a92b3F522Ead4c53a");

/// Contracts and services of the FHEVM deployment the engine connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FhevmNetwork {
    /// Access control list contract on the host chain.
    pub acl_contract: Address,
    pub kms_verifier_contract: Address,
    pub input_verifier_contract: Address,
    /// Decryption contract on the gateway chain.
    pub decryption_verifying_contract: Address,
    /// Input verification contract on the gateway chain.
    pub input_verification_verifying_contract: Address,
    pub chain_id: u64,
    pub gateway_chain_id: u64,
    pub relayer_url: String,
}

/// The Sepolia deployment of FHEVM v0.9.
impl Default for FhevmNetwork {
    fn default() -> Self {
        Self {
            acl_contract: address("0xf0Ffdc93b7E186bC2f8CB3dAA75D86d1930A433D"),
            kms_verifier_contract: address("0xbE0E383937d564D7FF0BC3b46c51f0bF8d5C311A"),
            input_verifier_contract: address("0xBBC1fFCdc7C316aAAd72E807D9b0272BE8F84DA0"),
            decryption_verifying_contract: address("0x5D8BD78e2ea6bbE41f26dFe9fdaEAa349e077478"),
            input_verification_verifying_contract: address("0x483b9dE06E4E4C7D35CCf5837A1668487406D955"),
            chain_id: SEPOLIA_CHAIN_ID,
            gateway_chain_id: 10901,
            relayer_url: "https://relayer.testnet.zama.org".to_string(),
        }
    }
}

/// Parse a `0x`-prefixed 40-digit address literal at compile time.
const fn address(text: &str) -> Address {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => panic!("invalid hex digit in address literal"),
        }
    }

    let text = text.as_bytes();
    assert!(text.len() == 42, "address literal must be 42 characters");
    let mut bytes = [0u8; 20];
    let mut i = 0;
    while i < 20 {
        bytes[i] = nibble(text[2 + 2 * i]) << 4 | nibble(text[3 + 2 * i]);
        i += 1;
    }
    H160(bytes)
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_are_sepolia() {
        let config = Config::default();
        assert_eq!(config.chain_id(), 11155111);
        assert_eq!(config.fhevm().gateway_chain_id, 10901);
        assert_eq!(
            config.contract_address(),
            "0xE499c6B91908Bb99b603D77a92b3F522Ead4c53a"
                .parse::<Address>()
                .unwrap()
        );
        assert_eq!(
            config.fhevm().acl_contract,
            "0xf0Ffdc93b7E186bC2f8CB3dAA75D86d1930A433D"
                .parse::<Address>()
                .unwrap()
        );
        assert_eq!(config.receipt_timeout(), Duration::seconds(120));
        assert_eq!(config.private_key(), None);
    }

    #[test]
    fn file_profiles_and_env_layer_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "Ballot.toml",
                r#"
                [default]
                rpc_url = "http://127.0.0.1:8545"
                confirmations = 2

                [local]
                chain_id = 31337

                [local.retry]
                max_attempts = 2
                "#,
            )?;
            jail.set_env("BALLOT_PROFILE", "local");
            jail.set_env("BALLOT_CONFIRMATIONS", 3);
            jail.set_env("BALLOT_FHEVM__RELAYER_URL", "http://127.0.0.1:3000");
            jail.set_env("BALLOT_PRIVATE_KEY", "0xfeed");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.rpc_url(), "http://127.0.0.1:8545");
            assert_eq!(config.chain_id(), 31337);
            assert_eq!(config.confirmations(), 3);
            assert_eq!(config.retry().max_attempts, 2);
            assert_eq!(config.retry().initial_backoff_ms, 250);
            assert_eq!(config.fhevm().relayer_url, "http://127.0.0.1:3000");
            assert_eq!(config.fhevm().gateway_chain_id, 10901);
            assert_eq!(config.private_key(), Some("0xfeed"));
            assert!(!format!("{config:?}").contains("feed"));
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("BALLOT_RETRY__MAX_ATTEMPTS", 0);
            let err = Config::load().unwrap_err();
            assert!(matches!(err, Error::Configuration(_)));

            jail.set_env("BALLOT_RETRY__MAX_ATTEMPTS", 1);
            jail.set_env("BALLOT_RECEIPT_TIMEOUT", "100000000000000000");
            let err = Config::load().unwrap_err();
            assert!(matches!(err, Error::Configuration(_)));

            jail.set_env("BALLOT_RECEIPT_TIMEOUT", MAX_RECEIPT_TIMEOUT);
            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.receipt_timeout(), Duration::days(1));

            jail.set_env("BALLOT_CONTRACT_ADDRESS", "not an address");
            let err = Config::load().unwrap_err();
            assert!(matches!(err, Error::Figment(_)));
            Ok(())
        });
    }
}
