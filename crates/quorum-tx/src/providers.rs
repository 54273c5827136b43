//! Provider interfaces the core consumes.
//!
//! The wallet core never talks to the network or to key storage directly;
//! callers inject implementations of these traits (`quorum-electrum` ships
//! the Electrum-backed ones). Provider failures surface verbatim inside a
//! [`ProviderError`] wrapper, and the core never retries.

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Address, Amount, OutPoint, Script, ScriptBuf, Transaction, Txid};
use thiserror::Error;

use quorum_core::{KeyError, KeyTree};
use quorum_script::ScriptKind;

/// Which provider an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Keys,
    Unspent,
    Fees,
    Broadcast,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderKind::Keys => "key",
            ProviderKind::Unspent => "unspent-output",
            ProviderKind::Fees => "fee-rate",
            ProviderKind::Broadcast => "broadcast",
        };
        f.write_str(s)
    }
}

/// A provider failure, passed through to the caller unretried.
#[derive(Error, Debug)]
#[error("{kind} provider failed: {inner}")]
pub struct ProviderError {
    pub kind: ProviderKind,
    pub inner: String,
}

impl ProviderError {
    pub fn new(kind: ProviderKind, inner: impl std::fmt::Display) -> Self {
        Self {
            kind,
            inner: inner.to_string(),
        }
    }
}

/// An unspent output as reported by the unspent provider.
///
/// `derivation_path` and `kind` are populated only for outputs this wallet
/// owns; foreign outputs (never selected) leave them empty.
#[derive(Debug, Clone)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub confirmed: bool,
    pub derivation_path: Option<DerivationPath>,
    pub kind: Option<ScriptKind>,
}

/// Suggested fee rates in satoshis per virtual byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRates {
    pub slow: u64,
    pub medium: u64,
    pub fast: u64,
}

/// Private-key source. The core never caches what this returns.
pub trait KeyProvider {
    fn private_key_for(&self, path: &DerivationPath) -> Result<SecretKey, ProviderError>;

    /// Fingerprint of the master key behind this provider, recorded as the
    /// key origin in multisig drafts.
    fn master_fingerprint(&self) -> Result<Fingerprint, ProviderError>;
}

impl KeyProvider for KeyTree {
    fn private_key_for(&self, path: &DerivationPath) -> Result<SecretKey, ProviderError> {
        self.private_key_at(path)
            .map_err(|e: KeyError| ProviderError::new(ProviderKind::Keys, e))
    }

    fn master_fingerprint(&self) -> Result<Fingerprint, ProviderError> {
        Ok(KeyTree::master_fingerprint(self))
    }
}

/// Unspent-output source.
pub trait UnspentProvider {
    fn unspent_for_script(&self, script: &Script) -> Result<Vec<UnspentOutput>, ProviderError>;

    fn unspent_for_address(&self, address: &Address) -> Result<Vec<UnspentOutput>, ProviderError> {
        self.unspent_for_script(&address.script_pubkey())
    }

    /// Full funding transaction for an outpoint, needed to sign legacy
    /// inputs. `None` when the provider cannot produce it.
    fn funding_transaction(&self, _txid: &Txid) -> Result<Option<Transaction>, ProviderError> {
        Ok(None)
    }
}

/// Fee-rate source.
pub trait FeeProvider {
    fn rates(&self) -> Result<FeeRates, ProviderError>;
}

/// Transaction submitter.
pub trait Broadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ProviderError>;
}
