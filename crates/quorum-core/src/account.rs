//! Cosigner records and multisig account membership.
//!
//! A `MultisigAccount` is an ordered set of cosigners plus the quorum
//! parameters. Exactly one cosigner is this wallet (its keys reachable via
//! [`KeyTree`]); the rest are foreign account-level xpubs. Address
//! derivation sorts the per-index public keys, so every cosigner computes
//! the same addresses no matter how the set was ordered when the account
//! was configured.

use bitcoin::bip32::Fingerprint;
use bitcoin::bip32::Xpub;
use bitcoin::{Address, Network};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use quorum_script::{MultisigError, MultisigScript, ScriptKind, MAX_COSIGNERS, MIN_QUORUM};

use crate::keys::{KeyError, KeyTree};
use crate::xpub::{self, ParsedXpub, XpubError};

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Unsupported quorum: {m}-of-{n}")]
    InvalidQuorum { m: usize, n: usize },
    #[error("{0} is not a multisig script kind")]
    NotMultisig(ScriptKind),
    #[error("Cosigner {name}: {source}")]
    Cosigner { name: String, source: XpubError },
    #[error("Cosigner {name}: key encodes {found}, account is {expected}")]
    KindMismatch {
        name: String,
        expected: ScriptKind,
        found: ScriptKind,
    },
    #[error(transparent)]
    Xpub(#[from] XpubError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Script(#[from] MultisigError),
}

/// One participant in a multisig account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cosigner {
    /// Display name, e.g. "Alice's hardware wallet".
    pub name: String,
    /// Account-level key in normalized (standard-prefix) encoding.
    pub xpub: String,
    /// Fingerprint of the account key, for quick identification.
    pub fingerprint: Fingerprint,
    /// Derivation template: the account path this key sits at, as text.
    pub path_template: String,
}

impl Cosigner {
    /// Record a foreign cosigner from a SLIP-132 string.
    ///
    /// The key must be an account-level multisig key of the right kind and
    /// network.
    pub fn foreign(
        name: &str,
        slip132: &str,
        kind: ScriptKind,
        network: Network,
    ) -> Result<Self, AccountError> {
        let parsed = xpub::parse(slip132, network).map_err(|source| AccountError::Cosigner {
            name: name.to_string(),
            source,
        })?;
        Self::from_parsed(name, &parsed, kind)
    }

    /// Record this wallet itself as a cosigner.
    pub fn local(
        name: &str,
        tree: &KeyTree,
        kind: ScriptKind,
        account: u32,
    ) -> Result<Self, AccountError> {
        let slip = tree.account_xpub_slip132(kind, account)?;
        let parsed = xpub::parse(&slip, tree.network())?;
        Self::from_parsed(name, &parsed, kind)
    }

    fn from_parsed(name: &str, parsed: &ParsedXpub, kind: ScriptKind) -> Result<Self, AccountError> {
        if !kind.is_multisig() {
            return Err(AccountError::NotMultisig(kind));
        }
        if parsed.kind != kind {
            return Err(AccountError::KindMismatch {
                name: name.to_string(),
                expected: kind,
                found: parsed.kind,
            });
        }
        parsed
            .require_account_depth()
            .map_err(|source| AccountError::Cosigner {
                name: name.to_string(),
                source,
            })?;
        // Display template for the account slot this key conventionally
        // occupies; the account number itself is not recoverable from the
        // key alone.
        let template = format!(
            "m/48'/{}'/0'/{}'",
            if parsed.network == Network::Bitcoin { 0 } else { 1 },
            kind.bip48_script_index().expect("multisig kind"),
        );
        Ok(Self {
            name: name.to_string(),
            xpub: parsed.normalized.clone(),
            fingerprint: parsed.fingerprint(),
            path_template: template,
        })
    }

    /// The decoded account key.
    pub fn account_key(&self, network: Network) -> Result<Xpub, AccountError> {
        Ok(xpub::parse(&self.xpub, network)?.xpub)
    }
}

/// An ordered cosigner set plus quorum parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultisigAccount {
    pub name: String,
    pub cosigners: Vec<Cosigner>,
    pub threshold: usize,
    pub kind: ScriptKind,
    pub network: Network,
}

impl MultisigAccount {
    /// Supported off-the-shelf configurations.
    pub const STANDARD_CONFIGS: [(usize, usize); 3] = [(2, 2), (2, 3), (3, 5)];

    pub fn new(
        name: &str,
        cosigners: Vec<Cosigner>,
        threshold: usize,
        kind: ScriptKind,
        network: Network,
    ) -> Result<Self, AccountError> {
        if !kind.is_multisig() {
            return Err(AccountError::NotMultisig(kind));
        }
        let n = cosigners.len();
        if threshold < MIN_QUORUM || n < threshold || n > MAX_COSIGNERS {
            return Err(AccountError::InvalidQuorum { m: threshold, n });
        }
        Ok(Self {
            name: name.to_string(),
            cosigners,
            threshold,
            kind,
            network,
        })
    }

    pub fn m(&self) -> usize {
        self.threshold
    }

    pub fn n(&self) -> usize {
        self.cosigners.len()
    }

    /// Whether this is one of the configurations the UI offers by default.
    pub fn is_standard_config(&self) -> bool {
        Self::STANDARD_CONFIGS.contains(&(self.m(), self.n()))
    }

    /// The sorted multisig script at `(chain, index)`.
    pub fn script_at(&self, chain: u32, index: u32) -> Result<MultisigScript, AccountError> {
        let mut keys = Vec::with_capacity(self.cosigners.len());
        for cosigner in &self.cosigners {
            let parsed = xpub::parse(&cosigner.xpub, self.network)?;
            keys.push(parsed.derive_public_key(chain, index)?);
        }
        Ok(MultisigScript::new(self.threshold, keys)?)
    }

    /// The deposit address at `(chain, index)`.
    pub fn address_at(&self, chain: u32, index: u32) -> Result<Address, AccountError> {
        Ok(self.script_at(chain, index)?.address(self.kind, self.network)?)
    }
}
