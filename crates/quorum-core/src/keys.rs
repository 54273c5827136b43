//! BIP-32 key tree.
//!
//! Derives every key the wallet ever signs with from one seed. Account
//! paths follow the purpose table: 44'/49'/84' for the single-key kinds at
//! depth 3, and 48'/coin'/account'/script' for multisig at depth 4. The
//! master secret is erased when the tree is dropped; derived nodes handed
//! out to callers are theirs to scrub.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network};
use thiserror::Error;

use quorum_script::{address, ScriptKind};

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Seed does not produce a valid master key")]
    InvalidSeed,
    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),
    #[error("Derivation failed: {0}")]
    DerivationFailed(String),
    #[error("{0} is not a single-key script kind")]
    SingleKeyOnly(ScriptKind),
}

/// Coin type field of a derivation path: 0 for mainnet, 1 for everything
/// else.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// The wallet's deterministic key tree.
///
/// All derivation is pure: the same seed and path always produce the same
/// node, and no state is shared across calls.
pub struct KeyTree {
    master: Xpriv,
    network: Network,
    secp: Secp256k1<All>,
}

impl KeyTree {
    /// Build the tree from a stretched seed.
    ///
    /// The master scalar and chain code are the two halves of
    /// HMAC-SHA-512 over the seed under the key `"Bitcoin seed"`; a zero or
    /// out-of-range scalar is rejected.
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, KeyError> {
        // BIP-32 bounds: 128 to 512 bits of entropy.
        if seed.len() < 16 || seed.len() > 64 {
            return Err(KeyError::InvalidSeed);
        }
        let master = Xpriv::new_master(network, seed).map_err(|_| KeyError::InvalidSeed)?;
        Ok(Self {
            master,
            network,
            secp: Secp256k1::new(),
        })
    }

    /// Convenience: stretch a mnemonic and build the tree. The
    /// intermediate seed stays sealed (pinned off swap, wiped on drop)
    /// for the whole derivation.
    pub fn from_mnemonic(
        mnemonic: &bip39::Mnemonic,
        passphrase: &str,
        network: Network,
    ) -> Result<Self, KeyError> {
        let seed = crate::seed::derive_seed(mnemonic, passphrase);
        Self::from_seed(seed.as_bytes(), network)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// First four bytes of HASH160 of the master public key.
    pub fn master_fingerprint(&self) -> Fingerprint {
        self.master.fingerprint(&self.secp)
    }

    /// One derivation step from an arbitrary node.
    ///
    /// Hardened steps require private material, which an `Xpriv` always
    /// has; public-only derivation lives in the `xpub` module.
    pub fn derive_child(
        &self,
        node: &Xpriv,
        index: u32,
        hardened: bool,
    ) -> Result<Xpriv, KeyError> {
        let child = if hardened {
            ChildNumber::from_hardened_idx(index)
        } else {
            ChildNumber::from_normal_idx(index)
        }
        .map_err(|e| KeyError::InvalidPath(e.to_string()))?;
        node.derive_priv(&self.secp, &[child])
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))
    }

    /// Apply a full path from the master node.
    pub fn derive_path(&self, path: &DerivationPath) -> Result<Xpriv, KeyError> {
        self.master
            .derive_priv(&self.secp, path)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))
    }

    /// Account-level path for a script kind: `m/44'|49'|84'/coin'/account'`
    /// or `m/48'/coin'/account'/script'`.
    pub fn account_path(&self, kind: ScriptKind, account: u32) -> Result<DerivationPath, KeyError> {
        let mut steps = vec![
            hardened(kind.purpose())?,
            hardened(coin_type(self.network))?,
            hardened(account)?,
        ];
        if let Some(script_index) = kind.bip48_script_index() {
            steps.push(hardened(script_index)?);
        }
        Ok(DerivationPath::from(steps))
    }

    /// Full address-level path: account path plus `/chain/index`.
    pub fn address_path(
        &self,
        kind: ScriptKind,
        account: u32,
        chain: u32,
        index: u32,
    ) -> Result<DerivationPath, KeyError> {
        if chain > 1 {
            return Err(KeyError::InvalidPath(format!(
                "chain must be 0 (receive) or 1 (change), got {chain}"
            )));
        }
        let base = self.account_path(kind, account)?;
        Ok(base.child(normal(chain)?).child(normal(index)?))
    }

    /// Public projection of the account-level node.
    pub fn account_xpub(&self, kind: ScriptKind, account: u32) -> Result<Xpub, KeyError> {
        let path = self.account_path(kind, account)?;
        let xpriv = self.derive_path(&path)?;
        Ok(Xpub::from_priv(&self.secp, &xpriv))
    }

    /// Account-level key in the SLIP-132 encoding matching the kind.
    pub fn account_xpub_slip132(&self, kind: ScriptKind, account: u32) -> Result<String, KeyError> {
        let xpub = self.account_xpub(kind, account)?;
        Ok(crate::xpub::encode_slip132(&xpub, kind, self.network))
    }

    /// Address for a single-key account at (chain, index).
    pub fn address_at(
        &self,
        kind: ScriptKind,
        account: u32,
        chain: u32,
        index: u32,
    ) -> Result<Address, KeyError> {
        if kind.is_multisig() {
            return Err(KeyError::SingleKeyOnly(kind));
        }
        let key = self.public_key_at(kind, account, chain, index)?;
        address::encode_single(kind, &key, self.network)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))
    }

    /// Compressed public key at a full address path.
    pub fn public_key_at(
        &self,
        kind: ScriptKind,
        account: u32,
        chain: u32,
        index: u32,
    ) -> Result<CompressedPublicKey, KeyError> {
        let path = self.address_path(kind, account, chain, index)?;
        let node = self.derive_path(&path)?;
        Ok(CompressedPublicKey(node.private_key.public_key(&self.secp)))
    }

    /// Private scalar for an arbitrary path: the key-provider hook.
    ///
    /// The returned key is never cached here; the caller erases it after
    /// signing.
    pub fn private_key_at(&self, path: &DerivationPath) -> Result<SecretKey, KeyError> {
        Ok(self.derive_path(path)?.private_key)
    }
}

impl Drop for KeyTree {
    fn drop(&mut self) {
        self.master.private_key.non_secure_erase();
    }
}

impl std::fmt::Debug for KeyTree {
    // Never prints key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyTree")
            .field("network", &self.network)
            .field("fingerprint", &self.master_fingerprint())
            .finish()
    }
}

/// Script kind implied by a path's purpose and shape, if it is one of the
/// wallet's standard shapes.
pub fn path_script_kind(path: &DerivationPath) -> Option<ScriptKind> {
    let raw: &[ChildNumber] = path.as_ref();
    let purpose = match raw.first()? {
        ChildNumber::Hardened { index } => *index,
        ChildNumber::Normal { .. } => return None,
    };
    match (purpose, raw.len()) {
        (44, 3 | 5) => Some(ScriptKind::P2pkh),
        (49, 3 | 5) => Some(ScriptKind::P2shP2wpkh),
        (84, 3 | 5) => Some(ScriptKind::P2wpkh),
        (48, 4 | 6) => {
            let script_index = match raw.get(3)? {
                ChildNumber::Hardened { index } => *index,
                ChildNumber::Normal { .. } => return None,
            };
            match script_index {
                0 => Some(ScriptKind::P2shMultisig),
                1 => Some(ScriptKind::P2shP2wshMultisig),
                2 => Some(ScriptKind::P2wshMultisig),
                _ => None,
            }
        }
        _ => None,
    }
}

fn hardened(index: u32) -> Result<ChildNumber, KeyError> {
    ChildNumber::from_hardened_idx(index).map_err(|e| KeyError::InvalidPath(e.to_string()))
}

fn normal(index: u32) -> Result<ChildNumber, KeyError> {
    ChildNumber::from_normal_idx(index).map_err(|e| KeyError::InvalidPath(e.to_string()))
}
