//! Extended public keys as a foreign-key interchange format.
//!
//! Cosigners and watch-only contacts hand us account-level keys in any of
//! the SLIP-132 encodings (xpub/ypub/zpub and the multisig Ypub/Zpub, plus
//! their testnet counterparts). Internally everything is normalized to the
//! standard `xpub`/`tpub` prefix before it touches the derivation engine;
//! the original string is kept for display.
//!
//! The `xpub`/`tpub` prefix is ambiguous between single-key legacy (depth
//! 3) and legacy multisig accounts (depth 4, `m/48'/c'/a'/0'`); the depth
//! resolves it.

use bitcoin::base58;
use bitcoin::bip32::{ChildNumber, Fingerprint, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, CompressedPublicKey, Network};
use thiserror::Error;

use quorum_script::{address, ScriptKind};

#[derive(Error, Debug)]
pub enum XpubError {
    #[error("Not a valid extended key: {0}")]
    Format(String),
    #[error("Extended key payload must be 78 bytes, got {0}")]
    Length(usize),
    #[error("Unrecognized extended-key prefix: {0}")]
    UnsupportedPrefix(String),
    #[error("Extended private keys are not accepted here")]
    PrivateKeyRejected,
    #[error("Extended key belongs to a different network than {expected}")]
    NetworkMismatch { expected: Network },
    #[error("Expected an account-level key of depth {expected}, got depth {found}")]
    WrongDepth { expected: u8, found: u8 },
    #[error("A lone extended key cannot produce a multisig address")]
    MultisigUnsupported,
    #[error("Chain must be 0 (receive) or 1 (change), got {0}")]
    InvalidChain(u32),
    #[error("Derivation failed: {0}")]
    Derivation(String),
}

struct PrefixEntry {
    version: [u8; 4],
    name: &'static str,
    network: Network,
    /// `None` marks the ambiguous legacy prefix; depth decides the kind.
    kind: Option<ScriptKind>,
    private: bool,
}

/// The recognized SLIP-132 version bytes, public and private, both
/// networks.
const PREFIXES: &[PrefixEntry] = &[
    // Mainnet public
    PrefixEntry { version: [0x04, 0x88, 0xB2, 0x1E], name: "xpub", network: Network::Bitcoin, kind: None, private: false },
    PrefixEntry { version: [0x04, 0x9D, 0x7C, 0xB2], name: "ypub", network: Network::Bitcoin, kind: Some(ScriptKind::P2shP2wpkh), private: false },
    PrefixEntry { version: [0x04, 0xB2, 0x47, 0x46], name: "zpub", network: Network::Bitcoin, kind: Some(ScriptKind::P2wpkh), private: false },
    PrefixEntry { version: [0x02, 0x95, 0xB4, 0x3F], name: "Ypub", network: Network::Bitcoin, kind: Some(ScriptKind::P2shP2wshMultisig), private: false },
    PrefixEntry { version: [0x02, 0xAA, 0x7E, 0xD3], name: "Zpub", network: Network::Bitcoin, kind: Some(ScriptKind::P2wshMultisig), private: false },
    // Testnet public
    PrefixEntry { version: [0x04, 0x35, 0x87, 0xCF], name: "tpub", network: Network::Testnet, kind: None, private: false },
    PrefixEntry { version: [0x04, 0x4A, 0x52, 0x62], name: "upub", network: Network::Testnet, kind: Some(ScriptKind::P2shP2wpkh), private: false },
    PrefixEntry { version: [0x04, 0x5F, 0x1C, 0xF6], name: "vpub", network: Network::Testnet, kind: Some(ScriptKind::P2wpkh), private: false },
    PrefixEntry { version: [0x02, 0x42, 0x89, 0xEF], name: "Upub", network: Network::Testnet, kind: Some(ScriptKind::P2shP2wshMultisig), private: false },
    PrefixEntry { version: [0x02, 0x57, 0x54, 0x83], name: "Vpub", network: Network::Testnet, kind: Some(ScriptKind::P2wshMultisig), private: false },
    // Mainnet private
    PrefixEntry { version: [0x04, 0x88, 0xAD, 0xE4], name: "xprv", network: Network::Bitcoin, kind: None, private: true },
    PrefixEntry { version: [0x04, 0x9D, 0x78, 0x78], name: "yprv", network: Network::Bitcoin, kind: Some(ScriptKind::P2shP2wpkh), private: true },
    PrefixEntry { version: [0x04, 0xB2, 0x43, 0x0C], name: "zprv", network: Network::Bitcoin, kind: Some(ScriptKind::P2wpkh), private: true },
    PrefixEntry { version: [0x02, 0x95, 0xB0, 0x05], name: "Yprv", network: Network::Bitcoin, kind: Some(ScriptKind::P2shP2wshMultisig), private: true },
    PrefixEntry { version: [0x02, 0xAA, 0x7A, 0x99], name: "Zprv", network: Network::Bitcoin, kind: Some(ScriptKind::P2wshMultisig), private: true },
    // Testnet private
    PrefixEntry { version: [0x04, 0x35, 0x83, 0x94], name: "tprv", network: Network::Testnet, kind: None, private: true },
    PrefixEntry { version: [0x04, 0x4A, 0x4E, 0x28], name: "uprv", network: Network::Testnet, kind: Some(ScriptKind::P2shP2wpkh), private: true },
    PrefixEntry { version: [0x04, 0x5F, 0x18, 0xBC], name: "vprv", network: Network::Testnet, kind: Some(ScriptKind::P2wpkh), private: true },
    PrefixEntry { version: [0x02, 0x42, 0x85, 0xB5], name: "Uprv", network: Network::Testnet, kind: Some(ScriptKind::P2shP2wshMultisig), private: true },
    PrefixEntry { version: [0x02, 0x57, 0x50, 0x48], name: "Vprv", network: Network::Testnet, kind: Some(ScriptKind::P2wshMultisig), private: true },
];

/// Standard version bytes for the given network's public prefix.
fn standard_version(network: Network) -> [u8; 4] {
    match network {
        Network::Bitcoin => [0x04, 0x88, 0xB2, 0x1E],
        _ => [0x04, 0x35, 0x87, 0xCF],
    }
}

/// A parsed, normalized, network-checked extended public key.
#[derive(Debug, Clone)]
pub struct ParsedXpub {
    /// The key itself, with standard-prefix semantics.
    pub xpub: Xpub,
    /// Script kind the original prefix encodes (depth-resolved for the
    /// ambiguous legacy prefix).
    pub kind: ScriptKind,
    pub network: Network,
    /// Canonical `xpub…`/`tpub…` encoding, fed to the derivation engine.
    pub normalized: String,
    /// Exactly what the user supplied, for display.
    pub original: String,
}

impl ParsedXpub {
    /// Fingerprint of this key (not its parent).
    pub fn fingerprint(&self) -> Fingerprint {
        self.xpub.fingerprint()
    }

    pub fn depth(&self) -> u8 {
        self.xpub.depth
    }

    pub fn child_index(&self) -> ChildNumber {
        self.xpub.child_number
    }

    /// Demand the account-level depth for this key's kind.
    pub fn require_account_depth(&self) -> Result<(), XpubError> {
        let expected = self.kind.account_depth();
        if self.xpub.depth != expected {
            return Err(XpubError::WrongDepth {
                expected,
                found: self.xpub.depth,
            });
        }
        Ok(())
    }

    /// Derive the address at `(chain, index)`: two unhardened steps.
    ///
    /// Only single-key kinds can do this; a multisig address needs every
    /// cosigner key (see `account::MultisigAccount`).
    pub fn derive_address(&self, chain: u32, index: u32) -> Result<Address, XpubError> {
        if self.kind.is_multisig() {
            return Err(XpubError::MultisigUnsupported);
        }
        let key = self.derive_public_key(chain, index)?;
        address::encode_single(self.kind, &key, self.network)
            .map_err(|e| XpubError::Derivation(e.to_string()))
    }

    /// Public key at `(chain, index)`, usable by multisig assembly.
    pub fn derive_public_key(&self, chain: u32, index: u32) -> Result<CompressedPublicKey, XpubError> {
        if chain > 1 {
            return Err(XpubError::InvalidChain(chain));
        }
        let secp = Secp256k1::verification_only();
        let steps = [
            ChildNumber::from_normal_idx(chain).map_err(|e| XpubError::Derivation(e.to_string()))?,
            ChildNumber::from_normal_idx(index).map_err(|e| XpubError::Derivation(e.to_string()))?,
        ];
        let child = self
            .xpub
            .derive_pub(&secp, &steps)
            .map_err(|e| XpubError::Derivation(e.to_string()))?;
        Ok(child.to_pub())
    }
}

/// Parse any recognized encoding and normalize it to the standard prefix.
pub fn parse(s: &str, network: Network) -> Result<ParsedXpub, XpubError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(XpubError::Format("empty string".into()));
    }

    let mut data =
        base58::decode_check(s).map_err(|e| XpubError::Format(e.to_string()))?;
    if data.len() != 78 {
        return Err(XpubError::Length(data.len()));
    }

    let version: [u8; 4] = data[0..4].try_into().expect("4 bytes");
    let entry = PREFIXES
        .iter()
        .find(|p| p.version == version)
        .ok_or_else(|| XpubError::UnsupportedPrefix(s.chars().take(4).collect()))?;

    if entry.private {
        return Err(XpubError::PrivateKeyRejected);
    }
    if entry.network != expected_prefix_network(network) {
        return Err(XpubError::NetworkMismatch { expected: network });
    }

    // Rewrite to the standard prefix before decoding; the bip32 engine
    // only speaks xpub/tpub.
    data[0..4].copy_from_slice(&standard_version(network));
    let xpub = Xpub::decode(&data).map_err(|e| XpubError::Format(e.to_string()))?;

    let kind = entry.kind.unwrap_or(if xpub.depth == 4 {
        ScriptKind::P2shMultisig
    } else {
        ScriptKind::P2pkh
    });

    Ok(ParsedXpub {
        normalized: xpub.to_string(),
        original: s.to_string(),
        xpub,
        kind,
        network,
    })
}

/// Encode an account key in the SLIP-132 prefix for its kind.
pub fn encode_slip132(xpub: &Xpub, kind: ScriptKind, network: Network) -> String {
    let version = PREFIXES
        .iter()
        .find(|p| {
            !p.private
                && p.network == expected_prefix_network(network)
                && p.kind == Some(kind)
        })
        .map(|p| p.version)
        // P2pkh and legacy multisig use the standard prefix.
        .unwrap_or_else(|| standard_version(network));

    let mut data = xpub.encode().to_vec();
    data[0..4].copy_from_slice(&version);
    base58::encode_check(&data)
}

/// All non-mainnet networks share the testnet prefixes.
fn expected_prefix_network(network: Network) -> Network {
    match network {
        Network::Bitcoin => Network::Bitcoin,
        _ => Network::Testnet,
    }
}
