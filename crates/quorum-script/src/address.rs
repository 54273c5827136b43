//! Address encoding and decoding.
//!
//! Wraps the `bitcoin` crate's base58check and bech32 codecs with the
//! wallet's own validation policy: a closed set of accepted prefixes per
//! network, explicit mixed-case rejection, and classification into a
//! [`ScriptKind`].
//!
//! A bare address cannot reveal what stands behind a script hash, so the
//! two script-hash forms decode to the multisig variants (`P2shMultisig`,
//! `P2wshMultisig`); encoding from the wallet's own side always knows the
//! real kind. The round-trip `encode(decode(a)) == a` holds either way
//! because both sides agree on the locking script.

use bitcoin::hashes::Hash;
use bitcoin::{
    Address, AddressType, CompressedPublicKey, Network, PubkeyHash, ScriptBuf, ScriptHash,
    WScriptHash,
};
use thiserror::Error;

use crate::kind::ScriptKind;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("Empty address string")]
    Empty,
    #[error("Unknown address prefix: {0}")]
    Prefix(String),
    #[error("Address checksum is invalid")]
    Checksum,
    #[error("Unexpected payload length: {0} bytes")]
    Length(usize),
    #[error("Bech32 strings must not mix upper and lower case")]
    MixedCase,
    #[error("Address belongs to a different network than {expected}")]
    NetworkMismatch { expected: Network },
    #[error("Unsupported address form: {0}")]
    Unsupported(String),
}

/// A validated address together with its classification and locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAddress {
    pub address: Address,
    pub kind: ScriptKind,
    pub script_pubkey: ScriptBuf,
}

/// Parse and validate an address against the wallet's network.
pub fn decode(s: &str, network: Network) -> Result<DecodedAddress, AddressError> {
    if s.is_empty() {
        return Err(AddressError::Empty);
    }
    if looks_bech32(s) && has_mixed_case(s) {
        return Err(AddressError::MixedCase);
    }
    if !has_known_prefix(s) {
        return Err(AddressError::Prefix(prefix_of(s)));
    }

    let unchecked: Address<bitcoin::address::NetworkUnchecked> =
        s.parse().map_err(|_| AddressError::Checksum)?;
    let address = unchecked
        .require_network(network)
        .map_err(|_| AddressError::NetworkMismatch { expected: network })?;

    let kind = match address.address_type() {
        Some(AddressType::P2pkh) => ScriptKind::P2pkh,
        Some(AddressType::P2sh) => ScriptKind::P2shMultisig,
        Some(AddressType::P2wpkh) => ScriptKind::P2wpkh,
        Some(AddressType::P2wsh) => ScriptKind::P2wshMultisig,
        other => {
            return Err(AddressError::Unsupported(
                other.map(|t| t.to_string()).unwrap_or_else(|| "unknown".into()),
            ))
        }
    };

    let script_pubkey = address.script_pubkey();
    Ok(DecodedAddress {
        address,
        kind,
        script_pubkey,
    })
}

/// Locking script bytes for an address, usable as a transaction output.
pub fn script_pubkey_for(s: &str, network: Network) -> Result<ScriptBuf, AddressError> {
    Ok(decode(s, network)?.script_pubkey)
}

/// Encode a raw hash into an address of the given kind.
///
/// `data` is a 20-byte public-key hash for the single-key kinds, a 20-byte
/// script hash for `P2shMultisig`, and a 32-byte witness-script hash for the
/// P2WSH kinds (`P2shP2wshMultisig` also accepts the 20-byte hash of its
/// wrapper).
pub fn encode_hash(kind: ScriptKind, data: &[u8], network: Network) -> Result<Address, AddressError> {
    let spk = match (kind, data.len()) {
        (ScriptKind::P2pkh, 20) => {
            ScriptBuf::new_p2pkh(&PubkeyHash::from_slice(data).expect("20 bytes"))
        }
        (ScriptKind::P2wpkh, 20) => {
            ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_slice(data).expect("20 bytes"))
        }
        (ScriptKind::P2shP2wpkh, 20) => {
            // The 20 bytes are the pubkey hash; the address commits to the
            // hash of the v0 witness program built from it.
            let redeem =
                ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_slice(data).expect("20 bytes"));
            ScriptBuf::new_p2sh(&redeem.script_hash())
        }
        (ScriptKind::P2shMultisig, 20) => {
            ScriptBuf::new_p2sh(&ScriptHash::from_slice(data).expect("20 bytes"))
        }
        (ScriptKind::P2wshMultisig, 32) => {
            ScriptBuf::new_p2wsh(&WScriptHash::from_slice(data).expect("32 bytes"))
        }
        (ScriptKind::P2shP2wshMultisig, 32) => {
            let wrapper =
                ScriptBuf::new_p2wsh(&WScriptHash::from_slice(data).expect("32 bytes"));
            ScriptBuf::new_p2sh(&wrapper.script_hash())
        }
        (ScriptKind::P2shP2wshMultisig, 20) => {
            ScriptBuf::new_p2sh(&ScriptHash::from_slice(data).expect("20 bytes"))
        }
        (_, len) => return Err(AddressError::Length(len)),
    };
    Address::from_script(&spk, network).map_err(|e| AddressError::Unsupported(e.to_string()))
}

/// Address for a single compressed key under the given kind.
pub fn encode_single(
    kind: ScriptKind,
    key: &CompressedPublicKey,
    network: Network,
) -> Result<Address, AddressError> {
    match kind {
        ScriptKind::P2pkh => Ok(Address::p2pkh(*key, network)),
        ScriptKind::P2shP2wpkh => Ok(Address::p2shwpkh(key, network)),
        ScriptKind::P2wpkh => Ok(Address::p2wpkh(key, network)),
        other => Err(AddressError::Unsupported(other.to_string())),
    }
}

fn looks_bech32(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("bc1") || lower.starts_with("tb1")
}

fn has_mixed_case(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_lowercase()) && s.chars().any(|c| c.is_ascii_uppercase())
}

fn has_known_prefix(s: &str) -> bool {
    if looks_bech32(s) {
        return true;
    }
    // Legacy version bytes: 0x00/0x05 on mainnet, 0x6F/0xC4 on testnet.
    matches!(s.chars().next(), Some('1') | Some('3') | Some('m') | Some('n') | Some('2'))
}

fn prefix_of(s: &str) -> String {
    s.chars().take(4).collect()
}
