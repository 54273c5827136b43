//! The closed set of script types the wallet can spend and pay to.
//!
//! Three single-key forms (BIP-44/49/84) and three multi-key forms
//! (BIP-48). Every address-generating and size-estimating function in the
//! workspace is a closed match on this enum.

use serde::{Deserialize, Serialize};

/// Script type of an owned or watched output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptKind {
    /// Legacy pay-to-public-key-hash.
    P2pkh,
    /// Native segwit wrapped in P2SH for legacy compatibility.
    P2shP2wpkh,
    /// Native segwit v0 pay-to-witness-public-key-hash.
    P2wpkh,
    /// Legacy M-of-N multisig behind a script hash.
    P2shMultisig,
    /// M-of-N multisig behind a witness script hash, wrapped in P2SH.
    P2shP2wshMultisig,
    /// Native segwit M-of-N multisig.
    P2wshMultisig,
}

impl ScriptKind {
    /// All supported kinds, single-key first.
    pub const ALL: [ScriptKind; 6] = [
        ScriptKind::P2pkh,
        ScriptKind::P2shP2wpkh,
        ScriptKind::P2wpkh,
        ScriptKind::P2shMultisig,
        ScriptKind::P2shP2wshMultisig,
        ScriptKind::P2wshMultisig,
    ];

    /// True for the three M-of-N forms.
    pub fn is_multisig(self) -> bool {
        matches!(
            self,
            ScriptKind::P2shMultisig | ScriptKind::P2shP2wshMultisig | ScriptKind::P2wshMultisig
        )
    }

    /// True when spending inputs of this kind carries a witness
    /// (wrapped segwit counts).
    pub fn is_segwit(self) -> bool {
        !matches!(self, ScriptKind::P2pkh | ScriptKind::P2shMultisig)
    }

    /// True for the bech32-encoded forms.
    pub fn is_native_segwit(self) -> bool {
        matches!(self, ScriptKind::P2wpkh | ScriptKind::P2wshMultisig)
    }

    /// True when the address wraps the real locking script in P2SH.
    pub fn is_wrapped(self) -> bool {
        matches!(
            self,
            ScriptKind::P2shP2wpkh | ScriptKind::P2shMultisig | ScriptKind::P2shP2wshMultisig
        )
    }

    /// BIP purpose number of the derivation path for this kind.
    pub fn purpose(self) -> u32 {
        match self {
            ScriptKind::P2pkh => 44,
            ScriptKind::P2shP2wpkh => 49,
            ScriptKind::P2wpkh => 84,
            ScriptKind::P2shMultisig
            | ScriptKind::P2shP2wshMultisig
            | ScriptKind::P2wshMultisig => 48,
        }
    }

    /// BIP-48 script index (`s'` in `m/48'/coin'/account'/s'`).
    ///
    /// Returns `None` for single-key kinds. Legacy P2SH multisig sits at 0'
    /// so that all multisig accounts have uniform depth.
    pub fn bip48_script_index(self) -> Option<u32> {
        match self {
            ScriptKind::P2shMultisig => Some(0),
            ScriptKind::P2shP2wshMultisig => Some(1),
            ScriptKind::P2wshMultisig => Some(2),
            _ => None,
        }
    }

    /// Depth of an account-level extended key for this kind.
    pub fn account_depth(self) -> u8 {
        if self.is_multisig() {
            4
        } else {
            3
        }
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScriptKind::P2pkh => "p2pkh",
            ScriptKind::P2shP2wpkh => "p2sh-p2wpkh",
            ScriptKind::P2wpkh => "p2wpkh",
            ScriptKind::P2shMultisig => "p2sh-multisig",
            ScriptKind::P2shP2wshMultisig => "p2sh-p2wsh-multisig",
            ScriptKind::P2wshMultisig => "p2wsh-multisig",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_mapping() {
        assert_eq!(ScriptKind::P2pkh.purpose(), 44);
        assert_eq!(ScriptKind::P2shP2wpkh.purpose(), 49);
        assert_eq!(ScriptKind::P2wpkh.purpose(), 84);
        for kind in [
            ScriptKind::P2shMultisig,
            ScriptKind::P2shP2wshMultisig,
            ScriptKind::P2wshMultisig,
        ] {
            assert_eq!(kind.purpose(), 48);
        }
    }

    #[test]
    fn test_segwit_classification() {
        assert!(!ScriptKind::P2pkh.is_segwit());
        assert!(!ScriptKind::P2shMultisig.is_segwit());
        assert!(ScriptKind::P2shP2wpkh.is_segwit());
        assert!(!ScriptKind::P2shP2wpkh.is_native_segwit());
        assert!(ScriptKind::P2wpkh.is_native_segwit());
        assert!(ScriptKind::P2wshMultisig.is_native_segwit());
    }

    #[test]
    fn test_account_depth() {
        assert_eq!(ScriptKind::P2wpkh.account_depth(), 3);
        assert_eq!(ScriptKind::P2wshMultisig.account_depth(), 4);
    }

    #[test]
    fn test_bip48_script_index_only_for_multisig() {
        assert_eq!(ScriptKind::P2wpkh.bip48_script_index(), None);
        assert_eq!(ScriptKind::P2shMultisig.bip48_script_index(), Some(0));
        assert_eq!(ScriptKind::P2shP2wshMultisig.bip48_script_index(), Some(1));
        assert_eq!(ScriptKind::P2wshMultisig.bip48_script_index(), Some(2));
    }

    #[test]
    fn test_serde_kebab_case() {
        let json = serde_json::to_string(&ScriptKind::P2shP2wshMultisig).unwrap();
        assert_eq!(json, "\"p2sh-p2wsh-multisig\"");
        let back: ScriptKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ScriptKind::P2shP2wshMultisig);
    }
}
