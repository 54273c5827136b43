//! Sorted M-of-N multisig scripts.
//!
//! The locking script is `OP_M <pub1> … <pubN> OP_N OP_CHECKMULTISIG` with
//! the public keys compressed and sorted lexicographically by byte value.
//! Sorting makes the script, and therefore every derived address, a pure
//! function of the key set, so cosigners who exchange keys in any order
//! still agree on where the money lives.

use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::script::{Builder, Instruction};
use bitcoin::{Address, CompressedPublicKey, Network, PublicKey, Script, ScriptBuf};
use thiserror::Error;

use crate::kind::ScriptKind;

/// Hard protocol bound on `OP_CHECKMULTISIG` participants.
pub const MAX_COSIGNERS: usize = 15;

/// Smallest quorum that is actually "multi".
pub const MIN_QUORUM: usize = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MultisigError {
    #[error("Unsupported multisig parameters: {m}-of-{n}")]
    InvalidParams { m: usize, n: usize },
    #[error("Script is not an M-of-N multisig: {0}")]
    NotMultisig(String),
    #[error("Multisig scripts require compressed public keys")]
    UncompressedKey,
    #[error("{0} is not a multisig script kind")]
    NotMultisigKind(ScriptKind),
}

/// A sorted M-of-N multisig locking script and its wrappers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigScript {
    m: usize,
    keys: Vec<CompressedPublicKey>,
}

impl MultisigScript {
    /// Build from a quorum size and an *unordered* key set.
    ///
    /// Keys are sorted ascending by their 33-byte serialization; duplicate
    /// keys are collapsed before validation.
    pub fn new(m: usize, keys: Vec<CompressedPublicKey>) -> Result<Self, MultisigError> {
        let mut keys = keys;
        keys.sort_by_key(|k| k.to_bytes());
        keys.dedup();

        let n = keys.len();
        if m < MIN_QUORUM || n < m || n > MAX_COSIGNERS {
            return Err(MultisigError::InvalidParams { m, n });
        }
        Ok(Self { m, keys })
    }

    /// Required signature count.
    pub fn m(&self) -> usize {
        self.m
    }

    /// Total key count.
    pub fn n(&self) -> usize {
        self.keys.len()
    }

    /// The sorted keys, in script order.
    pub fn keys(&self) -> &[CompressedPublicKey] {
        &self.keys
    }

    /// The bare `OP_M <keys…> OP_N OP_CHECKMULTISIG` script.
    pub fn script(&self) -> ScriptBuf {
        let mut builder = Builder::new().push_int(self.m as i64);
        for key in &self.keys {
            builder = builder.push_key(&PublicKey::from(*key));
        }
        builder
            .push_int(self.keys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
    }

    /// Redeem script placed in the scriptSig (or PSBT redeem-script field)
    /// when spending, if the kind calls for one.
    pub fn redeem_script(&self, kind: ScriptKind) -> Result<Option<ScriptBuf>, MultisigError> {
        match kind {
            ScriptKind::P2shMultisig => Ok(Some(self.script())),
            ScriptKind::P2shP2wshMultisig => {
                let ws = self.script();
                Ok(Some(ScriptBuf::new_p2wsh(&ws.wscript_hash())))
            }
            ScriptKind::P2wshMultisig => Ok(None),
            other => Err(MultisigError::NotMultisigKind(other)),
        }
    }

    /// Witness script revealed in the witness stack, if the kind has one.
    pub fn witness_script(&self, kind: ScriptKind) -> Result<Option<ScriptBuf>, MultisigError> {
        match kind {
            ScriptKind::P2shMultisig => Ok(None),
            ScriptKind::P2shP2wshMultisig | ScriptKind::P2wshMultisig => Ok(Some(self.script())),
            other => Err(MultisigError::NotMultisigKind(other)),
        }
    }

    /// The locking script funds are actually sent to.
    pub fn script_pubkey(&self, kind: ScriptKind) -> Result<ScriptBuf, MultisigError> {
        let inner = self.script();
        match kind {
            ScriptKind::P2shMultisig => Ok(ScriptBuf::new_p2sh(&inner.script_hash())),
            ScriptKind::P2wshMultisig => Ok(ScriptBuf::new_p2wsh(&inner.wscript_hash())),
            ScriptKind::P2shP2wshMultisig => {
                let wrapper = ScriptBuf::new_p2wsh(&inner.wscript_hash());
                Ok(ScriptBuf::new_p2sh(&wrapper.script_hash()))
            }
            other => Err(MultisigError::NotMultisigKind(other)),
        }
    }

    /// Address for the given wrapper kind and network.
    pub fn address(&self, kind: ScriptKind, network: Network) -> Result<Address, MultisigError> {
        let spk = self.script_pubkey(kind)?;
        // The three script_pubkey forms above are all standard, so this
        // cannot fail on length or version grounds.
        Address::from_script(&spk, network)
            .map_err(|e| MultisigError::NotMultisig(e.to_string()))
    }

    /// Decode a bare multisig script back into `(m, keys)`.
    ///
    /// Accepts exactly the shape this type emits; used to audit redeem and
    /// witness scripts found inside imported PSBTs.
    pub fn parse(script: &Script) -> Result<Self, MultisigError> {
        let mut instructions = Vec::new();
        for ins in script.instructions() {
            let ins =
                ins.map_err(|e| MultisigError::NotMultisig(format!("malformed script: {e}")))?;
            instructions.push(ins);
        }

        if instructions.len() < 4 {
            return Err(MultisigError::NotMultisig("too few opcodes".into()));
        }

        let m = pushnum(&instructions[0])
            .ok_or_else(|| MultisigError::NotMultisig("missing OP_M".into()))?;
        let n = pushnum(&instructions[instructions.len() - 2])
            .ok_or_else(|| MultisigError::NotMultisig("missing OP_N".into()))?;
        match instructions.last() {
            Some(Instruction::Op(op)) if *op == OP_CHECKMULTISIG => {}
            _ => return Err(MultisigError::NotMultisig("missing OP_CHECKMULTISIG".into())),
        }

        let key_instructions = &instructions[1..instructions.len() - 2];
        if key_instructions.len() != n {
            return Err(MultisigError::NotMultisig(format!(
                "key count {} does not match OP_N {}",
                key_instructions.len(),
                n
            )));
        }

        let mut keys = Vec::with_capacity(n);
        for ins in key_instructions {
            let bytes = match ins {
                Instruction::PushBytes(push) => push.as_bytes(),
                _ => return Err(MultisigError::NotMultisig("expected key push".into())),
            };
            if bytes.len() != 33 {
                return Err(MultisigError::UncompressedKey);
            }
            let key = CompressedPublicKey::from_slice(bytes)
                .map_err(|e| MultisigError::NotMultisig(format!("bad key: {e}")))?;
            keys.push(key);
        }

        if m < MIN_QUORUM || n < m || n > MAX_COSIGNERS {
            return Err(MultisigError::InvalidParams { m, n });
        }
        Ok(Self { m, keys })
    }
}

/// Small-integer value of an `OP_PUSHNUM_1..16` instruction.
fn pushnum(ins: &Instruction) -> Option<usize> {
    match ins {
        Instruction::Op(op)
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&op.to_u8()) =>
        {
            Some((op.to_u8() - OP_PUSHNUM_1.to_u8() + 1) as usize)
        }
        _ => None,
    }
}
