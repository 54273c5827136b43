//! The PSBT lifecycle engine.
//!
//! Works on standard BIP-174 containers produced by `quorum-tx`: text
//! export/import for transport, per-cosigner signing with
//! verify-before-accept, order-insensitive merging, and fail-closed
//! finalization into broadcast bytes.
//!
//! Signature maps are keyed by cosigner public key, so re-signing or
//! re-merging the same cosigner can never duplicate an entry.

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::bip32::ChildNumber;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash as _;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, CompressedPublicKey, Network, NetworkKind, PublicKey, ScriptBuf, Transaction, Txid, Witness};
use thiserror::Error;

use quorum_core::{coin_type, KeyTree};
use quorum_script::{MultisigError, MultisigScript};

#[derive(Error, Debug)]
pub enum PsbtError {
    #[error("Could not parse transaction: {detail}")]
    Parse { detail: String },
    #[error("Copies describe different transactions and cannot be merged")]
    MergeMismatch,
    #[error("Input {input} has {have} valid signatures, needs {need}")]
    NotEnoughSignatures { input: usize, have: usize, need: usize },
    #[error("Signature on input {input} failed verification")]
    SignatureInvalid { input: usize },
    #[error("Expected {expected_m} required signatures, script demands {found_m}")]
    MultisigParamMismatch { expected_m: usize, found_m: usize },
    #[error("Input {input} is missing its spending context")]
    MissingContext { input: usize },
    #[error("Input {input} does not spend a multisig script")]
    NotMultisig { input: usize },
    #[error("The signing key does not belong to any input's cosigner set")]
    SignerNotCosigner,
    #[error(transparent)]
    Script(#[from] MultisigError),
    #[error("Sighash computation failed on input {input}: {detail}")]
    Sighash { input: usize, detail: String },
}

/// Serialized forms of a PSBT ready for transport.
#[derive(Debug, Clone)]
pub struct PsbtExport {
    pub base64: String,
    pub hex: String,
    pub txid: Txid,
    /// Total fee when every input carries its value; `None` otherwise.
    pub fee: Option<u64>,
    /// Partial-signature count per input.
    pub sig_counts: Vec<usize>,
    pub finalized: bool,
}

/// Result of importing a cosigner's copy.
#[derive(Debug)]
pub struct PsbtImport {
    pub psbt: Psbt,
    pub txid: Txid,
    pub warnings: Vec<ImportWarning>,
    /// True iff no warnings were raised.
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportWarning {
    MissingUtxoContext { input: usize },
    NetworkMismatch,
    ExcessiveFee { fee: u64, pct: u64 },
    ZeroValueOutput { output: usize },
}

impl std::fmt::Display for ImportWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportWarning::MissingUtxoContext { input } => {
                write!(f, "input {input} is missing its UTXO context")
            }
            ImportWarning::NetworkMismatch => {
                write!(f, "recorded keys belong to a different network")
            }
            ImportWarning::ExcessiveFee { fee, pct } => {
                write!(f, "fee of {fee} sat is {pct}% of input value")
            }
            ImportWarning::ZeroValueOutput { output } => {
                write!(f, "output {output} carries no value")
            }
        }
    }
}

/// A finalized transaction ready for broadcast.
pub struct Finalized {
    pub tx: Transaction,
    pub bytes: Vec<u8>,
    pub txid: Txid,
}

/// The spending script of a multisig input.
enum SpendScript {
    /// P2WSH or P2SH-P2WSH: BIP-143 sighash over the witness script.
    Segwit(ScriptBuf),
    /// Legacy P2SH: legacy sighash over the redeem script.
    Legacy(ScriptBuf),
}

pub struct PsbtEngine {
    network: Network,
    secp: Secp256k1<All>,
}

impl PsbtEngine {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::new(),
        }
    }

    /// Serialize for transport, with a summary of signing progress.
    pub fn export(&self, psbt: &Psbt) -> PsbtExport {
        let bytes = psbt.serialize();
        let fee = total_input_value(psbt).map(|total_in| {
            let total_out: u64 = psbt.unsigned_tx.output.iter().map(|o| o.value.to_sat()).sum();
            total_in.saturating_sub(total_out)
        });
        PsbtExport {
            base64: BASE64.encode(&bytes),
            hex: hex::encode(&bytes),
            txid: psbt.unsigned_tx.compute_txid(),
            fee,
            sig_counts: psbt.inputs.iter().map(|i| i.partial_sigs.len()).collect(),
            finalized: psbt
                .inputs
                .iter()
                .all(|i| i.final_script_sig.is_some() || i.final_script_witness.is_some()),
        }
    }

    /// Parse either text encoding and audit the result.
    ///
    /// A string of nothing but `[0-9a-fA-F]` (even length) is hex;
    /// everything else goes down the base64 path. Warnings never abort the
    /// import; `is_valid` reports whether any were raised.
    pub fn import(&self, s: &str) -> Result<PsbtImport, PsbtError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PsbtError::Parse {
                detail: "empty string".into(),
            });
        }

        let bytes = if s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(s).map_err(|e| PsbtError::Parse {
                detail: e.to_string(),
            })?
        } else {
            BASE64.decode(s).map_err(|e| PsbtError::Parse {
                detail: e.to_string(),
            })?
        };

        let psbt = Psbt::deserialize(&bytes).map_err(|e| PsbtError::Parse {
            detail: e.to_string(),
        })?;

        let warnings = self.audit(&psbt);
        Ok(PsbtImport {
            txid: psbt.unsigned_tx.compute_txid(),
            is_valid: warnings.is_empty(),
            warnings,
            psbt,
        })
    }

    /// Sign every input whose cosigner set contains the key.
    ///
    /// Each signature is verified before it is accepted, and signing is
    /// idempotent per cosigner: the per-input map is keyed by public key.
    /// Returns the number of inputs signed.
    pub fn sign(&self, psbt: &mut Psbt, sk: &SecretKey) -> Result<usize, PsbtError> {
        let pk = CompressedPublicKey(sk.public_key(&self.secp));
        let unsigned = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&unsigned);
        let mut signed = 0;

        for index in 0..psbt.inputs.len() {
            let script = spend_script(psbt, index)?;
            let multisig = MultisigScript::parse(match &script {
                SpendScript::Segwit(s) | SpendScript::Legacy(s) => s,
            })
            .map_err(|_| PsbtError::NotMultisig { input: index })?;

            if !multisig.keys().contains(&pk) {
                continue;
            }

            let msg = self.input_message(psbt, &mut cache, index, &script)?;
            let sig = self.secp.sign_ecdsa(&msg, sk);
            self.secp
                .verify_ecdsa(&msg, &sig, &pk.0)
                .map_err(|_| PsbtError::SignatureInvalid { input: index })?;

            psbt.inputs[index].partial_sigs.insert(
                PublicKey::from(pk),
                bitcoin::ecdsa::Signature::sighash_all(sig),
            );
            signed += 1;
        }

        if signed == 0 {
            return Err(PsbtError::SignerNotCosigner);
        }
        log::debug!("signed {signed} inputs");
        Ok(signed)
    }

    /// Sign with this wallet's key tree, locating our per-input keys via
    /// the BIP-32 origin map the assembler recorded.
    pub fn sign_with_tree(&self, psbt: &mut Psbt, tree: &KeyTree) -> Result<usize, PsbtError> {
        let fingerprint = tree.master_fingerprint();
        let mut paths = Vec::new();
        for (index, input) in psbt.inputs.iter().enumerate() {
            for (pk, (fp, path)) in &input.bip32_derivation {
                if *fp == fingerprint {
                    paths.push((index, *pk, path.clone()));
                }
            }
        }
        if paths.is_empty() {
            return Err(PsbtError::SignerNotCosigner);
        }

        let mut seen = BTreeSet::new();
        let mut signed = 0;
        for (index, pk, path) in paths {
            if !seen.insert(pk) {
                continue;
            }
            let sk = tree
                .private_key_at(&path)
                .map_err(|e| PsbtError::Sighash {
                    input: index,
                    detail: e.to_string(),
                })?;
            if sk.public_key(&self.secp) != pk {
                return Err(PsbtError::SignatureInvalid { input: index });
            }
            signed += self.sign(psbt, &sk)?;
        }
        Ok(signed)
    }

    /// Union-merge copies of the same transaction.
    ///
    /// Fails if any copy describes a different unsigned transaction, and
    /// re-verifies every partial signature so a corrupt copy cannot smuggle
    /// one in. Merging A into B equals merging B into A.
    pub fn merge(&self, copies: Vec<Psbt>) -> Result<Psbt, PsbtError> {
        let mut iter = copies.into_iter();
        let mut merged = iter.next().ok_or(PsbtError::Parse {
            detail: "nothing to merge".into(),
        })?;
        let txid = merged.unsigned_tx.compute_txid();

        for copy in iter {
            if copy.unsigned_tx.compute_txid() != txid {
                return Err(PsbtError::MergeMismatch);
            }
            merged.combine(copy).map_err(|_| PsbtError::MergeMismatch)?;
        }

        self.verify_partial_sigs(&merged)?;
        Ok(merged)
    }

    /// Count of inputs ⇔ quorum check: true iff every input holds at least
    /// `m` valid partial signatures.
    pub fn has_enough_signatures(&self, psbt: &Psbt, m: usize) -> bool {
        (0..psbt.inputs.len()).all(|index| {
            self.valid_signatures(psbt, index)
                .map(|sigs| sigs.len() >= m)
                .unwrap_or(false)
        })
    }

    /// Assemble witnesses / scriptSigs and extract broadcast bytes.
    ///
    /// Precondition: every input carries at least `m` distinct valid
    /// partial signatures; fails closed otherwise. The witness stack is
    /// `[empty, sig_1, …, sig_m, witnessScript]`; the leading empty
    /// element feeds the extra item CHECKMULTISIG historically pops.
    pub fn finalize(&self, mut psbt: Psbt, m: usize) -> Result<Finalized, PsbtError> {
        for index in 0..psbt.inputs.len() {
            let script = spend_script(&psbt, index)?;
            let multisig = MultisigScript::parse(match &script {
                SpendScript::Segwit(s) | SpendScript::Legacy(s) => s,
            })
            .map_err(|_| PsbtError::NotMultisig { input: index })?;
            if multisig.m() != m {
                return Err(PsbtError::MultisigParamMismatch {
                    expected_m: m,
                    found_m: multisig.m(),
                });
            }

            let sigs = self.valid_signatures(&psbt, index)?;
            if sigs.len() < m {
                return Err(PsbtError::NotEnoughSignatures {
                    input: index,
                    have: sigs.len(),
                    need: m,
                });
            }
            let sigs = &sigs[..m];

            match script {
                SpendScript::Segwit(witness_script) => {
                    let mut witness = Witness::new();
                    witness.push(Vec::<u8>::new());
                    for sig in sigs {
                        witness.push(sig.to_vec());
                    }
                    witness.push(witness_script.as_bytes());
                    psbt.inputs[index].final_script_witness = Some(witness);

                    // P2SH-P2WSH also reveals the wrapper in the scriptSig.
                    if let Some(redeem) = psbt.inputs[index].redeem_script.clone() {
                        let push = PushBytesBuf::try_from(redeem.into_bytes()).map_err(|_| {
                            PsbtError::Sighash {
                                input: index,
                                detail: "oversized redeem script".into(),
                            }
                        })?;
                        psbt.inputs[index].final_script_sig =
                            Some(Builder::new().push_slice(&push).into_script());
                    }
                }
                SpendScript::Legacy(redeem) => {
                    let mut builder = Builder::new().push_int(0);
                    for sig in sigs {
                        let push =
                            PushBytesBuf::try_from(sig.to_vec()).map_err(|_| PsbtError::Sighash {
                                input: index,
                                detail: "oversized signature".into(),
                            })?;
                        builder = builder.push_slice(&push);
                    }
                    let redeem_push =
                        PushBytesBuf::try_from(redeem.into_bytes()).map_err(|_| {
                            PsbtError::Sighash {
                                input: index,
                                detail: "oversized redeem script".into(),
                            }
                        })?;
                    psbt.inputs[index].final_script_sig =
                        Some(builder.push_slice(&redeem_push).into_script());
                }
            }
            psbt.inputs[index].partial_sigs.clear();
        }

        let tx = psbt.extract_tx().map_err(|e| PsbtError::Parse {
            detail: e.to_string(),
        })?;
        Ok(Finalized {
            bytes: serialize(&tx),
            txid: tx.compute_txid(),
            tx,
        })
    }

    /// Decode every input's multisig script and check the quorum shape.
    pub fn validate(&self, psbt: &Psbt, expected_m: usize, expected_n: usize) -> Validation {
        let mut errors = Vec::new();
        for index in 0..psbt.inputs.len() {
            match spend_script(psbt, index).and_then(|script| {
                MultisigScript::parse(match &script {
                    SpendScript::Segwit(s) | SpendScript::Legacy(s) => s,
                })
                .map_err(|_| PsbtError::NotMultisig { input: index })
            }) {
                Ok(multisig) => {
                    if multisig.m() != expected_m {
                        errors.push(PsbtError::MultisigParamMismatch {
                            expected_m,
                            found_m: multisig.m(),
                        });
                    }
                    if multisig.n() != expected_n {
                        errors.push(PsbtError::MultisigParamMismatch {
                            expected_m: expected_n,
                            found_m: multisig.n(),
                        });
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        Validation {
            valid: errors.is_empty(),
            errors,
        }
    }

    // ─── internals ──────────────────────────────────────────────────────

    /// Signatures on `index` that verify, in script-key order.
    fn valid_signatures(
        &self,
        psbt: &Psbt,
        index: usize,
    ) -> Result<Vec<bitcoin::ecdsa::Signature>, PsbtError> {
        let script = spend_script(psbt, index)?;
        let multisig = MultisigScript::parse(match &script {
            SpendScript::Segwit(s) | SpendScript::Legacy(s) => s,
        })
        .map_err(|_| PsbtError::NotMultisig { input: index })?;

        let unsigned = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&unsigned);
        let msg = self.input_message(psbt, &mut cache, index, &script)?;

        let mut sigs = Vec::new();
        for key in multisig.keys() {
            if let Some(sig) = psbt.inputs[index].partial_sigs.get(&PublicKey::from(*key)) {
                if self.secp.verify_ecdsa(&msg, &sig.signature, &key.0).is_ok() {
                    sigs.push(*sig);
                }
            }
        }
        Ok(sigs)
    }

    /// Reject any partial signature that does not verify.
    fn verify_partial_sigs(&self, psbt: &Psbt) -> Result<(), PsbtError> {
        let unsigned = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&unsigned);
        for index in 0..psbt.inputs.len() {
            if psbt.inputs[index].partial_sigs.is_empty() {
                continue;
            }
            let script = spend_script(psbt, index)?;
            let msg = self.input_message(psbt, &mut cache, index, &script)?;
            for (pk, sig) in &psbt.inputs[index].partial_sigs {
                let key = pk.inner;
                if self.secp.verify_ecdsa(&msg, &sig.signature, &key).is_err() {
                    return Err(PsbtError::SignatureInvalid { input: index });
                }
            }
        }
        Ok(())
    }

    /// BIP-143 digest for segwit inputs, legacy digest otherwise.
    fn input_message(
        &self,
        psbt: &Psbt,
        cache: &mut SighashCache<&Transaction>,
        index: usize,
        script: &SpendScript,
    ) -> Result<Message, PsbtError> {
        let digest: [u8; 32] = match script {
            SpendScript::Segwit(witness_script) => {
                let value =
                    input_value(psbt, index).ok_or(PsbtError::MissingContext { input: index })?;
                cache
                    .p2wsh_signature_hash(index, witness_script, value, EcdsaSighashType::All)
                    .map_err(|e| PsbtError::Sighash {
                        input: index,
                        detail: e.to_string(),
                    })?
                    .to_byte_array()
            }
            SpendScript::Legacy(redeem) => cache
                .legacy_signature_hash(index, redeem, EcdsaSighashType::All.to_u32())
                .map_err(|e| PsbtError::Sighash {
                    input: index,
                    detail: e.to_string(),
                })?
                .to_byte_array(),
        };
        Ok(Message::from_digest(digest))
    }

    /// Import-time audit, modeled on the network/consistency checks a
    /// validating signer runs before touching a foreign PSBT.
    fn audit(&self, psbt: &Psbt) -> Vec<ImportWarning> {
        let mut warnings = Vec::new();

        for (index, input) in psbt.inputs.iter().enumerate() {
            if input.witness_utxo.is_none() && input.non_witness_utxo.is_none() {
                warnings.push(ImportWarning::MissingUtxoContext { input: index });
            }
        }

        if self.network_mismatch(psbt) {
            warnings.push(ImportWarning::NetworkMismatch);
        }

        for (index, output) in psbt.unsigned_tx.output.iter().enumerate() {
            if output.value.to_sat() == 0 {
                warnings.push(ImportWarning::ZeroValueOutput { output: index });
            }
        }

        if let Some(total_in) = total_input_value(psbt) {
            let total_out: u64 = psbt.unsigned_tx.output.iter().map(|o| o.value.to_sat()).sum();
            let fee = total_in.saturating_sub(total_out);
            if total_in > 0 && fee * 10 > total_in {
                warnings.push(ImportWarning::ExcessiveFee {
                    fee,
                    pct: fee * 100 / total_in,
                });
            }
        }

        warnings
    }

    /// Do any recorded keys or derivation paths belong to the wrong
    /// network?
    fn network_mismatch(&self, psbt: &Psbt) -> bool {
        let expected_kind = NetworkKind::from(self.network);
        let expected_coin = coin_type(self.network);

        if psbt.xpub.keys().any(|xpub| xpub.network != expected_kind) {
            return true;
        }

        let mut sources = Vec::new();
        for input in &psbt.inputs {
            sources.extend(input.bip32_derivation.values());
        }
        for output in &psbt.outputs {
            sources.extend(output.bip32_derivation.values());
        }
        sources.iter().any(|(_, path)| {
            let raw: &[ChildNumber] = path.as_ref();
            matches!(
                (raw.first(), raw.get(1)),
                (
                    Some(ChildNumber::Hardened { index: 44 | 48 | 49 | 84 }),
                    Some(ChildNumber::Hardened { index: coin }),
                ) if *coin != expected_coin
            )
        })
    }
}

/// Outcome of `validate`.
#[derive(Debug)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<PsbtError>,
}

/// The script that actually gets hashed when spending `index`.
fn spend_script(psbt: &Psbt, index: usize) -> Result<SpendScript, PsbtError> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or(PsbtError::MissingContext { input: index })?;
    if let Some(witness_script) = &input.witness_script {
        Ok(SpendScript::Segwit(witness_script.clone()))
    } else if let Some(redeem) = &input.redeem_script {
        Ok(SpendScript::Legacy(redeem.clone()))
    } else {
        Err(PsbtError::MissingContext { input: index })
    }
}

/// Funding value of one input, from either context form.
fn input_value(psbt: &Psbt, index: usize) -> Option<Amount> {
    let input = psbt.inputs.get(index)?;
    if let Some(utxo) = &input.witness_utxo {
        return Some(utxo.value);
    }
    let tx = input.non_witness_utxo.as_ref()?;
    let vout = psbt.unsigned_tx.input.get(index)?.previous_output.vout as usize;
    tx.output.get(vout).map(|o| o.value)
}

/// Sum of all input values, if every input has context.
fn total_input_value(psbt: &Psbt) -> Option<u64> {
    (0..psbt.inputs.len())
        .map(|i| input_value(psbt, i).map(|a| a.to_sat()))
        .sum::<Option<u64>>()
}
