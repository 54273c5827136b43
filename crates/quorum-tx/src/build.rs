//! Transaction assembly and single-signature signing.
//!
//! `build_singlesig` runs the whole pipeline (validate, select, populate,
//! sign, verify, finalize) and emits broadcast bytes. `build_multisig`
//! stops after populating the PSBT container with redeem/witness scripts;
//! the multi-party lifecycle lives in `quorum-psbt`.
//!
//! Every signature is verified against its public key before it is
//! accepted, and any verification or structural failure aborts the build.
//! The partial transaction is dropped; there is no retry logic.

use bitcoin::absolute::LockTime;
use bitcoin::bip32::ChildNumber;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash as _;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, CompressedPublicKey, Network, PublicKey, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use rand::{CryptoRng, RngCore};
use thiserror::Error;

use quorum_core::{AccountError, MultisigAccount};
use quorum_script::address::{self, AddressError};
use quorum_script::weight::DUST_THRESHOLD;
use quorum_script::{MultisigError, ScriptKind};

use crate::providers::{KeyProvider, ProviderError, UnspentOutput, UnspentProvider};
use crate::select::{self, SelectError, SelectParams};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("Output of {value} sat is below the {DUST_THRESHOLD} sat dust floor")]
    DustOutput { value: u64 },
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Multisig(#[from] MultisigError),
    #[error("Signature for input {input} failed verification")]
    SignatureInvalid { input: usize },
    #[error("Fee of {fee} sat is {pct}% of input value")]
    ExcessiveFee { fee: u64, pct: u64 },
    #[error("Build failed: {0}")]
    BuildFailed(String),
}

/// Spending context of one input, by script shape.
#[derive(Debug, Clone)]
pub enum ScriptContext {
    /// P2PKH or P2WPKH: the locking script alone suffices.
    SingleKey { spk: ScriptBuf },
    /// P2SH-P2WPKH: the P2SH wrapper plus its v0 program.
    Wrapped { spk: ScriptBuf, redeem: ScriptBuf },
    /// Any multisig form, with whichever of the two scripts it reveals.
    Multisig {
        spk: ScriptBuf,
        redeem: Option<ScriptBuf>,
        witness: Option<ScriptBuf>,
    },
}

/// A finished single-sig transaction.
#[derive(Debug)]
pub struct SignedTx {
    pub tx: Transaction,
    pub bytes: Vec<u8>,
    pub txid: Txid,
    pub fee: u64,
}

/// An unfinalized multisig draft, ready for the PSBT lifecycle.
pub struct MultisigDraft {
    pub psbt: Psbt,
    pub fee: u64,
}

pub struct Assembler<'a, K: KeyProvider> {
    network: Network,
    keys: &'a K,
    secp: Secp256k1<All>,
}

impl<'a, K: KeyProvider> Assembler<'a, K> {
    pub fn new(network: Network, keys: &'a K) -> Self {
        Self {
            network,
            keys,
            secp: Secp256k1::new(),
        }
    }

    /// Build, sign, and serialize a single-signature spend.
    pub fn build_singlesig<R, U>(
        &self,
        candidates: Vec<UnspentOutput>,
        unspent: &U,
        recipient: &str,
        amount: u64,
        fee_rate: u64,
        change_address: &str,
        rng: &mut R,
    ) -> Result<SignedTx, BuildError>
    where
        R: RngCore + CryptoRng,
        U: UnspentProvider,
    {
        let recipient = address::decode(recipient, self.network)?;
        let change = address::decode(change_address, self.network)?;
        if amount < DUST_THRESHOLD {
            return Err(BuildError::DustOutput { value: amount });
        }

        let selection = select::pick(
            candidates,
            SelectParams {
                target: amount,
                fee_rate,
                quorum: None,
            },
            &recipient.script_pubkey,
            &change.script_pubkey,
            rng,
        )?;
        let total_in: u64 = selection.inputs.iter().map(|i| i.value.to_sat()).sum();
        check_fee_ceiling(selection.fee, total_in)?;
        log::debug!(
            "selected {} inputs totaling {} sat, fee {} sat",
            selection.inputs.len(),
            total_in,
            selection.fee
        );

        let mut psbt = unsigned_psbt(
            &selection.inputs,
            &recipient.script_pubkey,
            amount,
            &change.script_pubkey,
            selection.change,
        )?;

        // Per-input keys and contexts, then signatures.
        let mut keys = Vec::with_capacity(selection.inputs.len());
        for (i, utxo) in selection.inputs.iter().enumerate() {
            let kind = utxo
                .kind
                .ok_or_else(|| BuildError::BuildFailed(format!("input {i} missing script kind")))?;
            if kind.is_multisig() {
                return Err(BuildError::BuildFailed(format!(
                    "input {i} is multisig; use build_multisig"
                )));
            }
            let path = utxo.derivation_path.as_ref().ok_or_else(|| {
                BuildError::BuildFailed(format!("input {i} missing derivation path"))
            })?;
            let sk = self.keys.private_key_for(path)?;
            let pk = CompressedPublicKey(sk.public_key(&self.secp));

            let context = match kind {
                ScriptKind::P2pkh | ScriptKind::P2wpkh => ScriptContext::SingleKey {
                    spk: utxo.script_pubkey.clone(),
                },
                ScriptKind::P2shP2wpkh => {
                    let redeem = ScriptBuf::new_p2wpkh(&pk.wpubkey_hash());
                    if ScriptBuf::new_p2sh(&redeem.script_hash()) != utxo.script_pubkey {
                        return Err(BuildError::BuildFailed(format!(
                            "input {i} script does not match its key"
                        )));
                    }
                    ScriptContext::Wrapped {
                        spk: utxo.script_pubkey.clone(),
                        redeem,
                    }
                }
                _ => unreachable!("multisig rejected above"),
            };
            let funding = match kind {
                ScriptKind::P2pkh => Some(fetch_funding(unspent, utxo, i)?),
                _ => None,
            };
            add_input(&mut psbt, i, utxo, &context, funding)?;
            keys.push((sk, pk, kind));
        }

        let unsigned = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&unsigned);
        for (i, (sk, pk, kind)) in keys.iter().enumerate() {
            self.sign_singlekey(&mut psbt, &mut cache, i, *kind, *sk, *pk)?;
        }
        for (i, (_, _, kind)) in keys.iter().enumerate() {
            finalize_singlekey(&mut psbt, i, *kind)?;
        }

        let tx = psbt
            .extract_tx()
            .map_err(|e| BuildError::BuildFailed(e.to_string()))?;
        verify_structure(&tx, &selection.inputs, selection.fee)?;

        Ok(SignedTx {
            bytes: serialize(&tx),
            txid: tx.compute_txid(),
            fee: selection.fee,
            tx,
        })
    }

    /// Build the unsigned multisig draft: selection and container
    /// population only. Signing, merging, and finalization belong to the
    /// PSBT engine.
    pub fn build_multisig<R, U>(
        &self,
        account: &MultisigAccount,
        candidates: Vec<UnspentOutput>,
        unspent: &U,
        recipient: &str,
        amount: u64,
        fee_rate: u64,
        change_address: &str,
        rng: &mut R,
    ) -> Result<MultisigDraft, BuildError>
    where
        R: RngCore + CryptoRng,
        U: UnspentProvider,
    {
        let recipient = address::decode(recipient, self.network)?;
        let change = address::decode(change_address, self.network)?;
        if amount < DUST_THRESHOLD {
            return Err(BuildError::DustOutput { value: amount });
        }

        let selection = select::pick(
            candidates,
            SelectParams {
                target: amount,
                fee_rate,
                quorum: Some((account.m(), account.n())),
            },
            &recipient.script_pubkey,
            &change.script_pubkey,
            rng,
        )?;
        let total_in: u64 = selection.inputs.iter().map(|i| i.value.to_sat()).sum();
        check_fee_ceiling(selection.fee, total_in)?;

        let mut psbt = unsigned_psbt(
            &selection.inputs,
            &recipient.script_pubkey,
            amount,
            &change.script_pubkey,
            selection.change,
        )?;

        for (i, utxo) in selection.inputs.iter().enumerate() {
            let path = utxo.derivation_path.as_ref().ok_or_else(|| {
                BuildError::BuildFailed(format!("input {i} missing derivation path"))
            })?;
            let (chain, index) = chain_index_of(path)
                .ok_or_else(|| BuildError::BuildFailed(format!("input {i} has no chain/index")))?;

            let script = account.script_at(chain, index)?;
            if script.script_pubkey(account.kind)? != utxo.script_pubkey {
                return Err(BuildError::BuildFailed(format!(
                    "input {i} does not belong to account {}",
                    account.name
                )));
            }

            let context = ScriptContext::Multisig {
                spk: utxo.script_pubkey.clone(),
                redeem: script.redeem_script(account.kind)?,
                witness: script.witness_script(account.kind)?,
            };
            let funding = match account.kind {
                ScriptKind::P2shMultisig => Some(fetch_funding(unspent, utxo, i)?),
                _ => None,
            };
            add_input(&mut psbt, i, utxo, &context, funding)?;

            // Record our own key origin so the signer can locate its key
            // without re-deriving the whole account.
            let sk = self.keys.private_key_for(path)?;
            let pk = sk.public_key(&self.secp);
            if !script.keys().contains(&CompressedPublicKey(pk)) {
                return Err(BuildError::BuildFailed(format!(
                    "input {i}: our key is not in the cosigner set"
                )));
            }
            psbt.inputs[i]
                .bip32_derivation
                .insert(pk, (self.keys.master_fingerprint()?, path.clone()));
        }

        Ok(MultisigDraft {
            psbt,
            fee: selection.fee,
        })
    }

    fn sign_singlekey(
        &self,
        psbt: &mut Psbt,
        cache: &mut SighashCache<&Transaction>,
        index: usize,
        kind: ScriptKind,
        sk: bitcoin::secp256k1::SecretKey,
        pk: CompressedPublicKey,
    ) -> Result<(), BuildError> {
        let input = &psbt.inputs[index];
        let digest: [u8; 32] = match kind {
            ScriptKind::P2pkh => {
                let spk = input
                    .non_witness_utxo
                    .as_ref()
                    .and_then(|tx| {
                        tx.output
                            .get(psbt.unsigned_tx.input[index].previous_output.vout as usize)
                    })
                    .map(|o| o.script_pubkey.clone())
                    .ok_or_else(|| {
                        BuildError::BuildFailed(format!("input {index} missing funding output"))
                    })?;
                let sighash = cache
                    .legacy_signature_hash(index, &spk, EcdsaSighashType::All.to_u32())
                    .map_err(|e| BuildError::BuildFailed(e.to_string()))?;
                sighash.to_byte_array()
            }
            ScriptKind::P2wpkh | ScriptKind::P2shP2wpkh => {
                let utxo = input.witness_utxo.as_ref().ok_or_else(|| {
                    BuildError::BuildFailed(format!("input {index} missing witness utxo"))
                })?;
                // BIP-143: for the wrapped form the program is the redeem
                // script, not the P2SH wrapper.
                let program = match kind {
                    ScriptKind::P2shP2wpkh => input.redeem_script.clone().ok_or_else(|| {
                        BuildError::BuildFailed(format!("input {index} missing redeem script"))
                    })?,
                    _ => utxo.script_pubkey.clone(),
                };
                let sighash = cache
                    .p2wpkh_signature_hash(index, &program, utxo.value, EcdsaSighashType::All)
                    .map_err(|e| BuildError::BuildFailed(e.to_string()))?;
                sighash.to_byte_array()
            }
            other => {
                return Err(BuildError::BuildFailed(format!(
                    "cannot single-sign {other} input {index}"
                )))
            }
        };

        let msg = Message::from_digest(digest);
        let sig = self.secp.sign_ecdsa(&msg, &sk);
        self.secp
            .verify_ecdsa(&msg, &sig, &pk.0)
            .map_err(|_| BuildError::SignatureInvalid { input: index })?;

        psbt.inputs[index].partial_sigs.insert(
            PublicKey::from(pk),
            bitcoin::ecdsa::Signature::sighash_all(sig),
        );
        Ok(())
    }
}

/// Unsigned skeleton: selected inputs in shuffled order, recipient output,
/// optional change output.
fn unsigned_psbt(
    inputs: &[UnspentOutput],
    recipient_spk: &ScriptBuf,
    amount: u64,
    change_spk: &ScriptBuf,
    change: Option<u64>,
) -> Result<Psbt, BuildError> {
    let tx_inputs: Vec<TxIn> = inputs
        .iter()
        .map(|u| TxIn {
            previous_output: u.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        })
        .collect();

    let mut outputs = vec![TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: recipient_spk.clone(),
    }];
    if let Some(change_value) = change {
        outputs.push(TxOut {
            value: Amount::from_sat(change_value),
            script_pubkey: change_spk.clone(),
        });
    }

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: tx_inputs,
        output: outputs,
    };
    Psbt::from_unsigned_tx(tx).map_err(|e| BuildError::BuildFailed(e.to_string()))
}

/// Populate one PSBT input from its script context. Legacy contexts carry
/// the full funding transaction; witness contexts just value + script.
fn add_input(
    psbt: &mut Psbt,
    index: usize,
    utxo: &UnspentOutput,
    context: &ScriptContext,
    funding: Option<Transaction>,
) -> Result<(), BuildError> {
    let input = &mut psbt.inputs[index];
    match context {
        ScriptContext::SingleKey { spk } if spk.is_p2pkh() => {
            input.non_witness_utxo = Some(funding.ok_or_else(|| {
                BuildError::BuildFailed(format!("input {index} needs its funding transaction"))
            })?);
        }
        ScriptContext::SingleKey { spk } => {
            input.witness_utxo = Some(TxOut {
                value: utxo.value,
                script_pubkey: spk.clone(),
            });
        }
        ScriptContext::Wrapped { spk, redeem } => {
            input.witness_utxo = Some(TxOut {
                value: utxo.value,
                script_pubkey: spk.clone(),
            });
            input.redeem_script = Some(redeem.clone());
        }
        ScriptContext::Multisig {
            spk,
            redeem,
            witness,
        } => {
            if witness.is_some() {
                input.witness_utxo = Some(TxOut {
                    value: utxo.value,
                    script_pubkey: spk.clone(),
                });
            } else {
                input.non_witness_utxo = Some(funding.ok_or_else(|| {
                    BuildError::BuildFailed(format!("input {index} needs its funding transaction"))
                })?);
            }
            input.redeem_script = redeem.clone();
            input.witness_script = witness.clone();
        }
    }
    Ok(())
}

/// Fetch and sanity-check the funding transaction for a legacy input.
fn fetch_funding<U: UnspentProvider>(
    unspent: &U,
    utxo: &UnspentOutput,
    index: usize,
) -> Result<Transaction, BuildError> {
    let tx = unspent
        .funding_transaction(&utxo.outpoint.txid)?
        .ok_or_else(|| {
            BuildError::BuildFailed(format!("input {index}: funding transaction unavailable"))
        })?;
    if tx.compute_txid() != utxo.outpoint.txid {
        return Err(BuildError::BuildFailed(format!(
            "input {index}: funding transaction id mismatch"
        )));
    }
    match tx.output.get(utxo.outpoint.vout as usize) {
        Some(out) if out.script_pubkey == utxo.script_pubkey && out.value == utxo.value => Ok(tx),
        _ => Err(BuildError::BuildFailed(format!(
            "input {index}: funding output does not match"
        ))),
    }
}

/// Assemble the final scriptSig / witness for a signed single-key input.
fn finalize_singlekey(psbt: &mut Psbt, index: usize, kind: ScriptKind) -> Result<(), BuildError> {
    let input = &mut psbt.inputs[index];
    let (pk, sig) = input
        .partial_sigs
        .iter()
        .next()
        .map(|(pk, sig)| (*pk, *sig))
        .ok_or_else(|| BuildError::BuildFailed(format!("input {index} is unsigned")))?;
    let sig_bytes = PushBytesBuf::try_from(sig.to_vec())
        .map_err(|_| BuildError::BuildFailed("oversized signature".into()))?;

    match kind {
        ScriptKind::P2pkh => {
            input.final_script_sig = Some(
                Builder::new()
                    .push_slice(&sig_bytes)
                    .push_key(&pk)
                    .into_script(),
            );
        }
        ScriptKind::P2wpkh => {
            let mut witness = Witness::new();
            witness.push(sig.to_vec());
            witness.push(pk.to_bytes());
            input.final_script_witness = Some(witness);
        }
        ScriptKind::P2shP2wpkh => {
            let redeem = input.redeem_script.clone().ok_or_else(|| {
                BuildError::BuildFailed(format!("input {index} missing redeem script"))
            })?;
            let mut witness = Witness::new();
            witness.push(sig.to_vec());
            witness.push(pk.to_bytes());
            input.final_script_witness = Some(witness);
            let redeem_push = PushBytesBuf::try_from(redeem.into_bytes())
                .map_err(|_| BuildError::BuildFailed("oversized redeem script".into()))?;
            input.final_script_sig = Some(Builder::new().push_slice(&redeem_push).into_script());
        }
        other => {
            return Err(BuildError::BuildFailed(format!(
                "cannot finalize {other} as single-key"
            )))
        }
    }
    input.partial_sigs.clear();
    Ok(())
}

fn chain_index_of(path: &bitcoin::bip32::DerivationPath) -> Option<(u32, u32)> {
    let raw: &[ChildNumber] = path.as_ref();
    if raw.len() < 2 {
        return None;
    }
    match (raw[raw.len() - 2], raw[raw.len() - 1]) {
        (ChildNumber::Normal { index: chain }, ChildNumber::Normal { index }) if chain <= 1 => {
            Some((chain, index))
        }
        _ => None,
    }
}

fn check_fee_ceiling(fee: u64, total_in: u64) -> Result<(), BuildError> {
    // More than 10% of input value is assumed to be a mistake.
    if total_in > 0 && fee * 10 > total_in {
        return Err(BuildError::ExcessiveFee {
            fee,
            pct: fee * 100 / total_in,
        });
    }
    Ok(())
}

/// Re-check the transaction invariants before handing bytes out.
fn verify_structure(
    tx: &Transaction,
    inputs: &[UnspentOutput],
    fee: u64,
) -> Result<(), BuildError> {
    let mut seen = std::collections::HashSet::new();
    for txin in &tx.input {
        if !seen.insert(txin.previous_output) {
            return Err(BuildError::BuildFailed("duplicate input".into()));
        }
    }

    for out in &tx.output {
        if out.value.to_sat() < DUST_THRESHOLD {
            return Err(BuildError::DustOutput {
                value: out.value.to_sat(),
            });
        }
    }

    let total_in: u64 = inputs.iter().map(|i| i.value.to_sat()).sum();
    let total_out: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
    if total_in != total_out + fee {
        return Err(BuildError::BuildFailed(format!(
            "value imbalance: {total_in} in, {total_out} out, {fee} fee"
        )));
    }
    Ok(())
}
