//! Unspent-output selection.
//!
//! Candidates are shuffled with a Fisher–Yates pass driven by a
//! caller-supplied cryptographically secure source, then accumulated in
//! shuffled order until the target plus fees is covered. Deterministic
//! selection would fingerprint the wallet on-chain, which is why the
//! source must be a real CSPRNG in production; tests inject a seeded one
//! to pin sequences.

use std::collections::HashSet;

use bitcoin::Script;
use rand::{CryptoRng, RngCore};
use thiserror::Error;

use quorum_script::weight::{fee_for, tx_vbytes, DUST_THRESHOLD, MIN_RELAY_FEE_RATE};
use quorum_script::ScriptKind;

use crate::providers::UnspentOutput;

/// Upper sanity bound on fee rates, sat/vB.
pub const MAX_FEE_RATE: u64 = 1_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectError {
    #[error("Insufficient funds: have {have} sat, need {need} sat")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Candidate set repeats a previous output")]
    DuplicateInput,
    #[error("Fee rate {rate} sat/vB is outside {MIN_RELAY_FEE_RATE}..={MAX_FEE_RATE}")]
    FeeRateOutOfRange { rate: u64 },
    #[error("Candidate {0} has no script kind; only owned outputs are spendable")]
    MissingKind(String),
}

/// Result of a successful pick.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Chosen inputs, in the shuffled order they will appear in the
    /// transaction.
    pub inputs: Vec<UnspentOutput>,
    /// Change value in satoshis; `None` means the residual was absorbed
    /// into the fee.
    pub change: Option<u64>,
    /// Total fee paid.
    pub fee: u64,
}

/// Quorum parameters used to weigh multisig inputs.
#[derive(Debug, Clone, Copy)]
pub struct SelectParams {
    /// Payment value, satoshis.
    pub target: u64,
    /// Fee rate, satoshis per virtual byte.
    pub fee_rate: u64,
    /// `(m, n)` when spending from a multisig account.
    pub quorum: Option<(usize, usize)>,
}

/// Fisher–Yates, 32 bits of randomness per swap, uniform modulo the
/// remaining count.
pub fn shuffle<T, R: RngCore + CryptoRng>(items: &mut [T], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = (rng.next_u32() as usize) % (i + 1);
        items.swap(i, j);
    }
}

/// Select inputs covering `target` at `fee_rate`, spending to
/// `recipient_spk` with change (if any) to `change_spk`.
pub fn pick<R: RngCore + CryptoRng>(
    mut candidates: Vec<UnspentOutput>,
    params: SelectParams,
    recipient_spk: &Script,
    change_spk: &Script,
    rng: &mut R,
) -> Result<Selection, SelectError> {
    let SelectParams {
        target,
        fee_rate,
        quorum,
    } = params;

    if !(MIN_RELAY_FEE_RATE..=MAX_FEE_RATE).contains(&fee_rate) {
        return Err(SelectError::FeeRateOutOfRange { rate: fee_rate });
    }

    let mut seen = HashSet::new();
    for c in &candidates {
        if !seen.insert(c.outpoint) {
            return Err(SelectError::DuplicateInput);
        }
    }

    let have: u64 = candidates.iter().map(|c| c.value.to_sat()).sum();
    let (m, n) = quorum.unwrap_or((0, 0));

    shuffle(&mut candidates, rng);

    let mut selected: Vec<UnspentOutput> = Vec::new();
    let mut kinds: Vec<ScriptKind> = Vec::new();
    let mut total: u64 = 0;
    let mut need = target;

    for candidate in candidates {
        let kind = candidate
            .kind
            .ok_or_else(|| SelectError::MissingKind(candidate.outpoint.to_string()))?;
        total += candidate.value.to_sat();
        kinds.push(kind);
        selected.push(candidate);

        let weighted = || kinds.iter().map(|&k| (k, m, n));
        let fee_with_change = fee_for(
            tx_vbytes(weighted(), [recipient_spk, change_spk]),
            fee_rate,
        );
        let fee_without_change = fee_for(tx_vbytes(weighted(), [recipient_spk]), fee_rate);
        need = target + fee_with_change;

        // Prefer a change output whenever it would clear the dust floor.
        if total >= target + fee_with_change
            && total - target - fee_with_change >= DUST_THRESHOLD
        {
            let change = total - target - fee_with_change;
            return Ok(Selection {
                inputs: selected,
                change: Some(change),
                fee: fee_with_change,
            });
        }

        // Otherwise accept exact-ish coverage, absorbing the residual.
        if total >= target + fee_without_change {
            let fee = total - target;
            return Ok(Selection {
                inputs: selected,
                change: None,
                fee,
            });
        }
    }

    Err(SelectError::InsufficientFunds { have, need })
}
