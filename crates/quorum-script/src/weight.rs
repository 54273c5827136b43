//! Virtual-size accounting for fee estimation.
//!
//! Per-input costs are a closed match on [`ScriptKind`], with the multisig
//! kinds parameterized by the quorum. Witness bytes count a quarter, so the
//! multisig rows divide the signature/script payload by four and round up.
//! The table is checked against serialized transactions in the integration
//! tests; the P2SH-P2WSH row is deliberately on the conservative side.

use bitcoin::Script;

use crate::kind::ScriptKind;

/// Outputs below this many satoshis are uneconomical to spend.
pub const DUST_THRESHOLD: u64 = 546;

/// Network relay floor, in satoshis per virtual byte.
pub const MIN_RELAY_FEE_RATE: u64 = 1;

/// Version + locktime + the two count varints.
pub const TX_BASE_VBYTES: u64 = 10;

/// Segwit marker and flag, paid once if any input carries a witness.
pub const SEGWIT_MARKER_VBYTES: u64 = 2;

/// Virtual bytes an input of this kind adds to a transaction.
///
/// `m` and `n` are ignored for the single-key kinds.
pub fn input_vbytes(kind: ScriptKind, m: usize, n: usize) -> u64 {
    let m = m as u64;
    let n = n as u64;
    match kind {
        ScriptKind::P2pkh => 148,
        ScriptKind::P2shP2wpkh => 91,
        ScriptKind::P2wpkh => 68,
        // prevout (32+4) + scriptSig with M signatures and the redeem
        // script + sequence, all non-witness bytes.
        ScriptKind::P2shMultisig => 32 + 4 + (73 * m + 34 * n + 3) + 4,
        ScriptKind::P2wshMultisig => 41 + (73 * m + 34 * n + 3 + 8).div_ceil(4),
        ScriptKind::P2shP2wshMultisig => 74 + (73 * m + 34 * n + 11).div_ceil(4),
    }
}

/// Virtual bytes an output paying to `script_pubkey` adds.
pub fn output_vbytes(script_pubkey: &Script) -> u64 {
    if script_pubkey.is_witness_program() {
        31
    } else {
        34
    }
}

/// Total virtual size of a transaction with the given inputs and outputs.
///
/// `inputs` yields `(kind, m, n)` triples; `outputs` yields locking scripts.
pub fn tx_vbytes<'a>(
    inputs: impl IntoIterator<Item = (ScriptKind, usize, usize)>,
    outputs: impl IntoIterator<Item = &'a Script>,
) -> u64 {
    let mut total = TX_BASE_VBYTES;
    let mut any_witness = false;
    for (kind, m, n) in inputs {
        any_witness |= kind.is_segwit();
        total += input_vbytes(kind, m, n);
    }
    for spk in outputs {
        total += output_vbytes(spk);
    }
    if any_witness {
        total += SEGWIT_MARKER_VBYTES;
    }
    total
}

/// Fee for a transaction of `vbytes` at `rate` satoshis per virtual byte.
pub fn fee_for(vbytes: u64, rate: u64) -> u64 {
    vbytes.saturating_mul(rate)
}
