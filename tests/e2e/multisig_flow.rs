//! End-to-end 2-of-3 P2WSH coordination: three wallets exchange account
//! keys, agree on deposit addresses, and co-sign a spend through the full
//! export → sign → merge → finalize lifecycle.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, OutPoint, Transaction, TxOut};
use rand::rngs::StdRng;
use rand::SeedableRng;

use quorum_core::seed::{derive_seed, parse_mnemonic};
use quorum_core::{Cosigner, KeyTree, MultisigAccount};
use quorum_psbt::PsbtEngine;
use quorum_script::{MultisigScript, ScriptKind};
use quorum_tx::{Assembler, MultisigDraft, ProviderError, UnspentOutput, UnspentProvider};

const PHRASES: [&str; 3] = [
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
    "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong",
    "legal winner thank year wave sausage worth useful legal winner thank yellow",
];

struct NoLookup;
impl UnspentProvider for NoLookup {
    fn unspent_for_script(
        &self,
        _script: &bitcoin::Script,
    ) -> Result<Vec<UnspentOutput>, ProviderError> {
        Ok(Vec::new())
    }
}

fn trees() -> Vec<KeyTree> {
    PHRASES
        .iter()
        .map(|p| {
            let mnemonic = parse_mnemonic(p).unwrap();
            let seed = derive_seed(&mnemonic, "");
            KeyTree::from_seed(seed.as_bytes(), Network::Testnet).unwrap()
        })
        .collect()
}

/// Each participant assembles the account from the exchanged SLIP-132
/// strings, in whatever order they received them.
fn account_as_seen_by(trees: &[KeyTree], order: [usize; 3]) -> MultisigAccount {
    let cosigners: Vec<Cosigner> = order
        .iter()
        .map(|&i| {
            let slip = trees[i]
                .account_xpub_slip132(ScriptKind::P2wshMultisig, 0)
                .unwrap();
            Cosigner::foreign(
                &format!("signer-{i}"),
                &slip,
                ScriptKind::P2wshMultisig,
                Network::Testnet,
            )
            .unwrap()
        })
        .collect();
    MultisigAccount::new("vault", cosigners, 2, ScriptKind::P2wshMultisig, Network::Testnet)
        .unwrap()
}

/// Vector: all three cosigners independently derive the identical first
/// receive address, regardless of key exchange order.
#[test]
fn cosigners_agree_on_first_receive_address() {
    let trees = trees();
    let views = [
        account_as_seen_by(&trees, [0, 1, 2]),
        account_as_seen_by(&trees, [1, 2, 0]),
        account_as_seen_by(&trees, [2, 1, 0]),
    ];

    let first = views[0].address_at(0, 0).unwrap().to_string();
    assert!(first.starts_with("tb1q"));
    for view in &views[1..] {
        assert_eq!(view.address_at(0, 0).unwrap().to_string(), first);
    }

    // The script behind it is a sorted 2-of-3.
    let script = views[0].script_at(0, 0).unwrap();
    assert_eq!((script.m(), script.n()), (2, 3));
    let keys: Vec<_> = script.keys().iter().map(|k| k.to_bytes()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

fn draft_spend(trees: &[KeyTree], account: &MultisigAccount) -> MultisigDraft {
    let deposit = account.address_at(0, 0).unwrap();
    let utxo = UnspentOutput {
        outpoint: OutPoint {
            txid: Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: vec![],
                output: vec![TxOut {
                    value: Amount::from_sat(500_000),
                    script_pubkey: deposit.script_pubkey(),
                }],
            }
            .compute_txid(),
            vout: 0,
        },
        value: Amount::from_sat(500_000),
        script_pubkey: deposit.script_pubkey(),
        confirmed: true,
        derivation_path: Some(
            trees[0]
                .address_path(ScriptKind::P2wshMultisig, 0, 0, 0)
                .unwrap(),
        ),
        kind: Some(ScriptKind::P2wshMultisig),
    };

    let assembler = Assembler::new(Network::Testnet, &trees[0]);
    let recipient = trees[0].address_at(ScriptKind::P2wpkh, 1, 0, 0).unwrap();
    let change = account.address_at(1, 0).unwrap();
    let mut rng = StdRng::seed_from_u64(77);
    assembler
        .build_multisig(
            account,
            vec![utxo],
            &NoLookup,
            &recipient.to_string(),
            120_000,
            5,
            &change.to_string(),
            &mut rng,
        )
        .unwrap()
}

/// Vector: export with one signature, cross-sign a second copy, merge,
/// finalize; the witness must read `[empty, sig_a, sig_b, script]` with
/// the signatures in script-key order.
#[test]
fn full_coordination_lifecycle() {
    let trees = trees();
    let account = account_as_seen_by(&trees, [0, 1, 2]);
    let engine = PsbtEngine::new(Network::Testnet);

    // Initiator drafts and signs its copy via the recorded key origin.
    let draft = draft_spend(&trees, &account);
    let mut ours = draft.psbt.clone();
    engine.sign_with_tree(&mut ours, &trees[0]).unwrap();

    let export = engine.export(&ours);
    assert_eq!(export.sig_counts, vec![1]);
    assert!(!export.finalized);

    // A cosigner imports the base64, validates the quorum shape, signs.
    let imported = engine.import(&export.base64).unwrap();
    assert!(imported.is_valid, "warnings: {:?}", imported.warnings);
    let validation = engine.validate(&imported.psbt, 2, 3);
    assert!(validation.valid, "errors: {:?}", validation.errors);

    let mut theirs = imported.psbt;
    let cosigner_key = {
        let path = trees[1]
            .address_path(ScriptKind::P2wshMultisig, 0, 0, 0)
            .unwrap();
        trees[1].private_key_at(&path).unwrap()
    };
    engine.sign(&mut theirs, &cosigner_key).unwrap();

    // Merge is order-insensitive and reaches the quorum.
    let merged = engine.merge(vec![ours.clone(), theirs.clone()]).unwrap();
    let merged_reverse = engine.merge(vec![theirs, ours]).unwrap();
    assert_eq!(merged.serialize(), merged_reverse.serialize());
    assert!(engine.has_enough_signatures(&merged, 2));

    // Signature bytes in expected script order.
    let witness_script = merged.inputs[0].witness_script.clone().unwrap();
    let multisig = MultisigScript::parse(&witness_script).unwrap();
    let expected: Vec<Vec<u8>> = multisig
        .keys()
        .iter()
        .filter_map(|k| {
            merged.inputs[0]
                .partial_sigs
                .get(&bitcoin::PublicKey::from(*k))
                .map(|sig| sig.to_vec())
        })
        .collect();
    assert_eq!(expected.len(), 2);

    let finalized = engine.finalize(merged, 2).unwrap();
    let witness: Vec<Vec<u8>> = finalized.tx.input[0].witness.to_vec();
    assert_eq!(witness.len(), 4);
    assert!(witness[0].is_empty());
    assert_eq!(witness[1], expected[0]);
    assert_eq!(witness[2], expected[1]);
    assert_eq!(witness[3], witness_script.into_bytes());

    // Broadcast bytes round-trip.
    let parsed: Transaction = bitcoin::consensus::encode::deserialize(&finalized.bytes).unwrap();
    assert_eq!(parsed.compute_txid(), finalized.txid);
}

/// PSBT round-trip property: import(export(p)) preserves the container.
#[test]
fn psbt_roundtrips_through_both_text_encodings() {
    let trees = trees();
    let account = account_as_seen_by(&trees, [0, 1, 2]);
    let engine = PsbtEngine::new(Network::Testnet);

    let mut psbt = draft_spend(&trees, &account).psbt;
    engine.sign_with_tree(&mut psbt, &trees[0]).unwrap();

    let export = engine.export(&psbt);
    assert_eq!(
        engine.import(&export.base64).unwrap().psbt.serialize(),
        psbt.serialize()
    );
    assert_eq!(
        engine.import(&export.hex).unwrap().psbt.serialize(),
        psbt.serialize()
    );
}

/// A finalize attempt below quorum fails closed, matching the
/// has-enough-signatures predicate.
#[test]
fn finalize_iff_enough_signatures() {
    let trees = trees();
    let account = account_as_seen_by(&trees, [0, 1, 2]);
    let engine = PsbtEngine::new(Network::Testnet);

    let mut psbt = draft_spend(&trees, &account).psbt;
    engine.sign_with_tree(&mut psbt, &trees[0]).unwrap();

    assert!(!engine.has_enough_signatures(&psbt, 2));
    assert!(engine.finalize(psbt.clone(), 2).is_err());

    let path = trees[2]
        .address_path(ScriptKind::P2wshMultisig, 0, 0, 0)
        .unwrap();
    let key = trees[2].private_key_at(&path).unwrap();
    engine.sign(&mut psbt, &key).unwrap();

    assert!(engine.has_enough_signatures(&psbt, 2));
    assert!(engine.finalize(psbt, 2).is_ok());
}
