//! Transaction evaluation against supporting outputs.
//!
//! The verifier replays the standard templates the signer produces: P2PKH,
//! P2PK, P2WPKH, bare and P2SH multisig, P2SH-nested witness programs, and
//! native P2WSH multisig. For each input it recomputes the digest the
//! signatures commit to and checks them against the keys the locking script
//! names. `strict` mode additionally demands every input reach its required
//! signature count.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::crypto::{ecdsa_verify, hash160};
use crate::script::{classify_output_script, OutputScriptType, OP_PUSHDATA1};
use crate::transaction::{
    legacy_sighash, serialize_output, Bip143Cache, Outpoint, ParsedTx, SighashTxView, TxError,
    Utxo,
};

pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
pub const SCRIPT_VERIFY_SEGWIT: u32 = 1 << 1;
pub const SCRIPT_VERIFY_P2SH_SHA256: u32 = 1 << 2;
pub const SCRIPT_VERIFY_CSV: u32 = 1 << 3;
pub const SCRIPT_VERIFY_CLTV: u32 = 1 << 4;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("input {0} has no supporting output")]
    MissingUtxo(usize),

    #[error("value balance is negative")]
    NegativeBalance,

    #[error(transparent)]
    Tx(#[from] TxError),
}

/// Per-input evaluation result.
#[derive(Clone, Debug, Default)]
pub struct InputEvalState {
    pub valid: bool,
    pub sig_count: u32,
    pub required_sigs: u32,
}

/// Evaluation result for a whole transaction.
#[derive(Clone, Debug, Default)]
pub struct TxEvalState {
    inputs: BTreeMap<usize, InputEvalState>,
    balance_ok: bool,
}

impl TxEvalState {
    pub fn input(&self, index: usize) -> Option<&InputEvalState> {
        self.inputs.get(&index)
    }

    pub fn is_valid(&self) -> bool {
        self.balance_ok && !self.inputs.is_empty() && self.inputs.values().all(|i| i.valid)
    }
}

/// Split a script into its pushed items; opcodes OP_0..OP_16 become
/// literal items the way the interpreter would stack them.
fn parse_pushes(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    let mut at = 0usize;
    while at < script.len() {
        let op = script[at];
        at += 1;
        match op {
            0x00 => items.push(Vec::new()),
            1..=75 => {
                let end = at + op as usize;
                items.push(script.get(at..end)?.to_vec());
                at = end;
            }
            OP_PUSHDATA1 => {
                let len = *script.get(at)? as usize;
                at += 1;
                let end = at + len;
                items.push(script.get(at..end)?.to_vec());
                at = end;
            }
            _ => return None,
        }
    }
    Some(items)
}

/// Check an accumulated signature set against ordered pubkeys.
/// Signatures must appear in key order, CHECKMULTISIG style.
fn count_multisig_sigs(
    sigs: &[Vec<u8>],
    pubkeys: &[Vec<u8>],
    digest: &[u8; 32],
) -> (u32, bool) {
    let mut valid = 0u32;
    let mut key_cursor = 0usize;
    let mut ordered = true;

    for sig in sigs {
        if sig.is_empty() {
            continue;
        }
        let der = &sig[..sig.len() - 1];
        let mut matched = false;
        for (pos, pubkey) in pubkeys.iter().enumerate() {
            if ecdsa_verify(digest, der, pubkey).is_ok() {
                if pos < key_cursor {
                    ordered = false;
                }
                key_cursor = pos + 1;
                matched = true;
                valid += 1;
                break;
            }
        }
        if !matched {
            ordered = false;
        }
    }

    (valid, ordered)
}

/// Evaluate a raw transaction against its supporting outputs.
///
/// `flags` is the OR of the spenders' script-verify flags; nested witness
/// programs require the P2SH flags to be present. With `strict`, inputs
/// short of their required signature count are invalid.
pub fn verify_transaction(
    raw_tx: &[u8],
    utxos: &HashMap<Outpoint, Utxo>,
    flags: u32,
    strict: bool,
) -> Result<TxEvalState, VerifyError> {
    let tx = ParsedTx::deserialize(raw_tx)?;

    let inputs: Vec<(Outpoint, u32)> = tx
        .inputs
        .iter()
        .map(|i| (i.outpoint.clone(), i.sequence))
        .collect();
    let outputs: Vec<Vec<u8>> = tx
        .outputs
        .iter()
        .map(|o| serialize_output(o.value, &o.script))
        .collect();
    let view = SighashTxView {
        version: tx.version,
        lock_time: tx.lock_time,
        inputs: &inputs,
        serialized_outputs: &outputs,
    };
    let bip143 = Bip143Cache::new(&view);

    let mut eval = TxEvalState::default();

    let mut input_total = 0u64;
    for (index, input) in tx.inputs.iter().enumerate() {
        let utxo = utxos
            .get(&input.outpoint)
            .ok_or(VerifyError::MissingUtxo(index))?;
        input_total = input_total.saturating_add(utxo.value);

        let mut state = InputEvalState {
            required_sigs: 1,
            ..Default::default()
        };

        match classify_output_script(&utxo.script) {
            OutputScriptType::P2pkh { h160 } => {
                if let Some(items) = parse_pushes(&input.script) {
                    if items.len() == 2 && !items[0].is_empty() {
                        let (sig, pubkey) = (&items[0], &items[1]);
                        if hash160(pubkey) == h160 {
                            let digest = legacy_sighash(
                                &view,
                                index,
                                &utxo.script,
                                sig[sig.len() - 1],
                            )?;
                            if ecdsa_verify(&digest, &sig[..sig.len() - 1], pubkey).is_ok() {
                                state.sig_count = 1;
                                state.valid = true;
                            }
                        }
                    }
                }
            }

            OutputScriptType::P2pk { pubkey } => {
                if let Some(items) = parse_pushes(&input.script) {
                    if items.len() == 1 && !items[0].is_empty() {
                        let sig = &items[0];
                        let digest = legacy_sighash(
                            &view,
                            index,
                            &utxo.script,
                            sig[sig.len() - 1],
                        )?;
                        if ecdsa_verify(&digest, &sig[..sig.len() - 1], &pubkey).is_ok() {
                            state.sig_count = 1;
                            state.valid = true;
                        }
                    }
                }
            }

            OutputScriptType::P2wpkh { h160 } => {
                if flags & SCRIPT_VERIFY_SEGWIT != 0 && input.witness.len() == 2 {
                    let (sig, pubkey) = (&input.witness[0], &input.witness[1]);
                    if !sig.is_empty() && hash160(pubkey) == h160 {
                        let code = crate::script::p2pkh_script(&h160);
                        let digest = bip143.sighash(
                            &view,
                            index,
                            &code,
                            utxo.value,
                            sig[sig.len() - 1],
                        )?;
                        if ecdsa_verify(&digest, &sig[..sig.len() - 1], pubkey).is_ok() {
                            state.sig_count = 1;
                            state.valid = true;
                        }
                    }
                }
            }

            OutputScriptType::P2sh { h160 } => {
                if flags & SCRIPT_VERIFY_P2SH != 0 {
                    evaluate_p2sh_input(
                        &view, &bip143, index, input, utxo, &h160, flags, &mut state,
                    )?;
                }
            }

            OutputScriptType::P2wsh { h256 } => {
                if flags & SCRIPT_VERIFY_SEGWIT != 0 {
                    evaluate_p2wsh_witness(
                        &view, &bip143, index, &input.witness, utxo, &h256, &mut state,
                    )?;
                }
            }

            OutputScriptType::Multisig { m, pubkeys } => {
                state.required_sigs = m as u32;
                if let Some(items) = parse_pushes(&input.script) {
                    // leading dummy element, then signatures
                    let sigs = if items.first().map(|i| i.is_empty()).unwrap_or(false) {
                        &items[1..]
                    } else {
                        &items[..]
                    };
                    // any present signature's hash byte drives the digest
                    if let Some(first) = sigs.iter().find(|s| !s.is_empty()) {
                        let digest = legacy_sighash(
                            &view,
                            index,
                            &utxo.script,
                            first[first.len() - 1],
                        )?;
                        let (count, ordered) = count_multisig_sigs(sigs, &pubkeys, &digest);
                        state.sig_count = count;
                        state.valid = ordered && count >= m as u32;
                    }
                }
            }

            _ => {}
        }

        eval.inputs.insert(index, state);
    }

    let output_total: u64 = tx.outputs.iter().map(|o| o.value).sum();
    eval.balance_ok = output_total <= input_total;
    if strict && !eval.balance_ok {
        return Err(VerifyError::NegativeBalance);
    }

    Ok(eval)
}

#[allow(clippy::too_many_arguments)]
fn evaluate_p2sh_input(
    view: &SighashTxView<'_>,
    bip143: &Bip143Cache,
    index: usize,
    input: &crate::transaction::ParsedTxIn,
    utxo: &Utxo,
    h160: &[u8; 20],
    flags: u32,
    state: &mut InputEvalState,
) -> Result<(), VerifyError> {
    let Some(items) = parse_pushes(&input.script) else {
        return Ok(());
    };
    let Some(redeem) = items.last() else {
        return Ok(());
    };
    if hash160(redeem) != *h160 {
        return Ok(());
    }

    match classify_output_script(redeem) {
        // nested P2WPKH: witness carries sig + pubkey
        OutputScriptType::P2wpkh { h160: wh } => {
            if flags & SCRIPT_VERIFY_SEGWIT != 0 && input.witness.len() == 2 {
                let (sig, pubkey) = (&input.witness[0], &input.witness[1]);
                if !sig.is_empty() && hash160(pubkey) == wh {
                    let code = crate::script::p2pkh_script(&wh);
                    let digest =
                        bip143.sighash(view, index, &code, utxo.value, sig[sig.len() - 1])?;
                    if ecdsa_verify(&digest, &sig[..sig.len() - 1], pubkey).is_ok() {
                        state.sig_count = 1;
                        state.valid = true;
                    }
                }
            }
        }

        // nested P2WSH: defer to the witness-script evaluation
        OutputScriptType::P2wsh { h256 } => {
            if flags & SCRIPT_VERIFY_SEGWIT != 0 {
                evaluate_p2wsh_witness(view, bip143, index, &input.witness, utxo, &h256, state)?;
            }
        }

        // legacy P2SH multisig: dummy, sigs, redeem
        OutputScriptType::Multisig { m, pubkeys } => {
            state.required_sigs = m as u32;
            let body = &items[..items.len() - 1];
            let sigs = if body.first().map(|i| i.is_empty()).unwrap_or(false) {
                &body[1..]
            } else {
                body
            };
            if let Some(first) = sigs.iter().find(|s| !s.is_empty()) {
                let digest = legacy_sighash(view, index, redeem, first[first.len() - 1])?;
                let (count, ordered) = count_multisig_sigs(sigs, &pubkeys, &digest);
                state.sig_count = count;
                state.valid = ordered && count >= m as u32;
            }
        }

        _ => {}
    }
    Ok(())
}

fn evaluate_p2wsh_witness(
    view: &SighashTxView<'_>,
    bip143: &Bip143Cache,
    index: usize,
    witness: &[Vec<u8>],
    utxo: &Utxo,
    h256: &[u8; 32],
    state: &mut InputEvalState,
) -> Result<(), VerifyError> {
    let Some(witness_script) = witness.last() else {
        return Ok(());
    };
    if crate::script::script_sha256(witness_script) != *h256 {
        return Ok(());
    }

    let OutputScriptType::Multisig { m, pubkeys } = classify_output_script(witness_script)
    else {
        return Ok(());
    };
    state.required_sigs = m as u32;

    let body = &witness[..witness.len() - 1];
    let sigs = if body.first().map(|i| i.is_empty()).unwrap_or(false) {
        &body[1..]
    } else {
        body
    };

    let Some(first) = sigs.iter().find(|s| !s.is_empty()) else {
        return Ok(());
    };
    let digest = bip143.sighash(
        view,
        index,
        witness_script,
        utxo.value,
        first[first.len() - 1],
    )?;
    let (count, ordered) = count_multisig_sigs(sigs, &pubkeys, &digest);
    state.sig_count = count;
    state.valid = ordered && count >= m as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{compute_pubkey, ecdsa_sign};
    use crate::script::{multisig_script, p2wsh_script};
    use crate::transaction::SIGHASH_ALL;
    use crate::util::BinaryWriter;

    /// Hand-assemble a 1-in-1-out segwit tx spending a P2WSH 2-of-3.
    #[test]
    fn p2wsh_multisig_manual_assembly_verifies() {
        let keys = [[0x41u8; 32], [0x42; 32], [0x43; 32]];
        let pubkeys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| compute_pubkey(k).unwrap().to_vec())
            .collect();
        let ws = multisig_script(2, &pubkeys).unwrap();
        let h = crate::script::script_sha256(&ws);
        let utxo = Utxo::new([0x77; 32], 0, 1_000_000, p2wsh_script(&h));

        let inputs = vec![(utxo.outpoint(), 0xFFFF_FFFFu32)];
        let out_script = crate::script::p2wpkh_script(&[0x10; 20]);
        let outputs = vec![serialize_output(999_000, &out_script)];
        let view = SighashTxView {
            version: 1,
            lock_time: 0,
            inputs: &inputs,
            serialized_outputs: &outputs,
        };
        let cache = Bip143Cache::new(&view);
        let digest = cache
            .sighash(&view, 0, &ws, utxo.value, SIGHASH_ALL)
            .unwrap();

        let mut sig0 = ecdsa_sign(&digest, &keys[0]).unwrap();
        sig0.push(SIGHASH_ALL);
        let mut sig1 = ecdsa_sign(&digest, &keys[1]).unwrap();
        sig1.push(SIGHASH_ALL);

        // raw segwit tx
        let mut bw = BinaryWriter::new();
        bw.put_u32_le(1);
        bw.put_u8(0x00);
        bw.put_u8(0x01);
        bw.put_var_int(1);
        bw.put_bytes(&utxo.outpoint().serialize());
        bw.put_var_int(0);
        bw.put_u32_le(0xFFFF_FFFF);
        bw.put_var_int(1);
        bw.put_bytes(&outputs[0]);
        bw.put_var_int(4); // empty + 2 sigs + script
        bw.put_var_bytes(&[]);
        bw.put_var_bytes(&sig0);
        bw.put_var_bytes(&sig1);
        bw.put_var_bytes(&ws);
        bw.put_u32_le(0);

        let mut utxos = HashMap::new();
        utxos.insert(utxo.outpoint(), utxo);

        let eval = verify_transaction(
            bw.as_slice(),
            &utxos,
            SCRIPT_VERIFY_SEGWIT | SCRIPT_VERIFY_P2SH,
            true,
        )
        .unwrap();
        assert!(eval.is_valid());
        assert_eq!(eval.input(0).unwrap().sig_count, 2);
    }

    #[test]
    fn out_of_order_multisig_sigs_are_rejected() {
        let keys = [[0x41u8; 32], [0x42; 32], [0x43; 32]];
        let pubkeys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| compute_pubkey(k).unwrap().to_vec())
            .collect();
        let ws = multisig_script(2, &pubkeys).unwrap();
        let h = crate::script::script_sha256(&ws);
        let utxo = Utxo::new([0x78; 32], 0, 1_000_000, p2wsh_script(&h));

        let inputs = vec![(utxo.outpoint(), 0xFFFF_FFFFu32)];
        let out_script = crate::script::p2wpkh_script(&[0x10; 20]);
        let outputs = vec![serialize_output(999_000, &out_script)];
        let view = SighashTxView {
            version: 1,
            lock_time: 0,
            inputs: &inputs,
            serialized_outputs: &outputs,
        };
        let cache = Bip143Cache::new(&view);
        let digest = cache
            .sighash(&view, 0, &ws, utxo.value, SIGHASH_ALL)
            .unwrap();

        let mut sig0 = ecdsa_sign(&digest, &keys[0]).unwrap();
        sig0.push(SIGHASH_ALL);
        let mut sig1 = ecdsa_sign(&digest, &keys[1]).unwrap();
        sig1.push(SIGHASH_ALL);

        let mut bw = BinaryWriter::new();
        bw.put_u32_le(1);
        bw.put_u8(0x00);
        bw.put_u8(0x01);
        bw.put_var_int(1);
        bw.put_bytes(&utxo.outpoint().serialize());
        bw.put_var_int(0);
        bw.put_u32_le(0xFFFF_FFFF);
        bw.put_var_int(1);
        bw.put_bytes(&outputs[0]);
        bw.put_var_int(4);
        bw.put_var_bytes(&[]);
        bw.put_var_bytes(&sig1); // swapped
        bw.put_var_bytes(&sig0);
        bw.put_var_bytes(&ws);
        bw.put_u32_le(0);

        let mut utxos = HashMap::new();
        utxos.insert(utxo.outpoint(), utxo);

        let eval =
            verify_transaction(bw.as_slice(), &utxos, SCRIPT_VERIFY_SEGWIT, false).unwrap();
        assert!(!eval.is_valid());
    }

    #[test]
    fn overspending_fails_strict_verification() {
        let key = [0x44u8; 32];
        let pubkey = compute_pubkey(&key).unwrap();
        let h = hash160(&pubkey);
        let utxo = Utxo::new([0x79; 32], 0, 1_000, crate::script::p2pkh_script(&h));

        let inputs = vec![(utxo.outpoint(), 0xFFFF_FFFFu32)];
        let out_script = crate::script::p2pkh_script(&[0x20; 20]);
        let outputs = vec![serialize_output(2_000, &out_script)];
        let view = SighashTxView {
            version: 1,
            lock_time: 0,
            inputs: &inputs,
            serialized_outputs: &outputs,
        };
        let digest = legacy_sighash(&view, 0, &utxo.script, SIGHASH_ALL).unwrap();
        let mut sig = ecdsa_sign(&digest, &key).unwrap();
        sig.push(SIGHASH_ALL);

        let mut input_script = Vec::new();
        crate::script::push_data(&mut input_script, &sig).unwrap();
        crate::script::push_data(&mut input_script, &pubkey).unwrap();

        let mut bw = BinaryWriter::new();
        bw.put_u32_le(1);
        bw.put_var_int(1);
        bw.put_bytes(&utxo.outpoint().serialize());
        bw.put_var_bytes(&input_script);
        bw.put_u32_le(0xFFFF_FFFF);
        bw.put_var_int(1);
        bw.put_bytes(&outputs[0]);
        bw.put_u32_le(0);

        let mut utxos = HashMap::new();
        utxos.insert(utxo.outpoint(), utxo);

        assert!(matches!(
            verify_transaction(bw.as_slice(), &utxos, 0, true),
            Err(VerifyError::NegativeBalance)
        ));
    }
}
