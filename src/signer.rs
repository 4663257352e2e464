//! Transaction signer.
//!
//! A signer assembles spenders (inputs) and recipients (outputs), resolves
//! each spender's script through a [`ResolverFeed`], computes sighashes,
//! collects signatures, and serializes either a final transaction or an
//! intermediate signing state other parties can merge into their own
//! signer. Multisig inputs accumulate signatures across parties until M of
//! N are present.
//!
//! Spenders walk a one-way ladder:
//!
//! ```text
//! Unknown → Empty → Resolved → (PartiallySigned →) Signed
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::script::{
    self, classify_output_script, p2pkh_script, push_data, OutputScriptType, ScriptError, OP_0,
};
use crate::transaction::{
    legacy_sighash, serialize_output, Bip143Cache, Outpoint, SighashTxView, TxError, Utxo,
    SIGHASH_ALL,
};
use crate::util::BinaryWriter;
use crate::verify::{
    self, TxEvalState, SCRIPT_VERIFY_CLTV, SCRIPT_VERIFY_CSV, SCRIPT_VERIFY_P2SH,
    SCRIPT_VERIFY_P2SH_SHA256, SCRIPT_VERIFY_SEGWIT,
};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("spender {0} has no utxo")]
    MissingUtxo(usize),

    #[error("spender {0} is not resolved")]
    NotResolved(usize),

    #[error("spender {0} is not signed")]
    NotSigned(usize),

    #[error("unsupported output script for spender {0}")]
    UnsupportedScript(usize),

    #[error("resolver feed has no key for this input")]
    MissingKey,

    #[error("txid requires signatures on legacy inputs")]
    UnsignedLegacyInput,

    #[error("state merge conflict: {0}")]
    MergeConflict(&'static str),

    #[error("malformed signer state: {0}")]
    InvalidState(String),

    #[error("signature slot {0} not available")]
    BadSignatureSlot(u16),

    #[error("transaction verification failed")]
    VerifyFailed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

// ----------------------------- Resolver feed -----------------------------

/// Oracle the signer resolves scripts and signatures through.
pub trait ResolverFeed {
    /// Public key whose hash160 matches.
    fn pubkey_for_hash160(&self, h160: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// Preimage script for a P2SH hash160 or P2WSH sha256.
    fn script_for_hash(&self, hash: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// Soft derivation path for a pubkey, when known (watch-only exchange).
    fn bip32_path_for_pubkey(&self, _pubkey: &[u8]) -> Option<Vec<u32>> {
        None
    }

    /// DER signature over a sighash digest with the key behind `pubkey`.
    /// `script` is the script code the digest committed to.
    fn sign(&self, script: &[u8], pubkey: &[u8], digest: &[u8; 32])
        -> Result<Vec<u8>, SignerError>;
}

// ----------------------------- Stack items -----------------------------

/// One resolved slot of an input script or witness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackItem {
    /// Literal data push.
    PushData(Vec<u8>),
    /// Raw opcode byte.
    OpCode(u8),
    /// Signature slot bound to a public key; empty until signed.
    Sig { pubkey: Vec<u8>, sig: Vec<u8> },
    /// M-of-N signature collector; key is the cosigner position.
    MultiSig {
        m: u8,
        sigs: BTreeMap<u16, Vec<u8>>,
    },
    /// Nested script (redeem or witness script).
    Script(Vec<u8>),
}

impl StackItem {
    /// Slot-wise merge: identical data is a no-op, empty slots take the
    /// incoming value, disagreements are conflicts.
    fn merge(&mut self, other: &StackItem) -> Result<(), SignerError> {
        match (self, other) {
            (StackItem::PushData(a), StackItem::PushData(b)) if a == b => Ok(()),
            (StackItem::OpCode(a), StackItem::OpCode(b)) if a == b => Ok(()),
            (StackItem::Script(a), StackItem::Script(b)) if a == b => Ok(()),

            (
                StackItem::Sig { pubkey: pa, sig: sa },
                StackItem::Sig { pubkey: pb, sig: sb },
            ) => {
                if pa != pb {
                    return Err(SignerError::MergeConflict("sig slot pubkey mismatch"));
                }
                if sa.is_empty() {
                    *sa = sb.clone();
                    Ok(())
                } else if sb.is_empty() || sa == sb {
                    Ok(())
                } else {
                    Err(SignerError::MergeConflict("conflicting signatures"))
                }
            }

            (
                StackItem::MultiSig { m: ma, sigs: sa },
                StackItem::MultiSig { m: mb, sigs: sb },
            ) => {
                if ma != mb {
                    return Err(SignerError::MergeConflict("multisig m mismatch"));
                }
                for (pos, sig) in sb {
                    match sa.get(pos) {
                        Some(existing) if existing != sig => {
                            return Err(SignerError::MergeConflict(
                                "conflicting multisig signature",
                            ))
                        }
                        Some(_) => {}
                        None => {
                            sa.insert(*pos, sig.clone());
                        }
                    }
                }
                Ok(())
            }

            _ => Err(SignerError::MergeConflict("stack item variant mismatch")),
        }
    }

    fn is_filled(&self) -> bool {
        match self {
            StackItem::Sig { sig, .. } => !sig.is_empty(),
            StackItem::MultiSig { m, sigs } => sigs.len() >= *m as usize,
            _ => true,
        }
    }

    fn sig_count(&self) -> usize {
        match self {
            StackItem::Sig { sig, .. } => usize::from(!sig.is_empty()),
            StackItem::MultiSig { sigs, .. } => sigs.len(),
            _ => 0,
        }
    }
}

// ----------------------------- Spender -----------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpenderStatus {
    Unknown,
    Empty,
    Resolved,
    PartiallySigned,
    Signed,
}

/// One input under construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpender {
    outpoint: Outpoint,
    value: u64,
    sequence: u32,
    sighash_type: u8,
    utxo: Option<Utxo>,

    status: SpenderStatus,
    is_p2sh: bool,
    is_csv: bool,
    is_cltv: bool,
    uses_witness: bool,

    legacy_stack: BTreeMap<u16, StackItem>,
    witness_stack: BTreeMap<u16, StackItem>,
}

impl ScriptSpender {
    pub fn from_utxo(utxo: Utxo, sequence: u32) -> Self {
        Self {
            outpoint: utxo.outpoint(),
            value: utxo.value,
            sequence,
            sighash_type: SIGHASH_ALL,
            utxo: Some(utxo),
            status: SpenderStatus::Unknown,
            is_p2sh: false,
            is_csv: false,
            is_cltv: false,
            uses_witness: false,
            legacy_stack: BTreeMap::new(),
            witness_stack: BTreeMap::new(),
        }
    }

    pub fn from_outpoint(txid: [u8; 32], index: u32, sequence: u32, value: u64) -> Self {
        Self {
            outpoint: Outpoint::new(txid, index),
            value,
            sequence,
            sighash_type: SIGHASH_ALL,
            utxo: None,
            status: SpenderStatus::Unknown,
            is_p2sh: false,
            is_csv: false,
            is_cltv: false,
            uses_witness: false,
            legacy_stack: BTreeMap::new(),
            witness_stack: BTreeMap::new(),
        }
    }

    pub fn outpoint(&self) -> &Outpoint {
        &self.outpoint
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn status(&self) -> SpenderStatus {
        self.status
    }

    pub fn utxo(&self) -> Option<&Utxo> {
        self.utxo.as_ref()
    }

    pub fn set_utxo(&mut self, utxo: Utxo) {
        self.value = utxo.value;
        self.utxo = Some(utxo);
    }

    pub fn has_utxo(&self) -> bool {
        self.utxo.is_some()
    }

    pub fn is_segwit(&self) -> bool {
        self.uses_witness
    }

    pub fn is_p2sh(&self) -> bool {
        self.is_p2sh
    }

    /// Script-verifier flags this input requires.
    pub fn flags(&self) -> u32 {
        let mut flags = SCRIPT_VERIFY_SEGWIT;
        if self.is_p2sh {
            flags |= SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_P2SH_SHA256;
        }
        if self.is_csv {
            flags |= SCRIPT_VERIFY_CSV;
        }
        if self.is_cltv {
            flags |= SCRIPT_VERIFY_CLTV;
        }
        flags
    }

    fn recompute_status(&mut self) {
        if self.legacy_stack.is_empty() && self.witness_stack.is_empty() {
            if self.status != SpenderStatus::Unknown {
                self.status = SpenderStatus::Empty;
            }
            return;
        }

        let all = self
            .legacy_stack
            .values()
            .chain(self.witness_stack.values());
        let mut filled = true;
        let mut any_sig = false;
        for item in all {
            if !item.is_filled() {
                filled = false;
            }
            if item.sig_count() > 0 {
                any_sig = true;
            }
        }

        self.status = if filled {
            SpenderStatus::Signed
        } else if any_sig {
            SpenderStatus::PartiallySigned
        } else {
            SpenderStatus::Resolved
        };
    }

    /// Populate every non-signature slot from the utxo's output script.
    fn resolve(&mut self, feed: &dyn ResolverFeed, index: usize) -> Result<(), SignerError> {
        if self.status >= SpenderStatus::Resolved {
            return Ok(());
        }
        let utxo = self.utxo.as_ref().ok_or(SignerError::MissingUtxo(index))?;
        let script = utxo.script.clone();
        self.status = SpenderStatus::Empty;

        match classify_output_script(&script) {
            OutputScriptType::P2pkh { h160 } => {
                let pubkey = feed.pubkey_for_hash160(&h160)?;
                self.legacy_stack.insert(
                    0,
                    StackItem::Sig {
                        pubkey: pubkey.clone(),
                        sig: Vec::new(),
                    },
                );
                self.legacy_stack.insert(1, StackItem::PushData(pubkey));
            }

            OutputScriptType::P2pk { pubkey } => {
                self.legacy_stack.insert(
                    0,
                    StackItem::Sig {
                        pubkey,
                        sig: Vec::new(),
                    },
                );
            }

            OutputScriptType::P2wpkh { h160 } => {
                let pubkey = feed.pubkey_for_hash160(&h160)?;
                self.uses_witness = true;
                self.witness_stack.insert(
                    0,
                    StackItem::Sig {
                        pubkey: pubkey.clone(),
                        sig: Vec::new(),
                    },
                );
                self.witness_stack.insert(1, StackItem::PushData(pubkey));
            }

            OutputScriptType::P2sh { h160 } => {
                let redeem = feed.script_for_hash(&h160)?;
                self.is_p2sh = true;
                self.legacy_stack
                    .insert(1, StackItem::PushData(redeem.clone()));

                match classify_output_script(&redeem) {
                    OutputScriptType::P2wpkh { h160 } => {
                        let pubkey = feed.pubkey_for_hash160(&h160)?;
                        self.uses_witness = true;
                        self.witness_stack.insert(
                            0,
                            StackItem::Sig {
                                pubkey: pubkey.clone(),
                                sig: Vec::new(),
                            },
                        );
                        self.witness_stack.insert(1, StackItem::PushData(pubkey));
                    }
                    OutputScriptType::P2wsh { h256 } => {
                        let witness_script = feed.script_for_hash(&h256)?;
                        self.resolve_witness_script(&witness_script, index)?;
                    }
                    OutputScriptType::Multisig { m, .. } => {
                        // legacy P2SH multisig: dummy, sigs, redeem script
                        self.legacy_stack.insert(0, StackItem::OpCode(OP_0));
                        self.legacy_stack.remove(&1);
                        self.legacy_stack.insert(
                            1,
                            StackItem::MultiSig {
                                m,
                                sigs: BTreeMap::new(),
                            },
                        );
                        self.legacy_stack.insert(2, StackItem::Script(redeem));
                    }
                    _ => return Err(SignerError::UnsupportedScript(index)),
                }
            }

            OutputScriptType::P2wsh { h256 } => {
                let witness_script = feed.script_for_hash(&h256)?;
                self.resolve_witness_script(&witness_script, index)?;
            }

            OutputScriptType::Multisig { m, .. } => {
                self.legacy_stack.insert(0, StackItem::OpCode(OP_0));
                self.legacy_stack.insert(
                    1,
                    StackItem::MultiSig {
                        m,
                        sigs: BTreeMap::new(),
                    },
                );
            }

            OutputScriptType::OpReturn { .. } | OutputScriptType::NonStandard => {
                return Err(SignerError::UnsupportedScript(index))
            }
        }

        self.recompute_status();
        Ok(())
    }

    fn resolve_witness_script(
        &mut self,
        witness_script: &[u8],
        index: usize,
    ) -> Result<(), SignerError> {
        match classify_output_script(witness_script) {
            OutputScriptType::Multisig { m, .. } => {
                self.uses_witness = true;
                self.witness_stack.insert(
                    0,
                    StackItem::MultiSig {
                        m,
                        sigs: BTreeMap::new(),
                    },
                );
                self.witness_stack
                    .insert(1, StackItem::Script(witness_script.to_vec()));
                Ok(())
            }
            _ => Err(SignerError::UnsupportedScript(index)),
        }
    }

    /// The script the sighash commits to for this input.
    fn script_code(&self) -> Result<Vec<u8>, SignerError> {
        if self.uses_witness {
            // P2WSH commits to the witness script, P2WPKH to its implied
            // P2PKH script
            for item in self.witness_stack.values() {
                if let StackItem::Script(script) = item {
                    return Ok(script.clone());
                }
            }
            for item in self.witness_stack.values() {
                if let StackItem::Sig { pubkey, .. } = item {
                    let h160 = crate::crypto::hash160(pubkey);
                    return Ok(p2pkh_script(&h160));
                }
            }
            Err(SignerError::MissingKey)
        } else {
            // P2SH commits to the redeem script, bare scripts to themselves
            for item in self.legacy_stack.values() {
                if let StackItem::Script(script) = item {
                    return Ok(script.clone());
                }
            }
            self.utxo
                .as_ref()
                .map(|u| u.script.clone())
                .ok_or(SignerError::MissingKey)
        }
    }

    /// Feed signatures into every signable slot this feed has keys for.
    fn sign_with(
        &mut self,
        feed: &dyn ResolverFeed,
        digest: &[u8; 32],
        script_code: &[u8],
        sighash_type: u8,
    ) -> Result<(), SignerError> {
        let multisig_pubkeys = self.multisig_pubkeys();

        let stack = if self.uses_witness {
            &mut self.witness_stack
        } else {
            &mut self.legacy_stack
        };

        for item in stack.values_mut() {
            match item {
                StackItem::Sig { pubkey, sig } if sig.is_empty() => {
                    let mut der = feed.sign(script_code, pubkey, digest)?;
                    der.push(sighash_type);
                    *sig = der;
                }
                StackItem::MultiSig { m, sigs } => {
                    let pubkeys = multisig_pubkeys
                        .as_ref()
                        .ok_or(SignerError::MissingKey)?;
                    for (pos, pubkey) in pubkeys.iter().enumerate() {
                        if sigs.len() >= *m as usize {
                            break;
                        }
                        if sigs.contains_key(&(pos as u16)) {
                            continue;
                        }
                        // feeds only hold some cosigner keys; skip the rest
                        match feed.sign(script_code, pubkey, digest) {
                            Ok(mut der) => {
                                der.push(sighash_type);
                                sigs.insert(pos as u16, der);
                            }
                            Err(SignerError::MissingKey) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                }
                _ => {}
            }
        }

        self.recompute_status();
        Ok(())
    }

    /// Cosigner pubkeys in script order, when this input is multisig.
    fn multisig_pubkeys(&self) -> Option<Vec<Vec<u8>>> {
        let stacks = self
            .legacy_stack
            .values()
            .chain(self.witness_stack.values());
        for item in stacks {
            if let StackItem::Script(script) = item {
                if let OutputScriptType::Multisig { pubkeys, .. } =
                    classify_output_script(script)
                {
                    return Some(pubkeys);
                }
            }
        }
        // bare multisig: the utxo script itself
        if let Some(utxo) = &self.utxo {
            if let OutputScriptType::Multisig { pubkeys, .. } =
                classify_output_script(&utxo.script)
            {
                return Some(pubkeys);
            }
        }
        None
    }

    /// Admit an externally produced signature (hardware signers).
    pub fn inject_signature(
        &mut self,
        sig: Vec<u8>,
        sig_id: Option<u16>,
    ) -> Result<(), SignerError> {
        if self.status < SpenderStatus::Resolved {
            return Err(SignerError::BadSignatureSlot(sig_id.unwrap_or(0)));
        }

        let mut placed = false;
        let stack = if self.uses_witness {
            &mut self.witness_stack
        } else {
            &mut self.legacy_stack
        };
        for item in stack.values_mut() {
            match item {
                StackItem::Sig { sig: slot, .. } if sig_id.is_none() => {
                    *slot = sig;
                    placed = true;
                    break;
                }
                StackItem::MultiSig { sigs, .. } => {
                    let pos = sig_id.ok_or(SignerError::BadSignatureSlot(0))?;
                    sigs.insert(pos, sig);
                    placed = true;
                    break;
                }
                _ => {}
            }
        }

        if !placed {
            return Err(SignerError::BadSignatureSlot(sig_id.unwrap_or(0)));
        }
        self.recompute_status();
        Ok(())
    }

    /// Serialize the legacy input script from the resolved stack. With
    /// `loose`, unfilled signature slots are skipped instead of failing.
    fn input_script(&self, loose: bool) -> Result<Vec<u8>, SignerError> {
        let mut out = Vec::new();
        for item in self.legacy_stack.values() {
            match item {
                StackItem::PushData(data) | StackItem::Script(data) => {
                    push_data(&mut out, data)?
                }
                StackItem::OpCode(op) => out.push(*op),
                StackItem::Sig { sig, .. } => {
                    if sig.is_empty() {
                        if loose {
                            continue;
                        }
                        return Err(SignerError::NotSigned(0));
                    }
                    push_data(&mut out, sig)?;
                }
                StackItem::MultiSig { m, sigs } => {
                    if !loose && sigs.len() < *m as usize {
                        return Err(SignerError::NotSigned(0));
                    }
                    for sig in sigs.values().take(*m as usize) {
                        push_data(&mut out, sig)?;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Serialize the witness: item count then var-length items. With
    /// `loose`, whatever signatures are present go out.
    fn witness_data(&self, loose: bool) -> Result<Vec<u8>, SignerError> {
        let mut items: Vec<Vec<u8>> = Vec::new();
        for item in self.witness_stack.values() {
            match item {
                StackItem::PushData(data) | StackItem::Script(data) => {
                    items.push(data.clone())
                }
                StackItem::OpCode(op) => items.push(vec![*op]),
                StackItem::Sig { sig, .. } => {
                    if sig.is_empty() {
                        if loose {
                            continue;
                        }
                        return Err(SignerError::NotSigned(0));
                    }
                    items.push(sig.clone());
                }
                StackItem::MultiSig { m, sigs } => {
                    if !loose && sigs.len() < *m as usize {
                        return Err(SignerError::NotSigned(0));
                    }
                    // CHECKMULTISIG consumes one extra (empty) element
                    items.push(Vec::new());
                    for sig in sigs.values().take(*m as usize) {
                        items.push(sig.clone());
                    }
                }
            }
        }

        let mut bw = BinaryWriter::new();
        bw.put_var_int(items.len() as u64);
        for item in items {
            bw.put_var_bytes(&item);
        }
        Ok(bw.into_bytes())
    }

    /// Merge another view of the same outpoint into this spender.
    fn merge(&mut self, other: &ScriptSpender) -> Result<(), SignerError> {
        if self.outpoint != other.outpoint {
            return Err(SignerError::MergeConflict("outpoint mismatch"));
        }
        if self.sequence != other.sequence {
            return Err(SignerError::MergeConflict("sequence mismatch"));
        }
        if self.sighash_type != other.sighash_type {
            return Err(SignerError::MergeConflict("sighash mismatch"));
        }
        if let Some(theirs) = &other.utxo {
            if let Some(ours) = &self.utxo {
                if ours != theirs {
                    return Err(SignerError::MergeConflict("utxo mismatch"));
                }
            } else {
                self.utxo = Some(theirs.clone());
                self.value = theirs.value;
            }
        }

        for (slot, item) in &other.legacy_stack {
            match self.legacy_stack.get_mut(slot) {
                Some(existing) => existing.merge(item)?,
                None => {
                    self.legacy_stack.insert(*slot, item.clone());
                }
            }
        }
        for (slot, item) in &other.witness_stack {
            match self.witness_stack.get_mut(slot) {
                Some(existing) => existing.merge(item)?,
                None => {
                    self.witness_stack.insert(*slot, item.clone());
                }
            }
        }

        self.is_p2sh |= other.is_p2sh;
        self.is_csv |= other.is_csv;
        self.is_cltv |= other.is_cltv;
        self.uses_witness |= other.uses_witness;
        self.recompute_status();
        Ok(())
    }

    fn signature_count(&self) -> usize {
        self.legacy_stack
            .values()
            .chain(self.witness_stack.values())
            .map(|i| i.sig_count())
            .sum()
    }

    /// Serialized size contribution of this input once signed, witness
    /// bytes included.
    fn estimated_size(&self) -> usize {
        // outpoint + sequence
        let fixed = 36 + 4;
        let Some(utxo) = &self.utxo else {
            return fixed + 1 + 107;
        };

        match classify_output_script(&utxo.script) {
            OutputScriptType::P2pkh { .. } => fixed + 1 + 107,
            OutputScriptType::P2pk { .. } => fixed + 1 + 73,
            OutputScriptType::P2wpkh { .. } => fixed + 1 + 108,
            OutputScriptType::P2sh { .. } => {
                if self.uses_witness {
                    match self.multisig_pubkeys() {
                        // nested P2WSH multisig
                        Some(_) => fixed + 1 + 36 + self.witness_estimate(),
                        // nested P2WPKH
                        None => fixed + 1 + 23 + 108,
                    }
                } else {
                    // legacy P2SH multisig
                    let redeem_len = self
                        .legacy_stack
                        .values()
                        .find_map(|i| match i {
                            StackItem::Script(s) => Some(s.len()),
                            _ => None,
                        })
                        .unwrap_or(71);
                    let m = self.required_sig_count();
                    fixed + 3 + m * 73 + 2 + redeem_len
                }
            }
            OutputScriptType::P2wsh { .. } => fixed + 1 + self.witness_estimate(),
            OutputScriptType::Multisig { m, .. } => fixed + 2 + m as usize * 73,
            _ => fixed + 1 + 107,
        }
    }

    fn witness_estimate(&self) -> usize {
        let script_len = self
            .witness_stack
            .values()
            .find_map(|i| match i {
                StackItem::Script(s) => Some(s.len()),
                _ => None,
            })
            .unwrap_or(71);
        let m = self.required_sig_count();
        // count byte + empty item + m sigs + script item
        1 + 1 + m * 74 + 2 + script_len
    }

    fn required_sig_count(&self) -> usize {
        self.legacy_stack
            .values()
            .chain(self.witness_stack.values())
            .map(|i| match i {
                StackItem::Sig { .. } => 1,
                StackItem::MultiSig { m, .. } => *m as usize,
                _ => 0,
            })
            .sum::<usize>()
            .max(1)
    }
}

// ----------------------------- Recipients -----------------------------

/// Output template plus value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientKind {
    P2pkh { h160: [u8; 20], value: u64 },
    P2pk { pubkey: Vec<u8>, value: u64 },
    P2wpkh { h160: [u8; 20], value: u64 },
    P2sh { h160: [u8; 20], value: u64 },
    P2wsh { h256: [u8; 32], value: u64 },
    OpReturn { payload: Vec<u8> },
    Universal { script: Vec<u8>, value: u64 },
}

/// One output of the transaction under construction, with optional BIP32
/// hints for watch-only counterparties.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub kind: RecipientKind,
    /// pubkey → soft derivation path
    pub bip32_paths: BTreeMap<Vec<u8>, Vec<u32>>,
}

impl Recipient {
    pub fn new(kind: RecipientKind) -> Self {
        Self {
            kind,
            bip32_paths: BTreeMap::new(),
        }
    }

    /// Parse a recipient from a serialized `value ‖ script` pair.
    pub fn from_script(script: &[u8], value: u64) -> Result<Self, SignerError> {
        let kind = match classify_output_script(script) {
            OutputScriptType::P2pkh { h160 } => RecipientKind::P2pkh { h160, value },
            OutputScriptType::P2pk { pubkey } => RecipientKind::P2pk { pubkey, value },
            OutputScriptType::P2wpkh { h160 } => RecipientKind::P2wpkh { h160, value },
            OutputScriptType::P2sh { h160 } => RecipientKind::P2sh { h160, value },
            OutputScriptType::P2wsh { h256 } => RecipientKind::P2wsh { h256, value },
            OutputScriptType::OpReturn { payload } => RecipientKind::OpReturn { payload },
            _ => RecipientKind::Universal {
                script: script.to_vec(),
                value,
            },
        };
        Ok(Self::new(kind))
    }

    pub fn add_bip32_path(
        &mut self,
        pubkey: Vec<u8>,
        path: Vec<u32>,
    ) -> Result<(), SignerError> {
        match self.bip32_paths.get(&pubkey) {
            Some(existing) if *existing != path => {
                Err(SignerError::MergeConflict("bip32 path conflict"))
            }
            Some(_) => Ok(()),
            None => {
                self.bip32_paths.insert(pubkey, path);
                Ok(())
            }
        }
    }

    pub fn value(&self) -> u64 {
        match &self.kind {
            RecipientKind::P2pkh { value, .. }
            | RecipientKind::P2pk { value, .. }
            | RecipientKind::P2wpkh { value, .. }
            | RecipientKind::P2sh { value, .. }
            | RecipientKind::P2wsh { value, .. }
            | RecipientKind::Universal { value, .. } => *value,
            RecipientKind::OpReturn { .. } => 0,
        }
    }

    pub fn output_script(&self) -> Vec<u8> {
        match &self.kind {
            RecipientKind::P2pkh { h160, .. } => script::p2pkh_script(h160),
            RecipientKind::P2pk { pubkey, .. } => script::p2pk_script(pubkey),
            RecipientKind::P2wpkh { h160, .. } => script::p2wpkh_script(h160),
            RecipientKind::P2sh { h160, .. } => script::p2sh_script(h160),
            RecipientKind::P2wsh { h256, .. } => script::p2wsh_script(h256),
            RecipientKind::OpReturn { payload } => {
                let mut s = vec![script::OP_RETURN];
                push_data(&mut s, payload).expect("op_return payload bounded");
                s
            }
            RecipientKind::Universal { script, .. } => script.clone(),
        }
    }

    /// `valueLE ‖ varint(len) ‖ script`, the tx-output wire form.
    pub fn serialized_output(&self) -> Vec<u8> {
        serialize_output(self.value(), &self.output_script())
    }

    /// Serialized size of this output.
    pub fn size(&self) -> usize {
        self.serialized_output().len()
    }
}

// ----------------------------- Signer -----------------------------

/// Serializable signer state, the multi-party interchange envelope.
#[derive(Serialize, Deserialize)]
struct SignerState {
    version: u32,
    lock_time: u32,
    spenders: Vec<ScriptSpender>,
    recipients: Vec<Recipient>,
}

/// Builds, signs, merges, and verifies one transaction.
pub struct Signer {
    version: u32,
    lock_time: u32,
    spenders: Vec<ScriptSpender>,
    recipients: Vec<Recipient>,
}

impl Signer {
    pub fn new() -> Self {
        Self {
            version: 1,
            lock_time: 0,
            spenders: Vec::new(),
            recipients: Vec::new(),
        }
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn set_lock_time(&mut self, lock_time: u32) {
        self.lock_time = lock_time;
    }

    pub fn add_spender(&mut self, spender: ScriptSpender) {
        self.spenders.push(spender);
    }

    pub fn add_spender_by_outpoint(
        &mut self,
        txid: [u8; 32],
        index: u32,
        sequence: u32,
        value: u64,
    ) {
        self.spenders
            .push(ScriptSpender::from_outpoint(txid, index, sequence, value));
    }

    pub fn add_recipient(&mut self, recipient: Recipient) {
        self.recipients.push(recipient);
    }

    pub fn spenders(&self) -> &[ScriptSpender] {
        &self.spenders
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    pub fn spender_mut(&mut self, index: usize) -> Option<&mut ScriptSpender> {
        self.spenders.get_mut(index)
    }

    /// Attach a utxo to the spender with the matching outpoint.
    pub fn populate_utxo(&mut self, utxo: Utxo) -> Result<(), SignerError> {
        let outpoint = utxo.outpoint();
        for spender in &mut self.spenders {
            if spender.outpoint == outpoint {
                spender.set_utxo(utxo);
                return Ok(());
            }
        }
        Err(SignerError::MergeConflict("no spender for utxo"))
    }

    pub fn total_spend(&self) -> u64 {
        self.spenders.iter().map(|s| s.value).sum()
    }

    pub fn is_resolved(&self) -> bool {
        self.spenders
            .iter()
            .all(|s| s.status >= SpenderStatus::Resolved)
    }

    pub fn is_signed(&self) -> bool {
        !self.spenders.is_empty()
            && self.spenders.iter().all(|s| s.status == SpenderStatus::Signed)
    }

    pub fn is_segwit(&self) -> bool {
        self.spenders.iter().any(|s| s.uses_witness)
    }

    pub fn has_legacy_inputs(&self) -> bool {
        self.spenders.iter().any(|s| !s.uses_witness)
    }

    /// Resolve every spender's public data. Resolution of all inputs
    /// completes before any sighash is computed.
    pub fn resolve_spenders(&mut self, feed: &dyn ResolverFeed) -> Result<(), SignerError> {
        for (index, spender) in self.spenders.iter_mut().enumerate() {
            spender.resolve(feed, index)?;
        }
        Ok(())
    }

    fn sighash_inputs(&self) -> Vec<(Outpoint, u32)> {
        self.spenders
            .iter()
            .map(|s| (s.outpoint.clone(), s.sequence))
            .collect()
    }

    fn serialized_outputs(&self) -> Vec<Vec<u8>> {
        self.recipients.iter().map(|r| r.serialized_output()).collect()
    }

    /// Resolve and sign every input this feed holds keys for.
    pub fn sign(&mut self, feed: &dyn ResolverFeed) -> Result<(), SignerError> {
        self.resolve_spenders(feed)?;

        let inputs = self.sighash_inputs();
        let outputs = self.serialized_outputs();
        let view = SighashTxView {
            version: self.version,
            lock_time: self.lock_time,
            inputs: &inputs,
            serialized_outputs: &outputs,
        };
        let bip143 = Bip143Cache::new(&view);

        for (index, spender) in self.spenders.iter_mut().enumerate() {
            if spender.status == SpenderStatus::Signed {
                continue;
            }
            let script_code = spender.script_code()?;
            let digest = if spender.uses_witness {
                bip143.sighash(
                    &view,
                    index,
                    &script_code,
                    spender.value,
                    spender.sighash_type,
                )?
            } else {
                legacy_sighash(&view, index, &script_code, spender.sighash_type)?
            };
            spender.sign_with(feed, &digest, &script_code, spender.sighash_type)?;
        }
        Ok(())
    }

    // ----------------------------- Serialization -----------------------------

    /// Final transaction bytes; all inputs must be signed.
    pub fn serialize_signed_tx(&self) -> Result<Vec<u8>, SignerError> {
        for (index, spender) in self.spenders.iter().enumerate() {
            if spender.status != SpenderStatus::Signed {
                return Err(SignerError::NotSigned(index));
            }
        }
        self.serialize_tx(true)
    }

    /// Transaction bytes with whatever data is available; unfilled
    /// signature slots serialize as empty scripts.
    pub fn serialize_available_tx(&self) -> Result<Vec<u8>, SignerError> {
        self.serialize_tx(false)
    }

    fn serialize_tx(&self, strict: bool) -> Result<Vec<u8>, SignerError> {
        let segwit = self.is_segwit();
        let mut bw = BinaryWriter::new();
        bw.put_u32_le(self.version);
        if segwit {
            bw.put_u8(0x00);
            bw.put_u8(0x01);
        }

        bw.put_var_int(self.spenders.len() as u64);
        for spender in &self.spenders {
            bw.put_bytes(&spender.outpoint.serialize());
            bw.put_var_bytes(&spender.input_script(!strict)?);
            bw.put_u32_le(spender.sequence);
        }

        bw.put_var_int(self.recipients.len() as u64);
        for recipient in &self.recipients {
            bw.put_bytes(&recipient.serialized_output());
        }

        if segwit {
            for spender in &self.spenders {
                if spender.uses_witness {
                    bw.put_bytes(&spender.witness_data(!strict)?);
                } else {
                    bw.put_var_int(0);
                }
            }
        }

        bw.put_u32_le(self.lock_time);
        Ok(bw.into_bytes())
    }

    /// Transaction id. Fully-segwit signers can answer before signing;
    /// legacy inputs must be signed first since their scripts are hashed.
    pub fn tx_id(&self) -> Result<[u8; 32], SignerError> {
        for (index, spender) in self.spenders.iter().enumerate() {
            if !spender.uses_witness && spender.status != SpenderStatus::Signed {
                // an unresolved spender might still turn out segwit
                if spender.status < SpenderStatus::Resolved {
                    return Err(SignerError::NotResolved(index));
                }
                return Err(SignerError::UnsignedLegacyInput);
            }
        }

        let mut bw = BinaryWriter::new();
        bw.put_u32_le(self.version);
        bw.put_var_int(self.spenders.len() as u64);
        for spender in &self.spenders {
            bw.put_bytes(&spender.outpoint.serialize());
            bw.put_var_bytes(&spender.input_script(spender.uses_witness)?);
            bw.put_u32_le(spender.sequence);
        }
        bw.put_var_int(self.recipients.len() as u64);
        for recipient in &self.recipients {
            bw.put_bytes(&recipient.serialized_output());
        }
        bw.put_u32_le(self.lock_time);
        Ok(crate::crypto::sha256d(bw.as_slice()))
    }

    /// Estimated size of the final signed transaction, for fee planning.
    pub fn estimate_size(&self) -> usize {
        let mut size = 4 + 4; // version + locktime
        if self.is_segwit() {
            size += 2;
        }
        size += var_int_len(self.spenders.len() as u64);
        for spender in &self.spenders {
            size += spender.estimated_size();
            if self.is_segwit() && !spender.uses_witness {
                size += 1; // empty witness slot
            }
        }
        size += var_int_len(self.recipients.len() as u64);
        for recipient in &self.recipients {
            size += recipient.size();
        }
        size
    }

    // ----------------------------- Multi-party state -----------------------------

    /// Self-describing state envelope for cooperating signers.
    pub fn serialize_state(&self) -> Result<Vec<u8>, SignerError> {
        let state = SignerState {
            version: self.version,
            lock_time: self.lock_time,
            spenders: self.spenders.clone(),
            recipients: self.recipients.clone(),
        };
        bincode::serialize(&state).map_err(|e| SignerError::InvalidState(e.to_string()))
    }

    /// Fresh signer from a serialized state.
    pub fn from_state(data: &[u8]) -> Result<Self, SignerError> {
        let state: SignerState =
            bincode::deserialize(data).map_err(|e| SignerError::InvalidState(e.to_string()))?;
        Ok(Self {
            version: state.version,
            lock_time: state.lock_time,
            spenders: state.spenders,
            recipients: state.recipients,
        })
    }

    /// Merge a cooperating party's state into this signer.
    ///
    /// Matching outpoints merge stack-by-stack; unknown spenders append in
    /// the incoming input order. A state that reorders inputs or outputs
    /// this signer already holds is rejected.
    pub fn merge_state(&mut self, data: &[u8]) -> Result<(), SignerError> {
        let incoming: SignerState =
            bincode::deserialize(data).map_err(|e| SignerError::InvalidState(e.to_string()))?;

        if !self.spenders.is_empty() {
            if incoming.version != self.version {
                return Err(SignerError::MergeConflict("version mismatch"));
            }
            if incoming.lock_time != self.lock_time {
                return Err(SignerError::MergeConflict("locktime mismatch"));
            }
        } else {
            self.version = incoming.version;
            self.lock_time = incoming.lock_time;
        }

        // known outpoints must arrive in our relative order
        let mut last_position: Option<usize> = None;
        for spender in &incoming.spenders {
            if let Some(pos) = self
                .spenders
                .iter()
                .position(|s| s.outpoint == spender.outpoint)
            {
                if let Some(last) = last_position {
                    if pos < last {
                        return Err(SignerError::MergeConflict("input order mismatch"));
                    }
                }
                last_position = Some(pos);
            }
        }

        for spender in incoming.spenders {
            match self
                .spenders
                .iter_mut()
                .find(|s| s.outpoint == spender.outpoint)
            {
                Some(existing) => existing.merge(&spender)?,
                None => self.spenders.push(spender),
            }
        }

        // recipients match by serialized output
        let mut last_position: Option<usize> = None;
        for recipient in &incoming.recipients {
            let ser = recipient.serialized_output();
            if let Some(pos) = self
                .recipients
                .iter()
                .position(|r| r.serialized_output() == ser)
            {
                if let Some(last) = last_position {
                    if pos < last {
                        return Err(SignerError::MergeConflict("output order mismatch"));
                    }
                }
                last_position = Some(pos);
            }
        }

        for recipient in incoming.recipients {
            let ser = recipient.serialized_output();
            match self
                .recipients
                .iter_mut()
                .find(|r| r.serialized_output() == ser)
            {
                Some(existing) => {
                    for (pubkey, path) in recipient.bip32_paths {
                        existing.add_bip32_path(pubkey, path)?;
                    }
                }
                None => self.recipients.push(recipient),
            }
        }

        Ok(())
    }

    // ----------------------------- Verification -----------------------------

    fn utxo_map(&self) -> Result<HashMap<Outpoint, Utxo>, SignerError> {
        let mut map = HashMap::new();
        for (index, spender) in self.spenders.iter().enumerate() {
            let utxo = spender
                .utxo
                .clone()
                .ok_or(SignerError::MissingUtxo(index))?;
            map.insert(spender.outpoint.clone(), utxo);
        }
        Ok(map)
    }

    fn combined_flags(&self) -> u32 {
        self.spenders.iter().fold(0, |acc, s| acc | s.flags())
    }

    /// Evaluate whatever signatures are present so far.
    pub fn evaluate_signed_state(&self) -> Result<TxEvalState, SignerError> {
        let raw = self.serialize_available_tx()?;
        let utxos = self.utxo_map()?;
        verify::verify_transaction(&raw, &utxos, self.combined_flags(), false)
            .map_err(|_| SignerError::VerifyFailed)
    }

    /// Full verification; success promotes every spender to `Signed`.
    pub fn verify(&mut self) -> Result<(), SignerError> {
        let raw = self.serialize_signed_tx()?;
        let utxos = self.utxo_map()?;
        let eval = verify::verify_transaction(&raw, &utxos, self.combined_flags(), true)
            .map_err(|_| SignerError::VerifyFailed)?;
        if !eval.is_valid() {
            return Err(SignerError::VerifyFailed);
        }
        for spender in &mut self.spenders {
            spender.status = SpenderStatus::Signed;
        }
        Ok(())
    }

    /// Admit an external signature for one input.
    pub fn inject_signature(
        &mut self,
        input_index: usize,
        sig: Vec<u8>,
        sig_id: Option<u16>,
    ) -> Result<(), SignerError> {
        self.spenders
            .get_mut(input_index)
            .ok_or(SignerError::NotResolved(input_index))?
            .inject_signature(sig, sig_id)
    }
}

fn var_int_len(v: u64) -> usize {
    match v {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{compute_pubkey, ecdsa_sign, hash160};
    use std::collections::HashMap;

    /// Feed over a set of raw private keys, indexed by pubkey hash.
    pub struct TestFeed {
        keys: HashMap<Vec<u8>, [u8; 32]>,
        scripts: HashMap<Vec<u8>, Vec<u8>>,
    }

    impl TestFeed {
        pub fn new(priv_keys: &[[u8; 32]]) -> Self {
            let mut keys = HashMap::new();
            for pk in priv_keys {
                let pubkey = compute_pubkey(pk).unwrap().to_vec();
                keys.insert(pubkey, *pk);
            }
            Self {
                keys,
                scripts: HashMap::new(),
            }
        }

        pub fn register_script(&mut self, script: &[u8]) {
            self.scripts
                .insert(crate::script::script_hash160(script).to_vec(), script.to_vec());
            self.scripts
                .insert(crate::script::script_sha256(script).to_vec(), script.to_vec());
        }
    }

    impl ResolverFeed for TestFeed {
        fn pubkey_for_hash160(&self, h160: &[u8]) -> Result<Vec<u8>, SignerError> {
            self.keys
                .keys()
                .find(|p| hash160(p) == h160)
                .cloned()
                .ok_or(SignerError::MissingKey)
        }

        fn script_for_hash(&self, hash: &[u8]) -> Result<Vec<u8>, SignerError> {
            self.scripts.get(hash).cloned().ok_or(SignerError::MissingKey)
        }

        fn sign(
            &self,
            _script: &[u8],
            pubkey: &[u8],
            digest: &[u8; 32],
        ) -> Result<Vec<u8>, SignerError> {
            let priv_key = self.keys.get(pubkey).ok_or(SignerError::MissingKey)?;
            Ok(ecdsa_sign(digest, priv_key)?)
        }
    }

    fn p2wpkh_utxo(priv_key: &[u8; 32], value: u64) -> Utxo {
        let pubkey = compute_pubkey(priv_key).unwrap();
        let h = hash160(&pubkey);
        Utxo::new([0xAA; 32], 0, value, crate::script::p2wpkh_script(&h))
    }

    fn p2pkh_utxo(priv_key: &[u8; 32], value: u64) -> Utxo {
        let pubkey = compute_pubkey(priv_key).unwrap();
        let h = hash160(&pubkey);
        Utxo::new([0xBB; 32], 1, value, crate::script::p2pkh_script(&h))
    }

    #[test]
    fn sign_p2wpkh_and_verify() {
        let key = [0x71u8; 32];
        let feed = TestFeed::new(&[key]);

        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(p2wpkh_utxo(&key, 100_000), 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
            h160: [0x12; 20],
            value: 90_000,
        }));

        signer.sign(&feed).unwrap();
        assert!(signer.is_signed());
        signer.verify().unwrap();

        let raw = signer.serialize_signed_tx().unwrap();
        // segwit marker present
        assert_eq!(raw[4], 0x00);
        assert_eq!(raw[5], 0x01);
    }

    #[test]
    fn sign_p2pkh_and_verify() {
        let key = [0x72u8; 32];
        let feed = TestFeed::new(&[key]);

        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(p2pkh_utxo(&key, 50_000), 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2pkh {
            h160: [0x21; 20],
            value: 49_000,
        }));

        signer.sign(&feed).unwrap();
        signer.verify().unwrap();
    }

    #[test]
    fn txid_of_segwit_tx_available_before_signing() {
        let key = [0x73u8; 32];
        let feed = TestFeed::new(&[key]);

        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(p2wpkh_utxo(&key, 100_000), 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
            h160: [0x12; 20],
            value: 90_000,
        }));

        signer.resolve_spenders(&feed).unwrap();
        let before = signer.tx_id().unwrap();

        signer.sign(&feed).unwrap();
        let after = signer.tx_id().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn txid_of_legacy_tx_requires_signature() {
        let key = [0x74u8; 32];
        let feed = TestFeed::new(&[key]);

        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(p2pkh_utxo(&key, 50_000), 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2pkh {
            h160: [0x21; 20],
            value: 49_000,
        }));

        signer.resolve_spenders(&feed).unwrap();
        assert!(matches!(
            signer.tx_id(),
            Err(SignerError::UnsignedLegacyInput)
        ));

        signer.sign(&feed).unwrap();
        signer.tx_id().unwrap();
    }

    #[test]
    fn size_estimate_close_to_actual() {
        let key = [0x75u8; 32];
        let feed = TestFeed::new(&[key]);

        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(p2wpkh_utxo(&key, 1_000_000), 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
            h160: [0x12; 20],
            value: 500_000,
        }));
        signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
            h160: [0x13; 20],
            value: 499_000,
        }));

        signer.resolve_spenders(&feed).unwrap();
        let estimate = signer.estimate_size();
        signer.sign(&feed).unwrap();
        let actual = signer.serialize_signed_tx().unwrap().len();

        let tolerance = 2 * signer.spenders().len();
        assert!(
            actual.abs_diff(estimate) <= tolerance,
            "estimate {estimate} vs actual {actual}"
        );
    }

    #[test]
    fn state_merge_is_commutative_for_multisig() {
        let keys = [[0x81u8; 32], [0x82; 32], [0x83; 32]];
        let pubkeys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| compute_pubkey(k).unwrap().to_vec())
            .collect();
        let ws = crate::script::multisig_script(2, &pubkeys).unwrap();
        let h = crate::script::script_sha256(&ws);
        let utxo = Utxo::new([0xCC; 32], 0, 1_000_000, crate::script::p2wsh_script(&h));

        let build_base = || {
            let mut signer = Signer::new();
            signer.add_spender(ScriptSpender::from_utxo(utxo.clone(), 0xFFFF_FFFF));
            signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
                h160: [0x31; 20],
                value: 999_000,
            }));
            signer
        };

        // party A signs with key 0, party B with key 1
        let mut feed_a = TestFeed::new(&keys[..1]);
        feed_a.register_script(&ws);
        let mut feed_b = TestFeed::new(&keys[1..2]);
        feed_b.register_script(&ws);

        let mut signer_a = build_base();
        signer_a.sign(&feed_a).unwrap();
        let state_a = signer_a.serialize_state().unwrap();

        let mut signer_b = build_base();
        signer_b.sign(&feed_b).unwrap();
        let state_b = signer_b.serialize_state().unwrap();

        // merge in both orders
        let mut ab = Signer::from_state(&state_a).unwrap();
        ab.merge_state(&state_b).unwrap();
        let mut ba = Signer::from_state(&state_b).unwrap();
        ba.merge_state(&state_a).unwrap();

        assert_eq!(
            ab.serialize_state().unwrap(),
            ba.serialize_state().unwrap()
        );

        ab.verify().unwrap();
        ba.verify().unwrap();
        assert_eq!(
            ab.serialize_signed_tx().unwrap(),
            ba.serialize_signed_tx().unwrap()
        );
    }

    #[test]
    fn merge_conflicting_recipients_fails() {
        let key = [0x91u8; 32];
        let feed = TestFeed::new(&[key]);
        let utxo = p2wpkh_utxo(&key, 100_000);

        let mut a = Signer::new();
        a.add_spender(ScriptSpender::from_utxo(utxo.clone(), 0xFFFF_FFFF));
        let mut recipient = Recipient::new(RecipientKind::P2wpkh {
            h160: [0x12; 20],
            value: 90_000,
        });
        recipient
            .add_bip32_path(compute_pubkey(&key).unwrap().to_vec(), vec![0, 5])
            .unwrap();
        a.add_recipient(recipient);
        a.resolve_spenders(&feed).unwrap();

        let mut b = Signer::new();
        b.add_spender(ScriptSpender::from_utxo(utxo, 0xFFFF_FFFF));
        let mut recipient = Recipient::new(RecipientKind::P2wpkh {
            h160: [0x12; 20],
            value: 90_000,
        });
        recipient
            .add_bip32_path(compute_pubkey(&key).unwrap().to_vec(), vec![0, 6])
            .unwrap();
        b.add_recipient(recipient);

        let state = b.serialize_state().unwrap();
        assert!(matches!(
            a.merge_state(&state),
            Err(SignerError::MergeConflict(_))
        ));
    }

    #[test]
    fn evaluate_signed_state_counts_partial_signatures() {
        let keys = [[0x81u8; 32], [0x82; 32], [0x83; 32]];
        let pubkeys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| compute_pubkey(k).unwrap().to_vec())
            .collect();
        let ws = crate::script::multisig_script(2, &pubkeys).unwrap();
        let h = crate::script::script_sha256(&ws);
        let utxo = Utxo::new([0xCD; 32], 0, 1_000_000, crate::script::p2wsh_script(&h));

        let mut feed = TestFeed::new(&keys[..1]);
        feed.register_script(&ws);

        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(utxo, 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
            h160: [0x31; 20],
            value: 999_000,
        }));
        signer.sign(&feed).unwrap();

        assert_eq!(
            signer.spenders()[0].status(),
            SpenderStatus::PartiallySigned
        );
        let eval = signer.evaluate_signed_state().unwrap();
        assert_eq!(eval.input(0).map(|i| i.sig_count), Some(1));
        assert!(!eval.is_valid());
    }

    #[test]
    fn inject_external_signature() {
        let key = [0x95u8; 32];
        let feed = TestFeed::new(&[key]);

        let mut signer = Signer::new();
        signer.add_spender(ScriptSpender::from_utxo(p2wpkh_utxo(&key, 80_000), 0xFFFF_FFFF));
        signer.add_recipient(Recipient::new(RecipientKind::P2wpkh {
            h160: [0x42; 20],
            value: 79_000,
        }));
        signer.resolve_spenders(&feed).unwrap();

        // compute the digest externally through the same path the signer uses
        let inputs = signer.sighash_inputs();
        let outputs = signer.serialized_outputs();
        let view = SighashTxView {
            version: 1,
            lock_time: 0,
            inputs: &inputs,
            serialized_outputs: &outputs,
        };
        let cache = Bip143Cache::new(&view);
        let pubkey = compute_pubkey(&key).unwrap();
        let code = p2pkh_script(&hash160(&pubkey));
        let digest = cache.sighash(&view, 0, &code, 80_000, SIGHASH_ALL).unwrap();

        let mut sig = ecdsa_sign(&digest, &key).unwrap();
        sig.push(SIGHASH_ALL);
        signer.inject_signature(0, sig, None).unwrap();

        assert!(signer.is_signed());
        signer.verify().unwrap();
    }
}
