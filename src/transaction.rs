//! Transaction primitives: outpoints, UTXOs, raw-tx parsing, and the two
//! sighash algorithms.
//!
//! Legacy inputs commit through the classical pre-segwit preimage; segwit
//! inputs use BIP143, which also commits to the spent value. The BIP143
//! hashPrevouts / hashSequence / hashOutputs triple is computed once per
//! signing pass and reused across inputs.

use thiserror::Error;

use crate::crypto::sha256d;
use crate::util::{BinaryReader, BinaryWriter, CodecError};

/// SIGHASH_ALL, the only policy the signer produces.
pub const SIGHASH_ALL: u8 = 0x01;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("input index {0} out of range")]
    InputOutOfRange(usize),

    #[error("malformed transaction: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ----------------------------- Outpoint / UTXO -----------------------------

/// Reference to a previous output.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Outpoint {
    pub txid: [u8; 32],
    pub index: u32,
}

impl Outpoint {
    pub fn new(txid: [u8; 32], index: u32) -> Self {
        Self { txid, index }
    }

    /// 36-byte wire form: txid ‖ indexLE.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bw = BinaryWriter::with_capacity(36);
        bw.put_bytes(&self.txid);
        bw.put_u32_le(self.index);
        bw.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, TxError> {
        let mut br = BinaryReader::new(data);
        let txid = br.get_array::<32>()?;
        let index = br.get_u32_le()?;
        Ok(Self { txid, index })
    }
}

/// A spendable output: where it lives, what it holds, what locks it.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Utxo {
    pub value: u64,
    pub txid: [u8; 32],
    pub index: u32,
    pub script: Vec<u8>,
}

impl Utxo {
    pub fn new(txid: [u8; 32], index: u32, value: u64, script: Vec<u8>) -> Self {
        Self {
            value,
            txid,
            index,
            script,
        }
    }

    pub fn outpoint(&self) -> Outpoint {
        Outpoint::new(self.txid, self.index)
    }
}

// ----------------------------- Parsed transaction -----------------------------

#[derive(Clone, Debug)]
pub struct ParsedTxIn {
    pub outpoint: Outpoint,
    pub script: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct ParsedTxOut {
    pub value: u64,
    pub script: Vec<u8>,
}

/// A deserialized raw transaction.
#[derive(Clone, Debug)]
pub struct ParsedTx {
    pub version: u32,
    pub inputs: Vec<ParsedTxIn>,
    pub outputs: Vec<ParsedTxOut>,
    pub lock_time: u32,
    pub has_witness: bool,
}

impl ParsedTx {
    pub fn deserialize(raw: &[u8]) -> Result<Self, TxError> {
        let mut br = BinaryReader::new(raw);
        let version = br.get_u32_le()?;

        let mut has_witness = false;
        let mut input_count = br.get_var_int()?;
        if input_count == 0 {
            // segwit marker: 0x00 flag-byte 0x01
            let flag = br.get_u8()?;
            if flag != 0x01 {
                return Err(TxError::Malformed("bad segwit flag"));
            }
            has_witness = true;
            input_count = br.get_var_int()?;
        }

        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let txid = br.get_array::<32>()?;
            let index = br.get_u32_le()?;
            let script = br.get_var_bytes()?;
            let sequence = br.get_u32_le()?;
            inputs.push(ParsedTxIn {
                outpoint: Outpoint::new(txid, index),
                script,
                sequence,
                witness: Vec::new(),
            });
        }

        let output_count = br.get_var_int()?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = br.get_u64_le()?;
            let script = br.get_var_bytes()?;
            outputs.push(ParsedTxOut { value, script });
        }

        if has_witness {
            for input in &mut inputs {
                let item_count = br.get_var_int()?;
                for _ in 0..item_count {
                    input.witness.push(br.get_var_bytes()?);
                }
            }
        }

        let lock_time = br.get_u32_le()?;
        br.expect_exhausted()?;

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
            has_witness,
        })
    }

    /// Transaction id: double SHA-256 of the no-witness serialization.
    pub fn txid(&self) -> [u8; 32] {
        let mut bw = BinaryWriter::new();
        bw.put_u32_le(self.version);
        bw.put_var_int(self.inputs.len() as u64);
        for input in &self.inputs {
            bw.put_bytes(&input.outpoint.serialize());
            bw.put_var_bytes(&input.script);
            bw.put_u32_le(input.sequence);
        }
        bw.put_var_int(self.outputs.len() as u64);
        for output in &self.outputs {
            bw.put_u64_le(output.value);
            bw.put_var_bytes(&output.script);
        }
        bw.put_u32_le(self.lock_time);
        sha256d(bw.as_slice())
    }
}

// ----------------------------- Sighash -----------------------------

/// A transaction shape reduced to what the two sighash algorithms need.
pub struct SighashTxView<'a> {
    pub version: u32,
    pub lock_time: u32,
    /// (outpoint, sequence) per input, in order.
    pub inputs: &'a [(Outpoint, u32)],
    /// Serialized `valueLE ‖ varint(scriptLen) ‖ script` per output, in order.
    pub serialized_outputs: &'a [Vec<u8>],
}

/// Cached BIP143 midstate for one signing pass.
pub struct Bip143Cache {
    hash_prevouts: [u8; 32],
    hash_sequence: [u8; 32],
    hash_outputs: [u8; 32],
}

impl Bip143Cache {
    pub fn new(view: &SighashTxView<'_>) -> Self {
        let mut prevouts = BinaryWriter::new();
        let mut sequences = BinaryWriter::new();
        for (outpoint, sequence) in view.inputs {
            prevouts.put_bytes(&outpoint.serialize());
            sequences.put_u32_le(*sequence);
        }

        let mut outputs = BinaryWriter::new();
        for out in view.serialized_outputs {
            outputs.put_bytes(out);
        }

        Self {
            hash_prevouts: sha256d(prevouts.as_slice()),
            hash_sequence: sha256d(sequences.as_slice()),
            hash_outputs: sha256d(outputs.as_slice()),
        }
    }

    /// BIP143 digest for `input_index` spending `value` locked by
    /// `script_code`.
    pub fn sighash(
        &self,
        view: &SighashTxView<'_>,
        input_index: usize,
        script_code: &[u8],
        value: u64,
        sighash_type: u8,
    ) -> Result<[u8; 32], TxError> {
        let (outpoint, sequence) = view
            .inputs
            .get(input_index)
            .ok_or(TxError::InputOutOfRange(input_index))?;

        let mut bw = BinaryWriter::new();
        bw.put_u32_le(view.version);
        bw.put_bytes(&self.hash_prevouts);
        bw.put_bytes(&self.hash_sequence);
        bw.put_bytes(&outpoint.serialize());
        bw.put_var_bytes(script_code);
        bw.put_u64_le(value);
        bw.put_u32_le(*sequence);
        bw.put_bytes(&self.hash_outputs);
        bw.put_u32_le(view.lock_time);
        bw.put_u32_le(sighash_type as u32);

        Ok(sha256d(bw.as_slice()))
    }
}

/// Classical pre-segwit digest: every input script emptied except the
/// signed input, which carries the subscript.
pub fn legacy_sighash(
    view: &SighashTxView<'_>,
    input_index: usize,
    subscript: &[u8],
    sighash_type: u8,
) -> Result<[u8; 32], TxError> {
    if input_index >= view.inputs.len() {
        return Err(TxError::InputOutOfRange(input_index));
    }

    let mut bw = BinaryWriter::new();
    bw.put_u32_le(view.version);
    bw.put_var_int(view.inputs.len() as u64);
    for (i, (outpoint, sequence)) in view.inputs.iter().enumerate() {
        bw.put_bytes(&outpoint.serialize());
        if i == input_index {
            bw.put_var_bytes(subscript);
        } else {
            bw.put_var_int(0);
        }
        bw.put_u32_le(*sequence);
    }
    bw.put_var_int(view.serialized_outputs.len() as u64);
    for out in view.serialized_outputs {
        bw.put_bytes(out);
    }
    bw.put_u32_le(view.lock_time);
    bw.put_u32_le(sighash_type as u32);

    Ok(sha256d(bw.as_slice()))
}

/// Serialize one output as `valueLE ‖ varint(len) ‖ script`.
pub fn serialize_output(value: u64, script: &[u8]) -> Vec<u8> {
    let mut bw = BinaryWriter::with_capacity(9 + script.len());
    bw.put_u64_le(value);
    bw.put_var_bytes(script);
    bw.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::p2pkh_script;

    fn sample_view() -> (Vec<(Outpoint, u32)>, Vec<Vec<u8>>) {
        let inputs = vec![
            (Outpoint::new([0x01; 32], 0), 0xFFFF_FFFF),
            (Outpoint::new([0x02; 32], 3), 0xFFFF_FFFE),
        ];
        let outputs = vec![
            serialize_output(50_000, &p2pkh_script(&[0x11; 20])),
            serialize_output(25_000, &p2pkh_script(&[0x22; 20])),
        ];
        (inputs, outputs)
    }

    #[test]
    fn outpoint_round_trip() {
        let op = Outpoint::new([0xAB; 32], 7);
        let back = Outpoint::deserialize(&op.serialize()).unwrap();
        assert_eq!(op, back);
    }

    #[test]
    fn legacy_sighash_depends_on_input_index() {
        let (inputs, outputs) = sample_view();
        let view = SighashTxView {
            version: 1,
            lock_time: 0,
            inputs: &inputs,
            serialized_outputs: &outputs,
        };
        let subscript = p2pkh_script(&[0x33; 20]);
        let h0 = legacy_sighash(&view, 0, &subscript, SIGHASH_ALL).unwrap();
        let h1 = legacy_sighash(&view, 1, &subscript, SIGHASH_ALL).unwrap();
        assert_ne!(h0, h1);
        assert!(legacy_sighash(&view, 2, &subscript, SIGHASH_ALL).is_err());
    }

    #[test]
    fn bip143_commits_to_value() {
        let (inputs, outputs) = sample_view();
        let view = SighashTxView {
            version: 1,
            lock_time: 0,
            inputs: &inputs,
            serialized_outputs: &outputs,
        };
        let cache = Bip143Cache::new(&view);
        let code = p2pkh_script(&[0x33; 20]);
        let a = cache.sighash(&view, 0, &code, 100_000, SIGHASH_ALL).unwrap();
        let b = cache.sighash(&view, 0, &code, 100_001, SIGHASH_ALL).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_legacy_tx_round_trip() {
        // build a raw legacy tx by hand
        let mut bw = BinaryWriter::new();
        bw.put_u32_le(2);
        bw.put_var_int(1);
        bw.put_bytes(&Outpoint::new([0x0A; 32], 1).serialize());
        bw.put_var_bytes(&[0xAA, 0xBB]);
        bw.put_u32_le(0xFFFF_FFFF);
        bw.put_var_int(1);
        bw.put_u64_le(90_000);
        bw.put_var_bytes(&p2pkh_script(&[0x55; 20]));
        bw.put_u32_le(101);
        let raw = bw.into_bytes();

        let tx = ParsedTx::deserialize(&raw).unwrap();
        assert_eq!(tx.version, 2);
        assert!(!tx.has_witness);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].script, vec![0xAA, 0xBB]);
        assert_eq!(tx.outputs[0].value, 90_000);
        assert_eq!(tx.lock_time, 101);
        // txid of a legacy tx hashes the full serialization
        assert_eq!(tx.txid(), sha256d(&raw));
    }

    #[test]
    fn parse_segwit_tx_and_txid_excludes_witness() {
        let mut bw = BinaryWriter::new();
        bw.put_u32_le(1);
        bw.put_u8(0x00); // marker
        bw.put_u8(0x01); // flag
        bw.put_var_int(1);
        bw.put_bytes(&Outpoint::new([0x0B; 32], 0).serialize());
        bw.put_var_int(0);
        bw.put_u32_le(0xFFFF_FFFF);
        bw.put_var_int(1);
        bw.put_u64_le(10_000);
        bw.put_var_bytes(&p2pkh_script(&[0x66; 20]));
        bw.put_var_int(2); // witness items
        bw.put_var_bytes(&[0x30, 0x45]);
        bw.put_var_bytes(&[0x02; 33]);
        bw.put_u32_le(0);
        let raw = bw.into_bytes();

        let tx = ParsedTx::deserialize(&raw).unwrap();
        assert!(tx.has_witness);
        assert_eq!(tx.inputs[0].witness.len(), 2);

        // strip the witness and compare txids
        let mut legacy = BinaryWriter::new();
        legacy.put_u32_le(1);
        legacy.put_var_int(1);
        legacy.put_bytes(&Outpoint::new([0x0B; 32], 0).serialize());
        legacy.put_var_int(0);
        legacy.put_u32_le(0xFFFF_FFFF);
        legacy.put_var_int(1);
        legacy.put_u64_le(10_000);
        legacy.put_var_bytes(&p2pkh_script(&[0x66; 20]));
        legacy.put_u32_le(0);
        assert_eq!(tx.txid(), sha256d(legacy.as_slice()));
    }
}
