//! Output-script templates and classification.
//!
//! Builders for the standard templates the wallet spends and pays to, plus
//! the classifier the signer uses to decide how to resolve an input. Only
//! the opcodes these templates need are named.

use thiserror::Error;

use crate::crypto::{hash160, sha256};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("multisig parameters out of range: {m} of {n}")]
    BadMultisigParams { m: usize, n: usize },

    #[error("push data too large: {0} bytes")]
    PushTooLarge(usize),
}

/// What an output script pays to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputScriptType {
    P2pkh { h160: [u8; 20] },
    P2pk { pubkey: Vec<u8> },
    P2wpkh { h160: [u8; 20] },
    P2sh { h160: [u8; 20] },
    P2wsh { h256: [u8; 32] },
    Multisig { m: u8, pubkeys: Vec<Vec<u8>> },
    OpReturn { payload: Vec<u8> },
    NonStandard,
}

// ----------------------------- Builders -----------------------------

/// Minimal push of a data item.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) -> Result<(), ScriptError> {
    match data.len() {
        0 => script.push(OP_0),
        1..=75 => {
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        76..=255 => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        n => return Err(ScriptError::PushTooLarge(n)),
    }
    Ok(())
}

pub fn p2pkh_script(h160: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, 20];
    script.extend_from_slice(h160);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    push_data(&mut script, pubkey).expect("pubkey fits a direct push");
    script.push(OP_CHECKSIG);
    script
}

pub fn p2wpkh_script(h160: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_0, 20];
    script.extend_from_slice(h160);
    script
}

pub fn p2sh_script(h160: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_HASH160, 20];
    script.extend_from_slice(h160);
    script.push(OP_EQUAL);
    script
}

pub fn p2wsh_script(h256: &[u8; 32]) -> Vec<u8> {
    let mut script = vec![OP_0, 32];
    script.extend_from_slice(h256);
    script
}

/// Bare `OP_m <keys> OP_n OP_CHECKMULTISIG`; keys keep their given order.
pub fn multisig_script(m: usize, pubkeys: &[Vec<u8>]) -> Result<Vec<u8>, ScriptError> {
    let n = pubkeys.len();
    if m == 0 || n == 0 || m > n || n > 16 {
        return Err(ScriptError::BadMultisigParams { m, n });
    }
    let mut script = vec![OP_1 + m as u8 - 1];
    for key in pubkeys {
        push_data(&mut script, key)?;
    }
    script.push(OP_1 + n as u8 - 1);
    script.push(OP_CHECKMULTISIG);
    Ok(script)
}

/// P2SH hash of a redeem script.
pub fn script_hash160(script: &[u8]) -> [u8; 20] {
    hash160(script)
}

/// P2WSH hash of a witness script.
pub fn script_sha256(script: &[u8]) -> [u8; 32] {
    sha256(script)
}

// ----------------------------- Classification -----------------------------

/// Decide which template an output script matches.
pub fn classify_output_script(script: &[u8]) -> OutputScriptType {
    // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return OutputScriptType::P2pkh {
            h160: script[3..23].try_into().expect("checked length"),
        };
    }

    // OP_HASH160 <20> OP_EQUAL
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        return OutputScriptType::P2sh {
            h160: script[2..22].try_into().expect("checked length"),
        };
    }

    // OP_0 <20>
    if script.len() == 22 && script[0] == OP_0 && script[1] == 20 {
        return OutputScriptType::P2wpkh {
            h160: script[2..22].try_into().expect("checked length"),
        };
    }

    // OP_0 <32>
    if script.len() == 34 && script[0] == OP_0 && script[1] == 32 {
        return OutputScriptType::P2wsh {
            h256: script[2..34].try_into().expect("checked length"),
        };
    }

    // <push pubkey> OP_CHECKSIG
    if (script.len() == 35 || script.len() == 67)
        && script[0] as usize == script.len() - 2
        && script[script.len() - 1] == OP_CHECKSIG
    {
        return OutputScriptType::P2pk {
            pubkey: script[1..script.len() - 1].to_vec(),
        };
    }

    // OP_RETURN [push]
    if !script.is_empty() && script[0] == OP_RETURN {
        let payload = if script.len() >= 2 {
            let mut at = 1usize;
            let mut len = script[at] as usize;
            if script[at] == OP_PUSHDATA1 && script.len() >= 3 {
                at += 1;
                len = script[at] as usize;
            }
            script
                .get(at + 1..at + 1 + len)
                .map(|s| s.to_vec())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        return OutputScriptType::OpReturn { payload };
    }

    // OP_m <keys> OP_n OP_CHECKMULTISIG
    if script.len() >= 3
        && script[script.len() - 1] == OP_CHECKMULTISIG
        && (OP_1..=OP_16).contains(&script[0])
        && (OP_1..=OP_16).contains(&script[script.len() - 2])
    {
        let m = script[0] - OP_1 + 1;
        let n = script[script.len() - 2] - OP_1 + 1;
        let mut pubkeys = Vec::new();
        let mut at = 1usize;
        while at < script.len() - 2 {
            let len = script[at] as usize;
            if len == 0 || at + 1 + len > script.len() - 2 {
                return OutputScriptType::NonStandard;
            }
            pubkeys.push(script[at + 1..at + 1 + len].to_vec());
            at += 1 + len;
        }
        if pubkeys.len() == n as usize && m <= n {
            return OutputScriptType::Multisig { m, pubkeys };
        }
        return OutputScriptType::NonStandard;
    }

    OutputScriptType::NonStandard
}

/// Is this script a v0 witness program (P2WPKH or P2WSH)?
pub fn is_witness_program(script: &[u8]) -> bool {
    matches!(
        classify_output_script(script),
        OutputScriptType::P2wpkh { .. } | OutputScriptType::P2wsh { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_round_trips_builders() {
        let h160 = [0x11u8; 20];
        let h256 = [0x22u8; 32];
        let pubkey = vec![0x02u8; 33];

        assert_eq!(
            classify_output_script(&p2pkh_script(&h160)),
            OutputScriptType::P2pkh { h160 }
        );
        assert_eq!(
            classify_output_script(&p2sh_script(&h160)),
            OutputScriptType::P2sh { h160 }
        );
        assert_eq!(
            classify_output_script(&p2wpkh_script(&h160)),
            OutputScriptType::P2wpkh { h160 }
        );
        assert_eq!(
            classify_output_script(&p2wsh_script(&h256)),
            OutputScriptType::P2wsh { h256 }
        );
        assert_eq!(
            classify_output_script(&p2pk_script(&pubkey)),
            OutputScriptType::P2pk { pubkey }
        );
    }

    #[test]
    fn classify_multisig() {
        let keys = vec![vec![0x02u8; 33], vec![0x03u8; 33], vec![0x02u8; 33]];
        let script = multisig_script(2, &keys).unwrap();
        match classify_output_script(&script) {
            OutputScriptType::Multisig { m, pubkeys } => {
                assert_eq!(m, 2);
                assert_eq!(pubkeys, keys);
            }
            other => panic!("misclassified: {other:?}"),
        }
    }

    #[test]
    fn multisig_rejects_bad_params() {
        let keys = vec![vec![0x02u8; 33]];
        assert!(multisig_script(2, &keys).is_err());
        assert!(multisig_script(0, &keys).is_err());
    }

    #[test]
    fn nonstandard_scripts_do_not_panic() {
        for script in [
            &[][..],
            &[0xFFu8][..],
            &[OP_DUP, OP_HASH160, 19][..],
            &[OP_1, 33, OP_CHECKMULTISIG][..],
        ] {
            let _ = classify_output_script(script);
        }
    }
}
