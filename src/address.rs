//! Address types and script-hash materialization.
//!
//! An address type is a script template policy over an asset: the same
//! public key can surface as P2PKH, native P2WPKH, or P2WPKH nested inside
//! P2SH. Prefixed hashes disambiguate the templates inside the wallet's
//! incoming-address index.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::assets::{AssetEntry, AssetError};
use crate::crypto::hash160;
use crate::script::{
    self, multisig_script, p2pkh_script, p2sh_script, p2wpkh_script, p2wsh_script, ScriptError,
};

/// Hash-index prefixes, one per script namespace.
pub const PREFIX_P2PKH: u8 = 0x00;
pub const PREFIX_P2SH: u8 = 0x05;
pub const PREFIX_P2WPKH: u8 = 0x90;
pub const PREFIX_P2WSH: u8 = 0x95;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("unknown address type code: {0}")]
    UnknownType(u32),

    #[error("asset cannot back this address type")]
    UnsupportedAsset,

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Script template an asset is exposed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum AddressType {
    P2pkh = 1,
    P2wpkh = 2,
    /// P2WPKH program nested in a P2SH output.
    NestedP2wpkh = 3,
    /// Native P2WSH over the asset's multisig script.
    P2wsh = 4,
    /// P2WSH program nested in a P2SH output.
    NestedP2wsh = 5,
}

impl AddressType {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Result<Self, AddressError> {
        match v {
            1 => Ok(AddressType::P2pkh),
            2 => Ok(AddressType::P2wpkh),
            3 => Ok(AddressType::NestedP2wpkh),
            4 => Ok(AddressType::P2wsh),
            5 => Ok(AddressType::NestedP2wsh),
            other => Err(AddressError::UnknownType(other)),
        }
    }
}

/// A materialized address: the asset it spends to, its locking script, and
/// the prefixed hash the incoming-address index is keyed by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressEntry {
    pub asset_id: Vec<u8>,
    pub address_type: AddressType,
    /// Type-prefixed hash for index lookups.
    pub prefixed_hash: Vec<u8>,
    /// The output script paying to this address.
    pub script: Vec<u8>,
    /// Redeem script for the nested types, witness script for P2WSH.
    pub inner_script: Option<Vec<u8>>,
}

impl AddressEntry {
    /// Build the address view of an asset under a template.
    pub fn instantiate(
        asset: &AssetEntry,
        address_type: AddressType,
    ) -> Result<Self, AddressError> {
        let asset_id = asset.id();
        match address_type {
            AddressType::P2pkh => {
                let h = hash160(asset.pubkey()?);
                let mut prefixed = vec![PREFIX_P2PKH];
                prefixed.extend_from_slice(&h);
                Ok(Self {
                    asset_id,
                    address_type,
                    prefixed_hash: prefixed,
                    script: p2pkh_script(&h),
                    inner_script: None,
                })
            }

            AddressType::P2wpkh => {
                let h = hash160(asset.pubkey()?);
                let mut prefixed = vec![PREFIX_P2WPKH];
                prefixed.extend_from_slice(&h);
                Ok(Self {
                    asset_id,
                    address_type,
                    prefixed_hash: prefixed,
                    script: p2wpkh_script(&h),
                    inner_script: None,
                })
            }

            AddressType::NestedP2wpkh => {
                let h = hash160(asset.pubkey()?);
                let program = p2wpkh_script(&h);
                let redeem_hash = script::script_hash160(&program);
                let mut prefixed = vec![PREFIX_P2SH];
                prefixed.extend_from_slice(&redeem_hash);
                Ok(Self {
                    asset_id,
                    address_type,
                    prefixed_hash: prefixed,
                    script: p2sh_script(&redeem_hash),
                    inner_script: Some(program),
                })
            }

            AddressType::P2wsh => {
                let witness_script = multisig_witness_script(asset)?;
                let h = script::script_sha256(&witness_script);
                let mut prefixed = vec![PREFIX_P2WSH];
                prefixed.extend_from_slice(&h);
                Ok(Self {
                    asset_id,
                    address_type,
                    prefixed_hash: prefixed,
                    script: p2wsh_script(&h),
                    inner_script: Some(witness_script),
                })
            }

            AddressType::NestedP2wsh => {
                let witness_script = multisig_witness_script(asset)?;
                let h = script::script_sha256(&witness_script);
                let program = p2wsh_script(&h);
                let redeem_hash = script::script_hash160(&program);
                let mut prefixed = vec![PREFIX_P2SH];
                prefixed.extend_from_slice(&redeem_hash);
                Ok(Self {
                    asset_id,
                    address_type,
                    prefixed_hash: prefixed,
                    script: p2sh_script(&redeem_hash),
                    inner_script: Some(witness_script),
                })
            }
        }
    }
}

/// Multisig witness script of a multisig asset, cosigners in map order.
fn multisig_witness_script(asset: &AssetEntry) -> Result<Vec<u8>, AddressError> {
    match asset {
        AssetEntry::Multisig(ms) => {
            let pubkeys: Vec<Vec<u8>> = ms
                .assets
                .values()
                .map(|single| single.pubkey().to_vec())
                .collect();
            Ok(multisig_script(ms.m as usize, &pubkeys)?)
        }
        _ => Err(AddressError::UnsupportedAsset),
    }
}

/// Compute the per-type prefixed hashes for one asset.
pub fn hashes_for_asset(
    asset: &AssetEntry,
    types: impl IntoIterator<Item = AddressType>,
) -> BTreeMap<AddressType, Vec<u8>> {
    let mut out = BTreeMap::new();
    for t in types {
        // types an asset cannot back (multisig templates over single keys)
        // are skipped rather than failing the whole refresh
        if let Ok(entry) = AddressEntry::instantiate(asset, t) {
            out.insert(t, entry.prefixed_hash);
        }
    }
    out
}
