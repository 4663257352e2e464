//! Derivation schemes.
//!
//! Four ways to grow a key chain:
//!
//! - **Legacy chain-code**: each entry derives from the previous one by
//!   scalar multiplication with `SHA256d(pub) XOR chainCode`. Linear and
//!   stateful over the last asset.
//! - **BIP32**: each entry derives from the account root with its own index
//!   as the non-hardened child number.
//! - **BIP32-salted**: same, with a 32-byte salt folded into the chain-code
//!   before every step.
//! - **ECDH**: `pub_i = rootPub + G·salt_i` over a persistent, ordered salt
//!   table.
//!
//! Public chains extend public keys only. Private chains need the DDC lock
//! and wrap each fresh private key under the caller's cipher spec.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::assets::{AssetEntry, AssetError, AssetSingle, PrivateKeyAsset};
use crate::crypto::{self, hmac_sha256, hmac_sha512, sha256d, CryptoError};
use crate::db::{DbError, DbTransaction, ECDH_SALT_PREFIX};
use crate::ddc::{DdcError, DdcLock, DecryptedDataContainer};
use crate::util::{BinaryReader, BinaryWriter, CodecError, SecureBytes};

const SCHEME_TAG_LEGACY: u8 = 0x01;
const SCHEME_TAG_BIP32: u8 = 0x02;
const SCHEME_TAG_BIP32_SALTED: u8 = 0x03;
const SCHEME_TAG_ECDH: u8 = 0x04;

/// First hardened child number; this module only derives below it.
const HARDENED_OFFSET: u32 = 0x8000_0000;

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("unknown derivation scheme tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("hardened index {0:#010x} cannot be soft-derived")]
    HardenedIndex(u32),

    #[error("no salt registered for index {0}")]
    MissingSalt(u32),

    #[error("salt must be 32 bytes")]
    BadSaltLength,

    #[error("start asset carries no private key")]
    NoPrivateKey,

    #[error("scheme requires a single-key start asset")]
    BadStartAsset,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Ddc(#[from] DdcError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Db(#[from] DbError),
}

// ----------------------------- ECDH salt table -----------------------------

/// Persistent ordered salt table of an ECDH account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EcdhSalts {
    by_index: BTreeMap<u32, Vec<u8>>,
    by_salt: HashMap<Vec<u8>, u32>,
}

impl EcdhSalts {
    /// Register a salt; duplicates return their existing position.
    pub fn add(&mut self, salt: Vec<u8>) -> Result<u32, DerivationError> {
        if salt.len() != 32 {
            return Err(DerivationError::BadSaltLength);
        }
        if let Some(&index) = self.by_salt.get(&salt) {
            return Ok(index);
        }
        let index = self.by_index.len() as u32;
        self.by_index.insert(index, salt.clone());
        self.by_salt.insert(salt, index);
        Ok(index)
    }

    pub fn get(&self, index: u32) -> Option<&[u8]> {
        self.by_index.get(&index).map(|s| s.as_slice())
    }

    pub fn index_of(&self, salt: &[u8]) -> Option<u32> {
        self.by_salt.get(salt).copied()
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    fn salt_db_key(full_account_id: &[u8], index: u32) -> Vec<u8> {
        let mut key = vec![ECDH_SALT_PREFIX];
        key.extend_from_slice(full_account_id);
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    /// Persist a single salt record.
    pub fn save_salt(
        tx: &DbTransaction,
        full_account_id: &[u8],
        index: u32,
        salt: &[u8],
    ) -> Result<(), DbError> {
        tx.insert(&Self::salt_db_key(full_account_id, index), salt)
    }

    /// Persist the whole table (watching-only copies).
    pub fn save_all(
        &self,
        tx: &DbTransaction,
        full_account_id: &[u8],
    ) -> Result<(), DbError> {
        for (index, salt) in &self.by_index {
            Self::save_salt(tx, full_account_id, *index, salt)?;
        }
        Ok(())
    }

    /// Reload the table from its records, in index order.
    pub fn load(
        tx: &DbTransaction,
        full_account_id: &[u8],
    ) -> Result<Self, DerivationError> {
        let mut prefix = vec![ECDH_SALT_PREFIX];
        prefix.extend_from_slice(full_account_id);

        let mut salts = Self::default();
        for (key, value) in tx.iter_prefix(&prefix) {
            if key.len() != prefix.len() + 4 {
                continue;
            }
            let index = u32::from_be_bytes(
                key[prefix.len()..].try_into().expect("checked length"),
            );
            if value.len() != 32 {
                return Err(DerivationError::BadSaltLength);
            }
            salts.by_index.insert(index, value.clone());
            salts.by_salt.insert(value, index);
        }
        Ok(salts)
    }
}

// ----------------------------- DerivationScheme -----------------------------

/// Tagged union over the four derivation algorithms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DerivationScheme {
    ArmoryLegacy {
        chaincode: SecureBytes,
    },
    Bip32 {
        chaincode: SecureBytes,
        depth: u8,
        leaf_id: u32,
    },
    Bip32Salted {
        chaincode: SecureBytes,
        depth: u8,
        leaf_id: u32,
        salt: SecureBytes,
    },
    Ecdh {
        salts: EcdhSalts,
    },
}

/// Legacy chain-code multiplier for one step.
fn legacy_multiplier(pubkey: &[u8], chaincode: &[u8]) -> [u8; 32] {
    let mut m = sha256d(pubkey);
    for (byte, cc) in m.iter_mut().zip(chaincode.iter()) {
        *byte ^= cc;
    }
    m
}

/// Chain-code for an Armory-legacy chain seeded from a root key.
pub fn legacy_chaincode_from_root(root: &[u8]) -> SecureBytes {
    SecureBytes::from(sha256d(root))
}

/// One legacy step on the private side.
pub fn legacy_next_private(
    prev_priv: &[u8],
    chaincode: &[u8],
) -> Result<SecureBytes, DerivationError> {
    let prev_pub = crypto::compute_pubkey(prev_priv)?;
    let m = legacy_multiplier(&prev_pub, chaincode);
    Ok(crypto::privkey_mul(prev_priv, &m)?)
}

/// One legacy step on the public side.
pub fn legacy_next_public(prev_pub: &[u8], chaincode: &[u8]) -> Result<Vec<u8>, DerivationError> {
    let m = legacy_multiplier(prev_pub, chaincode);
    Ok(crypto::pubkey_scalar_multiply(prev_pub, &m)?.to_vec())
}

impl DerivationScheme {
    /// The BIP32 tweak for child `index` off `(chaincode, pubkey)`.
    fn bip32_tweak(
        chaincode: &[u8],
        pubkey: &[u8],
        index: u32,
    ) -> Result<[u8; 32], DerivationError> {
        if index >= HARDENED_OFFSET {
            return Err(DerivationError::HardenedIndex(index));
        }
        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(pubkey);
        data.extend_from_slice(&index.to_be_bytes());
        let i = hmac_sha512(chaincode, &data);
        Ok(i[..32].try_into().expect("fixed split"))
    }

    fn effective_chaincode(&self, root_pub: &[u8]) -> Option<SecureBytes> {
        match self {
            DerivationScheme::Bip32 { chaincode, .. } => Some(chaincode.clone()),
            DerivationScheme::Bip32Salted {
                chaincode, salt, ..
            } => {
                let mut input = chaincode.to_vec();
                input.extend_from_slice(root_pub);
                Some(SecureBytes::from(hmac_sha256(salt.as_slice(), &input)))
            }
            _ => None,
        }
    }

    /// Derive entries `start..=end` as public-only assets.
    ///
    /// `start_asset` is the previous entry for the legacy scheme and the
    /// account root for every other scheme.
    pub fn extend_public(
        &self,
        start_asset: &AssetEntry,
        start: u32,
        end: u32,
    ) -> Result<Vec<AssetEntry>, DerivationError> {
        let account_id = start_asset.account_id().to_vec();
        let start_pub = start_asset.pubkey().map_err(|_| DerivationError::BadStartAsset)?;
        let mut out = Vec::with_capacity((end - start + 1) as usize);

        match self {
            DerivationScheme::ArmoryLegacy { chaincode } => {
                let mut prev = start_pub.to_vec();
                for index in start..=end {
                    let m = legacy_multiplier(&prev, chaincode.as_slice());
                    let next = crypto::pubkey_scalar_multiply(&prev, &m)?;
                    out.push(AssetEntry::Single(AssetSingle::new(
                        index as i64,
                        account_id.clone(),
                        next.to_vec(),
                        None,
                    )));
                    prev = next.to_vec();
                }
            }

            DerivationScheme::Bip32 { .. } | DerivationScheme::Bip32Salted { .. } => {
                let cc = self
                    .effective_chaincode(start_pub)
                    .expect("bip32 variants have chaincodes");
                for index in start..=end {
                    let tweak = Self::bip32_tweak(cc.as_slice(), start_pub, index)?;
                    let child = crypto::pubkey_add_tweak(start_pub, &tweak)?;
                    out.push(AssetEntry::Single(AssetSingle::new(
                        index as i64,
                        account_id.clone(),
                        child.to_vec(),
                        None,
                    )));
                }
            }

            DerivationScheme::Ecdh { salts } => {
                for index in start..=end {
                    let salt = salts
                        .get(index)
                        .ok_or(DerivationError::MissingSalt(index))?;
                    let salt_point = crypto::compute_pubkey(salt)?;
                    let child = crypto::pubkey_add_point(start_pub, &salt_point)?;
                    out.push(AssetEntry::Single(AssetSingle::new(
                        index as i64,
                        account_id.clone(),
                        child.to_vec(),
                        None,
                    )));
                }
            }
        }

        Ok(out)
    }

    /// Derive entries `start..=end` with private keys. Each fresh key is
    /// wrapped under the start asset's cipher spec with its own IV.
    pub fn extend_private(
        &self,
        ddc: &DecryptedDataContainer,
        lock: &DdcLock<'_>,
        start_asset: &AssetEntry,
        start: u32,
        end: u32,
    ) -> Result<Vec<AssetEntry>, DerivationError> {
        let account_id = start_asset.account_id().to_vec();
        let start_priv_asset = start_asset
            .private_key()
            .ok_or(DerivationError::NoPrivateKey)?;
        let cipher = start_priv_asset
            .data
            .cipher()
            .ok_or(DerivationError::NoPrivateKey)?
            .clone();
        let start_priv = ddc.get_private_data(lock, &start_priv_asset.data)?;

        let mut out = Vec::with_capacity((end - start + 1) as usize);

        let make_entry = |index: u32,
                          priv_key: &SecureBytes|
         -> Result<AssetEntry, DerivationError> {
            let pubkey = crypto::compute_pubkey(priv_key.as_slice())?;
            let spec = cipher.fresh_iv();
            let ciphertext = ddc.encrypt_data(lock, &spec, priv_key.as_slice())?;

            let mut single = AssetSingle::new(
                index as i64,
                account_id.clone(),
                pubkey.to_vec(),
                None,
            );
            let key_id = single.id();
            single.set_private_key(PrivateKeyAsset::new(key_id, spec, ciphertext));
            Ok(AssetEntry::Single(single))
        };

        match self {
            DerivationScheme::ArmoryLegacy { chaincode } => {
                let mut prev_priv = start_priv;
                for index in start..=end {
                    let prev_pub = crypto::compute_pubkey(prev_priv.as_slice())?;
                    let m = legacy_multiplier(&prev_pub, chaincode.as_slice());
                    let next_priv = crypto::privkey_mul(prev_priv.as_slice(), &m)?;
                    out.push(make_entry(index, &next_priv)?);
                    prev_priv = next_priv;
                }
            }

            DerivationScheme::Bip32 { .. } | DerivationScheme::Bip32Salted { .. } => {
                let root_pub = crypto::compute_pubkey(start_priv.as_slice())?;
                let cc = self
                    .effective_chaincode(&root_pub)
                    .expect("bip32 variants have chaincodes");
                for index in start..=end {
                    let tweak = Self::bip32_tweak(cc.as_slice(), &root_pub, index)?;
                    let child_priv = crypto::privkey_add_tweak(start_priv.as_slice(), &tweak)?;
                    out.push(make_entry(index, &child_priv)?);
                }
            }

            DerivationScheme::Ecdh { salts } => {
                for index in start..=end {
                    let salt = salts
                        .get(index)
                        .ok_or(DerivationError::MissingSalt(index))?;
                    let child_priv =
                        crypto::privkey_add_tweak(start_priv.as_slice(), salt)?;
                    out.push(make_entry(index, &child_priv)?);
                }
            }
        }

        Ok(out)
    }

    /// Whether chains grow off the previous entry (legacy) or the root.
    pub fn is_linear(&self) -> bool {
        matches!(self, DerivationScheme::ArmoryLegacy { .. })
    }

    pub fn ecdh_salts(&self) -> Option<&EcdhSalts> {
        match self {
            DerivationScheme::Ecdh { salts } => Some(salts),
            _ => None,
        }
    }

    pub fn ecdh_salts_mut(&mut self) -> Option<&mut EcdhSalts> {
        match self {
            DerivationScheme::Ecdh { salts } => Some(salts),
            _ => None,
        }
    }

    // ----------------------------- Persistence -----------------------------

    /// Stable byte form. ECDH salts persist as their own records, not here.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bw = BinaryWriter::new();
        match self {
            DerivationScheme::ArmoryLegacy { chaincode } => {
                bw.put_u8(SCHEME_TAG_LEGACY);
                bw.put_var_bytes(chaincode.as_slice());
            }
            DerivationScheme::Bip32 {
                chaincode,
                depth,
                leaf_id,
            } => {
                bw.put_u8(SCHEME_TAG_BIP32);
                bw.put_var_bytes(chaincode.as_slice());
                bw.put_u8(*depth);
                bw.put_u32_be(*leaf_id);
            }
            DerivationScheme::Bip32Salted {
                chaincode,
                depth,
                leaf_id,
                salt,
            } => {
                bw.put_u8(SCHEME_TAG_BIP32_SALTED);
                bw.put_var_bytes(chaincode.as_slice());
                bw.put_u8(*depth);
                bw.put_u32_be(*leaf_id);
                bw.put_var_bytes(salt.as_slice());
            }
            DerivationScheme::Ecdh { .. } => {
                bw.put_u8(SCHEME_TAG_ECDH);
            }
        }
        bw.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DerivationError> {
        let mut br = BinaryReader::new(data);
        let scheme = match br.get_u8()? {
            SCHEME_TAG_LEGACY => DerivationScheme::ArmoryLegacy {
                chaincode: SecureBytes::new(br.get_var_bytes()?),
            },
            SCHEME_TAG_BIP32 => DerivationScheme::Bip32 {
                chaincode: SecureBytes::new(br.get_var_bytes()?),
                depth: br.get_u8()?,
                leaf_id: br.get_u32_be()?,
            },
            SCHEME_TAG_BIP32_SALTED => DerivationScheme::Bip32Salted {
                chaincode: SecureBytes::new(br.get_var_bytes()?),
                depth: br.get_u8()?,
                leaf_id: br.get_u32_be()?,
                salt: SecureBytes::new(br.get_var_bytes()?),
            },
            SCHEME_TAG_ECDH => DerivationScheme::Ecdh {
                salts: EcdhSalts::default(),
            },
            other => return Err(DerivationError::UnknownTag(other)),
        };
        br.expect_exhausted()?;
        Ok(scheme)
    }
}

// ----------------------------- BIP32 node steps -----------------------------

/// Extended-key state used while soft-deriving account roots.
#[derive(Clone)]
pub struct Bip32Node {
    pub privkey: Option<SecureBytes>,
    pub pubkey: Vec<u8>,
    pub chaincode: SecureBytes,
    pub depth: u8,
    pub leaf_id: u32,
    pub parent_fingerprint: u32,
}

impl Bip32Node {
    pub fn from_private(
        privkey: SecureBytes,
        chaincode: SecureBytes,
        depth: u8,
        leaf_id: u32,
        parent_fingerprint: u32,
    ) -> Result<Self, DerivationError> {
        let pubkey = crypto::compute_pubkey(privkey.as_slice())?;
        Ok(Self {
            privkey: Some(privkey),
            pubkey: pubkey.to_vec(),
            chaincode,
            depth,
            leaf_id,
            parent_fingerprint,
        })
    }

    pub fn from_public(
        pubkey: Vec<u8>,
        chaincode: SecureBytes,
        depth: u8,
        leaf_id: u32,
        parent_fingerprint: u32,
    ) -> Self {
        Self {
            privkey: None,
            pubkey,
            chaincode,
            depth,
            leaf_id,
            parent_fingerprint,
        }
    }

    /// First four bytes of `hash160(pubkey)`, the BIP32 fingerprint.
    pub fn fingerprint(&self) -> u32 {
        let h = crate::crypto::hash160(&self.pubkey);
        u32::from_be_bytes(h[..4].try_into().expect("fixed slice"))
    }

    /// One non-hardened derivation step.
    pub fn derive_step(&self, index: u32) -> Result<Self, DerivationError> {
        if index >= HARDENED_OFFSET {
            return Err(DerivationError::HardenedIndex(index));
        }
        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&self.pubkey);
        data.extend_from_slice(&index.to_be_bytes());
        let i = hmac_sha512(self.chaincode.as_slice(), &data);
        let tweak: [u8; 32] = i[..32].try_into().expect("fixed split");
        let child_chaincode = SecureBytes::from(&i[32..]);

        let parent_fingerprint = self.fingerprint();
        match &self.privkey {
            Some(privkey) => {
                let child_priv = crypto::privkey_add_tweak(privkey.as_slice(), &tweak)?;
                let child_pub = crypto::compute_pubkey(child_priv.as_slice())?;
                Ok(Self {
                    privkey: Some(child_priv),
                    pubkey: child_pub.to_vec(),
                    chaincode: child_chaincode,
                    depth: self.depth + 1,
                    leaf_id: index,
                    parent_fingerprint,
                })
            }
            None => {
                let child_pub = crypto::pubkey_add_tweak(&self.pubkey, &tweak)?;
                Ok(Self {
                    privkey: None,
                    pubkey: child_pub.to_vec(),
                    chaincode: child_chaincode,
                    depth: self.depth + 1,
                    leaf_id: index,
                    parent_fingerprint,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::compute_pubkey;

    fn root_single(priv_key: &[u8; 32]) -> AssetEntry {
        let pubkey = compute_pubkey(priv_key).unwrap();
        AssetEntry::Single(AssetSingle::new(
            crate::assets::ROOT_ASSET_INDEX,
            vec![0u8; 8],
            pubkey.to_vec(),
            None,
        ))
    }

    #[test]
    fn legacy_public_chain_is_deterministic() {
        let chaincode = legacy_chaincode_from_root(&[0x42u8; 32]);
        let scheme = DerivationScheme::ArmoryLegacy { chaincode };
        let start = root_single(&[0x42u8; 32]);

        let a = scheme.extend_public(&start, 0, 9).unwrap();
        let b = scheme.extend_public(&start, 0, 9).unwrap();
        assert_eq!(a.len(), 10);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.pubkey().unwrap(), y.pubkey().unwrap());
        }
    }

    #[test]
    fn legacy_chain_resumes_mid_sequence() {
        let chaincode = legacy_chaincode_from_root(&[0x42u8; 32]);
        let scheme = DerivationScheme::ArmoryLegacy { chaincode };
        let start = root_single(&[0x42u8; 32]);

        let full = scheme.extend_public(&start, 0, 9).unwrap();
        // restart from entry 4 and re-derive the tail
        let tail = scheme.extend_public(&full[4], 5, 9).unwrap();
        for (offset, entry) in tail.iter().enumerate() {
            assert_eq!(
                entry.pubkey().unwrap(),
                full[5 + offset].pubkey().unwrap()
            );
        }
    }

    #[test]
    fn bip32_children_derive_from_root_independently() {
        let scheme = DerivationScheme::Bip32 {
            chaincode: SecureBytes::from([0x10u8; 32]),
            depth: 2,
            leaf_id: 0,
        };
        let root = root_single(&[0x21u8; 32]);

        let batch = scheme.extend_public(&root, 0, 4).unwrap();
        // single-index derivation matches the batch
        let lone = scheme.extend_public(&root, 3, 3).unwrap();
        assert_eq!(lone[0].pubkey().unwrap(), batch[3].pubkey().unwrap());
    }

    #[test]
    fn bip32_rejects_hardened_index() {
        let scheme = DerivationScheme::Bip32 {
            chaincode: SecureBytes::from([0x10u8; 32]),
            depth: 0,
            leaf_id: 0,
        };
        let root = root_single(&[0x21u8; 32]);
        assert!(matches!(
            scheme.extend_public(&root, HARDENED_OFFSET, HARDENED_OFFSET),
            Err(DerivationError::HardenedIndex(_))
        ));
    }

    #[test]
    fn salted_scheme_diverges_from_plain_bip32() {
        let chaincode = SecureBytes::from([0x10u8; 32]);
        let plain = DerivationScheme::Bip32 {
            chaincode: chaincode.clone(),
            depth: 0,
            leaf_id: 0,
        };
        let salted = DerivationScheme::Bip32Salted {
            chaincode,
            depth: 0,
            leaf_id: 0,
            salt: SecureBytes::from([0x77u8; 32]),
        };
        let root = root_single(&[0x21u8; 32]);

        let a = plain.extend_public(&root, 0, 0).unwrap();
        let b = salted.extend_public(&root, 0, 0).unwrap();
        assert_ne!(a[0].pubkey().unwrap(), b[0].pubkey().unwrap());
    }

    #[test]
    fn ecdh_requires_registered_salts() {
        let mut salts = EcdhSalts::default();
        assert_eq!(salts.add(vec![0x01; 32]).unwrap(), 0);
        assert_eq!(salts.add(vec![0x02; 32]).unwrap(), 1);
        // duplicate returns its original position
        assert_eq!(salts.add(vec![0x01; 32]).unwrap(), 0);

        let scheme = DerivationScheme::Ecdh { salts };
        let root = root_single(&[0x31u8; 32]);

        let entries = scheme.extend_public(&root, 0, 1).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            scheme.extend_public(&root, 2, 2),
            Err(DerivationError::MissingSalt(2))
        ));
    }

    #[test]
    fn ecdh_public_matches_private_derivation() {
        let mut salts = EcdhSalts::default();
        salts.add(sha256d(b"salt-0").to_vec()).unwrap();
        let scheme = DerivationScheme::Ecdh { salts };

        let root_priv = [0x31u8; 32];
        let root = root_single(&root_priv);
        let entries = scheme.extend_public(&root, 0, 0).unwrap();

        // private-side: priv + salt, then to public
        let salt = sha256d(b"salt-0");
        let child_priv = crypto::privkey_add_tweak(&root_priv, &salt).unwrap();
        let child_pub = compute_pubkey(child_priv.as_slice()).unwrap();
        assert_eq!(entries[0].pubkey().unwrap(), child_pub);
    }

    #[test]
    fn scheme_serialization_round_trips() {
        let schemes = [
            DerivationScheme::ArmoryLegacy {
                chaincode: SecureBytes::from([1u8; 32]),
            },
            DerivationScheme::Bip32 {
                chaincode: SecureBytes::from([2u8; 32]),
                depth: 4,
                leaf_id: 7,
            },
            DerivationScheme::Bip32Salted {
                chaincode: SecureBytes::from([3u8; 32]),
                depth: 1,
                leaf_id: 0,
                salt: SecureBytes::from([4u8; 32]),
            },
            DerivationScheme::Ecdh {
                salts: EcdhSalts::default(),
            },
        ];
        for scheme in schemes {
            let back = DerivationScheme::deserialize(&scheme.serialize()).unwrap();
            assert_eq!(scheme, back);
        }
    }
}
