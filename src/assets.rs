//! Asset entries: the leaves of the wallet key tree.
//!
//! An asset is a public key at a numeric index inside an asset account,
//! optionally carrying its private key as an encrypted datum. BIP32 roots
//! add the extended-key metadata needed to derive children; multisig
//! entries bundle one single asset per cosigner.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::db::ASSETENTRY_PREFIX;
use crate::encryption::{CipherSpec, EncryptedData, EncryptionError};
use crate::util::{BinaryReader, BinaryWriter, CodecError, SecureBytes};

/// Persisted index of an account-root entry (`-1` in memory).
pub const ROOT_ASSET_SENTINEL: u32 = 0xFFFF_FFFF;

/// In-memory index of an account-root entry.
pub const ROOT_ASSET_INDEX: i64 = -1;

const ASSET_TAG_SINGLE: u8 = 0x01;
const ASSET_TAG_BIP32_ROOT: u8 = 0x02;
const ASSET_TAG_MULTISIG: u8 = 0x03;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("unknown asset tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("invalid asset id length: {0}")]
    InvalidId(usize),

    #[error("asset has no private key")]
    NoPrivateKey,

    #[error("asset has no single public key")]
    NoPubKey,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

/// Persisted index for an in-memory index.
pub fn index_to_wire(index: i64) -> u32 {
    if index == ROOT_ASSET_INDEX {
        ROOT_ASSET_SENTINEL
    } else {
        index as u32
    }
}

/// In-memory index for a persisted one.
pub fn index_from_wire(wire: u32) -> i64 {
    if wire == ROOT_ASSET_SENTINEL {
        ROOT_ASSET_INDEX
    } else {
        wire as i64
    }
}

// ----------------------------- Private key slot -----------------------------

/// Encrypted private key attached to an asset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateKeyAsset {
    pub id: Vec<u8>,
    pub data: EncryptedData,
}

impl PrivateKeyAsset {
    pub fn new(id: Vec<u8>, cipher: CipherSpec, ciphertext: Vec<u8>) -> Self {
        Self {
            id,
            data: EncryptedData::new(cipher, ciphertext),
        }
    }

    /// Declared slot whose key bytes were never derived.
    pub fn shadow(id: Vec<u8>) -> Self {
        Self {
            id,
            data: EncryptedData::shadow(),
        }
    }

    fn serialize_into(&self, bw: &mut BinaryWriter) {
        bw.put_var_bytes(&self.id);
        self.data.serialize_into(bw);
    }

    fn deserialize_from(br: &mut BinaryReader<'_>) -> Result<Self, AssetError> {
        let id = br.get_var_bytes()?;
        let data = EncryptedData::deserialize_from(br)?;
        Ok(Self { id, data })
    }
}

// ----------------------------- Single -----------------------------

/// Compressed public key, optional encrypted private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetSingle {
    index: i64,
    account_id: Vec<u8>,
    pubkey: Vec<u8>,
    private_key: Option<PrivateKeyAsset>,
    needs_commit: bool,
}

impl AssetSingle {
    pub fn new(
        index: i64,
        account_id: Vec<u8>,
        pubkey: Vec<u8>,
        private_key: Option<PrivateKeyAsset>,
    ) -> Self {
        Self {
            index,
            account_id,
            pubkey,
            private_key,
            needs_commit: true,
        }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn account_id(&self) -> &[u8] {
        &self.account_id
    }

    pub fn pubkey(&self) -> &[u8] {
        &self.pubkey
    }

    pub fn private_key(&self) -> Option<&PrivateKeyAsset> {
        self.private_key.as_ref()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key
            .as_ref()
            .map(|p| p.data.has_data())
            .unwrap_or(false)
    }

    pub fn set_private_key(&mut self, private_key: PrivateKeyAsset) {
        self.private_key = Some(private_key);
        self.needs_commit = true;
    }

    /// Full 12-byte asset id: accountId ‖ indexBE.
    pub fn id(&self) -> Vec<u8> {
        let mut id = self.account_id.clone();
        id.extend_from_slice(&index_to_wire(self.index).to_be_bytes());
        id
    }

    pub fn public_copy(&self) -> Self {
        Self {
            index: self.index,
            account_id: self.account_id.clone(),
            pubkey: self.pubkey.clone(),
            private_key: None,
            needs_commit: true,
        }
    }

    fn serialize_into(&self, bw: &mut BinaryWriter) {
        bw.put_var_bytes(&self.pubkey);
        match &self.private_key {
            Some(pk) => {
                bw.put_u8(1);
                pk.serialize_into(bw);
            }
            None => bw.put_u8(0),
        }
    }

    fn deserialize_from(
        br: &mut BinaryReader<'_>,
        index: i64,
        account_id: Vec<u8>,
    ) -> Result<Self, AssetError> {
        let pubkey = br.get_var_bytes()?;
        let private_key = match br.get_u8()? {
            0 => None,
            _ => Some(PrivateKeyAsset::deserialize_from(br)?),
        };
        Ok(Self {
            index,
            account_id,
            pubkey,
            private_key,
            needs_commit: false,
        })
    }
}

// ----------------------------- BIP32 root -----------------------------

/// Single plus the extended-key context of a BIP32 node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetBip32Root {
    pub single: AssetSingle,
    pub chaincode: SecureBytes,
    pub depth: u8,
    pub leaf_id: u32,
    pub parent_fingerprint: u32,
    pub seed_fingerprint: u32,
    pub derivation_path: Vec<u32>,
}

impl AssetBip32Root {
    fn serialize_into(&self, bw: &mut BinaryWriter) {
        self.single.serialize_into(bw);
        bw.put_var_bytes(self.chaincode.as_slice());
        bw.put_u8(self.depth);
        bw.put_u32_be(self.leaf_id);
        bw.put_u32_be(self.parent_fingerprint);
        bw.put_u32_be(self.seed_fingerprint);
        bw.put_var_int(self.derivation_path.len() as u64);
        for step in &self.derivation_path {
            bw.put_u32_be(*step);
        }
    }

    fn deserialize_from(
        br: &mut BinaryReader<'_>,
        index: i64,
        account_id: Vec<u8>,
    ) -> Result<Self, AssetError> {
        let single = AssetSingle::deserialize_from(br, index, account_id)?;
        let chaincode = SecureBytes::new(br.get_var_bytes()?);
        let depth = br.get_u8()?;
        let leaf_id = br.get_u32_be()?;
        let parent_fingerprint = br.get_u32_be()?;
        let seed_fingerprint = br.get_u32_be()?;
        let step_count = br.get_var_int()?;
        let mut derivation_path = Vec::with_capacity(step_count as usize);
        for _ in 0..step_count {
            derivation_path.push(br.get_u32_be()?);
        }
        Ok(Self {
            single,
            chaincode,
            depth,
            leaf_id,
            parent_fingerprint,
            seed_fingerprint,
            derivation_path,
        })
    }
}

// ----------------------------- Multisig -----------------------------

/// Ordered cosigner keys plus the M-of-N parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetMultisig {
    pub index: i64,
    pub account_id: Vec<u8>,
    pub m: u8,
    pub n: u8,
    pub assets: BTreeMap<u32, AssetSingle>,
}

impl AssetMultisig {
    fn serialize_into(&self, bw: &mut BinaryWriter) {
        bw.put_u8(self.m);
        bw.put_u8(self.n);
        bw.put_var_int(self.assets.len() as u64);
        for (pos, asset) in &self.assets {
            bw.put_u32_be(*pos);
            asset.serialize_into(bw);
        }
    }

    fn deserialize_from(
        br: &mut BinaryReader<'_>,
        index: i64,
        account_id: Vec<u8>,
    ) -> Result<Self, AssetError> {
        let m = br.get_u8()?;
        let n = br.get_u8()?;
        let count = br.get_var_int()?;
        let mut assets = BTreeMap::new();
        for _ in 0..count {
            let pos = br.get_u32_be()?;
            let asset = AssetSingle::deserialize_from(br, index, account_id.clone())?;
            assets.insert(pos, asset);
        }
        Ok(Self {
            index,
            account_id,
            m,
            n,
            assets,
        })
    }
}

// ----------------------------- AssetEntry -----------------------------

/// Any entry in an asset account's index → asset map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetEntry {
    Single(AssetSingle),
    Bip32Root(AssetBip32Root),
    Multisig(AssetMultisig),
}

impl AssetEntry {
    pub fn index(&self) -> i64 {
        match self {
            AssetEntry::Single(a) => a.index,
            AssetEntry::Bip32Root(a) => a.single.index,
            AssetEntry::Multisig(a) => a.index,
        }
    }

    pub fn account_id(&self) -> &[u8] {
        match self {
            AssetEntry::Single(a) => &a.account_id,
            AssetEntry::Bip32Root(a) => &a.single.account_id,
            AssetEntry::Multisig(a) => &a.account_id,
        }
    }

    /// Full 12-byte asset id.
    pub fn id(&self) -> Vec<u8> {
        let mut id = self.account_id().to_vec();
        id.extend_from_slice(&index_to_wire(self.index()).to_be_bytes());
        id
    }

    /// Logical db key for this entry.
    pub fn db_key(&self) -> Vec<u8> {
        let mut key = vec![ASSETENTRY_PREFIX];
        key.extend_from_slice(&self.id());
        key
    }

    pub fn has_private_key(&self) -> bool {
        match self {
            AssetEntry::Single(a) => a.has_private_key(),
            AssetEntry::Bip32Root(a) => a.single.has_private_key(),
            AssetEntry::Multisig(a) => {
                !a.assets.is_empty() && a.assets.values().all(|s| s.has_private_key())
            }
        }
    }

    /// The single compressed public key, where one exists.
    pub fn pubkey(&self) -> Result<&[u8], AssetError> {
        match self {
            AssetEntry::Single(a) => Ok(a.pubkey()),
            AssetEntry::Bip32Root(a) => Ok(a.single.pubkey()),
            AssetEntry::Multisig(_) => Err(AssetError::NoPubKey),
        }
    }

    pub fn private_key(&self) -> Option<&PrivateKeyAsset> {
        match self {
            AssetEntry::Single(a) => a.private_key(),
            AssetEntry::Bip32Root(a) => a.single.private_key(),
            AssetEntry::Multisig(_) => None,
        }
    }

    pub fn as_single(&self) -> Option<&AssetSingle> {
        match self {
            AssetEntry::Single(a) => Some(a),
            AssetEntry::Bip32Root(a) => Some(&a.single),
            AssetEntry::Multisig(_) => None,
        }
    }

    /// Copy with all private material stripped.
    pub fn public_copy(&self) -> Self {
        match self {
            AssetEntry::Single(a) => AssetEntry::Single(a.public_copy()),
            AssetEntry::Bip32Root(a) => AssetEntry::Bip32Root(AssetBip32Root {
                single: a.single.public_copy(),
                chaincode: a.chaincode.clone(),
                depth: a.depth,
                leaf_id: a.leaf_id,
                parent_fingerprint: a.parent_fingerprint,
                seed_fingerprint: a.seed_fingerprint,
                derivation_path: a.derivation_path.clone(),
            }),
            AssetEntry::Multisig(a) => {
                let assets = a
                    .assets
                    .iter()
                    .map(|(pos, s)| (*pos, s.public_copy()))
                    .collect();
                AssetEntry::Multisig(AssetMultisig {
                    index: a.index,
                    account_id: a.account_id.clone(),
                    m: a.m,
                    n: a.n,
                    assets,
                })
            }
        }
    }

    pub fn needs_commit(&self) -> bool {
        match self {
            AssetEntry::Single(a) => a.needs_commit,
            AssetEntry::Bip32Root(a) => a.single.needs_commit,
            AssetEntry::Multisig(_) => true,
        }
    }

    pub fn flag_for_commit(&mut self) {
        match self {
            AssetEntry::Single(a) => a.needs_commit = true,
            AssetEntry::Bip32Root(a) => a.single.needs_commit = true,
            AssetEntry::Multisig(_) => {}
        }
    }

    pub fn clear_commit_flag(&mut self) {
        match self {
            AssetEntry::Single(a) => a.needs_commit = false,
            AssetEntry::Bip32Root(a) => a.single.needs_commit = false,
            AssetEntry::Multisig(_) => {}
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bw = BinaryWriter::new();
        match self {
            AssetEntry::Single(a) => {
                bw.put_u8(ASSET_TAG_SINGLE);
                a.serialize_into(&mut bw);
            }
            AssetEntry::Bip32Root(a) => {
                bw.put_u8(ASSET_TAG_BIP32_ROOT);
                a.serialize_into(&mut bw);
            }
            AssetEntry::Multisig(a) => {
                bw.put_u8(ASSET_TAG_MULTISIG);
                a.serialize_into(&mut bw);
            }
        }
        bw.into_bytes()
    }

    /// Rebuild from a db record; the id comes from the record key.
    pub fn deserialize(db_key: &[u8], value: &[u8]) -> Result<Self, AssetError> {
        // ASSETENTRY_PREFIX ‖ 8B account ‖ 4B index
        if db_key.len() != 13 || db_key[0] != ASSETENTRY_PREFIX {
            return Err(AssetError::InvalidId(db_key.len()));
        }
        let account_id = db_key[1..9].to_vec();
        let wire_index =
            u32::from_be_bytes(db_key[9..13].try_into().expect("checked length"));
        let index = index_from_wire(wire_index);

        let mut br = BinaryReader::new(value);
        let entry = match br.get_u8()? {
            ASSET_TAG_SINGLE => {
                AssetEntry::Single(AssetSingle::deserialize_from(&mut br, index, account_id)?)
            }
            ASSET_TAG_BIP32_ROOT => AssetEntry::Bip32Root(AssetBip32Root::deserialize_from(
                &mut br, index, account_id,
            )?),
            ASSET_TAG_MULTISIG => AssetEntry::Multisig(AssetMultisig::deserialize_from(
                &mut br, index, account_id,
            )?),
            other => return Err(AssetError::UnknownTag(other)),
        };
        br.expect_exhausted()?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::CipherSpec;

    fn account_id() -> Vec<u8> {
        vec![1, 2, 3, 4, 5, 6, 7, 8]
    }

    #[test]
    fn single_round_trip() {
        let asset = AssetEntry::Single(AssetSingle::new(
            7,
            account_id(),
            vec![0x02; 33],
            Some(PrivateKeyAsset::new(
                vec![9; 12],
                CipherSpec::aes_cbc(vec![1; 20], vec![2; 20]),
                vec![0xEE; 48],
            )),
        ));

        let back = AssetEntry::deserialize(&asset.db_key(), &asset.serialize()).unwrap();
        assert_eq!(back.index(), 7);
        assert_eq!(back.account_id(), account_id());
        assert!(back.has_private_key());
        assert_eq!(back.pubkey().unwrap(), &[0x02; 33][..]);
    }

    #[test]
    fn root_sentinel_round_trip() {
        let root = AssetEntry::Bip32Root(AssetBip32Root {
            single: AssetSingle::new(ROOT_ASSET_INDEX, account_id(), vec![0x03; 33], None),
            chaincode: SecureBytes::from([0x44u8; 32]),
            depth: 3,
            leaf_id: 2,
            parent_fingerprint: 0xDEADBEEF,
            seed_fingerprint: 0xFEEDFACE,
            derivation_path: vec![0x8000002C, 0x80000000, 0],
        });

        let db_key = root.db_key();
        // sentinel index on the wire
        assert_eq!(&db_key[9..13], &ROOT_ASSET_SENTINEL.to_be_bytes());

        let back = AssetEntry::deserialize(&db_key, &root.serialize()).unwrap();
        assert_eq!(back.index(), ROOT_ASSET_INDEX);
        match back {
            AssetEntry::Bip32Root(r) => {
                assert_eq!(r.depth, 3);
                assert_eq!(r.derivation_path.len(), 3);
                assert_eq!(r.parent_fingerprint, 0xDEADBEEF);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn multisig_requires_all_private_keys() {
        let mut assets = BTreeMap::new();
        assets.insert(0, AssetSingle::new(0, account_id(), vec![0x02; 33], None));
        assets.insert(
            1,
            AssetSingle::new(
                0,
                account_id(),
                vec![0x03; 33],
                Some(PrivateKeyAsset::new(
                    vec![1; 12],
                    CipherSpec::aes_cbc(vec![1; 20], vec![2; 20]),
                    vec![0xAB; 48],
                )),
            ),
        );

        let ms = AssetEntry::Multisig(AssetMultisig {
            index: 0,
            account_id: account_id(),
            m: 2,
            n: 2,
            assets,
        });
        assert!(!ms.has_private_key());
        assert!(ms.pubkey().is_err());

        let back = AssetEntry::deserialize(&ms.db_key(), &ms.serialize()).unwrap();
        match back {
            AssetEntry::Multisig(b) => {
                assert_eq!(b.m, 2);
                assert_eq!(b.assets.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn public_copy_strips_private_material() {
        let asset = AssetEntry::Single(AssetSingle::new(
            0,
            account_id(),
            vec![0x02; 33],
            Some(PrivateKeyAsset::new(
                vec![1; 12],
                CipherSpec::aes_cbc(vec![1; 20], vec![2; 20]),
                vec![0xAB; 48],
            )),
        ));
        let copy = asset.public_copy();
        assert!(!copy.has_private_key());
        assert_eq!(copy.pubkey().unwrap(), asset.pubkey().unwrap());
    }
}
