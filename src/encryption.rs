//! Encrypted-datum data model.
//!
//! An encrypted datum is self-describing: its cipher spec names the
//! algorithm, IV, KDF and the encryption key it was wrapped under, so
//! decryption only needs to resolve the referenced master key (which may in
//! turn be encrypted, recursively). Master keys can carry several wraps at
//! once, one per passphrase that unlocks them.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, hash160, CryptoError, AES_BLOCK_SIZE};
use crate::kdf::KdfRomix;
use crate::prng::prng;
use crate::util::{BinaryReader, BinaryWriter, CodecError, SecureBytes};

/// Serialization tag for AES-256-CBC.
const CIPHER_TYPE_AES_CBC: u8 = 0x01;

/// Entry tags inside encrypted-asset records.
const ENCRYPTED_DATA_TAG_KEY: u8 = 0x81;
const ENCRYPTED_DATA_TAG_SEED: u8 = 0x82;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("unknown cipher algorithm tag: {0:#04x}")]
    UnknownCipher(u8),

    #[error("unknown encrypted data tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("cipher data already present for this key id")]
    DuplicateWrap,

    #[error("no cipher data for this key id")]
    UnknownWrap,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ----------------------------- CipherSpec -----------------------------

/// Names the algorithm, IV, KDF and encryption key of a ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherSpec {
    iv: Vec<u8>,
    kdf_id: Vec<u8>,
    encryption_key_id: Vec<u8>,
}

impl CipherSpec {
    /// New AES-CBC spec with a fresh random IV.
    pub fn aes_cbc(kdf_id: Vec<u8>, encryption_key_id: Vec<u8>) -> Self {
        Self {
            iv: prng().random_iv().to_vec(),
            kdf_id,
            encryption_key_id,
        }
    }

    /// Same key references, fresh IV. Every new ciphertext gets its own IV.
    pub fn fresh_iv(&self) -> Self {
        Self {
            iv: prng().random_iv().to_vec(),
            kdf_id: self.kdf_id.clone(),
            encryption_key_id: self.encryption_key_id.clone(),
        }
    }

    /// Same KDF, fresh IV, rewired to another encryption key.
    pub fn with_key_id(&self, encryption_key_id: Vec<u8>) -> Self {
        Self {
            iv: prng().random_iv().to_vec(),
            kdf_id: self.kdf_id.clone(),
            encryption_key_id,
        }
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn kdf_id(&self) -> &[u8] {
        &self.kdf_id
    }

    pub fn encryption_key_id(&self) -> &[u8] {
        &self.encryption_key_id
    }

    pub fn encrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(crypto::aes_cbc_encrypt(key, &self.iv, data)?)
    }

    pub fn decrypt(&self, key: &[u8], data: &[u8]) -> Result<SecureBytes, EncryptionError> {
        Ok(SecureBytes::new(crypto::aes_cbc_decrypt(
            key, &self.iv, data,
        )?))
    }

    pub fn serialize_into(&self, bw: &mut BinaryWriter) {
        bw.put_u8(CIPHER_TYPE_AES_CBC);
        bw.put_var_bytes(&self.iv);
        bw.put_var_bytes(&self.kdf_id);
        bw.put_var_bytes(&self.encryption_key_id);
    }

    pub fn deserialize_from(br: &mut BinaryReader<'_>) -> Result<Self, EncryptionError> {
        let tag = br.get_u8()?;
        if tag != CIPHER_TYPE_AES_CBC {
            return Err(EncryptionError::UnknownCipher(tag));
        }
        let iv = br.get_var_bytes()?;
        if iv.len() != AES_BLOCK_SIZE {
            return Err(EncryptionError::Codec(CodecError::BadLength(iv.len() as u64)));
        }
        let kdf_id = br.get_var_bytes()?;
        let encryption_key_id = br.get_var_bytes()?;
        Ok(Self {
            iv,
            kdf_id,
            encryption_key_id,
        })
    }
}

// ----------------------------- EncryptedData -----------------------------

/// Ciphertext plus the spec that produced it.
///
/// A datum without a cipher is a plaintext shadow: a declared slot whose
/// content was never computed (an unmaterialized private key). Decryption
/// of a shadow is reported as missing data, not as a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedData {
    cipher: Option<CipherSpec>,
    ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn new(cipher: CipherSpec, ciphertext: Vec<u8>) -> Self {
        Self {
            cipher: Some(cipher),
            ciphertext,
        }
    }

    /// Declared-but-uncomputed slot.
    pub fn shadow() -> Self {
        Self {
            cipher: None,
            ciphertext: Vec::new(),
        }
    }

    pub fn has_data(&self) -> bool {
        self.cipher.is_some() && !self.ciphertext.is_empty()
    }

    pub fn cipher(&self) -> Option<&CipherSpec> {
        self.cipher.as_ref()
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn serialize_into(&self, bw: &mut BinaryWriter) {
        match &self.cipher {
            Some(spec) => {
                bw.put_u8(1);
                spec.serialize_into(bw);
                bw.put_var_bytes(&self.ciphertext);
            }
            None => bw.put_u8(0),
        }
    }

    pub fn deserialize_from(br: &mut BinaryReader<'_>) -> Result<Self, EncryptionError> {
        match br.get_u8()? {
            0 => Ok(Self::shadow()),
            _ => {
                let cipher = CipherSpec::deserialize_from(br)?;
                let ciphertext = br.get_var_bytes()?;
                Ok(Self::new(cipher, ciphertext))
            }
        }
    }
}

// ----------------------------- CipherData -----------------------------

/// One wrap of a master key: ciphertext under one unlocker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherData {
    pub cipher: CipherSpec,
    pub ciphertext: Vec<u8>,
}

impl CipherData {
    pub fn serialize_into(&self, bw: &mut BinaryWriter) {
        self.cipher.serialize_into(bw);
        bw.put_var_bytes(&self.ciphertext);
    }

    pub fn deserialize_from(br: &mut BinaryReader<'_>) -> Result<Self, EncryptionError> {
        let cipher = CipherSpec::deserialize_from(br)?;
        let ciphertext = br.get_var_bytes()?;
        Ok(Self { cipher, ciphertext })
    }
}

// ----------------------------- EncryptionKeyAsset -----------------------------

/// A master encryption key at rest: one ciphertext per unlocker.
///
/// `replace = false` passphrase changes append wraps here, so several
/// passphrases can decrypt the same master key.
#[derive(Clone, Debug)]
pub struct EncryptionKeyAsset {
    id: Vec<u8>,
    wraps: BTreeMap<Vec<u8>, CipherData>,
}

impl EncryptionKeyAsset {
    pub fn new(id: Vec<u8>, cipher_data: CipherData) -> Self {
        let mut wraps = BTreeMap::new();
        wraps.insert(cipher_data.cipher.encryption_key_id().to_vec(), cipher_data);
        Self { id, wraps }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn wraps(&self) -> impl Iterator<Item = &CipherData> {
        self.wraps.values()
    }

    pub fn wrap_for_key_id(&self, key_id: &[u8]) -> Option<&CipherData> {
        self.wraps.get(key_id)
    }

    pub fn add_wrap(&mut self, cipher_data: CipherData) -> Result<(), EncryptionError> {
        let key_id = cipher_data.cipher.encryption_key_id().to_vec();
        if self.wraps.contains_key(&key_id) {
            return Err(EncryptionError::DuplicateWrap);
        }
        self.wraps.insert(key_id, cipher_data);
        Ok(())
    }

    pub fn remove_wrap(&mut self, key_id: &[u8]) -> Result<(), EncryptionError> {
        self.wraps
            .remove(key_id)
            .map(|_| ())
            .ok_or(EncryptionError::UnknownWrap)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bw = BinaryWriter::new();
        bw.put_u8(ENCRYPTED_DATA_TAG_KEY);
        bw.put_var_bytes(&self.id);
        bw.put_var_int(self.wraps.len() as u64);
        for wrap in self.wraps.values() {
            wrap.serialize_into(&mut bw);
        }
        bw.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, EncryptionError> {
        let mut br = BinaryReader::new(data);
        let tag = br.get_u8()?;
        if tag != ENCRYPTED_DATA_TAG_KEY {
            return Err(EncryptionError::UnknownTag(tag));
        }
        let id = br.get_var_bytes()?;
        let count = br.get_var_int()?;
        let mut wraps = BTreeMap::new();
        for _ in 0..count {
            let wrap = CipherData::deserialize_from(&mut br)?;
            wraps.insert(wrap.cipher.encryption_key_id().to_vec(), wrap);
        }
        br.expect_exhausted()?;
        Ok(Self { id, wraps })
    }
}

// ----------------------------- EncryptedSeed -----------------------------

/// The wallet's control seed, encrypted under the master key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedSeed(pub EncryptedData);

impl EncryptedSeed {
    pub fn serialize(&self) -> Vec<u8> {
        let mut bw = BinaryWriter::new();
        bw.put_u8(ENCRYPTED_DATA_TAG_SEED);
        self.0.serialize_into(&mut bw);
        bw.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, EncryptionError> {
        let mut br = BinaryReader::new(data);
        let tag = br.get_u8()?;
        if tag != ENCRYPTED_DATA_TAG_SEED {
            return Err(EncryptionError::UnknownTag(tag));
        }
        let inner = EncryptedData::deserialize_from(&mut br)?;
        br.expect_exhausted()?;
        Ok(Self(inner))
    }
}

// ----------------------------- DecryptedEncryptionKey -----------------------------

/// A decrypted master key (or raw passphrase) plus its per-KDF derivations.
///
/// The id of a derived key — `hash160(derived bytes)` — is how a candidate
/// passphrase is matched against the key id a cipher spec references.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DecryptedEncryptionKey {
    raw: SecureBytes,
    #[zeroize(skip)]
    derived_ids: HashMap<Vec<u8>, Vec<u8>>,
    derived: Vec<SecureBytes>,
    #[zeroize(skip)]
    derived_index: HashMap<Vec<u8>, usize>,
}

impl DecryptedEncryptionKey {
    pub fn new(raw: SecureBytes) -> Self {
        Self {
            raw,
            derived_ids: HashMap::new(),
            derived: Vec::new(),
            derived_index: HashMap::new(),
        }
    }

    pub fn raw(&self) -> &SecureBytes {
        &self.raw
    }

    /// Run the KDF over the raw key and cache the result under the KDF id.
    pub fn derive_key(&mut self, kdf: &KdfRomix) {
        if self.derived_index.contains_key(kdf.id()) {
            return;
        }
        let derived = kdf.derive(self.raw.as_slice());
        let id = hash160(derived.as_slice()).to_vec();
        self.derived_ids.insert(kdf.id().to_vec(), id);
        self.derived_index
            .insert(kdf.id().to_vec(), self.derived.len());
        self.derived.push(derived);
    }

    pub fn has_derivation(&self, kdf_id: &[u8]) -> bool {
        self.derived_index.contains_key(kdf_id)
    }

    pub fn derived_key(&self, kdf_id: &[u8]) -> Option<&SecureBytes> {
        self.derived_index.get(kdf_id).map(|&i| &self.derived[i])
    }

    /// Key id under a KDF it has been derived with.
    pub fn key_id(&self, kdf_id: &[u8]) -> Option<&[u8]> {
        self.derived_ids.get(kdf_id).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kdf() -> KdfRomix {
        KdfRomix::new(4096, 1, vec![0x5A; 32]).unwrap()
    }

    #[test]
    fn cipher_spec_round_trip() {
        let spec = CipherSpec::aes_cbc(vec![1; 20], vec![2; 20]);
        let mut bw = BinaryWriter::new();
        spec.serialize_into(&mut bw);
        let bytes = bw.into_bytes();
        let mut br = BinaryReader::new(&bytes);
        let back = CipherSpec::deserialize_from(&mut br).unwrap();
        assert_eq!(spec, back);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let spec = CipherSpec::aes_cbc(vec![1; 20], vec![2; 20]);
        let key = [7u8; 32];
        let ct = spec.encrypt(&key, b"secret scalar").unwrap();
        let pt = spec.decrypt(&key, &ct).unwrap();
        assert_eq!(pt.as_slice(), b"secret scalar");
    }

    #[test]
    fn shadow_has_no_data() {
        let shadow = EncryptedData::shadow();
        assert!(!shadow.has_data());

        let mut bw = BinaryWriter::new();
        shadow.serialize_into(&mut bw);
        let bytes = bw.into_bytes();
        let mut br = BinaryReader::new(&bytes);
        let back = EncryptedData::deserialize_from(&mut br).unwrap();
        assert!(!back.has_data());
    }

    #[test]
    fn key_asset_multi_wrap() {
        let spec_a = CipherSpec::aes_cbc(vec![1; 20], vec![0xAA; 20]);
        let spec_b = CipherSpec::aes_cbc(vec![1; 20], vec![0xBB; 20]);

        let mut asset = EncryptionKeyAsset::new(
            vec![0x01; 20],
            CipherData {
                cipher: spec_a.clone(),
                ciphertext: vec![1, 2, 3],
            },
        );
        asset
            .add_wrap(CipherData {
                cipher: spec_b,
                ciphertext: vec![4, 5, 6],
            })
            .unwrap();

        // duplicate wrap for the same unlocker is rejected
        assert!(matches!(
            asset.add_wrap(CipherData {
                cipher: spec_a,
                ciphertext: vec![9],
            }),
            Err(EncryptionError::DuplicateWrap)
        ));

        let back = EncryptionKeyAsset::deserialize(&asset.serialize()).unwrap();
        assert_eq!(back.wraps().count(), 2);
        assert!(back.wrap_for_key_id(&[0xAA; 20]).is_some());
        assert!(back.wrap_for_key_id(&[0xBB; 20]).is_some());

        asset.remove_wrap(&[0xAA; 20]).unwrap();
        assert!(asset.wrap_for_key_id(&[0xAA; 20]).is_none());
    }

    #[test]
    fn derived_key_ids_are_stable() {
        let kdf = test_kdf();
        let mut a = DecryptedEncryptionKey::new(SecureBytes::from(&b"passphrase"[..]));
        let mut b = DecryptedEncryptionKey::new(SecureBytes::from(&b"passphrase"[..]));
        a.derive_key(&kdf);
        b.derive_key(&kdf);
        assert_eq!(a.key_id(kdf.id()), b.key_id(kdf.id()));
        assert_eq!(a.derived_key(kdf.id()), b.derived_key(kdf.id()));

        let mut c = DecryptedEncryptionKey::new(SecureBytes::from(&b"other"[..]));
        c.derive_key(&kdf);
        assert_ne!(a.key_id(kdf.id()), c.key_id(kdf.id()));
    }
}
