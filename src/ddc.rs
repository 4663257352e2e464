//! Decrypted-data container.
//!
//! All decrypted key material lives behind a scope guard: [`lock`] hands out
//! a [`DdcLock`] witness, every accessor demands one, and when the last
//! guard drops the cache zeroizes. Decryption walks the key graph upward —
//! a datum names its encryption key, that key may itself be wrapped under
//! another key — until it reaches a key that is already decrypted or must be
//! derived from a passphrase via the prompt protocol.
//!
//! [`lock`]: DecryptedDataContainer::lock

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;
use zeroize::Zeroize;

use crate::crypto::sha256;
use crate::db::{
    DbError, WalletDbInterface, ENCRYPTIONKEY_PREFIX, ENCRYPTIONKEY_PREFIX_TEMP, KDF_PREFIX,
};
use crate::encryption::{
    CipherData, CipherSpec, DecryptedEncryptionKey, EncryptedData, EncryptionError,
    EncryptionKeyAsset,
};
use crate::kdf::{KdfError, KdfRomix};
use crate::util::SecureBytes;

/// Caller-supplied passphrase source: given the set of candidate key ids,
/// return the passphrase to try. An empty return aborts the attempt.
pub type PassphrasePrompt = Arc<dyn Fn(&BTreeSet<Vec<u8>>) -> SecureBytes + Send + Sync>;

#[derive(Debug, Error)]
pub enum DdcError {
    #[error("container lock is held elsewhere")]
    LockHeld,

    #[error("encrypted payload missing (uncomputed private key)")]
    EncryptedDataMissing,

    #[error("no passphrase yielded the referenced key")]
    DecryptionFailed,

    #[error("passphrase prompt returned empty bytes")]
    EmptyPassphrase,

    #[error("no passphrase prompt installed")]
    MissingPrompt,

    #[error("unknown encryption key id")]
    UnknownKey,

    #[error("unknown kdf id")]
    UnknownKdf,

    #[error("kdf id does not match its record key")]
    KdfIdMismatch,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Kdf(#[from] KdfError),
}

// ----------------------------- Cache -----------------------------

struct DecryptedCache {
    /// keyId → decrypted encryption key (with its per-KDF derivations)
    keys: BTreeMap<Vec<u8>, DecryptedEncryptionKey>,
    /// digest of (iv ‖ ciphertext) → decrypted payload
    private_data: BTreeMap<[u8; 32], SecureBytes>,
}

impl DecryptedCache {
    fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
            private_data: BTreeMap::new(),
        }
    }
}

struct DdcInner {
    guards: u32,
    prompt: Option<PassphrasePrompt>,
    cache: Option<DecryptedCache>,
    encrypted_keys: BTreeMap<Vec<u8>, EncryptionKeyAsset>,
    kdfs: BTreeMap<Vec<u8>, KdfRomix>,
}

// ----------------------------- Container -----------------------------

/// Where a container keeps its key and KDF records: the raw control tree
/// (readable before any session key exists) or an encrypted sub-database.
#[derive(Clone)]
pub enum DdcStore {
    Control,
    Encrypted(String),
}

/// Scoped decryption cache for one store's key material.
pub struct DecryptedDataContainer {
    iface: Arc<WalletDbInterface>,
    store: DdcStore,

    default_key: SecureBytes,
    default_key_id: Vec<u8>,
    default_kdf_id: Vec<u8>,
    master_key_id: Vec<u8>,

    inner: Mutex<DdcInner>,
}

/// Witness that the container is locked. Private data is only reachable
/// while one of these is alive.
pub struct DdcLock<'a> {
    ddc: &'a DecryptedDataContainer,
}

impl Drop for DdcLock<'_> {
    fn drop(&mut self) {
        let mut inner = self.ddc.inner.lock().expect("ddc poisoned");
        inner.guards -= 1;
        if inner.guards == 0 {
            inner.cache = None;
            inner.prompt = None;
        }
    }
}

impl DecryptedDataContainer {
    pub fn new(
        iface: Arc<WalletDbInterface>,
        store: DdcStore,
        default_key: SecureBytes,
        default_key_id: Vec<u8>,
        default_kdf_id: Vec<u8>,
        master_key_id: Vec<u8>,
    ) -> Self {
        Self {
            iface,
            store,
            default_key,
            default_key_id,
            default_kdf_id,
            master_key_id,
            inner: Mutex::new(DdcInner {
                guards: 0,
                prompt: None,
                cache: None,
                encrypted_keys: BTreeMap::new(),
                kdfs: BTreeMap::new(),
            }),
        }
    }

    pub fn master_key_id(&self) -> &[u8] {
        &self.master_key_id
    }

    pub fn default_kdf_id(&self) -> &[u8] {
        &self.default_kdf_id
    }

    pub fn default_key_id(&self) -> &[u8] {
        &self.default_key_id
    }

    pub fn add_encryption_key(&self, asset: EncryptionKeyAsset) {
        let mut inner = self.inner.lock().expect("ddc poisoned");
        inner.encrypted_keys.insert(asset.id().to_vec(), asset);
    }

    pub fn add_kdf(&self, kdf: KdfRomix) {
        let mut inner = self.inner.lock().expect("ddc poisoned");
        inner.kdfs.insert(kdf.id().to_vec(), kdf);
    }

    pub fn get_kdf(&self, kdf_id: &[u8]) -> Option<KdfRomix> {
        let inner = self.inner.lock().expect("ddc poisoned");
        inner.kdfs.get(kdf_id).cloned()
    }

    /// Acquire the container, installing the passphrase prompt for the
    /// lifetime of the lock. Reentrant: nested locks share the cache.
    pub fn lock(&self, prompt: PassphrasePrompt) -> DdcLock<'_> {
        let mut inner = self.inner.lock().expect("ddc poisoned");
        inner.guards += 1;
        inner.prompt = Some(prompt);
        if inner.cache.is_none() {
            let mut cache = DecryptedCache::new();
            // the default key is always available in clear text
            cache.keys.insert(
                self.default_key_id.clone(),
                DecryptedEncryptionKey::new(self.default_key.clone()),
            );
            inner.cache = Some(cache);
        }
        drop(inner);
        DdcLock { ddc: self }
    }

    /// Single-owner acquisition: fails if any other guard is alive, so the
    /// passphrase used for decryption inside is unambiguous.
    pub fn lock_exclusive(&self, prompt: PassphrasePrompt) -> Result<DdcLock<'_>, DdcError> {
        {
            let inner = self.inner.lock().expect("ddc poisoned");
            if inner.guards > 0 {
                return Err(DdcError::LockHeld);
            }
        }
        Ok(self.lock(prompt))
    }

    // ----------------------------- Decryption -----------------------------

    /// Decrypt a datum, resolving (and caching) its key chain on demand.
    pub fn get_private_data(
        &self,
        _lock: &DdcLock<'_>,
        data: &EncryptedData,
    ) -> Result<SecureBytes, DdcError> {
        if !data.has_data() {
            // plaintext shadow: the slot exists, the payload was never
            // computed; the caller decides whether to extend the chain
            return Err(DdcError::EncryptedDataMissing);
        }
        let cipher = data.cipher().expect("has_data implies cipher");

        let mut digest_input = cipher.iv().to_vec();
        digest_input.extend_from_slice(data.ciphertext());
        let cache_key = sha256(&digest_input);
        digest_input.zeroize();

        let mut inner = self.inner.lock().expect("ddc poisoned");
        if let Some(cached) = inner
            .cache
            .as_ref()
            .and_then(|c| c.private_data.get(&cache_key))
        {
            return Ok(cached.clone());
        }

        let mut key_map = BTreeMap::new();
        key_map.insert(
            cipher.encryption_key_id().to_vec(),
            cipher.kdf_id().to_vec(),
        );
        let (key_id, kdf_id) = Self::populate_encryption_key(&mut inner, &key_map)?;

        let cache = inner.cache.as_mut().expect("populated above");
        let derived = cache
            .keys
            .get(&key_id)
            .and_then(|k| k.derived_key(&kdf_id))
            .ok_or(DdcError::DecryptionFailed)?;

        let plain = cipher.decrypt(derived.as_slice(), data.ciphertext())?;
        cache.private_data.insert(cache_key, plain.clone());
        Ok(plain)
    }

    /// Encrypt under the key the cipher spec references, resolving it first.
    pub fn encrypt_data(
        &self,
        _lock: &DdcLock<'_>,
        cipher: &CipherSpec,
        data: &[u8],
    ) -> Result<Vec<u8>, DdcError> {
        let mut inner = self.inner.lock().expect("ddc poisoned");

        let mut key_map = BTreeMap::new();
        key_map.insert(
            cipher.encryption_key_id().to_vec(),
            cipher.kdf_id().to_vec(),
        );
        let (key_id, kdf_id) = Self::populate_encryption_key(&mut inner, &key_map)?;

        let cache = inner.cache.as_ref().expect("populated above");
        let derived = cache
            .keys
            .get(&key_id)
            .and_then(|k| k.derived_key(&kdf_id))
            .ok_or(DdcError::DecryptionFailed)?;

        Ok(cipher.encrypt(derived.as_slice(), data)?)
    }

    /// Resolve every key in `key_map` into the decrypted cache, recursing
    /// through wrapping keys and finally prompting for a passphrase.
    /// Returns the `(keyId, kdfId)` pair that ended the search.
    fn populate_encryption_key(
        inner: &mut DdcInner,
        key_map: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>), DdcError> {
        // already decrypted?
        let mut found: Option<(Vec<u8>, Vec<u8>)> = None;
        {
            let cache = inner.cache.as_ref().ok_or(DdcError::LockHeld)?;
            for (key_id, kdf_id) in key_map {
                if cache.keys.contains_key(key_id) {
                    found = Some((key_id.clone(), kdf_id.clone()));
                    break;
                }
            }
        }

        // encrypted in the container? unwrap it first
        if found.is_none() {
            for (key_id, kdf_id) in key_map {
                let Some(asset) = inner.encrypted_keys.get(key_id).cloned() else {
                    continue;
                };

                let parent_map: BTreeMap<Vec<u8>, Vec<u8>> = asset
                    .wraps()
                    .map(|w| {
                        (
                            w.cipher.encryption_key_id().to_vec(),
                            w.cipher.kdf_id().to_vec(),
                        )
                    })
                    .collect();
                Self::populate_encryption_key(inner, &parent_map)?;

                let mut unwrapped = false;
                for wrap in asset.wraps() {
                    let unlocker_id = wrap.cipher.encryption_key_id().to_vec();
                    let wrap_kdf_id = wrap.cipher.kdf_id().to_vec();

                    let kdf = match inner.kdfs.get(&wrap_kdf_id) {
                        Some(k) => k.clone(),
                        None => continue,
                    };
                    let cache = inner.cache.as_mut().expect("cache alive");
                    let Some(unlocker) = cache.keys.get_mut(&unlocker_id) else {
                        continue;
                    };
                    unlocker.derive_key(&kdf);
                    let derived = unlocker
                        .derived_key(kdf.id())
                        .expect("derived just above")
                        .clone();

                    let raw = wrap.cipher.decrypt(derived.as_slice(), &wrap.ciphertext)?;
                    cache
                        .keys
                        .insert(key_id.clone(), DecryptedEncryptionKey::new(raw));
                    unwrapped = true;
                    break;
                }

                if !unwrapped {
                    return Err(DdcError::DecryptionFailed);
                }
                found = Some((key_id.clone(), kdf_id.clone()));
                break;
            }
        }

        // still nothing: ask the user
        if found.is_none() {
            found = Some(Self::prompt_passphrase(inner, key_map)?);
        }

        let (key_id, kdf_id) = found.expect("set in every arm");

        // make sure the kdf derivation for the requested pair exists
        let kdf = inner
            .kdfs
            .get(&kdf_id)
            .cloned()
            .ok_or(DdcError::UnknownKdf)?;
        let cache = inner.cache.as_mut().ok_or(DdcError::LockHeld)?;
        let entry = cache.keys.get_mut(&key_id).ok_or(DdcError::DecryptionFailed)?;
        entry.derive_key(&kdf);

        Ok((key_id, kdf_id))
    }

    /// Prompt loop: try each returned passphrase against every candidate
    /// `(keyId, kdfId)` pair until one matches. The passphrase itself is
    /// dropped as soon as the derived key is verified.
    fn prompt_passphrase(
        inner: &mut DdcInner,
        key_map: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>), DdcError> {
        let prompt = inner.prompt.clone().ok_or(DdcError::MissingPrompt)?;
        let key_set: BTreeSet<Vec<u8>> = key_map.keys().cloned().collect();

        loop {
            let passphrase = prompt(&key_set);
            if passphrase.is_empty() {
                return Err(DdcError::EmptyPassphrase);
            }

            let mut candidate = DecryptedEncryptionKey::new(passphrase);
            for (key_id, kdf_id) in key_map {
                let Some(kdf) = inner.kdfs.get(kdf_id).cloned() else {
                    continue;
                };
                candidate.derive_key(&kdf);
                if candidate.key_id(kdf.id()) == Some(key_id.as_slice()) {
                    let cache = inner.cache.as_mut().ok_or(DdcError::LockHeld)?;
                    cache.keys.insert(key_id.clone(), candidate);
                    return Ok((key_id.clone(), kdf_id.clone()));
                }
            }
        }
    }

    // ----------------------------- Record store access -----------------------------

    fn store_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DdcError> {
        match &self.store {
            DdcStore::Control => Ok(self.iface.control_get(key)?),
            DdcStore::Encrypted(db_name) => {
                let tx = self.iface.begin_read_transaction(db_name)?;
                Ok(tx.get(key))
            }
        }
    }

    /// Apply writes (`Some`) and removals (`None`) as one unit.
    fn store_write(&self, ops: &[(Vec<u8>, Option<Vec<u8>>)]) -> Result<(), DdcError> {
        match &self.store {
            DdcStore::Control => {
                for (key, value) in ops {
                    match value {
                        Some(v) => self.iface.control_put(key, v)?,
                        None => self.iface.control_del(key)?,
                    }
                }
                Ok(())
            }
            DdcStore::Encrypted(db_name) => {
                let tx = self.iface.begin_write_transaction(db_name)?;
                for (key, value) in ops {
                    match value {
                        Some(v) => tx.insert(key, v)?,
                        None => tx.wipe(key)?,
                    }
                }
                tx.commit()?;
                Ok(())
            }
        }
    }

    fn store_iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DdcError> {
        match &self.store {
            DdcStore::Control => Ok(self.iface.control_iter_prefix(prefix)?),
            DdcStore::Encrypted(db_name) => {
                let tx = self.iface.begin_read_transaction(db_name)?;
                Ok(tx.iter_prefix(prefix))
            }
        }
    }

    // ----------------------------- Passphrase rotation -----------------------------

    /// Re-wrap a master key under a new passphrase. With `replace`, the wrap
    /// that decrypted the key is removed; otherwise the new wrap is added
    /// alongside, giving the key several valid unlockers.
    ///
    /// Requires single ownership: any live guard makes the "current
    /// passphrase" ambiguous, so the call fails instead.
    pub fn change_passphrase(
        &self,
        prompt: PassphrasePrompt,
        key_id: &[u8],
        kdf_id: &[u8],
        new_passphrase: SecureBytes,
        replace: bool,
    ) -> Result<(), DdcError> {
        if new_passphrase.is_empty() {
            return Err(DdcError::EmptyPassphrase);
        }

        let guard = self.lock_exclusive(prompt)?;

        let updated_asset = {
            let mut inner = self.inner.lock().expect("ddc poisoned");

            let mut asset = inner
                .encrypted_keys
                .get(key_id)
                .cloned()
                .ok_or(DdcError::UnknownKey)?;

            // decrypt the master key with whatever passphrase the user
            // supplies through the prompt
            let mut key_map = BTreeMap::new();
            key_map.insert(key_id.to_vec(), kdf_id.to_vec());
            Self::populate_encryption_key(&mut inner, &key_map)?;

            let kdf = inner
                .kdfs
                .get(kdf_id)
                .cloned()
                .ok_or(DdcError::UnknownKdf)?;

            let cache = inner.cache.as_mut().expect("populated above");
            let master_raw = cache
                .keys
                .get(key_id)
                .ok_or(DdcError::DecryptionFailed)?
                .raw()
                .clone();

            // which unlocker decrypted it? the one whose id is both in the
            // cache and among the asset's wraps
            let old_wrap = cache
                .keys
                .keys()
                .find_map(|cached_id| asset.wrap_for_key_id(cached_id))
                .cloned()
                .ok_or(DdcError::DecryptionFailed)?;

            // derive the new unlocker and its id
            let mut new_key = DecryptedEncryptionKey::new(new_passphrase);
            new_key.derive_key(&kdf);
            let new_key_id = new_key
                .key_id(kdf.id())
                .expect("derived just above")
                .to_vec();
            let new_derived = new_key
                .derived_key(kdf.id())
                .expect("derived just above")
                .clone();

            let new_cipher = old_wrap.cipher.with_key_id(new_key_id.clone());
            let new_ciphertext = new_cipher.encrypt(new_derived.as_slice(), master_raw.as_slice())?;

            cache.keys.insert(new_key_id, new_key);

            if replace {
                asset.remove_wrap(old_wrap.cipher.encryption_key_id())?;
            }
            asset.add_wrap(CipherData {
                cipher: new_cipher,
                ciphertext: new_ciphertext,
            })?;

            inner
                .encrypted_keys
                .insert(asset.id().to_vec(), asset.clone());
            asset
        };

        // Crash-safe shuffle: stage the new record under a temp key, then
        // overwrite the permanent record in one write, then drop the stage.
        // The permanent slot is never without a value on disk; a crash
        // between any two steps leaves a state `read_from_disk` recovers.
        let mut temp_key = vec![ENCRYPTIONKEY_PREFIX_TEMP];
        temp_key.extend_from_slice(key_id);
        let mut perm_key = vec![ENCRYPTIONKEY_PREFIX];
        perm_key.extend_from_slice(key_id);
        let serialized = updated_asset.serialize();

        self.store_write(&[(temp_key.clone(), Some(serialized.clone()))])?;
        self.store_write(&[(perm_key, Some(serialized))])?;
        self.store_write(&[(temp_key, None)])?;

        drop(guard);
        Ok(())
    }

    // ----------------------------- Persistence -----------------------------

    /// Write encryption keys and KDFs, skipping records already on disk
    /// with identical content.
    pub fn update_on_disk(&self) -> Result<(), DdcError> {
        let mut ops: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        {
            let inner = self.inner.lock().expect("ddc poisoned");

            // changed records overwrite in place; the encrypted store wipes
            // the stale slot on its own, and the control store replaces the
            // value in a single write
            for (id, asset) in &inner.encrypted_keys {
                let mut key = vec![ENCRYPTIONKEY_PREFIX];
                key.extend_from_slice(id);
                let serialized = asset.serialize();
                match self.store_get(&key)? {
                    Some(existing) if existing == serialized => {}
                    _ => ops.push((key, Some(serialized))),
                }
            }

            for (id, kdf) in &inner.kdfs {
                let mut key = vec![KDF_PREFIX];
                key.extend_from_slice(id);
                let serialized = kdf.serialize();
                match self.store_get(&key)? {
                    Some(existing) if existing == serialized => {}
                    _ => ops.push((key, Some(serialized))),
                }
            }
        }

        self.store_write(&ops)
    }

    /// Restore encryption keys and KDFs from their records.
    ///
    /// Finishes any passphrase rotation that was interrupted mid-shuffle:
    /// a staged temp record whose permanent counterpart is missing is
    /// promoted, a stale one is dropped.
    pub fn read_from_disk(&self) -> Result<(), DdcError> {
        for (temp_key, staged) in self.store_iter_prefix(&[ENCRYPTIONKEY_PREFIX_TEMP])? {
            let mut perm_key = vec![ENCRYPTIONKEY_PREFIX];
            perm_key.extend_from_slice(&temp_key[1..]);
            if self.store_get(&perm_key)?.is_none() {
                warn!("promoting staged encryption key from interrupted rotation");
                self.store_write(&[(perm_key, Some(staged))])?;
            }
            self.store_write(&[(temp_key, None)])?;
        }

        let key_records = self.store_iter_prefix(&[ENCRYPTIONKEY_PREFIX])?;
        let kdf_records = self.store_iter_prefix(&[KDF_PREFIX])?;
        let mut inner = self.inner.lock().expect("ddc poisoned");

        for (key, value) in key_records {
            let asset = EncryptionKeyAsset::deserialize(&value)?;
            if key[1..] != *asset.id() {
                return Err(DdcError::KdfIdMismatch);
            }
            inner.encrypted_keys.insert(asset.id().to_vec(), asset);
        }

        for (key, value) in kdf_records {
            let kdf = KdfRomix::deserialize(&value)?;
            if key[1..] != *kdf.id() {
                return Err(DdcError::KdfIdMismatch);
            }
            inner.kdfs.insert(kdf.id().to_vec(), kdf);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::HEADER_DB_NAME;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn fixed_prompt(pass: &'static [u8]) -> PassphrasePrompt {
        Arc::new(move |_ids| SecureBytes::from(pass))
    }

    fn make_container(iface: &Arc<WalletDbInterface>, kdf: &KdfRomix) -> DecryptedDataContainer {
        let default_key = SecureBytes::from([0x07u8; 32]);
        let mut default_decrypted = DecryptedEncryptionKey::new(default_key.clone());
        default_decrypted.derive_key(kdf);
        let default_key_id = default_decrypted.key_id(kdf.id()).unwrap().to_vec();

        DecryptedDataContainer::new(
            Arc::clone(iface),
            DdcStore::Encrypted(HEADER_DB_NAME.to_string()),
            default_key,
            default_key_id,
            kdf.id().to_vec(),
            Vec::new(),
        )
    }

    fn build_container(dir: &TempDir) -> (Arc<WalletDbInterface>, DecryptedDataContainer, KdfRomix)
    {
        let iface = WalletDbInterface::open(&dir.path().join("wallet.db")).unwrap();
        let salt = SecureBytes::from([0x31u8; 32]);
        let root = vec![0x32u8; 32];
        iface.open_db(HEADER_DB_NAME, &salt, &root).unwrap();

        let kdf = KdfRomix::new(4096, 1, vec![0x99; 32]).unwrap();
        let ddc = make_container(&iface, &kdf);
        ddc.add_kdf(kdf.clone());
        (iface, ddc, kdf)
    }

    /// Wrap a fresh master key under `passphrase`, register it, and return
    /// `(masterKeyId, master raw bytes)`.
    fn install_master_key(
        ddc: &DecryptedDataContainer,
        kdf: &KdfRomix,
        passphrase: &[u8],
    ) -> (Vec<u8>, SecureBytes) {
        let master_raw = SecureBytes::from([0x55u8; 32]);
        let mut master = DecryptedEncryptionKey::new(master_raw.clone());
        master.derive_key(kdf);
        let master_id = master.key_id(kdf.id()).unwrap().to_vec();

        let mut unlocker = DecryptedEncryptionKey::new(SecureBytes::from(passphrase));
        unlocker.derive_key(kdf);
        let unlocker_id = unlocker.key_id(kdf.id()).unwrap().to_vec();
        let derived = unlocker.derived_key(kdf.id()).unwrap();

        let cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), unlocker_id);
        let ciphertext = cipher.encrypt(derived.as_slice(), master_raw.as_slice()).unwrap();

        let asset = EncryptionKeyAsset::new(master_id.clone(), CipherData { cipher, ciphertext });
        ddc.add_encryption_key(asset);
        (master_id, master_raw)
    }

    #[test]
    fn decrypts_datum_through_prompted_key() {
        let dir = TempDir::new().unwrap();
        let (_iface, ddc, kdf) = build_container(&dir);
        let (master_id, _) = install_master_key(&ddc, &kdf, b"hunter2");

        // encrypt a payload under the master key
        let lock = ddc.lock(fixed_prompt(b"hunter2"));
        let cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), master_id);
        let ciphertext = ddc.encrypt_data(&lock, &cipher, b"private scalar").unwrap();
        let datum = EncryptedData::new(cipher, ciphertext);

        let plain = ddc.get_private_data(&lock, &datum).unwrap();
        assert_eq!(plain.as_slice(), b"private scalar");
    }

    #[test]
    fn wrong_then_right_passphrase_retries() {
        let dir = TempDir::new().unwrap();
        let (_iface, ddc, kdf) = build_container(&dir);
        let (master_id, _) = install_master_key(&ddc, &kdf, b"correct");

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_prompt = Arc::clone(&attempts);
        let prompt: PassphrasePrompt = Arc::new(move |_ids| {
            let n = attempts_in_prompt.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                SecureBytes::from(&b"wrong"[..])
            } else {
                SecureBytes::from(&b"correct"[..])
            }
        });

        let lock = ddc.lock(prompt);
        let cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), master_id);
        let ct = ddc.encrypt_data(&lock, &cipher, b"payload").unwrap();
        let datum = EncryptedData::new(cipher, ct);
        assert_eq!(
            ddc.get_private_data(&lock, &datum).unwrap().as_slice(),
            b"payload"
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_passphrase_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (_iface, ddc, kdf) = build_container(&dir);
        let (master_id, _) = install_master_key(&ddc, &kdf, b"secret");

        let lock = ddc.lock(fixed_prompt(b""));
        let cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), master_id);
        assert!(matches!(
            ddc.encrypt_data(&lock, &cipher, b"x"),
            Err(DdcError::EmptyPassphrase)
        ));
    }

    #[test]
    fn shadow_datum_reports_missing_not_failed() {
        let dir = TempDir::new().unwrap();
        let (_iface, ddc, _kdf) = build_container(&dir);

        let lock = ddc.lock(fixed_prompt(b"any"));
        let shadow = EncryptedData::shadow();
        assert!(matches!(
            ddc.get_private_data(&lock, &shadow),
            Err(DdcError::EncryptedDataMissing)
        ));
    }

    #[test]
    fn exclusive_lock_fails_when_held() {
        let dir = TempDir::new().unwrap();
        let (_iface, ddc, _kdf) = build_container(&dir);

        let _held = ddc.lock(fixed_prompt(b"x"));
        assert!(matches!(
            ddc.lock_exclusive(fixed_prompt(b"x")),
            Err(DdcError::LockHeld)
        ));
    }

    #[test]
    fn interrupted_rotation_promotes_staged_record() {
        let dir = TempDir::new().unwrap();
        let (iface, ddc, kdf) = build_container(&dir);
        let (master_id, _) = install_master_key(&ddc, &kdf, b"secret");
        ddc.update_on_disk().unwrap();

        let mut perm_key = vec![ENCRYPTIONKEY_PREFIX];
        perm_key.extend_from_slice(&master_id);
        let mut temp_key = vec![ENCRYPTIONKEY_PREFIX_TEMP];
        temp_key.extend_from_slice(&master_id);

        // simulate a crash right after staging: the new record sits under
        // the temp key and the permanent slot is gone
        {
            let tx = iface.begin_write_transaction(HEADER_DB_NAME).unwrap();
            let record = tx.get(&perm_key).unwrap();
            tx.insert(&temp_key, &record).unwrap();
            tx.wipe(&perm_key).unwrap();
            tx.commit().unwrap();
        }

        // a fresh load promotes the staged record and clears the stage
        let recovered = make_container(&iface, &kdf);
        recovered.read_from_disk().unwrap();

        let tx = iface.begin_read_transaction(HEADER_DB_NAME).unwrap();
        assert!(tx.get(&perm_key).is_some());
        assert!(tx.get(&temp_key).is_none());
        drop(tx);

        // the promoted key still unlocks
        let lock = recovered.lock(fixed_prompt(b"secret"));
        let cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), master_id);
        recovered.encrypt_data(&lock, &cipher, b"probe").unwrap();
    }

    #[test]
    fn change_passphrase_add_then_replace() {
        let dir = TempDir::new().unwrap();
        let (_iface, ddc, kdf) = build_container(&dir);
        let (master_id, _) = install_master_key(&ddc, &kdf, b"alpha");

        let unlock = |pass: &'static [u8], ddc: &DecryptedDataContainer| -> Result<(), DdcError> {
            let lock = ddc.lock(fixed_prompt(pass));
            let cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), master_id.clone());
            ddc.encrypt_data(&lock, &cipher, b"probe").map(|_| ())
        };

        // add "beta" alongside "alpha"
        ddc.change_passphrase(
            fixed_prompt(b"alpha"),
            &master_id,
            kdf.id(),
            SecureBytes::from(&b"beta"[..]),
            false,
        )
        .unwrap();
        unlock(b"alpha", &ddc).unwrap();
        unlock(b"beta", &ddc).unwrap();

        // replace "alpha" with "gamma"
        ddc.change_passphrase(
            fixed_prompt(b"alpha"),
            &master_id,
            kdf.id(),
            SecureBytes::from(&b"gamma"[..]),
            true,
        )
        .unwrap();

        // "alpha" now dead-ends into the retry loop; the prompt returning
        // empty on the second call surfaces the failure
        let tried = Arc::new(AtomicUsize::new(0));
        let tried_in_prompt = Arc::clone(&tried);
        let alpha_then_give_up: PassphrasePrompt = Arc::new(move |_ids| {
            if tried_in_prompt.fetch_add(1, Ordering::SeqCst) == 0 {
                SecureBytes::from(&b"alpha"[..])
            } else {
                SecureBytes::empty()
            }
        });
        {
            let lock = ddc.lock(alpha_then_give_up);
            let cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), master_id.clone());
            assert!(matches!(
                ddc.encrypt_data(&lock, &cipher, b"probe"),
                Err(DdcError::EmptyPassphrase)
            ));
        }

        unlock(b"beta", &ddc).unwrap();
        unlock(b"gamma", &ddc).unwrap();
    }
}
