//! Wallet file lifecycle.
//!
//! A wallet file holds a raw control area and a set of encrypted
//! sub-databases. The control area stores the wallet header (salts, key
//! ids) and the control seed, encrypted under the master key; the master
//! key itself is wrapped under the user passphrase (or the clear-text
//! default key, so passphrase-less wallets walk the same code path). The
//! decrypted seed is the root from which every sub-database derives its
//! record session keys.
//!
//! Opening a wallet prompts for the passphrase, decrypts the seed, opens
//! the header database, and reloads every address account.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::accounts::{AccountError, AccountType, AddressAccount, MetaDataAccount};
use crate::address::{AddressEntry, AddressType, PREFIX_P2PKH, PREFIX_P2SH, PREFIX_P2WPKH};
use crate::crypto::{ecdsa_sign, hash160, CryptoError};
use crate::db::{
    DbError, WalletDbInterface, ADDRESS_ACCOUNT_PREFIX, HEADER_DB_NAME, WALLETHEADER_PREFIX,
    WALLET_SEED_KEY,
};
use crate::ddc::{DdcError, DdcLock, DdcStore, DecryptedDataContainer, PassphrasePrompt};
use crate::encryption::{
    CipherData, CipherSpec, DecryptedEncryptionKey, EncryptedSeed, EncryptionError,
    EncryptionKeyAsset,
};
use crate::kdf::{KdfError, KdfRomix};
use crate::prng::prng;
use crate::signer::{ResolverFeed, SignerError};
use crate::util::{BinaryReader, BinaryWriter, CodecError, SecureBytes};

/// Control header id; the main sub-wallet derives its name from this.
const CONTROL_HEADER_ID: &[u8] = b"control";

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet file is not initialized")]
    NotInitialized,

    #[error("control seed record missing")]
    MissingSeed,

    #[error("malformed wallet header")]
    BadHeader,

    #[error("unknown address account")]
    UnknownAccount,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Ddc(#[from] DdcError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Kdf(#[from] KdfError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ----------------------------- WalletHeader -----------------------------

/// Persisted per-database header: salts and the key ids everything else
/// references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletHeader {
    pub wallet_id: Vec<u8>,
    pub control_salt: SecureBytes,
    pub default_key: SecureBytes,
    pub default_key_id: Vec<u8>,
    pub default_kdf_id: Vec<u8>,
    pub master_key_id: Vec<u8>,
}

impl WalletHeader {
    pub fn db_key(&self) -> Vec<u8> {
        let mut key = vec![WALLETHEADER_PREFIX];
        key.extend_from_slice(&self.wallet_id);
        key
    }

    pub fn db_name(&self) -> String {
        String::from_utf8_lossy(&self.wallet_id).into_owned()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bw = BinaryWriter::new();
        bw.put_var_bytes(&self.wallet_id);
        bw.put_var_bytes(self.control_salt.as_slice());
        bw.put_var_bytes(self.default_key.as_slice());
        bw.put_var_bytes(&self.default_key_id);
        bw.put_var_bytes(&self.default_kdf_id);
        bw.put_var_bytes(&self.master_key_id);
        bw.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, WalletError> {
        let mut br = BinaryReader::new(data);
        let header = Self {
            wallet_id: br.get_var_bytes()?,
            control_salt: SecureBytes::new(br.get_var_bytes()?),
            default_key: SecureBytes::new(br.get_var_bytes()?),
            default_key_id: br.get_var_bytes()?,
            default_kdf_id: br.get_var_bytes()?,
            master_key_id: br.get_var_bytes()?,
        };
        br.expect_exhausted().map_err(|_| WalletError::BadHeader)?;
        Ok(header)
    }
}

// ----------------------------- Wallet -----------------------------

/// An open wallet: the file, the key container, and the loaded accounts.
pub struct Wallet {
    iface: Arc<WalletDbInterface>,
    header: WalletHeader,
    ddc: Arc<DecryptedDataContainer>,
    seed: EncryptedSeed,
    main_db: String,
    accounts: BTreeMap<Vec<u8>, AddressAccount>,
    comments: MetaDataAccount,
}

impl Wallet {
    /// Create a fresh wallet file.
    ///
    /// The prompt is called once for the new passphrase; an empty return
    /// creates a passphrase-less wallet protected only by the on-disk
    /// default key.
    pub fn create(
        path: &Path,
        prompt: PassphrasePrompt,
        kdf: KdfRomix,
    ) -> Result<Self, WalletError> {
        let iface = WalletDbInterface::open(path)?;

        let passphrase = prompt(&Default::default());
        if passphrase.is_empty() {
            warn!("wallet created without passphrase, using default encryption key");
        }

        // master encryption key and its id under the kdf
        let master_raw = prng().random(32);
        let mut master = DecryptedEncryptionKey::new(master_raw.clone());
        master.derive_key(&kdf);
        let master_key_id = master
            .key_id(kdf.id())
            .expect("derived above")
            .to_vec();

        // clear-text default key, so unencrypted wallets share the code path
        let default_key = prng().random(32);
        let mut default_decrypted = DecryptedEncryptionKey::new(default_key.clone());
        default_decrypted.derive_key(&kdf);
        let default_key_id = default_decrypted
            .key_id(kdf.id())
            .expect("derived above")
            .to_vec();

        // top key: passphrase if given, default key otherwise
        let mut top = if passphrase.is_empty() {
            DecryptedEncryptionKey::new(default_key.clone())
        } else {
            DecryptedEncryptionKey::new(passphrase.clone())
        };
        top.derive_key(&kdf);
        let top_key_id = top.key_id(kdf.id()).expect("derived above").to_vec();
        let top_derived = top
            .derived_key(kdf.id())
            .expect("derived above")
            .clone();

        // wrap the master key under the top key
        let master_wrap_cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), top_key_id);
        let wrapped_master =
            master_wrap_cipher.encrypt(top_derived.as_slice(), master_raw.as_slice())?;
        let master_asset = EncryptionKeyAsset::new(
            master_key_id.clone(),
            CipherData {
                cipher: master_wrap_cipher,
                ciphertext: wrapped_master,
            },
        );

        let header = WalletHeader {
            wallet_id: CONTROL_HEADER_ID.to_vec(),
            control_salt: prng().random(32),
            default_key,
            default_key_id: default_key_id.clone(),
            default_kdf_id: kdf.id().to_vec(),
            master_key_id: master_key_id.clone(),
        };
        iface.control_put(&header.db_key(), &header.serialize())?;

        let ddc = Arc::new(DecryptedDataContainer::new(
            Arc::clone(&iface),
            DdcStore::Control,
            header.default_key.clone(),
            default_key_id,
            kdf.id().to_vec(),
            master_key_id.clone(),
        ));
        ddc.add_kdf(kdf.clone());
        ddc.add_encryption_key(master_asset);
        ddc.update_on_disk()?;

        // control seed, encrypted under the master key
        let seed_plain = prng().random(32);
        let seed = {
            let seed_prompt: PassphrasePrompt = {
                let passphrase = passphrase.clone();
                Arc::new(move |_ids| passphrase.clone())
            };
            let lock = ddc.lock(seed_prompt);
            let seed_cipher = CipherSpec::aes_cbc(kdf.id().to_vec(), master_key_id.clone());
            let ciphertext = ddc.encrypt_data(&lock, &seed_cipher, seed_plain.as_slice())?;
            EncryptedSeed(crate::encryption::EncryptedData::new(seed_cipher, ciphertext))
        };
        iface.control_put(&WALLET_SEED_KEY.to_be_bytes(), &seed.serialize())?;

        // header db plus one sub-wallet for accounts
        iface.set_db_count(1)?;
        iface.open_db(HEADER_DB_NAME, &header.control_salt, seed_plain.as_slice())?;

        let main_db = format!("wallet-{}", hex_id(&master_key_id));
        let main_header = WalletHeader {
            wallet_id: main_db.as_bytes().to_vec(),
            control_salt: prng().random(32),
            default_key: header.default_key.clone(),
            default_key_id: header.default_key_id.clone(),
            default_kdf_id: header.default_kdf_id.clone(),
            master_key_id: header.master_key_id.clone(),
        };
        {
            let tx = iface.begin_write_transaction(HEADER_DB_NAME)?;
            tx.insert(&main_header.db_key(), &main_header.serialize())?;
            tx.commit()?;
        }
        iface.open_db(&main_db, &main_header.control_salt, seed_plain.as_slice())?;

        let comments = MetaDataAccount::new(Arc::clone(&iface), &main_db);

        Ok(Self {
            iface,
            header,
            ddc,
            seed,
            main_db,
            accounts: BTreeMap::new(),
            comments,
        })
    }

    /// Open an existing wallet file, prompting for the passphrase.
    pub fn open(path: &Path, prompt: PassphrasePrompt) -> Result<Self, WalletError> {
        let iface = WalletDbInterface::open(path)?;

        let mut header_key = vec![WALLETHEADER_PREFIX];
        header_key.extend_from_slice(CONTROL_HEADER_ID);
        let header_bytes = iface
            .control_get(&header_key)?
            .ok_or(WalletError::NotInitialized)?;
        let header = WalletHeader::deserialize(&header_bytes)?;

        let ddc = Arc::new(DecryptedDataContainer::new(
            Arc::clone(&iface),
            DdcStore::Control,
            header.default_key.clone(),
            header.default_key_id.clone(),
            header.default_kdf_id.clone(),
            header.master_key_id.clone(),
        ));
        ddc.read_from_disk()?;

        let seed_bytes = iface
            .control_get(&WALLET_SEED_KEY.to_be_bytes())?
            .ok_or(WalletError::MissingSeed)?;
        let seed = EncryptedSeed::deserialize(&seed_bytes)?;

        // decrypt the seed; this is where the passphrase is verified
        let seed_plain = {
            let lock = ddc.lock(prompt);
            ddc.get_private_data(&lock, &seed.0)?
        };

        iface.open_db(HEADER_DB_NAME, &header.control_salt, seed_plain.as_slice())?;

        // sub-wallet headers
        let mut main_db = None;
        {
            let tx = iface.begin_read_transaction(HEADER_DB_NAME)?;
            for (_, value) in tx.iter_prefix(&[WALLETHEADER_PREFIX]) {
                let sub = WalletHeader::deserialize(&value)?;
                iface.open_db(&sub.db_name(), &sub.control_salt, seed_plain.as_slice())?;
                main_db.get_or_insert(sub.db_name());
            }
        }
        let main_db = main_db.ok_or(WalletError::NotInitialized)?;

        // reload accounts
        let mut accounts = BTreeMap::new();
        {
            let tx = iface.begin_read_transaction(&main_db)?;
            let ids: Vec<Vec<u8>> = tx
                .iter_prefix(&[ADDRESS_ACCOUNT_PREFIX])
                .into_iter()
                .map(|(k, _)| k[1..].to_vec())
                .collect();
            drop(tx);
            for id in ids {
                let account = AddressAccount::read_from_disk(
                    Arc::clone(&iface),
                    &main_db,
                    &id,
                    crate::accounts::DEFAULT_LOOKUP,
                )?;
                accounts.insert(id, account);
            }
        }

        let comments = MetaDataAccount::read_from_disk(Arc::clone(&iface), &main_db)?;

        Ok(Self {
            iface,
            header,
            ddc,
            seed,
            main_db,
            accounts,
            comments,
        })
    }

    // ----------------------------- Accessors -----------------------------

    pub fn iface(&self) -> &Arc<WalletDbInterface> {
        &self.iface
    }

    pub fn ddc(&self) -> &Arc<DecryptedDataContainer> {
        &self.ddc
    }

    pub fn header(&self) -> &WalletHeader {
        &self.header
    }

    pub fn main_db_name(&self) -> &str {
        &self.main_db
    }

    pub fn comments(&mut self) -> &mut MetaDataAccount {
        &mut self.comments
    }

    pub fn account_ids(&self) -> Vec<Vec<u8>> {
        self.accounts.keys().cloned().collect()
    }

    pub fn account(&self, id: &[u8]) -> Option<&AddressAccount> {
        self.accounts.get(id)
    }

    pub fn account_mut(&mut self, id: &[u8]) -> Option<&mut AddressAccount> {
        self.accounts.get_mut(id)
    }

    /// Cipher spec new private keys are wrapped under.
    pub fn master_cipher(&self) -> CipherSpec {
        CipherSpec::aes_cbc(
            self.header.default_kdf_id.clone(),
            self.header.master_key_id.clone(),
        )
    }

    /// Acquire the key container.
    pub fn unlock(&self, prompt: PassphrasePrompt) -> DdcLock<'_> {
        self.ddc.lock(prompt)
    }

    /// Decrypt the control seed (backup export).
    pub fn decrypt_seed(&self, lock: &DdcLock<'_>) -> Result<SecureBytes, WalletError> {
        Ok(self.ddc.get_private_data(lock, &self.seed.0)?)
    }

    // ----------------------------- Accounts -----------------------------

    /// Build, commit, and register an address account from a blueprint.
    pub fn create_address_account(
        &mut self,
        acc_type: &AccountType,
        prompt: PassphrasePrompt,
    ) -> Result<Vec<u8>, WalletError> {
        let cipher = self.master_cipher();
        let mut account = {
            let lock = self.ddc.lock(prompt);
            AddressAccount::make_new(
                Arc::clone(&self.iface),
                &self.main_db,
                acc_type,
                &self.ddc,
                Some(&lock),
                Some(&cipher),
            )?
        };
        account.commit()?;
        let id = account.id().to_vec();
        self.accounts.insert(id.clone(), account);
        Ok(id)
    }

    pub fn get_new_address(
        &mut self,
        account_id: &[u8],
        ae_type: Option<AddressType>,
    ) -> Result<AddressEntry, WalletError> {
        let account = self
            .accounts
            .get_mut(account_id)
            .ok_or(WalletError::UnknownAccount)?;
        Ok(account.get_new_address(ae_type)?)
    }

    pub fn get_new_change_address(
        &mut self,
        account_id: &[u8],
        ae_type: Option<AddressType>,
    ) -> Result<AddressEntry, WalletError> {
        let account = self
            .accounts
            .get_mut(account_id)
            .ok_or(WalletError::UnknownAccount)?;
        Ok(account.get_new_change_address(ae_type)?)
    }

    // ----------------------------- Passphrase -----------------------------

    /// Rotate or add a passphrase on the master key.
    pub fn change_passphrase(
        &self,
        prompt: PassphrasePrompt,
        new_passphrase: SecureBytes,
        replace: bool,
    ) -> Result<(), WalletError> {
        self.ddc.change_passphrase(
            prompt,
            &self.header.master_key_id,
            &self.header.default_kdf_id,
            new_passphrase,
            replace,
        )?;
        Ok(())
    }

    // ----------------------------- Watching-only copy -----------------------------

    /// Export a watching-only wallet file: same account structure, every
    /// private key stripped.
    pub fn watching_only_copy(&self, path: &Path) -> Result<Wallet, WalletError> {
        let empty_prompt: PassphrasePrompt = Arc::new(|_ids| SecureBytes::empty());
        let kdf = self
            .ddc
            .get_kdf(&self.header.default_kdf_id)
            .ok_or(WalletError::BadHeader)?;
        let mut wo = Wallet::create(path, empty_prompt, kdf)?;

        for (id, account) in &self.accounts {
            let mut copy =
                account.get_watching_only_copy(Arc::clone(&wo.iface), &wo.main_db);
            copy.commit()?;
            wo.accounts.insert(id.clone(), copy);
        }
        Ok(wo)
    }
}

fn hex_id(id: &[u8]) -> String {
    hex::encode(&id[..id.len().min(4)])
}

// ----------------------------- Account resolver feed -----------------------------

/// Resolver feed bound to one address account and the wallet's DDC: looks
/// keys up through the account's hash index and materializes private keys
/// on demand for signing.
pub struct AccountResolverFeed<'a> {
    account: RefCell<&'a mut AddressAccount>,
    ddc: &'a DecryptedDataContainer,
    lock: &'a DdcLock<'a>,
    /// Extra preimages (multisig scripts and the like), keyed by both their
    /// hash160 and sha256.
    extra_scripts: RefCell<HashMap<Vec<u8>, Vec<u8>>>,
}

impl<'a> AccountResolverFeed<'a> {
    pub fn new(
        account: &'a mut AddressAccount,
        ddc: &'a DecryptedDataContainer,
        lock: &'a DdcLock<'a>,
    ) -> Self {
        Self {
            account: RefCell::new(account),
            ddc,
            lock,
            extra_scripts: RefCell::new(HashMap::new()),
        }
    }

    /// Register a script preimage the account itself does not know (e.g. a
    /// multisig witness script assembled across wallets).
    pub fn register_script(&self, script: &[u8]) {
        let mut map = self.extra_scripts.borrow_mut();
        map.insert(crate::script::script_hash160(script).to_vec(), script.to_vec());
        map.insert(crate::script::script_sha256(script).to_vec(), script.to_vec());
    }

    /// Find the asset id behind a bare hash160, trying each script
    /// namespace prefix the index may know it under.
    fn asset_id_for_h160(&self, h160: &[u8]) -> Option<Vec<u8>> {
        let mut account = self.account.borrow_mut();
        for prefix in [PREFIX_P2PKH, PREFIX_P2WPKH, PREFIX_P2SH] {
            let mut prefixed = vec![prefix];
            prefixed.extend_from_slice(h160);
            if let Ok((asset_id, _)) = account.get_asset_id_pair_for_addr(&prefixed) {
                return Some(asset_id);
            }
        }
        None
    }
}

impl ResolverFeed for AccountResolverFeed<'_> {
    fn pubkey_for_hash160(&self, h160: &[u8]) -> Result<Vec<u8>, SignerError> {
        let asset_id = self.asset_id_for_h160(h160).ok_or(SignerError::MissingKey)?;
        let account = self.account.borrow();
        let asset = account
            .get_asset_for_id(&asset_id[4..])
            .map_err(|_| SignerError::MissingKey)?;
        let pubkey = asset.pubkey().map_err(|_| SignerError::MissingKey)?;
        Ok(pubkey.to_vec())
    }

    fn script_for_hash(&self, hash: &[u8]) -> Result<Vec<u8>, SignerError> {
        if let Some(script) = self.extra_scripts.borrow().get(hash) {
            return Ok(script.clone());
        }

        // nested single-key addresses: rebuild the witness program
        if hash.len() == 20 {
            let mut prefixed = vec![PREFIX_P2SH];
            prefixed.extend_from_slice(hash);
            let mut account = self.account.borrow_mut();
            if let Ok((asset_id, _)) = account.get_asset_id_pair_for_addr(&prefixed) {
                let entry = account
                    .get_address_entry_for_id(&asset_id)
                    .map_err(|_| SignerError::MissingKey)?;
                if let Some(inner) = entry.inner_script {
                    return Ok(inner);
                }
            }
        }
        Err(SignerError::MissingKey)
    }

    fn bip32_path_for_pubkey(&self, pubkey: &[u8]) -> Option<Vec<u32>> {
        let asset_id = self.asset_id_for_h160(&hash160(pubkey))?;
        self.account.borrow().bip32_path_for_asset_id(&asset_id)
    }

    fn sign(
        &self,
        _script: &[u8],
        pubkey: &[u8],
        digest: &[u8; 32],
    ) -> Result<Vec<u8>, SignerError> {
        let asset_id = self
            .asset_id_for_h160(&hash160(pubkey))
            .ok_or(SignerError::MissingKey)?;

        let priv_asset = self
            .account
            .borrow_mut()
            .fill_private_key(self.ddc, self.lock, &asset_id)
            .map_err(|_| SignerError::MissingKey)?;
        let priv_key = self
            .ddc
            .get_private_data(self.lock, &priv_asset.data)
            .map_err(|_| SignerError::MissingKey)?;

        Ok(ecdsa_sign(digest, priv_key.as_slice())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_kdf() -> KdfRomix {
        KdfRomix::new(4096, 1, prng().random(32).to_vec()).unwrap()
    }

    fn prompt_of(pass: &'static [u8]) -> PassphrasePrompt {
        Arc::new(move |_ids| SecureBytes::from(pass))
    }

    #[test]
    fn create_and_reopen_wallet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet");

        let header = {
            let wallet = Wallet::create(&path, prompt_of(b"hunter2"), small_kdf()).unwrap();
            wallet.header().clone()
        };

        let wallet = Wallet::open(&path, prompt_of(b"hunter2")).unwrap();
        assert_eq!(wallet.header(), &header);
    }

    #[test]
    fn wrong_passphrase_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet");
        Wallet::create(&path, prompt_of(b"right"), small_kdf()).unwrap();

        // prompt gives up after the wrong attempt
        let tries = std::sync::atomic::AtomicUsize::new(0);
        let prompt: PassphrasePrompt = Arc::new(move |_ids| {
            if tries.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                SecureBytes::from(&b"wrong"[..])
            } else {
                SecureBytes::empty()
            }
        });
        assert!(Wallet::open(&path, prompt).is_err());
    }

    #[test]
    fn passphrase_less_wallet_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet");
        let empty: PassphrasePrompt = Arc::new(|_ids| SecureBytes::empty());
        Wallet::create(&path, empty.clone(), small_kdf()).unwrap();
        Wallet::open(&path, empty).unwrap();
    }

    #[test]
    fn seed_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wallet");

        let seed_a = {
            let wallet = Wallet::create(&path, prompt_of(b"pw"), small_kdf()).unwrap();
            let lock = wallet.unlock(prompt_of(b"pw"));
            wallet.decrypt_seed(&lock).unwrap()
        };
        let seed_b = {
            let wallet = Wallet::open(&path, prompt_of(b"pw")).unwrap();
            let lock = wallet.unlock(prompt_of(b"pw"));
            wallet.decrypt_seed(&lock).unwrap()
        };
        assert_eq!(seed_a, seed_b);
    }
}
