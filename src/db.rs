//! Encrypted record store.
//!
//! Callers address records by logical key, but nothing recognizable ever
//! reaches the file: each record is an IES envelope (ephemeral secp256k1
//! ECDH, AES-256-CBC, HMAC-SHA256 bound to the record's slot) written under
//! an opaque rotating 4-byte integer db-key. Updates never overwrite in
//! place — the old slot is wiped, an erasure placeholder records the hole,
//! and the new payload lands at a fresh slot, so write patterns do not leak
//! which logical record changed.
//!
//! Session keys are numbered. Every load appends a key-cycle marker and
//! bumps the counter, so each session encrypts under a key the previous
//! session never used.
//!
//! Transactions buffer writes per `(db, thread)`; reopening a transaction on
//! the same thread nests inside the outer one and shares its buffer. The
//! outermost `commit` flushes; dropping the outermost guard uncommitted
//! rolls everything back.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::crypto::{
    self, hmac_sha256, hmac_sha512, sha256d, CryptoError, AES_BLOCK_SIZE, COMPRESSED_PUBKEY_LEN,
};
use crate::prng::prng;
use crate::util::{BinaryReader, BinaryWriter, CodecError, SecureBytes};

// ----------------------------- Logical key prefixes -----------------------------

pub const ADDRESS_ACCOUNT_PREFIX: u8 = 0xD0;
pub const ADDRESS_TYPE_PREFIX: u8 = 0xD2;
pub const ASSET_ACCOUNT_PREFIX: u8 = 0xE1;
pub const ASSET_COUNT_PREFIX: u8 = 0xE2;
pub const ASSET_TOP_INDEX_PREFIX: u8 = 0xE3;
pub const ASSETENTRY_PREFIX: u8 = 0xAA;
pub const ECDH_SALT_PREFIX: u8 = 0xE5;
pub const ENCRYPTIONKEY_PREFIX: u8 = 0xC0;
pub const ENCRYPTIONKEY_PREFIX_TEMP: u8 = 0xC1;
pub const KDF_PREFIX: u8 = 0xC2;
pub const META_ACCOUNT_PREFIX: u8 = 0xF1;
pub const METADATA_COMMENT_PREFIX: u8 = 0xF2;
pub const WALLETHEADER_PREFIX: u8 = 0xB1;

/// Control-seed record key, 4 bytes big-endian.
pub const WALLET_SEED_KEY: u32 = 0x0000_5EED;

pub const CONTROL_DB_NAME: &str = "control";
pub const HEADER_DB_NAME: &str = "headers";

/// Marker body of an erasure placeholder record.
const ERASURE_PLACEHOLDER: &[u8] = b"erased";

/// Marker body of a session key-cycle record.
const KEY_CYCLE_FLAG: &[u8] = b"cycleflag";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("record mac mismatch")]
    MacMismatch,

    #[error("corrupt record envelope: {0}")]
    Envelope(&'static str),

    #[error("unfilled db-key gaps after load")]
    UnfilledGap,

    #[error("duplicate logical key across records")]
    DuplicateKey,

    #[error("record with empty logical key is not a known marker")]
    UnknownMetaPacket,

    #[error("invalid session decryption key")]
    InvalidSessionKey,

    #[error("write operation on a read transaction")]
    ReadOnlyTransaction,

    #[error("transaction of opposite mode already open on this thread")]
    TxModeMismatch,

    #[error("transaction is no longer registered")]
    TxGone,

    #[error("erase of a logical key that does not exist")]
    EraseMissingKey,

    #[error("unknown database: {0}")]
    UnknownDb(String),

    #[error("database already open: {0}")]
    DbAlreadyOpen(String),

    #[error("sub-database count exceeded")]
    DbCountExceeded,

    #[error("live transactions forbid this operation")]
    LiveTransactions,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
}

// ----------------------------- Record envelope -----------------------------

fn compute_session_keys(
    salted_root: &[u8],
    counter: u32,
) -> Result<(SecureBytes, SecureBytes), DbError> {
    let hmac_val = hmac_sha512(&counter.to_be_bytes(), salted_root);
    let decr_priv = SecureBytes::from(&hmac_val[..32]);
    let mac_key = SecureBytes::from(&hmac_val[32..]);

    if !crypto::check_private_key(decr_priv.as_slice()) {
        return Err(DbError::InvalidSessionKey);
    }
    Ok((decr_priv, mac_key))
}

/// Build the IES envelope for one record slot.
fn create_data_packet(
    db_key: u32,
    data_key: &[u8],
    data_val: &[u8],
    encr_pub: &[u8; 33],
    mac_key: &[u8],
) -> Result<Vec<u8>, DbError> {
    // authentication leg
    let mut payload = BinaryWriter::new();
    payload.put_var_bytes(data_key);
    payload.put_var_bytes(data_val);

    let mut mac_input = BinaryWriter::with_capacity(payload.len() + 4);
    mac_input.put_bytes(payload.as_slice());
    mac_input.put_u32_be(db_key);
    let mac = hmac_sha256(mac_key, mac_input.as_slice());

    let mut plain = BinaryWriter::with_capacity(32 + payload.len());
    plain.put_bytes(&mac);
    plain.put_bytes(payload.as_slice());

    // ephemeral encryption key
    let local_priv = loop {
        let candidate = prng().random(32);
        if crypto::check_private_key(candidate.as_slice()) {
            break candidate;
        }
    };
    let local_pub = crypto::compute_pubkey(local_priv.as_slice())?;
    let ecdh_point = crypto::pubkey_scalar_multiply(encr_pub, local_priv.as_slice())?;
    let encr_key = sha256d(&ecdh_point);

    // encryption leg
    let iv = prng().random_iv();
    let cipher_text = crypto::aes_cbc_encrypt(&encr_key, &iv, plain.as_slice())?;

    let mut packet = BinaryWriter::with_capacity(33 + 16 + cipher_text.len());
    packet.put_bytes(&local_pub);
    packet.put_bytes(&iv);
    packet.put_bytes(&cipher_text);
    Ok(packet.into_bytes())
}

/// Open an IES envelope; returns `(logical key, value)`.
fn read_data_packet(
    db_key: u32,
    packet: &[u8],
    decr_priv: &[u8],
    mac_key: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), DbError> {
    if packet.len() < COMPRESSED_PUBKEY_LEN + AES_BLOCK_SIZE * 2 {
        return Err(DbError::Envelope("truncated envelope"));
    }

    let mut br = BinaryReader::new(packet);
    let local_pub = br.get_bytes(COMPRESSED_PUBKEY_LEN)?;
    let iv = br.get_bytes(AES_BLOCK_SIZE)?;
    let cipher_text = br.get_rest();

    let ecdh_point = crypto::pubkey_scalar_multiply(&local_pub, decr_priv)?;
    let encr_key = sha256d(&ecdh_point);
    let plain = crypto::aes_cbc_decrypt(&encr_key, &iv, &cipher_text)?;

    let mut br = BinaryReader::new(&plain);
    let mac = br.get_bytes(32)?;
    let data_key = br.get_var_bytes()?;
    let data_val = br.get_var_bytes()?;
    br.expect_exhausted()
        .map_err(|_| DbError::Envelope("loose data after record"))?;

    let mut mac_input = BinaryWriter::new();
    mac_input.put_bytes(&plain[32..]);
    mac_input.put_u32_be(db_key);
    let computed = hmac_sha256(mac_key, mac_input.as_slice());

    if !bool::from(computed.ct_eq(&mac)) {
        return Err(DbError::MacMismatch);
    }

    Ok((data_key, data_val))
}

fn erasure_packet_body(wiped_db_key: u32) -> Vec<u8> {
    let mut bw = BinaryWriter::new();
    bw.put_bytes(ERASURE_PLACEHOLDER);
    bw.put_var_int(4);
    bw.put_u32_be(wiped_db_key);
    bw.into_bytes()
}

// ----------------------------- DbInterface -----------------------------

static NEXT_DB_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// One encrypted sub-database: the sled tree plus the decrypted in-memory
/// image and this session's envelope keys.
pub(crate) struct DbInterface {
    instance_id: u64,
    name: String,
    tree: sled::Tree,
    control_salt: SecureBytes,

    data_map: BTreeMap<Vec<u8>, Vec<u8>>,
    data_key_to_db_key: HashMap<Vec<u8>, u32>,
    db_key_counter: AtomicU32,

    encr_pub: [u8; 33],
    mac_key: SecureBytes,
}

impl DbInterface {
    fn new(name: String, tree: sled::Tree, control_salt: SecureBytes) -> Self {
        Self {
            instance_id: NEXT_DB_INSTANCE.fetch_add(1, Ordering::Relaxed),
            name,
            tree,
            control_salt,
            data_map: BTreeMap::new(),
            data_key_to_db_key: HashMap::new(),
            db_key_counter: AtomicU32::new(0),
            encr_pub: [0u8; 33],
            mac_key: SecureBytes::empty(),
        }
    }

    /// Decrypt and reconcile every record, then cycle the session key.
    fn load_all_entries(&mut self, root_key: &[u8]) -> Result<(), DbError> {
        let salted_root = hmac_sha256(self.control_salt.as_slice(), root_key);

        let mut counter = 0u32;
        let (mut decr_priv, mut mac_key) = compute_session_keys(&salted_root, counter)?;

        let mut gaps: BTreeSet<u32> = BTreeSet::new();
        let mut prev_db_key: i64 = -1;

        for item in self.tree.iter() {
            let (key, value) = item?;
            if key.len() != 4 {
                return Err(DbError::Envelope("invalid db key width"));
            }
            let db_key = u32::from_be_bytes(key.as_ref().try_into().expect("checked width"));

            // db keys must be consecutive; mark holes
            if db_key as i64 - prev_db_key != 1 {
                for missing in (prev_db_key + 1)..db_key as i64 {
                    gaps.insert(missing as u32);
                }
            }
            prev_db_key = db_key as i64;

            let (data_key, data_val) =
                read_data_packet(db_key, &value, decr_priv.as_slice(), mac_key.as_slice())?;

            if data_key.is_empty() {
                if let Some(wiped) = parse_erasure_packet(&data_val) {
                    if !gaps.remove(&wiped) {
                        return Err(DbError::Envelope("erasure placeholder for missing gap"));
                    }
                } else if data_val == KEY_CYCLE_FLAG {
                    counter += 1;
                    let pair = compute_session_keys(&salted_root, counter)?;
                    decr_priv = pair.0;
                    mac_key = pair.1;
                } else {
                    return Err(DbError::UnknownMetaPacket);
                }
                continue;
            }

            if self
                .data_key_to_db_key
                .insert(data_key.clone(), db_key)
                .is_some()
            {
                return Err(DbError::DuplicateKey);
            }
            self.data_map.insert(data_key, data_val);
        }

        if !gaps.is_empty() {
            return Err(DbError::UnfilledGap);
        }
        self.db_key_counter
            .store((prev_db_key + 1) as u32, Ordering::Relaxed);

        // Flag this load so the next one cycles onto the key this session
        // is about to start using.
        let flag_db_key = self.new_db_key();
        let encr_pub = crypto::compute_pubkey(decr_priv.as_slice())?;
        let flag_packet = create_data_packet(
            flag_db_key,
            &[],
            KEY_CYCLE_FLAG,
            &encr_pub,
            mac_key.as_slice(),
        )?;
        self.tree
            .insert(flag_db_key.to_be_bytes(), flag_packet)?;

        counter += 1;
        let (session_priv, session_mac) = compute_session_keys(&salted_root, counter)?;
        self.encr_pub = crypto::compute_pubkey(session_priv.as_slice())?;
        self.mac_key = session_mac;
        self.tree.flush()?;

        debug!(db = %self.name, records = self.data_map.len(), session = counter, "loaded encrypted db");
        Ok(())
    }

    fn new_db_key(&self) -> u32 {
        self.db_key_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Zero the slot's bytes on disk before removing it.
    fn wipe_slot(&self, db_key: u32) -> Result<(), DbError> {
        let key = db_key.to_be_bytes();
        if let Some(value) = self.tree.get(key)? {
            self.tree.insert(key, vec![0u8; value.len()])?;
            self.tree.flush()?;
            self.tree.remove(key)?;
        }
        Ok(())
    }

    /// Apply a committed transaction buffer: for each logical key only the
    /// last recorded effect lands on disk.
    fn commit_ops(
        &mut self,
        ops: Vec<InsertData>,
        key_to_idx: HashMap<Vec<u8>, usize>,
    ) -> Result<(), DbError> {
        for (i, op) in ops.iter().enumerate() {
            let last_idx = *key_to_idx.get(&op.key).ok_or(DbError::TxGone)?;
            if i != last_idx {
                continue;
            }

            let db_key = match self.data_key_to_db_key.get(&op.key) {
                Some(&existing) => {
                    // wipe the stale slot and account for the hole
                    self.wipe_slot(existing)?;

                    let marker_key = self.new_db_key();
                    let marker = create_data_packet(
                        marker_key,
                        &[],
                        &erasure_packet_body(existing),
                        &self.encr_pub,
                        self.mac_key.as_slice(),
                    )?;
                    self.tree.insert(marker_key.to_be_bytes(), marker)?;

                    if !op.write {
                        self.data_key_to_db_key.remove(&op.key);
                        continue;
                    }
                    self.new_db_key()
                }
                None => {
                    if !op.write {
                        return Err(DbError::EraseMissingKey);
                    }
                    self.new_db_key()
                }
            };

            let packet = create_data_packet(
                db_key,
                &op.key,
                &op.value,
                &self.encr_pub,
                self.mac_key.as_slice(),
            )?;
            self.tree.insert(db_key.to_be_bytes(), packet)?;
            self.data_key_to_db_key.insert(op.key.clone(), db_key);
        }

        // replay onto the in-memory image
        for op in ops {
            if op.write {
                self.data_map.insert(op.key, op.value);
            } else {
                self.data_map.remove(&op.key);
            }
        }

        self.tree.flush()?;
        Ok(())
    }
}

fn parse_erasure_packet(value: &[u8]) -> Option<u32> {
    if value.len() <= ERASURE_PLACEHOLDER.len() {
        return None;
    }
    let mut br = BinaryReader::new(value);
    let marker = br.get_bytes(ERASURE_PLACEHOLDER.len()).ok()?;
    if marker != ERASURE_PLACEHOLDER {
        return None;
    }
    if br.get_var_int().ok()? != 4 {
        return None;
    }
    br.get_u32_be().ok()
}

// ----------------------------- Transaction registry -----------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum TxMode {
    Read,
    Write,
}

#[derive(Clone)]
struct InsertData {
    key: Vec<u8>,
    value: Vec<u8>,
    write: bool,
}

struct ParentTx {
    mode: TxMode,
    depth: u32,
    ops: Vec<InsertData>,
    key_to_idx: HashMap<Vec<u8>, usize>,
}

type TxRegistry = Mutex<HashMap<(u64, ThreadId), ParentTx>>;

fn registry() -> &'static TxRegistry {
    static REGISTRY: OnceLock<TxRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn registry_has_live_tx_for(instance_ids: &[u64]) -> bool {
    registry()
        .lock()
        .expect("tx registry poisoned")
        .keys()
        .any(|(id, _)| instance_ids.contains(id))
}

/// Scoped read or write view of one encrypted sub-database.
///
/// Nested opens of the same mode on the same thread share the outermost
/// buffer; `commit` on the outermost guard flushes it, dropping the
/// outermost guard uncommitted discards it.
pub struct DbTransaction {
    db: Arc<Mutex<DbInterface>>,
    instance_id: u64,
    thread: ThreadId,
    mode: TxMode,
    committed: bool,
}

impl DbTransaction {
    fn open(db: Arc<Mutex<DbInterface>>, mode: TxMode) -> Result<Self, DbError> {
        let instance_id = db.lock().expect("db poisoned").instance_id;
        let thread = thread::current().id();

        let mut reg = registry().lock().expect("tx registry poisoned");
        match reg.get_mut(&(instance_id, thread)) {
            Some(parent) => {
                if parent.mode != mode {
                    return Err(DbError::TxModeMismatch);
                }
                parent.depth += 1;
            }
            None => {
                reg.insert(
                    (instance_id, thread),
                    ParentTx {
                        mode,
                        depth: 1,
                        ops: Vec::new(),
                        key_to_idx: HashMap::new(),
                    },
                );
            }
        }

        Ok(Self {
            db,
            instance_id,
            thread,
            mode,
            committed: false,
        })
    }

    fn push_op(&self, op: InsertData) -> Result<(), DbError> {
        if self.mode != TxMode::Write {
            return Err(DbError::ReadOnlyTransaction);
        }
        let mut reg = registry().lock().expect("tx registry poisoned");
        let parent = reg
            .get_mut(&(self.instance_id, self.thread))
            .ok_or(DbError::TxGone)?;
        let idx = parent.ops.len();
        parent.key_to_idx.insert(op.key.clone(), idx);
        parent.ops.push(op);
        Ok(())
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.push_op(InsertData {
            key: key.to_vec(),
            value: value.to_vec(),
            write: true,
        })
    }

    pub fn erase(&self, key: &[u8]) -> Result<(), DbError> {
        self.push_op(InsertData {
            key: key.to_vec(),
            value: Vec::new(),
            write: false,
        })
    }

    /// Erase with best-effort zeroization of the underlying slot. The store
    /// wipes replaced slots in every update path, so this shares the erase
    /// implementation.
    pub fn wipe(&self, key: &[u8]) -> Result<(), DbError> {
        self.erase(key)
    }

    /// Read through the transaction: pending writes shadow the db image.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if self.mode == TxMode::Write {
            let reg = registry().lock().expect("tx registry poisoned");
            if let Some(parent) = reg.get(&(self.instance_id, self.thread)) {
                if let Some(&idx) = parent.key_to_idx.get(key) {
                    let op = &parent.ops[idx];
                    return if op.write { Some(op.value.clone()) } else { None };
                }
            }
        }
        self.db
            .lock()
            .expect("db poisoned")
            .data_map
            .get(key)
            .cloned()
    }

    /// Snapshot of all `(logicalKey, value)` pairs in map order.
    pub fn iter(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.db
            .lock()
            .expect("db poisoned")
            .data_map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of entries whose logical key starts with `prefix`.
    pub fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.db
            .lock()
            .expect("db poisoned")
            .data_map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn commit(mut self) -> Result<(), DbError> {
        self.committed = true;

        let pending = {
            let mut reg = registry().lock().expect("tx registry poisoned");
            let parent = reg
                .get_mut(&(self.instance_id, self.thread))
                .ok_or(DbError::TxGone)?;
            parent.depth -= 1;
            if parent.depth == 0 {
                reg.remove(&(self.instance_id, self.thread))
            } else {
                None
            }
        };

        if let Some(parent) = pending {
            if parent.mode == TxMode::Write {
                self.db
                    .lock()
                    .expect("db poisoned")
                    .commit_ops(parent.ops, parent.key_to_idx)?;
            }
        }
        Ok(())
    }
}

impl Drop for DbTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Uncommitted drop: unwind the nesting; the outermost drop discards
        // the buffer, which is the rollback path.
        if let Ok(mut reg) = registry().lock() {
            if let Some(parent) = reg.get_mut(&(self.instance_id, self.thread)) {
                parent.depth -= 1;
                if parent.depth == 0 {
                    reg.remove(&(self.instance_id, self.thread));
                }
            }
        }
    }
}

// ----------------------------- WalletDbInterface -----------------------------

/// The wallet file: a sled database holding the raw control tree plus one
/// encrypted tree per sub-database. The sub-database budget is recorded at
/// creation and enforced at open.
pub struct WalletDbInterface {
    db: sled::Db,
    path: PathBuf,
    control: sled::Tree,
    dbs: Mutex<HashMap<String, Arc<Mutex<DbInterface>>>>,
    db_count: Mutex<u32>,
}

const DB_COUNT_KEY: &[u8] = b"__db_count";

impl WalletDbInterface {
    pub fn open(path: &Path) -> Result<Arc<Self>, DbError> {
        let db = sled::open(path)?;
        let control = db.open_tree(CONTROL_DB_NAME)?;
        let db_count = match control.get(DB_COUNT_KEY)? {
            Some(v) if v.len() == 4 => {
                u32::from_be_bytes(v.as_ref().try_into().expect("checked width"))
            }
            // control + headers
            _ => 2,
        };

        Ok(Arc::new(Self {
            db,
            path: path.to_path_buf(),
            control,
            dbs: Mutex::new(HashMap::new()),
            db_count: Mutex::new(db_count),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (and fully decrypt) one encrypted sub-database.
    pub fn open_db(
        &self,
        name: &str,
        control_salt: &SecureBytes,
        root_key: &[u8],
    ) -> Result<(), DbError> {
        let mut dbs = self.dbs.lock().expect("db map poisoned");
        if dbs.contains_key(name) {
            return Ok(());
        }

        // the control tree occupies one slot; every encrypted tree
        // (headers included) counts against the rest of the budget
        let budget = *self.db_count.lock().expect("count poisoned");
        if dbs.len() as u32 + 2 > budget {
            return Err(DbError::DbCountExceeded);
        }

        let tree = self.db.open_tree(name)?;
        let mut iface = DbInterface::new(name.to_string(), tree, control_salt.clone());
        iface.load_all_entries(root_key)?;
        dbs.insert(name.to_string(), Arc::new(Mutex::new(iface)));
        Ok(())
    }

    pub fn has_db(&self, name: &str) -> bool {
        self.dbs.lock().expect("db map poisoned").contains_key(name)
    }

    fn db_handle(&self, name: &str) -> Result<Arc<Mutex<DbInterface>>, DbError> {
        self.dbs
            .lock()
            .expect("db map poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownDb(name.to_string()))
    }

    pub fn begin_write_transaction(&self, name: &str) -> Result<DbTransaction, DbError> {
        DbTransaction::open(self.db_handle(name)?, TxMode::Write)
    }

    pub fn begin_read_transaction(&self, name: &str) -> Result<DbTransaction, DbError> {
        DbTransaction::open(self.db_handle(name)?, TxMode::Read)
    }

    pub fn db_count(&self) -> u32 {
        *self.db_count.lock().expect("count poisoned")
    }

    /// Grow the sub-database budget. Refused while this wallet has live
    /// transactions.
    pub fn set_db_count(&self, sub_wallet_count: u32) -> Result<(), DbError> {
        let instance_ids: Vec<u64> = self
            .dbs
            .lock()
            .expect("db map poisoned")
            .values()
            .map(|db| db.lock().expect("db poisoned").instance_id)
            .collect();
        if registry_has_live_tx_for(&instance_ids) {
            return Err(DbError::LiveTransactions);
        }
        let total = sub_wallet_count + 2;
        let mut count = self.db_count.lock().expect("count poisoned");
        if total <= *count {
            return Ok(());
        }
        self.control
            .insert(DB_COUNT_KEY, total.to_be_bytes().to_vec())?;
        self.control.flush()?;
        *count = total;
        Ok(())
    }

    // Raw (unencrypted) control records: the control header and the
    // encrypted seed live here, before any session key exists.

    pub fn control_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.control.get(key)?.map(|v| v.to_vec()))
    }

    pub fn control_put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.control.insert(key, value)?;
        self.control.flush()?;
        Ok(())
    }

    /// Remove a control record, zeroing its bytes first.
    pub fn control_del(&self, key: &[u8]) -> Result<(), DbError> {
        if let Some(value) = self.control.get(key)? {
            self.control.insert(key, vec![0u8; value.len()])?;
            self.control.flush()?;
            self.control.remove(key)?;
            self.control.flush()?;
        }
        Ok(())
    }

    pub fn control_iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let mut out = Vec::new();
        for item in self.control.scan_prefix(prefix) {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    /// Raw dump of one encrypted tree, for inspection and tests.
    pub fn raw_records(&self, name: &str) -> Result<Vec<(u32, Vec<u8>)>, DbError> {
        let tree = self.db.open_tree(name)?;
        let mut out = Vec::new();
        for item in tree.iter() {
            let (k, v) = item?;
            if k.len() == 4 {
                let db_key = u32::from_be_bytes(k.as_ref().try_into().expect("checked width"));
                out.push((db_key, v.to_vec()));
            }
        }
        Ok(out)
    }
}
