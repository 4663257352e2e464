//! Account hierarchy.
//!
//! An **asset account** owns one ordered chain of assets under a single
//! derivation scheme: it allocates fresh indices, extends the public chain
//! by a lookup window on demand, materializes private keys lazily, and
//! keeps an incremental script-hash cache. An **address account** groups
//! asset accounts (typically outer + change), enforces the address-type
//! policy, tracks per-address type overrides, and maintains the
//! scriptHash → (assetId, addressType) index used to recognize incoming
//! addresses.
//!
//! Everything persists through typed key prefixes in the encrypted store;
//! loading rebuilds the full structure and treats count mismatches as
//! corruption.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::address::{AddressEntry, AddressError, AddressType};
use crate::assets::{
    index_to_wire, AssetBip32Root, AssetEntry, AssetError, AssetMultisig, AssetSingle,
    PrivateKeyAsset, ROOT_ASSET_INDEX,
};
use crate::crypto::{self, hash160, CryptoError};
use crate::db::{
    DbError, DbTransaction, WalletDbInterface, ADDRESS_ACCOUNT_PREFIX, ADDRESS_TYPE_PREFIX,
    ASSETENTRY_PREFIX, ASSET_ACCOUNT_PREFIX, ASSET_COUNT_PREFIX, ASSET_TOP_INDEX_PREFIX,
    META_ACCOUNT_PREFIX, METADATA_COMMENT_PREFIX,
};
use crate::ddc::{DdcError, DdcLock, DecryptedDataContainer};
use crate::derivation::{
    legacy_chaincode_from_root, Bip32Node, DerivationError, DerivationScheme, EcdhSalts,
};
use crate::encryption::{CipherSpec, EncryptionError};
use crate::util::{BinaryReader, BinaryWriter, CodecError, SecureBytes};

/// Reserved address-account id for the legacy chain.
pub const ARMORY_LEGACY_ACCOUNT_ID: u32 = 0xF6E1_0000;

/// Reserved address-account id for imported keys.
pub const IMPORTS_ACCOUNT_ID: u32 = 0x0000_0000;

/// Default extend-on-demand window.
pub const DEFAULT_LOOKUP: u32 = 100;

const ASSET_ACCOUNT_KIND_PLAIN: u8 = 0x01;
const ASSET_ACCOUNT_KIND_ECDH: u8 = 0x02;

const META_ACCOUNT_TYPE_COMMENTS: u32 = 1;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("unknown asset account id")]
    UnknownAccount,

    #[error("unknown asset index")]
    UnknownAsset,

    #[error("invalid account or asset id length")]
    InvalidId,

    #[error("persisted asset count does not match loaded assets")]
    CountMismatch,

    #[error("address index was never handed out")]
    UnrequestedAddress,

    #[error("account id collides with a reserved id")]
    IdCollision,

    #[error("account already registered")]
    DuplicateAccount,

    #[error("address type not permitted for this account")]
    InvalidAddressType,

    #[error("requested index overflows the lookup window")]
    LookupOverflow,

    #[error("account carries no root asset")]
    MissingRoot,

    #[error("account root is not a bip32 root")]
    NotBip32,

    #[error("no asset with a private key to extend from")]
    NoPrivateAsset,

    #[error("missing account record: {0}")]
    MissingRecord(&'static str),

    #[error("script hash not indexed by this account")]
    UnknownScriptHash,

    #[error("watch-only account cannot derive private material")]
    WatchingOnly,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Ddc(#[from] DdcError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetAccountKind {
    Plain,
    Ecdh,
}

// ===================================================================
// AssetAccount
// ===================================================================

pub struct AssetAccount {
    id: Vec<u8>,
    parent_id: Vec<u8>,
    kind: AssetAccountKind,
    root: Option<AssetEntry>,
    der_scheme: DerivationScheme,

    assets: BTreeMap<u32, AssetEntry>,
    last_used_index: i64,
    last_hashed_asset: i64,
    addr_hash_map: BTreeMap<Vec<u8>, BTreeMap<AddressType, Vec<u8>>>,

    lookup: u32,
    iface: Arc<WalletDbInterface>,
    db_name: String,
}

impl AssetAccount {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Vec<u8>,
        parent_id: Vec<u8>,
        kind: AssetAccountKind,
        root: Option<AssetEntry>,
        der_scheme: DerivationScheme,
        lookup: u32,
        iface: Arc<WalletDbInterface>,
        db_name: String,
    ) -> Self {
        Self {
            id,
            parent_id,
            kind,
            root,
            der_scheme,
            assets: BTreeMap::new(),
            last_used_index: -1,
            last_hashed_asset: -1,
            addr_hash_map: BTreeMap::new(),
            lookup,
            iface,
            db_name,
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// parentId ‖ ownId, the 8-byte persisted account id.
    pub fn full_id(&self) -> Vec<u8> {
        let mut id = self.parent_id.clone();
        id.extend_from_slice(&self.id);
        id
    }

    pub fn kind(&self) -> AssetAccountKind {
        self.kind
    }

    pub fn root(&self) -> Option<&AssetEntry> {
        self.root.as_ref()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    pub fn lookup(&self) -> u32 {
        self.lookup
    }

    pub fn last_used_index(&self) -> i64 {
        self.last_used_index
    }

    pub fn last_computed_index(&self) -> i64 {
        self.assets
            .keys()
            .next_back()
            .map(|&i| i as i64)
            .unwrap_or(-1)
    }

    // ----------------------------- Chain extension -----------------------------

    /// The asset a public extension starts from: the newest entry for the
    /// linear scheme, the root otherwise.
    fn public_extension_base(&self) -> Result<&AssetEntry, AccountError> {
        if self.der_scheme.is_linear() {
            if let Some((_, last)) = self.assets.iter().next_back() {
                return Ok(last);
            }
        }
        self.root.as_ref().ok_or(AccountError::MissingRoot)
    }

    pub fn extend_public_chain(&mut self, count: u32) -> Result<(), AccountError> {
        if count == 0 {
            return Ok(());
        }
        let base_index = self.last_computed_index();
        let start = (base_index + 1) as u32;
        let end = (base_index + count as i64) as u32;

        let fresh = {
            let base = self.public_extension_base()?;
            self.der_scheme.extend_public(base, start, end)?
        };
        for asset in fresh {
            let index = asset.index() as u32;
            self.assets.entry(index).or_insert(asset);
        }
        self.update_on_disk_assets()
    }

    /// Make the chain at least `index + 1` entries long.
    pub fn extend_public_chain_to_index(&mut self, index: u32) -> Result<(), AccountError> {
        let last = self.last_computed_index();
        if last >= index as i64 {
            return Ok(());
        }
        self.extend_public_chain((index as i64 - last) as u32)
    }

    /// Newest entry that carries a private key; falls back to the root.
    pub fn last_asset_with_private_key(&self) -> Result<&AssetEntry, AccountError> {
        for asset in self.assets.values().rev() {
            if asset.has_private_key() {
                return Ok(asset);
            }
        }
        match &self.root {
            Some(root) if root.has_private_key() => Ok(root),
            _ => Err(AccountError::NoPrivateAsset),
        }
    }

    pub fn extend_private_chain(
        &mut self,
        ddc: &DecryptedDataContainer,
        lock: &DdcLock<'_>,
        count: u32,
    ) -> Result<(), AccountError> {
        if count == 0 {
            return Ok(());
        }
        let top = self.last_asset_with_private_key()?.clone();
        self.extend_private_chain_from(ddc, lock, &top, count)
    }

    pub fn extend_private_chain_to_index(
        &mut self,
        ddc: &DecryptedDataContainer,
        lock: &DdcLock<'_>,
        index: u32,
    ) -> Result<(), AccountError> {
        let top = self.last_asset_with_private_key()?.clone();
        if (index as i64) <= top.index() {
            return Ok(());
        }
        let count = (index as i64 - top.index()) as u32;
        self.extend_private_chain_from(ddc, lock, &top, count)
    }

    fn extend_private_chain_from(
        &mut self,
        ddc: &DecryptedDataContainer,
        lock: &DdcLock<'_>,
        from: &AssetEntry,
        count: u32,
    ) -> Result<(), AccountError> {
        let start = (from.index() + 1) as u32;
        let end = (from.index() + count as i64) as u32;

        // the linear scheme walks from the given entry; the others always
        // re-derive from the root
        let fresh = if self.der_scheme.is_linear() {
            self.der_scheme.extend_private(ddc, lock, from, start, end)?
        } else {
            let root = self.root.as_ref().ok_or(AccountError::MissingRoot)?;
            self.der_scheme.extend_private(ddc, lock, root, start, end)?
        };

        for asset in fresh {
            let index = asset.index() as u32;
            match self.assets.get_mut(&index) {
                Some(existing) if existing.has_private_key() => {}
                Some(existing) => *existing = asset,
                None => {
                    self.assets.insert(index, asset);
                }
            }
        }
        self.update_on_disk_assets()
    }

    // ----------------------------- Index allocation -----------------------------

    fn bump_highest_used_index(&mut self, tx: &DbTransaction) -> Result<u32, AccountError> {
        self.last_used_index += 1;
        self.write_top_index(tx)?;
        Ok(self.last_used_index as u32)
    }

    /// Hand out the next unused asset, extending the public chain by the
    /// lookup window if the index is not materialized yet.
    pub fn get_new_asset(&mut self) -> Result<AssetEntry, AccountError> {
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        let index = self.bump_highest_used_index(&tx)?;
        if !self.assets.contains_key(&index) {
            self.extend_public_chain(self.lookup)?;
        }
        let asset = self
            .assets
            .get(&index)
            .cloned()
            .ok_or(AccountError::LookupOverflow)?;
        tx.commit()?;
        Ok(asset)
    }

    /// The asset `get_new_asset` would return, without bumping the index.
    pub fn peek_next_asset(&mut self) -> Result<AssetEntry, AccountError> {
        let index = (self.last_used_index + 1) as u32;
        if !self.assets.contains_key(&index) {
            self.extend_public_chain(self.lookup)?;
        }
        self.assets
            .get(&index)
            .cloned()
            .ok_or(AccountError::LookupOverflow)
    }

    pub fn get_asset_for_index(&self, index: u32) -> Result<&AssetEntry, AccountError> {
        self.assets.get(&index).ok_or(AccountError::UnknownAsset)
    }

    pub fn get_asset_for_id(&self, asset_id: &[u8]) -> Result<&AssetEntry, AccountError> {
        if asset_id.len() < 4 {
            return Err(AccountError::InvalidId);
        }
        let index = u32::from_be_bytes(asset_id[..4].try_into().expect("checked length"));
        self.get_asset_for_index(index)
    }

    // ----------------------------- Private key materialization -----------------------------

    /// Ensure the asset at `full_asset_id` has its private key, deriving the
    /// missing stretch of the private chain if needed.
    pub fn fill_private_key(
        &mut self,
        ddc: &DecryptedDataContainer,
        lock: &DdcLock<'_>,
        full_asset_id: &[u8],
    ) -> Result<PrivateKeyAsset, AccountError> {
        if full_asset_id.len() != 12 {
            return Err(AccountError::InvalidId);
        }
        let index = u32::from_be_bytes(full_asset_id[8..12].try_into().expect("checked length"));

        let asset = self
            .assets
            .get(&index)
            .ok_or(AccountError::UnknownAsset)?;
        if asset.has_private_key() {
            return Ok(asset
                .private_key()
                .expect("has_private_key checked")
                .clone());
        }

        // nearest earlier entry that still has a key; only the linear
        // scheme truly needs the walk, the others re-derive from the root
        let from = self
            .assets
            .range(..index)
            .rev()
            .map(|(_, a)| a)
            .find(|a| a.has_private_key())
            .or(self.root.as_ref().filter(|r| r.has_private_key()))
            .cloned()
            .ok_or(AccountError::NoPrivateAsset)?;

        let count = (index as i64 - from.index()) as u32;
        self.extend_private_chain_from(ddc, lock, &from, count)?;

        let filled = self
            .assets
            .get(&index)
            .ok_or(AccountError::UnknownAsset)?;
        filled
            .private_key()
            .cloned()
            .ok_or(AccountError::NoPrivateAsset)
    }

    // ----------------------------- Hash map -----------------------------

    /// Materialize script hashes for every asset past the cursor.
    pub fn update_address_hash_map(
        &mut self,
        types: &BTreeSet<AddressType>,
    ) -> &BTreeMap<Vec<u8>, BTreeMap<AddressType, Vec<u8>>> {
        let start = (self.last_hashed_asset + 1) as u32;
        for (&index, asset) in self.assets.range(start..) {
            let entry = self
                .addr_hash_map
                .entry(asset.id())
                .or_default();
            for &t in types {
                if entry.contains_key(&t) {
                    continue;
                }
                if let Ok(addr) = AddressEntry::instantiate(asset, t) {
                    entry.insert(t, addr.prefixed_hash);
                }
            }
            self.last_hashed_asset = index as i64;
        }
        &self.addr_hash_map
    }

    // ----------------------------- ECDH salts -----------------------------

    /// Register (and persist) a new ECDH salt; returns its index.
    pub fn add_salt(&mut self, salt: Vec<u8>) -> Result<u32, AccountError> {
        let full_id = self.full_id();
        let salts = self
            .der_scheme
            .ecdh_salts_mut()
            .ok_or(AccountError::UnknownAccount)?;
        let index = salts.add(salt.clone())?;

        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        EcdhSalts::save_salt(&tx, &full_id, index, &salt)?;
        tx.commit()?;
        Ok(index)
    }

    pub fn salt_index(&self, salt: &[u8]) -> Option<u32> {
        self.der_scheme.ecdh_salts().and_then(|s| s.index_of(salt))
    }

    // ----------------------------- Persistence -----------------------------

    fn header_db_key(&self) -> Vec<u8> {
        let mut key = vec![ASSET_ACCOUNT_PREFIX];
        key.extend_from_slice(&self.full_id());
        key
    }

    fn count_db_key(full_id: &[u8]) -> Vec<u8> {
        let mut key = vec![ASSET_COUNT_PREFIX];
        key.extend_from_slice(full_id);
        key
    }

    fn top_index_db_key(full_id: &[u8]) -> Vec<u8> {
        let mut key = vec![ASSET_TOP_INDEX_PREFIX];
        key.extend_from_slice(full_id);
        key
    }

    fn write_asset_entry(tx: &DbTransaction, entry: &mut AssetEntry) -> Result<(), AccountError> {
        if !entry.needs_commit() {
            return Ok(());
        }
        tx.insert(&entry.db_key(), &entry.serialize())?;
        entry.clear_commit_flag();
        Ok(())
    }

    fn write_asset_count(&self, tx: &DbTransaction) -> Result<(), AccountError> {
        let mut bw = BinaryWriter::new();
        bw.put_var_int(self.assets.len() as u64);
        tx.insert(&Self::count_db_key(&self.full_id()), bw.as_slice())?;
        Ok(())
    }

    fn write_top_index(&self, tx: &DbTransaction) -> Result<(), AccountError> {
        let mut bw = BinaryWriter::new();
        bw.put_var_int(index_to_wire(self.last_used_index) as u64);
        tx.insert(&Self::top_index_db_key(&self.full_id()), bw.as_slice())?;
        Ok(())
    }

    fn update_on_disk_assets(&mut self) -> Result<(), AccountError> {
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        for entry in self.assets.values_mut() {
            Self::write_asset_entry(&tx, entry)?;
        }
        self.write_asset_count(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Write the whole account: header, scheme, root, assets, counters.
    pub fn commit(&mut self) -> Result<(), AccountError> {
        let tx = self.iface.begin_write_transaction(&self.db_name)?;

        let mut bw = BinaryWriter::new();
        bw.put_u8(match self.kind {
            AssetAccountKind::Plain => ASSET_ACCOUNT_KIND_PLAIN,
            AssetAccountKind::Ecdh => ASSET_ACCOUNT_KIND_ECDH,
        });
        bw.put_var_int(self.parent_id.len() as u64);
        bw.put_var_bytes(&self.der_scheme.serialize());
        tx.insert(&self.header_db_key(), bw.as_slice())?;

        if let Some(root) = &mut self.root {
            Self::write_asset_entry(&tx, root)?;
        }
        for entry in self.assets.values_mut() {
            Self::write_asset_entry(&tx, entry)?;
        }
        self.write_asset_count(&tx)?;
        self.write_top_index(&tx)?;

        if let Some(salts) = self.der_scheme.ecdh_salts() {
            salts.save_all(&tx, &self.full_id())?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Rebuild an account from its records. `db_key` is the header key.
    pub fn load_from_disk(
        iface: Arc<WalletDbInterface>,
        db_name: &str,
        db_key: &[u8],
        lookup: u32,
    ) -> Result<Self, AccountError> {
        if db_key.len() < 2 || db_key[0] != ASSET_ACCOUNT_PREFIX {
            return Err(AccountError::InvalidId);
        }

        let tx = iface.begin_read_transaction(db_name)?;
        let header = tx
            .get(db_key)
            .ok_or(AccountError::MissingRecord("asset account header"))?;

        let mut br = BinaryReader::new(&header);
        let kind = match br.get_u8()? {
            ASSET_ACCOUNT_KIND_PLAIN => AssetAccountKind::Plain,
            ASSET_ACCOUNT_KIND_ECDH => AssetAccountKind::Ecdh,
            _ => return Err(AccountError::MissingRecord("asset account kind")),
        };
        let parent_id_len = br.get_var_int()? as usize;
        let scheme_bytes = br.get_var_bytes()?;
        let mut der_scheme = DerivationScheme::deserialize(&scheme_bytes)?;

        let full_id = db_key[1..].to_vec();
        if full_id.len() <= parent_id_len {
            return Err(AccountError::InvalidId);
        }
        let parent_id = full_id[..parent_id_len].to_vec();
        let id = full_id[parent_id_len..].to_vec();

        // counters
        let count_rec = tx
            .get(&Self::count_db_key(&full_id))
            .ok_or(AccountError::MissingRecord("asset count"))?;
        let expected_count = BinaryReader::new(&count_rec).get_var_int()? as usize;

        let top_rec = tx
            .get(&Self::top_index_db_key(&full_id))
            .ok_or(AccountError::MissingRecord("top index"))?;
        let last_used_index =
            crate::assets::index_from_wire(BinaryReader::new(&top_rec).get_var_int()? as u32);

        // assets
        let mut asset_prefix = vec![ASSETENTRY_PREFIX];
        asset_prefix.extend_from_slice(&full_id);

        let mut root = None;
        let mut assets = BTreeMap::new();
        for (key, value) in tx.iter_prefix(&asset_prefix) {
            let entry = AssetEntry::deserialize(&key, &value)?;
            if entry.index() == ROOT_ASSET_INDEX {
                root = Some(entry);
            } else {
                assets.insert(entry.index() as u32, entry);
            }
        }

        if assets.len() != expected_count {
            return Err(AccountError::CountMismatch);
        }

        // ECDH salt table
        if let Some(salts) = der_scheme.ecdh_salts_mut() {
            *salts = EcdhSalts::load(&tx, &full_id)?;
        }

        Ok(Self {
            id,
            parent_id,
            kind,
            root,
            der_scheme,
            assets,
            last_used_index,
            last_hashed_asset: -1,
            addr_hash_map: BTreeMap::new(),
            lookup,
            iface,
            db_name: db_name.to_string(),
        })
    }

    /// Structure clone with every private key stripped.
    fn watching_only_copy(
        &self,
        iface: Arc<WalletDbInterface>,
        db_name: &str,
    ) -> AssetAccount {
        let mut assets = BTreeMap::new();
        for (&index, asset) in &self.assets {
            assets.insert(index, asset.public_copy());
        }
        AssetAccount {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            kind: self.kind,
            root: self.root.as_ref().map(|r| r.public_copy()),
            der_scheme: self.der_scheme.clone(),
            assets,
            last_used_index: self.last_used_index,
            last_hashed_asset: -1,
            addr_hash_map: BTreeMap::new(),
            lookup: self.lookup,
            iface,
            db_name: db_name.to_string(),
        }
    }
}

// ===================================================================
// Account types (creation blueprints)
// ===================================================================

/// Blueprint for the legacy chain-code account.
pub struct AccountTypeArmoryLegacy {
    pub root_priv: Option<SecureBytes>,
    pub root_pub: Option<Vec<u8>>,
    pub chaincode: Option<SecureBytes>,
    pub address_types: BTreeSet<AddressType>,
    pub default_address_type: AddressType,
    pub lookup: u32,
}

/// Blueprint for BIP32 accounts (plain and salted).
pub struct AccountTypeBip32 {
    /// Account-level node; private or watch-only.
    pub node: Bip32Node,
    pub seed_fingerprint: u32,
    pub derivation_path: Vec<u32>,
    /// Soft children to instantiate, in order; first is the outer chain,
    /// second the change chain. Empty set uses the node itself.
    pub nodes: Vec<u32>,
    /// Explicit outer/inner asset-account ids. Empty defers to the first
    /// and second soft nodes (or the node itself). When set, they feed the
    /// account-id hash and pick the active chains.
    pub outer_account_override: Vec<u8>,
    pub inner_account_override: Vec<u8>,
    pub address_types: BTreeSet<AddressType>,
    pub default_address_type: AddressType,
    pub main: bool,
    pub lookup: u32,
}

/// Blueprint for ECDH accounts.
pub struct AccountTypeEcdh {
    pub privkey: Option<SecureBytes>,
    pub pubkey: Option<Vec<u8>>,
    pub address_types: BTreeSet<AddressType>,
    pub default_address_type: AddressType,
    pub lookup: u32,
}

pub enum AccountType {
    ArmoryLegacy(AccountTypeArmoryLegacy),
    Bip32(AccountTypeBip32),
    Bip32Salted {
        base: AccountTypeBip32,
        salt: SecureBytes,
    },
    Ecdh(AccountTypeEcdh),
}

impl AccountType {
    fn type_tag(&self) -> u8 {
        match self {
            AccountType::ArmoryLegacy(_) => 1,
            AccountType::Bip32(_) => 2,
            AccountType::Bip32Salted { .. } => 3,
            AccountType::Ecdh(_) => 4,
        }
    }

    fn bip32_base(&self) -> Option<&AccountTypeBip32> {
        match self {
            AccountType::Bip32(b) => Some(b),
            AccountType::Bip32Salted { base, .. } => Some(base),
            _ => None,
        }
    }

    /// Derive the 4-byte address-account id for this blueprint.
    pub fn account_id(&self) -> Result<Vec<u8>, AccountError> {
        let id = match self {
            AccountType::ArmoryLegacy(_) => {
                return Ok(ARMORY_LEGACY_ACCOUNT_ID.to_be_bytes().to_vec())
            }

            AccountType::Bip32(_) | AccountType::Bip32Salted { .. } => {
                let base = self.bip32_base().expect("bip32 variants");
                // fold in everything that distinguishes two accounts built
                // off the same root
                let mut bw = BinaryWriter::new();
                bw.put_bytes(&base.node.pubkey);
                for node in &base.nodes {
                    bw.put_u32_be(*node);
                }
                if !base.outer_account_override.is_empty() {
                    bw.put_bytes(&base.outer_account_override);
                }
                if !base.inner_account_override.is_empty() {
                    bw.put_bytes(&base.inner_account_override);
                }
                for t in &base.address_types {
                    bw.put_u32_be(t.to_u32());
                }
                bw.put_u32_be(base.default_address_type.to_u32());
                bw.put_u8(base.main as u8);
                hash160(bw.as_slice())[..4].to_vec()
            }

            AccountType::Ecdh(ecdh) => {
                let mut pubkey = match (&ecdh.pubkey, &ecdh.privkey) {
                    (Some(p), _) => p.clone(),
                    (None, Some(sk)) => crypto::compute_pubkey(sk.as_slice())?.to_vec(),
                    (None, None) => return Err(AccountError::MissingRoot),
                };
                pubkey[0] ^= self.type_tag();
                hash160(&pubkey)[..4].to_vec()
            }
        };

        if id == ARMORY_LEGACY_ACCOUNT_ID.to_be_bytes()
            || id == IMPORTS_ACCOUNT_ID.to_be_bytes()
        {
            return Err(AccountError::IdCollision);
        }
        Ok(id)
    }

    fn address_types(&self) -> &BTreeSet<AddressType> {
        match self {
            AccountType::ArmoryLegacy(a) => &a.address_types,
            AccountType::Bip32(b) => &b.address_types,
            AccountType::Bip32Salted { base, .. } => &base.address_types,
            AccountType::Ecdh(e) => &e.address_types,
        }
    }

    fn default_address_type(&self) -> AddressType {
        match self {
            AccountType::ArmoryLegacy(a) => a.default_address_type,
            AccountType::Bip32(b) => b.default_address_type,
            AccountType::Bip32Salted { base, .. } => base.default_address_type,
            AccountType::Ecdh(e) => e.default_address_type,
        }
    }

    fn lookup(&self) -> u32 {
        match self {
            AccountType::ArmoryLegacy(a) => a.lookup,
            AccountType::Bip32(b) => b.lookup,
            AccountType::Bip32Salted { base, .. } => base.lookup,
            AccountType::Ecdh(e) => e.lookup,
        }
    }
}

// ===================================================================
// AddressAccount
// ===================================================================

pub struct AddressAccount {
    id: Vec<u8>,
    outer_account: Vec<u8>,
    inner_account: Vec<u8>,
    address_types: BTreeSet<AddressType>,
    default_address_type: AddressType,

    asset_accounts: BTreeMap<Vec<u8>, AssetAccount>,
    /// Per-address overrides; only non-default instantiations are stored.
    address_type_overrides: BTreeMap<Vec<u8>, AddressType>,
    /// prefixed scriptHash → (full asset id, address type)
    address_hashes: HashMap<Vec<u8>, (Vec<u8>, AddressType)>,

    iface: Arc<WalletDbInterface>,
    db_name: String,
}

impl AddressAccount {
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn outer_account_id(&self) -> &[u8] {
        &self.outer_account
    }

    pub fn inner_account_id(&self) -> &[u8] {
        &self.inner_account
    }

    pub fn address_types(&self) -> &BTreeSet<AddressType> {
        &self.address_types
    }

    pub fn default_address_type(&self) -> AddressType {
        self.default_address_type
    }

    pub fn account_map(&self) -> &BTreeMap<Vec<u8>, AssetAccount> {
        &self.asset_accounts
    }

    // ----------------------------- Factory -----------------------------

    /// Build a fresh address account from a blueprint. Private blueprints
    /// need the DDC lock and the cipher the wallet wraps private keys with.
    pub fn make_new(
        iface: Arc<WalletDbInterface>,
        db_name: &str,
        acc_type: &AccountType,
        ddc: &DecryptedDataContainer,
        lock: Option<&DdcLock<'_>>,
        cipher: Option<&CipherSpec>,
    ) -> Result<Self, AccountError> {
        let id = acc_type.account_id()?;
        let lookup = acc_type.lookup();

        let mut account = Self {
            id: id.clone(),
            outer_account: Vec::new(),
            inner_account: Vec::new(),
            address_types: acc_type.address_types().clone(),
            default_address_type: acc_type.default_address_type(),
            asset_accounts: BTreeMap::new(),
            address_type_overrides: BTreeMap::new(),
            address_hashes: HashMap::new(),
            iface: Arc::clone(&iface),
            db_name: db_name.to_string(),
        };

        // wrap a private scalar into an encrypted private-key slot
        let encrypt_priv = |lock: &DdcLock<'_>,
                            cipher: &CipherSpec,
                            priv_key: &SecureBytes,
                            key_id: Vec<u8>|
         -> Result<PrivateKeyAsset, AccountError> {
            let spec = cipher.fresh_iv();
            let ciphertext = ddc.encrypt_data(lock, &spec, priv_key.as_slice())?;
            Ok(PrivateKeyAsset::new(key_id, spec, ciphertext))
        };

        match acc_type {
            AccountType::ArmoryLegacy(legacy) => {
                let asset_account_id = ARMORY_LEGACY_ACCOUNT_ID.to_be_bytes().to_vec();
                let mut full_id = id.clone();
                full_id.extend_from_slice(&asset_account_id);

                let first_asset = match &legacy.root_priv {
                    Some(root_priv) => {
                        let lock = lock.ok_or(AccountError::WatchingOnly)?;
                        let cipher = cipher.ok_or(AccountError::WatchingOnly)?;
                        let chaincode = legacy
                            .chaincode
                            .clone()
                            .unwrap_or_else(|| legacy_chaincode_from_root(root_priv.as_slice()));

                        let priv0 = crate::derivation::legacy_next_private(
                            root_priv.as_slice(),
                            chaincode.as_slice(),
                        )?;
                        let pub0 = crypto::compute_pubkey(priv0.as_slice())?;

                        let mut single =
                            AssetSingle::new(0, full_id.clone(), pub0.to_vec(), None);
                        let priv_asset =
                            encrypt_priv(lock, cipher, &priv0, single.id())?;
                        single.set_private_key(priv_asset);

                        let scheme = DerivationScheme::ArmoryLegacy { chaincode };
                        (AssetEntry::Single(single), scheme)
                    }
                    None => {
                        let root_pub =
                            legacy.root_pub.as_ref().ok_or(AccountError::MissingRoot)?;
                        let chaincode =
                            legacy.chaincode.clone().ok_or(AccountError::MissingRoot)?;
                        let pub0 = crate::derivation::legacy_next_public(
                            root_pub,
                            chaincode.as_slice(),
                        )?;
                        let single =
                            AssetSingle::new(0, full_id.clone(), pub0.to_vec(), None);
                        let scheme = DerivationScheme::ArmoryLegacy { chaincode };
                        (AssetEntry::Single(single), scheme)
                    }
                };
                let (asset0, scheme) = first_asset;

                let mut asset_account = AssetAccount::new(
                    asset_account_id.clone(),
                    id.clone(),
                    AssetAccountKind::Plain,
                    None,
                    scheme,
                    lookup,
                    Arc::clone(&iface),
                    db_name.to_string(),
                );
                asset_account.assets.insert(0, asset0);

                account.add_account(asset_account)?;
                account.outer_account = asset_account_id.clone();
                account.inner_account = asset_account_id;
            }

            AccountType::Bip32(_) | AccountType::Bip32Salted { .. } => {
                let base = acc_type.bip32_base().expect("bip32 variants");
                let salt = match acc_type {
                    AccountType::Bip32Salted { salt, .. } => Some(salt.clone()),
                    _ => None,
                };

                let node_ids: Vec<Option<u32>> = if base.nodes.is_empty() {
                    vec![None]
                } else {
                    base.nodes.iter().copied().map(Some).collect()
                };

                for node_id in node_ids {
                    let (node, asset_account_id, der_path) = match node_id {
                        Some(n) => {
                            let child = base.node.derive_step(n)?;
                            let mut path = base.derivation_path.clone();
                            path.push(n);
                            (child, n.to_be_bytes().to_vec(), path)
                        }
                        None => (
                            base.node.clone(),
                            u32::MAX.to_be_bytes().to_vec(),
                            base.derivation_path.clone(),
                        ),
                    };

                    let mut full_id = id.clone();
                    full_id.extend_from_slice(&asset_account_id);

                    let private_key = match &node.privkey {
                        Some(priv_key) => {
                            let lock = lock.ok_or(AccountError::WatchingOnly)?;
                            let cipher = cipher.ok_or(AccountError::WatchingOnly)?;
                            let mut key_id = full_id.clone();
                            key_id.extend_from_slice(&u32::MAX.to_be_bytes());
                            Some(encrypt_priv(lock, cipher, priv_key, key_id)?)
                        }
                        None => None,
                    };

                    let root = AssetEntry::Bip32Root(AssetBip32Root {
                        single: AssetSingle::new(
                            ROOT_ASSET_INDEX,
                            full_id.clone(),
                            node.pubkey.clone(),
                            private_key,
                        ),
                        chaincode: node.chaincode.clone(),
                        depth: node.depth,
                        leaf_id: node.leaf_id,
                        parent_fingerprint: node.parent_fingerprint,
                        seed_fingerprint: base.seed_fingerprint,
                        derivation_path: der_path,
                    });

                    let scheme = match &salt {
                        Some(s) => {
                            if s.len() != 32 {
                                return Err(AccountError::Derivation(
                                    DerivationError::BadSaltLength,
                                ));
                            }
                            DerivationScheme::Bip32Salted {
                                chaincode: node.chaincode.clone(),
                                depth: node.depth,
                                leaf_id: node.leaf_id,
                                salt: s.clone(),
                            }
                        }
                        None => DerivationScheme::Bip32 {
                            chaincode: node.chaincode.clone(),
                            depth: node.depth,
                            leaf_id: node.leaf_id,
                        },
                    };

                    let asset_account = AssetAccount::new(
                        asset_account_id,
                        id.clone(),
                        AssetAccountKind::Plain,
                        Some(root),
                        scheme,
                        lookup,
                        Arc::clone(&iface),
                        db_name.to_string(),
                    );
                    account.add_account(asset_account)?;
                }

                account.outer_account = if !base.outer_account_override.is_empty() {
                    base.outer_account_override.clone()
                } else {
                    base.nodes
                        .first()
                        .map(|n| n.to_be_bytes().to_vec())
                        .unwrap_or_else(|| u32::MAX.to_be_bytes().to_vec())
                };
                account.inner_account = if !base.inner_account_override.is_empty() {
                    base.inner_account_override.clone()
                } else {
                    base.nodes
                        .get(1)
                        .map(|n| n.to_be_bytes().to_vec())
                        .unwrap_or_else(|| account.outer_account.clone())
                };
            }

            AccountType::Ecdh(ecdh) => {
                let asset_account_id = 0u32.to_be_bytes().to_vec();
                let mut full_id = id.clone();
                full_id.extend_from_slice(&asset_account_id);

                let root = match &ecdh.privkey {
                    Some(priv_key) => {
                        let lock = lock.ok_or(AccountError::WatchingOnly)?;
                        let cipher = cipher.ok_or(AccountError::WatchingOnly)?;
                        let pubkey = crypto::compute_pubkey(priv_key.as_slice())?;
                        let mut key_id = full_id.clone();
                        key_id.extend_from_slice(&u32::MAX.to_be_bytes());
                        let priv_asset = encrypt_priv(lock, cipher, priv_key, key_id)?;
                        AssetEntry::Single(AssetSingle::new(
                            ROOT_ASSET_INDEX,
                            full_id.clone(),
                            pubkey.to_vec(),
                            Some(priv_asset),
                        ))
                    }
                    None => {
                        let pubkey = ecdh.pubkey.clone().ok_or(AccountError::MissingRoot)?;
                        AssetEntry::Single(AssetSingle::new(
                            ROOT_ASSET_INDEX,
                            full_id.clone(),
                            pubkey,
                            None,
                        ))
                    }
                };

                let asset_account = AssetAccount::new(
                    asset_account_id.clone(),
                    id.clone(),
                    AssetAccountKind::Ecdh,
                    Some(root),
                    DerivationScheme::Ecdh {
                        salts: EcdhSalts::default(),
                    },
                    lookup,
                    Arc::clone(&iface),
                    db_name.to_string(),
                );
                account.add_account(asset_account)?;
                account.outer_account = asset_account_id.clone();
                account.inner_account = asset_account_id;
            }
        }

        Ok(account)
    }

    fn add_account(&mut self, account: AssetAccount) -> Result<(), AccountError> {
        if account.id().len() != 4 {
            return Err(AccountError::InvalidId);
        }
        let key = account.id().to_vec();
        if self.asset_accounts.contains_key(&key) {
            return Err(AccountError::DuplicateAccount);
        }
        self.asset_accounts.insert(key, account);
        Ok(())
    }

    // ----------------------------- Address allocation -----------------------------

    fn resolve_type(&self, requested: Option<AddressType>) -> Result<AddressType, AccountError> {
        let t = requested.unwrap_or(self.default_address_type);
        if t != self.default_address_type && !self.address_types.contains(&t) {
            return Err(AccountError::InvalidAddressType);
        }
        Ok(t)
    }

    fn new_address_from(
        &mut self,
        account_id: Vec<u8>,
        requested: Option<AddressType>,
    ) -> Result<AddressEntry, AccountError> {
        let ae_type = self.resolve_type(requested)?;
        let tx = self.iface.begin_write_transaction(&self.db_name)?;

        let asset = self
            .asset_accounts
            .get_mut(&account_id)
            .ok_or(AccountError::UnknownAccount)?
            .get_new_asset()?;
        let entry = AddressEntry::instantiate(&asset, ae_type)?;

        // only non-default instantiations are recorded
        if ae_type != self.default_address_type {
            self.update_instantiated_address_type(&tx, &entry.asset_id, ae_type)?;
        }

        tx.commit()?;
        Ok(entry)
    }

    /// Fresh receiving address off the outer chain.
    pub fn get_new_address(
        &mut self,
        requested: Option<AddressType>,
    ) -> Result<AddressEntry, AccountError> {
        if self.outer_account.is_empty() {
            return Err(AccountError::UnknownAccount);
        }
        self.new_address_from(self.outer_account.clone(), requested)
    }

    /// Fresh change address off the inner chain.
    pub fn get_new_change_address(
        &mut self,
        requested: Option<AddressType>,
    ) -> Result<AddressEntry, AccountError> {
        if self.inner_account.is_empty() {
            return Err(AccountError::UnknownAccount);
        }
        self.new_address_from(self.inner_account.clone(), requested)
    }

    pub fn peek_next_change_address(
        &mut self,
        requested: Option<AddressType>,
    ) -> Result<AddressEntry, AccountError> {
        let ae_type = self.resolve_type(requested)?;
        let asset = self
            .asset_accounts
            .get_mut(&self.inner_account.clone())
            .ok_or(AccountError::UnknownAccount)?
            .peek_next_asset()?;
        Ok(AddressEntry::instantiate(&asset, ae_type)?)
    }

    pub fn has_address_type(&self, ae_type: AddressType) -> bool {
        self.address_types.contains(&ae_type)
    }

    // ----------------------------- Lookup -----------------------------

    /// Asset by 8-byte (assetAccount ‖ index) id.
    pub fn get_asset_for_id(&self, id: &[u8]) -> Result<&AssetEntry, AccountError> {
        if id.len() != 8 {
            return Err(AccountError::InvalidId);
        }
        let account = self
            .asset_accounts
            .get(&id[..4])
            .ok_or(AccountError::UnknownAccount)?;
        account.get_asset_for_id(&id[4..])
    }

    /// Address entry for a full 12-byte asset id, honoring overrides.
    /// Indices beyond the last handed-out one fail as unrequested.
    pub fn get_address_entry_for_id(&self, id: &[u8]) -> Result<AddressEntry, AccountError> {
        if id.len() != 12 {
            return Err(AccountError::InvalidId);
        }
        let account = self
            .asset_accounts
            .get(&id[4..8])
            .ok_or(AccountError::UnknownAccount)?;

        let index = u32::from_be_bytes(id[8..12].try_into().expect("checked length"));
        if index as i64 > account.last_used_index() {
            return Err(AccountError::UnrequestedAddress);
        }

        let ae_type = self
            .address_type_overrides
            .get(id)
            .copied()
            .unwrap_or(self.default_address_type);
        let asset = account.get_asset_for_index(index)?;
        Ok(AddressEntry::instantiate(asset, ae_type)?)
    }

    /// Refresh the hash index and resolve an incoming prefixed script hash.
    pub fn get_asset_id_pair_for_addr(
        &mut self,
        prefixed_hash: &[u8],
    ) -> Result<(Vec<u8>, AddressType), AccountError> {
        self.update_address_hash_map();
        self.address_hashes
            .get(prefixed_hash)
            .cloned()
            .ok_or(AccountError::UnknownScriptHash)
    }

    /// Fold every asset account's incremental hash map into the index.
    pub fn update_address_hash_map(&mut self) {
        let types = self.address_types.clone();
        for account in self.asset_accounts.values_mut() {
            let map = account.update_address_hash_map(&types);
            for (asset_id, by_type) in map {
                for (&ae_type, hash) in by_type {
                    self.address_hashes
                        .entry(hash.clone())
                        .or_insert_with(|| (asset_id.clone(), ae_type));
                }
            }
        }
    }

    pub fn get_outer_account(&self) -> Result<&AssetAccount, AccountError> {
        self.asset_accounts
            .get(&self.outer_account)
            .ok_or(AccountError::UnknownAccount)
    }

    pub fn get_outer_account_mut(&mut self) -> Result<&mut AssetAccount, AccountError> {
        self.asset_accounts
            .get_mut(&self.outer_account.clone())
            .ok_or(AccountError::UnknownAccount)
    }

    /// Every address handed out so far, built on the fly.
    pub fn get_used_address_map(
        &self,
    ) -> Result<BTreeMap<Vec<u8>, AddressEntry>, AccountError> {
        let mut out = BTreeMap::new();
        for account in self.asset_accounts.values() {
            if account.last_used_index() < 0 {
                continue;
            }
            for index in 0..=account.last_used_index() as u32 {
                let asset = account.get_asset_for_index(index)?;
                let asset_id = asset.id();
                let ae_type = self
                    .address_type_overrides
                    .get(&asset_id)
                    .copied()
                    .unwrap_or(self.default_address_type);
                out.insert(asset_id, AddressEntry::instantiate(asset, ae_type)?);
            }
        }
        Ok(out)
    }

    /// BIP32 root backing an asset, for derivation-path export.
    pub fn get_bip32_root_for_asset_id(
        &self,
        id: &[u8],
    ) -> Result<&AssetBip32Root, AccountError> {
        if id.len() != 12 {
            return Err(AccountError::InvalidId);
        }
        let account = self
            .asset_accounts
            .get(&id[4..8])
            .ok_or(AccountError::UnknownAccount)?;
        match account.root() {
            Some(AssetEntry::Bip32Root(root)) => Ok(root),
            _ => Err(AccountError::NotBip32),
        }
    }

    /// Soft derivation path of an asset off its account root.
    pub fn bip32_path_for_asset_id(&self, id: &[u8]) -> Option<Vec<u32>> {
        let root = self.get_bip32_root_for_asset_id(id).ok()?;
        let index = u32::from_be_bytes(id[8..12].try_into().ok()?);
        let mut path = root.derivation_path.clone();
        path.push(index);
        Some(path)
    }

    // ----------------------------- Chain passthroughs -----------------------------

    pub fn extend_public_chain(&mut self, count: u32) -> Result<(), AccountError> {
        for account in self.asset_accounts.values_mut() {
            account.extend_public_chain(count)?;
        }
        Ok(())
    }

    pub fn extend_public_chain_to_index(
        &mut self,
        account_id: &[u8],
        index: u32,
    ) -> Result<(), AccountError> {
        self.asset_accounts
            .get_mut(account_id)
            .ok_or(AccountError::UnknownAccount)?
            .extend_public_chain_to_index(index)
    }

    pub fn extend_private_chain(
        &mut self,
        ddc: &DecryptedDataContainer,
        lock: &DdcLock<'_>,
        count: u32,
    ) -> Result<(), AccountError> {
        for account in self.asset_accounts.values_mut() {
            account.extend_private_chain(ddc, lock, count)?;
        }
        Ok(())
    }

    /// Materialize the private key of one asset through the DDC.
    pub fn fill_private_key(
        &mut self,
        ddc: &DecryptedDataContainer,
        lock: &DdcLock<'_>,
        id: &[u8],
    ) -> Result<PrivateKeyAsset, AccountError> {
        if id.len() != 12 {
            return Err(AccountError::InvalidId);
        }
        self.asset_accounts
            .get_mut(&id[4..8])
            .ok_or(AccountError::UnknownAccount)?
            .fill_private_key(ddc, lock, id)
    }

    // ----------------------------- Persistence -----------------------------

    fn header_db_key(&self) -> Vec<u8> {
        let mut key = vec![ADDRESS_ACCOUNT_PREFIX];
        key.extend_from_slice(&self.id);
        key
    }

    /// Write the account header, every asset account, and the overrides.
    pub fn commit(&mut self) -> Result<(), AccountError> {
        let tx = self.iface.begin_write_transaction(&self.db_name)?;

        let mut bw = BinaryWriter::new();
        bw.put_var_bytes(&self.outer_account);
        bw.put_var_bytes(&self.inner_account);
        bw.put_var_int(self.address_types.len() as u64);
        for t in &self.address_types {
            bw.put_u32_be(t.to_u32());
        }
        bw.put_u32_be(self.default_address_type.to_u32());
        bw.put_var_int(self.asset_accounts.len() as u64);
        for account in self.asset_accounts.values() {
            bw.put_var_bytes(&account.full_id());
        }
        tx.insert(&self.header_db_key(), bw.as_slice())?;

        for account in self.asset_accounts.values_mut() {
            account.commit()?;
        }

        let overrides: Vec<(Vec<u8>, AddressType)> = self
            .address_type_overrides
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (asset_id, ae_type) in overrides {
            self.write_address_type(&tx, &asset_id, ae_type)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Rebuild an address account from its records.
    pub fn read_from_disk(
        iface: Arc<WalletDbInterface>,
        db_name: &str,
        id: &[u8],
        lookup: u32,
    ) -> Result<Self, AccountError> {
        if id.len() != 4 {
            return Err(AccountError::InvalidId);
        }

        let tx = iface.begin_read_transaction(db_name)?;

        let mut header_key = vec![ADDRESS_ACCOUNT_PREFIX];
        header_key.extend_from_slice(id);
        let header = tx
            .get(&header_key)
            .ok_or(AccountError::MissingRecord("address account header"))?;

        let mut br = BinaryReader::new(&header);
        let outer_account = br.get_var_bytes()?;
        let inner_account = br.get_var_bytes()?;

        let type_count = br.get_var_int()?;
        let mut address_types = BTreeSet::new();
        for _ in 0..type_count {
            address_types.insert(AddressType::from_u32(br.get_u32_be()?)?);
        }
        let default_address_type = AddressType::from_u32(br.get_u32_be()?)?;

        let account_count = br.get_var_int()?;
        let mut asset_accounts = BTreeMap::new();
        for _ in 0..account_count {
            let full_id = br.get_var_bytes()?;
            let mut acc_key = vec![ASSET_ACCOUNT_PREFIX];
            acc_key.extend_from_slice(&full_id);
            let account =
                AssetAccount::load_from_disk(Arc::clone(&iface), db_name, &acc_key, lookup)?;
            asset_accounts.insert(account.id().to_vec(), account);
        }

        // per-address type overrides; malformed records are skipped
        let mut override_prefix = vec![ADDRESS_TYPE_PREFIX];
        override_prefix.extend_from_slice(id);
        let mut address_type_overrides = BTreeMap::new();
        for (key, value) in tx.iter_prefix(&override_prefix) {
            if key.len() != 13 {
                warn!(len = key.len(), "unexpected address-type record key size");
                continue;
            }
            if value.len() != 4 {
                warn!(len = value.len(), "unexpected address-type record value size");
                continue;
            }
            let code = u32::from_le_bytes(value.as_slice().try_into().expect("checked length"));
            match AddressType::from_u32(code) {
                Ok(t) => {
                    address_type_overrides.insert(key[1..].to_vec(), t);
                }
                Err(_) => {
                    warn!(code, "unknown address type in override record");
                }
            }
        }

        Ok(Self {
            id: id.to_vec(),
            outer_account,
            inner_account,
            address_types,
            default_address_type,
            asset_accounts,
            address_type_overrides,
            address_hashes: HashMap::new(),
            iface,
            db_name: db_name.to_string(),
        })
    }

    // ----------------------------- Address-type overrides -----------------------------

    fn address_type_db_key(asset_id: &[u8]) -> Vec<u8> {
        let mut key = vec![ADDRESS_TYPE_PREFIX];
        key.extend_from_slice(asset_id);
        key
    }

    fn write_address_type(
        &mut self,
        tx: &DbTransaction,
        asset_id: &[u8],
        ae_type: AddressType,
    ) -> Result<(), AccountError> {
        self.address_type_overrides
            .insert(asset_id.to_vec(), ae_type);
        tx.insert(
            &Self::address_type_db_key(asset_id),
            &ae_type.to_u32().to_le_bytes(),
        )?;
        Ok(())
    }

    /// Record an address-type override; reverting to the default removes
    /// the record instead.
    pub fn update_instantiated_address_type(
        &mut self,
        tx: &DbTransaction,
        asset_id: &[u8],
        ae_type: AddressType,
    ) -> Result<(), AccountError> {
        match self.address_type_overrides.get(asset_id) {
            Some(&existing) if existing == ae_type => return Ok(()),
            Some(_) if ae_type == self.default_address_type => {
                self.address_type_overrides.remove(asset_id);
                tx.erase(&Self::address_type_db_key(asset_id))?;
                return Ok(());
            }
            None if ae_type == self.default_address_type => return Ok(()),
            _ => {}
        }
        self.write_address_type(tx, asset_id, ae_type)
    }

    // ----------------------------- Watching-only copy -----------------------------

    /// Deep copy with every private key stripped; all entries are flagged
    /// for commit into the target database.
    pub fn get_watching_only_copy(
        &self,
        iface: Arc<WalletDbInterface>,
        db_name: &str,
    ) -> AddressAccount {
        let mut asset_accounts = BTreeMap::new();
        for (key, account) in &self.asset_accounts {
            asset_accounts.insert(
                key.clone(),
                account.watching_only_copy(Arc::clone(&iface), db_name),
            );
        }
        AddressAccount {
            id: self.id.clone(),
            outer_account: self.outer_account.clone(),
            inner_account: self.inner_account.clone(),
            address_types: self.address_types.clone(),
            default_address_type: self.default_address_type,
            asset_accounts,
            address_type_overrides: self.address_type_overrides.clone(),
            address_hashes: HashMap::new(),
            iface,
            db_name: db_name.to_string(),
        }
    }

    // ----------------------------- Multisig helper -----------------------------

    /// Assemble a multisig asset from cosigner assets, in the given order.
    pub fn build_multisig_asset(
        cosigners: &[(&AddressAccount, &[u8])],
        m: u8,
    ) -> Result<AssetEntry, AccountError> {
        let mut assets = BTreeMap::new();
        for (pos, (account, asset_id)) in cosigners.iter().enumerate() {
            let asset = account.get_asset_for_id(&asset_id[4..])?;
            let single = asset
                .as_single()
                .ok_or(AccountError::UnknownAsset)?
                .clone();
            assets.insert(pos as u32, single);
        }
        Ok(AssetEntry::Multisig(AssetMultisig {
            index: 0,
            account_id: vec![0u8; 8],
            m,
            n: cosigners.len() as u8,
            assets,
        }))
    }
}

// ===================================================================
// MetaDataAccount (comments)
// ===================================================================

/// Free-form comment records attached to arbitrary keys (addresses, txids).
pub struct MetaDataAccount {
    id: Vec<u8>,
    comments: BTreeMap<u32, (Vec<u8>, String)>,
    by_key: HashMap<Vec<u8>, u32>,
    iface: Arc<WalletDbInterface>,
    db_name: String,
}

impl MetaDataAccount {
    pub fn new(iface: Arc<WalletDbInterface>, db_name: &str) -> Self {
        Self {
            id: META_ACCOUNT_TYPE_COMMENTS.to_be_bytes().to_vec(),
            comments: BTreeMap::new(),
            by_key: HashMap::new(),
            iface,
            db_name: db_name.to_string(),
        }
    }

    fn comment_db_key(&self, index: u32) -> Vec<u8> {
        let mut key = vec![METADATA_COMMENT_PREFIX];
        key.extend_from_slice(&self.id);
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    pub fn set_comment(&mut self, key: &[u8], value: &str) -> Result<u32, AccountError> {
        let index = match self.by_key.get(key) {
            Some(&i) => i,
            None => {
                let i = self.comments.keys().next_back().map(|&k| k + 1).unwrap_or(0);
                self.by_key.insert(key.to_vec(), i);
                i
            }
        };
        self.comments
            .insert(index, (key.to_vec(), value.to_string()));

        let mut bw = BinaryWriter::new();
        bw.put_var_bytes(key);
        bw.put_var_bytes(value.as_bytes());
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        tx.insert(&self.comment_db_key(index), bw.as_slice())?;
        tx.commit()?;
        Ok(index)
    }

    pub fn get_comment(&self, key: &[u8]) -> Option<&str> {
        self.by_key
            .get(key)
            .and_then(|i| self.comments.get(i))
            .map(|(_, v)| v.as_str())
    }

    pub fn delete_comment(&mut self, key: &[u8]) -> Result<(), AccountError> {
        let Some(index) = self.by_key.remove(key) else {
            return Ok(());
        };
        self.comments.remove(&index);
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        tx.erase(&self.comment_db_key(index))?;
        tx.commit()?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), AccountError> {
        let tx = self.iface.begin_write_transaction(&self.db_name)?;

        let mut header_key = vec![META_ACCOUNT_PREFIX];
        header_key.extend_from_slice(&self.id);
        let mut bw = BinaryWriter::new();
        bw.put_u32_be(META_ACCOUNT_TYPE_COMMENTS);
        tx.insert(&header_key, bw.as_slice())?;

        for (&index, (key, value)) in &self.comments {
            let mut rec = BinaryWriter::new();
            rec.put_var_bytes(key);
            rec.put_var_bytes(value.as_bytes());
            tx.insert(&self.comment_db_key(index), rec.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read_from_disk(
        iface: Arc<WalletDbInterface>,
        db_name: &str,
    ) -> Result<Self, AccountError> {
        let mut account = Self::new(iface, db_name);
        let tx = account.iface.begin_read_transaction(db_name)?;

        let mut prefix = vec![METADATA_COMMENT_PREFIX];
        prefix.extend_from_slice(&account.id);
        for (key, value) in tx.iter_prefix(&prefix) {
            if key.len() != prefix.len() + 4 {
                continue;
            }
            let index =
                u32::from_be_bytes(key[prefix.len()..].try_into().expect("checked length"));
            let mut br = BinaryReader::new(&value);
            let comment_key = br.get_var_bytes()?;
            let comment_val = String::from_utf8_lossy(&br.get_var_bytes()?).into_owned();
            account.by_key.insert(comment_key.clone(), index);
            account.comments.insert(index, (comment_key, comment_val));
        }
        Ok(account)
    }
}
